//! Per-chain deployment state machine and the sequential batch driver.
//!
//! A chain moves through
//! `NotStarted -> DeployingAdmin -> DeployingPrimary -> ConfiguringPrimary ->
//! DeployingDependents -> TransferringOwnership -> Done`, and can fail from any
//! stage. Each chain runs under its own wall-clock budget; chains run one after
//! the other and a failed chain never stops the batch.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use alloy_core::primitives::{Address, Bytes, U256};
use alloy_sol_types::SolValue;
use anyhow::Result;
use derive_more::Deref;
use serde::Serialize;

use crate::authority;
use crate::chain::{self, ChainClient, is_already_initialized};
use crate::config::{CoreConfig, TimelockConfig};
use crate::context::DeployContext;
use crate::contracts::{
    ContractArtifacts, IMailbox, MAILBOX, PROXY_ADMIN, TEST_RECIPIENT, TIMELOCK_CONTROLLER,
    VALIDATOR_ANNOUNCE,
};
use crate::fingerprint::{self, ChainFingerprint};
use crate::ledger::{AddressLedger, Slot, VerificationArtifact};
use crate::output::DeploymentOutput;
use crate::proxy;
use crate::reconcile::{self, HookAccessor, ModuleAccessor, OwnershipTransfer, Reconciled};
use crate::strategies::{
    CoreAddresses, HookDeployer, HookSpec, ModuleDeployer, ModuleSpec, VerificationSink,
};

/// Default wall-clock budget of one chain.
pub const DEFAULT_CHAIN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum DeployStage {
    NotStarted,
    DeployingAdmin,
    DeployingPrimary,
    ConfiguringPrimary,
    DeployingDependents,
    TransferringOwnership,
    Done,
    Failed,
}

/// How the mailbox initializer went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This run initialized the mailbox with the resolved configuration.
    Initialized,
    /// Someone initialized it before; its configuration must be reconciled.
    AlreadyInitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainFailure {
    Timeout(Duration),
    Error(String),
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(budget) => write!(f, "timed out after {}s", budget.as_secs()),
            Self::Error(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainOutcome {
    Done,
    Failed {
        /// Stage the chain was in when it failed.
        stage: DeployStage,
        failure: ChainFailure,
    },
}

impl ChainOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// A desired state the signer could not reach for lack of authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unreconciled {
    pub item: String,
    pub current: Address,
    pub desired: Address,
    pub authority: Address,
}

/// Terminal state and products of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub chain: String,
    pub stage: DeployStage,
    pub outcome: ChainOutcome,
    /// Ledger bindings of the chain after the run.
    pub contracts: BTreeMap<Slot, Address>,
    pub verification: Vec<VerificationArtifact>,
    pub transfers: Vec<OwnershipTransfer>,
    pub unreconciled: Vec<Unreconciled>,
}

/// Reports of every chain of a run, keyed by chain name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deref)]
pub struct BatchReport(BTreeMap<String, ChainReport>);

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.0.values().all(|report| report.outcome.is_done())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ChainReport> {
        self.0.values().filter(|report| !report.outcome.is_done())
    }
}

/// A chain to deploy on.
pub struct ChainTarget<C> {
    pub name: String,
    /// Messaging domain passed to the Mailbox constructor.
    pub domain_id: u32,
    pub client: C,
    pub core: CoreConfig,
}

/// What a chain has produced so far; survives a timeout of the chain's run.
struct ChainProgress {
    stage: DeployStage,
    transfers: Vec<OwnershipTransfer>,
    unreconciled: Vec<Unreconciled>,
}

impl ChainProgress {
    fn new() -> Self {
        Self {
            stage: DeployStage::NotStarted,
            transfers: Vec::new(),
            unreconciled: Vec::new(),
        }
    }

    fn enter(&mut self, chain: &str, stage: DeployStage) {
        tracing::info!(chain, from = %self.stage, to = %stage, "Entering stage");
        self.stage = stage;
    }

    fn record(&mut self, item: impl fmt::Display, result: &Reconciled) {
        if let Reconciled::NotAuthorized {
            current,
            desired,
            authority,
        } = result
        {
            self.unreconciled.push(Unreconciled {
                item: item.to_string(),
                current: *current,
                desired: *desired,
                authority: *authority,
            });
        }
    }
}

/// Deploys and reconciles the core contracts of every chain.
pub struct CoreDeployer<M, H, V> {
    artifacts: ContractArtifacts,
    modules: M,
    hooks: H,
    verifier: V,
    chain_timeout: Duration,
    redeploy_implementations: bool,
    output_dir: Option<PathBuf>,
}

impl<M, H, V> CoreDeployer<M, H, V>
where
    M: ModuleDeployer,
    H: HookDeployer,
    V: VerificationSink,
{
    pub fn new(artifacts: ContractArtifacts, modules: M, hooks: H, verifier: V) -> Self {
        Self {
            artifacts,
            modules,
            hooks,
            verifier,
            chain_timeout: DEFAULT_CHAIN_TIMEOUT,
            redeploy_implementations: false,
            output_dir: None,
        }
    }

    pub fn with_chain_timeout(mut self, timeout: Duration) -> Self {
        self.chain_timeout = timeout;
        self
    }

    /// Deploy fresh implementations for reused proxies and upgrade to them.
    pub fn with_redeploy_implementations(mut self, redeploy: bool) -> Self {
        self.redeploy_implementations = redeploy;
        self
    }

    /// Persist the output to `dir` after every chain.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Deploy on every target in order, seeding from and updating `output`.
    ///
    /// Errors only when the output cannot be persisted; chain failures are
    /// part of the report.
    pub async fn deploy_all<C: ChainClient>(
        &self,
        targets: &[ChainTarget<C>],
        output: &mut DeploymentOutput,
    ) -> Result<BatchReport> {
        let mut reports = BTreeMap::new();

        for target in targets {
            let fingerprint =
                ChainFingerprint::new(fingerprint::config_hash(target.domain_id, &target.core)?);
            fingerprint.log_drift(&target.name, output.fingerprints.get(&target.name));

            let report = self.deploy_chain(target, &mut output.ledger).await;

            output.merge_verification(&target.name, &report.verification);
            if report.outcome.is_done() {
                output.fingerprints.insert(target.name.clone(), fingerprint);
            }
            if let Some(dir) = &self.output_dir {
                output.save(dir)?;
            }

            reports.insert(target.name.clone(), report);
        }

        Ok(BatchReport(reports))
    }

    /// Deploy on one chain within the chain budget. Never fails: errors and
    /// timeouts end up in the report's outcome.
    pub async fn deploy_chain<C: ChainClient>(
        &self,
        target: &ChainTarget<C>,
        ledger: &mut AddressLedger,
    ) -> ChainReport {
        let chain = target.name.as_str();
        let mut ctx = DeployContext::new(chain, &target.client, &self.artifacts, ledger);
        let mut progress = ChainProgress::new();

        tracing::info!(chain, signer = %ctx.signer(), "Starting chain deployment");
        let result =
            tokio::time::timeout(self.chain_timeout, self.run_chain(target, &mut ctx, &mut progress))
                .await;

        let outcome = match result {
            Ok(Ok(())) => {
                progress.enter(chain, DeployStage::Done);
                ChainOutcome::Done
            }
            Ok(Err(err)) => {
                tracing::error!(chain, stage = %progress.stage, error = ?err, "Chain deployment failed");
                ChainOutcome::Failed {
                    stage: progress.stage,
                    failure: ChainFailure::Error(format!("{err:#}")),
                }
            }
            Err(_) => {
                tracing::error!(chain, stage = %progress.stage, budget = ?self.chain_timeout, "Chain deployment timed out");
                ChainOutcome::Failed {
                    stage: progress.stage,
                    failure: ChainFailure::Timeout(self.chain_timeout),
                }
            }
        };

        let verification = std::mem::take(&mut ctx.verification);
        for artifact in &verification {
            if let Err(err) = self.verifier.submit(chain, artifact).await {
                tracing::warn!(chain, contract = %artifact.name, address = %artifact.address, error = %err, "Verification submission failed");
            }
        }

        ChainReport {
            chain: chain.to_string(),
            stage: if outcome.is_done() {
                DeployStage::Done
            } else {
                DeployStage::Failed
            },
            outcome,
            contracts: ctx.ledger.chain(chain),
            verification,
            transfers: progress.transfers,
            unreconciled: progress.unreconciled,
        }
    }

    async fn run_chain<C: ChainClient>(
        &self,
        target: &ChainTarget<C>,
        ctx: &mut DeployContext<'_, C>,
        progress: &mut ChainProgress,
    ) -> Result<()> {
        let core = &target.core;
        let chain = ctx.chain;

        if core.is_removed(&Slot::ProxyAdmin) || core.is_removed(&Slot::Mailbox) {
            tracing::info!(chain, "Core contracts removed from topology, skipping chain");
            return Ok(());
        }

        progress.enter(chain, DeployStage::DeployingAdmin);
        let proxy_admin = ctx
            .deploy_contract(Slot::ProxyAdmin, PROXY_ADMIN, Bytes::new(), None)
            .await?;
        let timelock = match core.timelock() {
            Some(timelock) => Some(self.deploy_timelock(ctx, timelock).await?),
            None => None,
        };

        progress.enter(chain, DeployStage::DeployingPrimary);
        let mailbox_args: Bytes = (target.domain_id,).abi_encode_params().into();
        // A bare implementation wrapped below is fresh, not a reused proxy.
        let reused = match ctx.live_binding(&Slot::Mailbox).await? {
            Some(recorded) => proxy::is_proxy(ctx.client, recorded).await?,
            None => false,
        };
        let mailbox = proxy::deploy_behind_proxy(
            ctx,
            Slot::Mailbox,
            MAILBOX,
            mailbox_args.clone(),
            proxy_admin,
            None,
        )
        .await?;
        self.converge_proxy(
            ctx,
            progress,
            (Slot::Mailbox, MAILBOX),
            mailbox,
            mailbox_args,
            proxy_admin,
            reused,
        )
        .await?;

        let default_ism = self.resolve_default_ism(ctx, &core.default_ism, mailbox).await?;
        let core_addresses = CoreAddresses {
            proxy_admin,
            mailbox,
        };
        let default_hook = self.resolve_hook(ctx, &core.default_hook, &core_addresses).await?;
        let required_hook = self.resolve_hook(ctx, &core.required_hook, &core_addresses).await?;

        let init = initialize_mailbox(ctx, mailbox, default_ism, default_hook, required_hook).await?;

        progress.enter(chain, DeployStage::ConfiguringPrimary);
        match init {
            InitOutcome::Initialized => {
                tracing::info!(chain, mailbox = %mailbox, "Mailbox initialized with target configuration");
            }
            InitOutcome::AlreadyInitialized => {
                tracing::info!(chain, mailbox = %mailbox, "Reconciling existing mailbox configuration");
                let result = reconcile::configure_auth_module(
                    ctx,
                    &self.modules,
                    mailbox,
                    ModuleAccessor::MailboxDefault,
                    &ModuleSpec::Address(default_ism),
                    mailbox,
                )
                .await?;
                progress.record("mailbox default ISM", &result);

                let result =
                    reconcile::configure_hook(ctx, mailbox, HookAccessor::Default, default_hook)
                        .await?;
                progress.record("mailbox default hook", &result);

                let result =
                    reconcile::configure_hook(ctx, mailbox, HookAccessor::Required, required_hook)
                        .await?;
                progress.record("mailbox required hook", &result);
            }
        }

        progress.enter(chain, DeployStage::DeployingDependents);
        if core.is_removed(&Slot::ValidatorAnnounce) {
            tracing::info!(chain, slot = %Slot::ValidatorAnnounce, "Slot removed from topology, skipping");
        } else {
            let args: Bytes = (mailbox,).abi_encode_params().into();
            ctx.deploy_contract(Slot::ValidatorAnnounce, VALIDATOR_ANNOUNCE, args, None)
                .await?;
        }

        if core.is_removed(&Slot::TestRecipient) {
            tracing::info!(chain, slot = %Slot::TestRecipient, "Slot removed from topology, skipping");
        } else {
            let recipient = ctx
                .deploy_contract(Slot::TestRecipient, TEST_RECIPIENT, Bytes::new(), None)
                .await?;
            let result = reconcile::configure_auth_module(
                ctx,
                &self.modules,
                recipient,
                ModuleAccessor::Recipient,
                &ModuleSpec::Address(default_ism),
                mailbox,
            )
            .await?;
            progress.record("test recipient ISM", &result);
        }

        progress.enter(chain, DeployStage::TransferringOwnership);
        let contracts: BTreeMap<Slot, Address> = ctx
            .ledger
            .chain(chain)
            .into_iter()
            .filter(|(slot, _)| !core.is_removed(slot))
            .collect();
        let transfers = reconcile::transfer_ownership(ctx, &contracts, |slot| {
            target_owner(core, timelock, slot)
        })
        .await?;
        for transfer in &transfers {
            progress.record(format!("{} owner", transfer.slot), &transfer.result);
        }
        progress.transfers = transfers;

        Ok(())
    }

    async fn deploy_timelock<C: ChainClient>(
        &self,
        ctx: &mut DeployContext<'_, C>,
        timelock: &TimelockConfig,
    ) -> Result<Address> {
        let args: Bytes = (
            U256::from(timelock.min_delay),
            timelock.proposers.clone(),
            timelock.executors.clone(),
            Address::ZERO,
        )
            .abi_encode_params()
            .into();
        ctx.deploy_contract(Slot::TimelockController, TIMELOCK_CONTROLLER, args, None)
            .await
    }

    /// Bring a proxy's admin and implementation in line with the ledger.
    #[allow(clippy::too_many_arguments)]
    async fn converge_proxy<C: ChainClient>(
        &self,
        ctx: &mut DeployContext<'_, C>,
        progress: &mut ChainProgress,
        (slot, name): (Slot, &str),
        proxy: Address,
        constructor_args: Bytes,
        proxy_admin: Address,
        reused: bool,
    ) -> Result<()> {
        let result = proxy::change_admin(ctx.client, proxy, proxy_admin).await?;
        progress.record(format!("{slot} proxy admin"), &result);

        let implementation_slot = Slot::implementation(slot.clone());
        let live = proxy::implementation_of(ctx.client, proxy).await?;
        let desired = if reused && self.redeploy_implementations {
            let fresh =
                chain::deploy_bytecode(ctx.client, ctx.artifacts, name, &constructor_args).await?;
            ctx.verification.push(VerificationArtifact::implementation(
                name,
                fresh,
                constructor_args,
            ));
            ctx.bind(implementation_slot, fresh);
            fresh
        } else {
            match ctx.live_binding(&implementation_slot).await? {
                Some(recorded) => recorded,
                None => {
                    ctx.bind(implementation_slot, live);
                    live
                }
            }
        };

        let result = proxy::upgrade_and_initialize(ctx.client, proxy, desired, None).await?;
        progress.record(format!("{slot} implementation"), &result);
        Ok(())
    }

    async fn resolve_default_ism<C: ChainClient>(
        &self,
        ctx: &mut DeployContext<'_, C>,
        spec: &ModuleSpec,
        mailbox: Address,
    ) -> Result<Address> {
        match spec {
            ModuleSpec::Address(address) => Ok(*address),
            ModuleSpec::Config(config) => {
                let current = chain::read(ctx.client, mailbox, IMailbox::defaultIsmCall {})
                    .await?
                    ._0;
                reconcile::resolve_module(
                    ctx,
                    &self.modules,
                    config,
                    current,
                    Some(Slot::DefaultIsm),
                    mailbox,
                )
                .await
            }
        }
    }

    async fn resolve_hook<C: ChainClient>(
        &self,
        ctx: &mut DeployContext<'_, C>,
        spec: &HookSpec,
        core: &CoreAddresses,
    ) -> Result<Address> {
        let config = match spec {
            HookSpec::Address(address) => return Ok(*address),
            HookSpec::Config(config) => config,
        };

        let slot = Slot::hook(config.ledger_key()?);
        if let Some(address) = ctx.live_binding(&slot).await? {
            tracing::info!(chain = ctx.chain, slot = %slot, address = %address, "Reusing hook");
            return Ok(address);
        }

        let address = self.hooks.deploy(ctx.client, ctx.chain, config, core).await?;
        ctx.bind(slot, address);
        Ok(address)
    }
}

/// Initialize the mailbox with the signer as owner, unless it already is.
///
/// An owner already set, or an "already initialized" revert from a racing
/// deployer, both lead to reconciling the live configuration instead.
async fn initialize_mailbox<C: ChainClient>(
    ctx: &DeployContext<'_, C>,
    mailbox: Address,
    default_ism: Address,
    default_hook: Address,
    required_hook: Address,
) -> Result<InitOutcome> {
    let owner = authority::read_owner(ctx.client, mailbox).await?;
    if !owner.is_zero() {
        tracing::info!(chain = ctx.chain, mailbox = %mailbox, owner = %owner, "Mailbox already initialized");
        return Ok(InitOutcome::AlreadyInitialized);
    }

    let call = IMailbox::initializeCall {
        _owner: ctx.signer(),
        _defaultIsm: default_ism,
        _defaultHook: default_hook,
        _requiredHook: required_hook,
    };
    match chain::send(ctx.client, mailbox, call).await {
        Ok(_) => Ok(InitOutcome::Initialized),
        Err(err) if is_already_initialized(&err) => {
            tracing::warn!(chain = ctx.chain, mailbox = %mailbox, "Mailbox was initialized concurrently");
            Ok(InitOutcome::AlreadyInitialized)
        }
        Err(err) => Err(err),
    }
}

/// Owner `slot` should end up with.
fn target_owner(core: &CoreConfig, timelock: Option<Address>, slot: &Slot) -> Address {
    if let Some(owner) = core.owner_overrides.get(slot) {
        return *owner;
    }
    match (slot, timelock) {
        (Slot::ProxyAdmin, Some(timelock)) => timelock,
        _ => core.owner,
    }
}
