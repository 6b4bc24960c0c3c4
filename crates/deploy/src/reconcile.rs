//! Convergence of live configuration to the declared target.
//!
//! Every protocol reads the live value, compares it with the target, sends a
//! transaction only when they differ and the signer holds authority, then
//! re-reads the value to confirm the write landed.

use std::collections::BTreeMap;

use alloy_core::primitives::Address;
use anyhow::Result;
use serde::Serialize;

use crate::authority::{self, AuthorityOutcome};
use crate::chain::{self, ChainClient, TransactionReceipt};
use crate::context::DeployContext;
use crate::contracts::{IMailbox, IOwnable, ITestRecipient};
use crate::ledger::Slot;
use crate::strategies::{ModuleConfig, ModuleDeployer, ModuleSpec};

/// Outcome of one reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Reconciled {
    /// Live state already matched.
    Unchanged,
    /// A transaction converged the live state.
    Updated(TransactionReceipt),
    /// The signer lacks authority; the gap remains for its owner to close.
    NotAuthorized {
        current: Address,
        desired: Address,
        authority: Address,
    },
}

impl Reconciled {
    pub fn is_converged(&self) -> bool {
        !matches!(self, Self::NotAuthorized { .. })
    }

    fn from_outcome(outcome: AuthorityOutcome<TransactionReceipt>, current: Address, desired: Address) -> Self {
        match outcome {
            AuthorityOutcome::Applied(receipt) => Self::Updated(receipt),
            AuthorityOutcome::NotAuthorized { authority, .. } => Self::NotAuthorized {
                current,
                desired,
                authority,
            },
        }
    }
}

/// Where a contract keeps its security module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAccessor {
    /// `Mailbox.defaultIsm` / `setDefaultIsm`.
    MailboxDefault,
    /// `interchainSecurityModule` / `setInterchainSecurityModule` of a recipient.
    Recipient,
}

impl ModuleAccessor {
    async fn current<C: ChainClient>(self, client: &C, contract: Address) -> Result<Address> {
        Ok(match self {
            Self::MailboxDefault => chain::read(client, contract, IMailbox::defaultIsmCall {}).await?._0,
            Self::Recipient => {
                chain::read(client, contract, ITestRecipient::interchainSecurityModuleCall {})
                    .await?
                    ._0
            }
        })
    }

    async fn set<C: ChainClient>(
        self,
        client: &C,
        contract: Address,
        module: Address,
    ) -> Result<TransactionReceipt> {
        match self {
            Self::MailboxDefault => {
                chain::send(client, contract, IMailbox::setDefaultIsmCall { _module: module }).await
            }
            Self::Recipient => {
                let call = ITestRecipient::setInterchainSecurityModuleCall { _ism: module };
                chain::send(client, contract, call).await
            }
        }
    }

    /// Ledger slot of modules deployed for this accessor.
    pub fn slot(self) -> Option<Slot> {
        match self {
            Self::MailboxDefault => Some(Slot::DefaultIsm),
            Self::Recipient => None,
        }
    }
}

/// Which mailbox hook is being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAccessor {
    Default,
    Required,
}

impl HookAccessor {
    /// Ledger slot recording a hook the signer could not apply.
    pub fn custom_slot(self) -> Slot {
        match self {
            Self::Default => Slot::CustomHook,
            Self::Required => Slot::CustomRequiredHook,
        }
    }

    async fn current<C: ChainClient>(self, client: &C, mailbox: Address) -> Result<Address> {
        Ok(match self {
            Self::Default => chain::read(client, mailbox, IMailbox::defaultHookCall {}).await?._0,
            Self::Required => chain::read(client, mailbox, IMailbox::requiredHookCall {}).await?._0,
        })
    }

    async fn set<C: ChainClient>(
        self,
        client: &C,
        mailbox: Address,
        hook: Address,
    ) -> Result<TransactionReceipt> {
        match self {
            Self::Default => {
                chain::send(client, mailbox, IMailbox::setDefaultHookCall { _hook: hook }).await
            }
            Self::Required => {
                chain::send(client, mailbox, IMailbox::setRequiredHookCall { _hook: hook }).await
            }
        }
    }
}

/// Address of a module satisfying `config`.
///
/// Prefers `current`, then the module recorded under `slot`, and deploys a new
/// one (recorded under `slot`) only when neither matches.
pub async fn resolve_module<C, M>(
    ctx: &mut DeployContext<'_, C>,
    modules: &M,
    config: &ModuleConfig,
    current: Address,
    slot: Option<Slot>,
    mailbox: Address,
) -> Result<Address>
where
    C: ChainClient,
    M: ModuleDeployer,
{
    if !current.is_zero()
        && modules
            .structurally_matches(ctx.client, ctx.chain, current, config)
            .await?
    {
        tracing::info!(chain = ctx.chain, module = %current, "Configured module satisfies spec");
        if let Some(slot) = slot {
            ctx.bind(slot, current);
        }
        return Ok(current);
    }

    if let Some(slot) = &slot {
        if let Some(cached) = ctx.live_binding(slot).await? {
            if cached != current
                && modules
                    .structurally_matches(ctx.client, ctx.chain, cached, config)
                    .await?
            {
                tracing::info!(chain = ctx.chain, slot = %slot, module = %cached, "Reusing module from ledger");
                return Ok(cached);
            }
        }
    }

    let deployed = modules.deploy(ctx.client, ctx.chain, config, mailbox).await?;
    if let Some(slot) = slot {
        ctx.bind(slot, deployed);
    }
    Ok(deployed)
}

/// Converge the security module of `contract` to `spec`.
///
/// Structural specs are compared against the live module and deployed only
/// when it does not satisfy them. A write that does not stick is an error.
pub async fn configure_auth_module<C, M>(
    ctx: &mut DeployContext<'_, C>,
    modules: &M,
    contract: Address,
    accessor: ModuleAccessor,
    spec: &ModuleSpec,
    mailbox: Address,
) -> Result<Reconciled>
where
    C: ChainClient,
    M: ModuleDeployer,
{
    let current = accessor.current(ctx.client, contract).await?;

    let desired = match spec {
        ModuleSpec::Address(address) => *address,
        ModuleSpec::Config(config) => {
            resolve_module(ctx, modules, config, current, accessor.slot(), mailbox).await?
        }
    };

    if current == desired {
        tracing::info!(chain = ctx.chain, contract = %contract, module = %current, "Module up to date");
        return Ok(Reconciled::Unchanged);
    }

    let client = ctx.client;
    let outcome =
        authority::run_as_owner(client, contract, || accessor.set(client, contract, desired)).await?;

    if outcome.is_applied() {
        let actual = accessor.current(client, contract).await?;
        if actual != desired {
            anyhow::bail!(
                "Module of {contract} is {actual} after setting it to {desired} on {}",
                ctx.chain
            );
        }
        tracing::info!(chain = ctx.chain, contract = %contract, from = %current, to = %desired, "Module updated");
    }

    Ok(Reconciled::from_outcome(outcome, current, desired))
}

/// Converge a mailbox hook to `desired`.
///
/// When the signer cannot apply it, the hook is still recorded under the
/// accessor's custom hook slot so the intended configuration is not lost.
pub async fn configure_hook<C: ChainClient>(
    ctx: &mut DeployContext<'_, C>,
    mailbox: Address,
    accessor: HookAccessor,
    desired: Address,
) -> Result<Reconciled> {
    let client = ctx.client;
    let current = accessor.current(client, mailbox).await?;

    if current == desired {
        tracing::info!(chain = ctx.chain, hook = %desired, kind = ?accessor, "Hook up to date");
        return Ok(Reconciled::Unchanged);
    }

    let outcome =
        authority::run_as_owner(client, mailbox, || accessor.set(client, mailbox, desired)).await?;

    if outcome.is_applied() {
        let actual = accessor.current(client, mailbox).await?;
        if actual != desired {
            anyhow::bail!(
                "{accessor:?} hook of {mailbox} is {actual} after setting it to {desired} on {}",
                ctx.chain
            );
        }
        tracing::info!(chain = ctx.chain, kind = ?accessor, from = %current, to = %desired, "Hook updated");
    } else {
        ctx.bind(accessor.custom_slot(), desired);
    }

    Ok(Reconciled::from_outcome(outcome, current, desired))
}

/// An ownership change that was wanted for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipTransfer {
    pub slot: Slot,
    pub contract: Address,
    pub result: Reconciled,
}

/// Transfer every ownable contract to `owner_of(slot)`.
pub async fn transfer_ownership<C, F>(
    ctx: &DeployContext<'_, C>,
    contracts: &BTreeMap<Slot, Address>,
    owner_of: F,
) -> Result<Vec<OwnershipTransfer>>
where
    C: ChainClient,
    F: Fn(&Slot) -> Address,
{
    let client = ctx.client;
    let mut transfers = Vec::new();

    for (slot, contract) in contracts.iter().filter(|(slot, _)| slot.is_ownable()) {
        let contract = *contract;
        let desired = owner_of(slot);
        let current = authority::read_owner(client, contract).await?;

        if current == desired {
            tracing::debug!(chain = ctx.chain, slot = %slot, owner = %current, "Owner up to date");
            continue;
        }

        let outcome = authority::run_as_owner(client, contract, || {
            chain::send(client, contract, IOwnable::transferOwnershipCall { newOwner: desired })
        })
        .await?;

        if outcome.is_applied() {
            tracing::info!(chain = ctx.chain, slot = %slot, from = %current, to = %desired, "Ownership transferred");
        }

        transfers.push(OwnershipTransfer {
            slot: slot.clone(),
            contract,
            result: Reconciled::from_outcome(outcome, current, desired),
        });
    }

    Ok(transfers)
}
