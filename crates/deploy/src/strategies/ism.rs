//! Interchain security module specs, structural matching and an
//! artifact-backed deployer.

use std::collections::BTreeSet;
use std::future::Future;

use alloy_core::primitives::{Address, Bytes};
use alloy_sol_types::{SolCall, SolType, sol_data};

/// ABI shape of `(address[], uint8)` constructor arguments.
type AddressesAndThreshold = (sol_data::Array<sol_data::Address>, sol_data::Uint<8>);
use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::ModuleDeployer;
use crate::chain::{self, ChainClient};
use crate::contracts::{
    AGGREGATION_ISM, ContractArtifacts, DOMAIN_ROUTING_ISM, IAggregationIsm,
    IInterchainSecurityModule, IMultisigIsm, IOwnable, IRoutingIsm, MERKLE_ROOT_MULTISIG_ISM,
    MESSAGE_ID_MULTISIG_ISM, TEST_ISM,
};

/// `moduleType()` values reported on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[repr(u8)]
pub enum ModuleType {
    Routing = 1,
    Aggregation = 2,
    MerkleRootMultisig = 4,
    MessageIdMultisig = 5,
    Null = 6,
}

/// Desired security module: a literal address, or a structure to satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModuleSpec {
    Address(Address),
    Config(ModuleConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ModuleConfig {
    MessageIdMultisigIsm {
        validators: Vec<Address>,
        threshold: u8,
    },
    MerkleRootMultisigIsm {
        validators: Vec<Address>,
        threshold: u8,
    },
    AggregationIsm {
        modules: Vec<ModuleConfig>,
        threshold: u8,
    },
    RoutingIsm {
        owner: Address,
        domains: Vec<RoutedModule>,
    },
    TestIsm,
}

/// Module used for messages from one origin domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedModule {
    pub domain: u32,
    pub module: ModuleConfig,
}

impl ModuleConfig {
    pub fn module_type(&self) -> ModuleType {
        match self {
            Self::MessageIdMultisigIsm { .. } => ModuleType::MessageIdMultisig,
            Self::MerkleRootMultisigIsm { .. } => ModuleType::MerkleRootMultisig,
            Self::AggregationIsm { .. } => ModuleType::Aggregation,
            Self::RoutingIsm { .. } => ModuleType::Routing,
            Self::TestIsm => ModuleType::Null,
        }
    }
}

/// Whether the module deployed at `address` satisfies `config`.
///
/// Multisig modules match on validator set and threshold, aggregation modules
/// when every live submodule matches a distinct configured one, routing modules
/// on owner, domain set and per-domain module. An address without code, or one
/// that does not answer `moduleType()`, matches nothing.
pub fn matches_config<'a, C: ChainClient>(
    client: &'a C,
    address: Address,
    config: &'a ModuleConfig,
) -> BoxFuture<'a, Result<bool>> {
    async move {
        if !chain::has_code(client, address).await? {
            tracing::debug!(module = %address, "No code at module address");
            return Ok(false);
        }

        let call = IInterchainSecurityModule::moduleTypeCall {};
        let output = match client.call(address, call.abi_encode().into()).await {
            Ok(output) => output,
            Err(err) if chain::is_revert(&err) => {
                tracing::debug!(module = %address, error = %err, "Not a security module");
                return Ok(false);
            }
            Err(err) => {
                return Err(err.context(format!("Failed to read module type of {address}")));
            }
        };
        let Ok(module_type) =
            IInterchainSecurityModule::moduleTypeCall::abi_decode_returns(&output, true)
        else {
            tracing::debug!(module = %address, "Malformed moduleType() return data");
            return Ok(false);
        };
        let module_type = module_type._0;
        if module_type != config.module_type() as u8 {
            return Ok(false);
        }

        match config {
            ModuleConfig::MessageIdMultisigIsm { validators, threshold }
            | ModuleConfig::MerkleRootMultisigIsm { validators, threshold } => {
                let live = chain::read(
                    client,
                    address,
                    IMultisigIsm::validatorsAndThresholdCall { _message: Bytes::new() },
                )
                .await?;
                Ok(live.threshold == *threshold && same_set(&live.validators, validators))
            }
            ModuleConfig::AggregationIsm { modules, threshold } => {
                let live = chain::read(
                    client,
                    address,
                    IAggregationIsm::modulesAndThresholdCall { _message: Bytes::new() },
                )
                .await?;
                if live.threshold != *threshold || live.modules.len() != modules.len() {
                    return Ok(false);
                }

                let mut claimed = vec![false; modules.len()];
                for submodule in live.modules {
                    let mut found = false;
                    for (index, sub_config) in modules.iter().enumerate() {
                        if !claimed[index] && matches_config(client, submodule, sub_config).await? {
                            claimed[index] = true;
                            found = true;
                            break;
                        }
                    }
                    if !found {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ModuleConfig::RoutingIsm { owner, domains } => {
                let live_owner = chain::read(client, address, IOwnable::ownerCall {}).await?._0;
                if live_owner != *owner {
                    return Ok(false);
                }

                let live_domains = chain::read(client, address, IRoutingIsm::domainsCall {})
                    .await?
                    ._0
                    .into_iter()
                    .map(|domain| {
                        u32::try_from(domain)
                            .map_err(|_| anyhow::anyhow!("Routing domain {domain} out of range"))
                    })
                    .collect::<Result<BTreeSet<u32>>>()?;
                let wanted: BTreeSet<u32> = domains.iter().map(|routed| routed.domain).collect();
                if live_domains != wanted {
                    return Ok(false);
                }

                for routed in domains {
                    let module = chain::read(
                        client,
                        address,
                        IRoutingIsm::moduleCall { origin: routed.domain },
                    )
                    .await?
                    ._0;
                    if !matches_config(client, module, &routed.module).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ModuleConfig::TestIsm => Ok(true),
        }
    }
    .boxed()
}

fn same_set(live: &[Address], wanted: &[Address]) -> bool {
    let live: BTreeSet<_> = live.iter().collect();
    let wanted: BTreeSet<_> = wanted.iter().collect();
    live == wanted
}

/// Constructor arguments of a multisig module over the distinct `validators`.
fn multisig_args(validators: &[Address], threshold: u8) -> Result<Bytes> {
    let mut validators = validators.to_vec();
    validators.sort();
    validators.dedup();

    if threshold == 0 || usize::from(threshold) > validators.len() {
        anyhow::bail!(
            "Invalid multisig threshold {threshold} for {} distinct validators",
            validators.len()
        );
    }

    Ok(AddressesAndThreshold::abi_encode_params(&(validators, threshold)).into())
}

/// Deploys modules straight from bytecode artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactModuleDeployer {
    artifacts: ContractArtifacts,
}

impl ArtifactModuleDeployer {
    pub fn new(artifacts: ContractArtifacts) -> Self {
        Self { artifacts }
    }

    fn deploy_module<'a, C: ChainClient>(
        &'a self,
        client: &'a C,
        config: &'a ModuleConfig,
    ) -> BoxFuture<'a, Result<Address>> {
        async move {
            let address = match config {
                ModuleConfig::MessageIdMultisigIsm { validators, threshold } => {
                    self.deploy_multisig(client, MESSAGE_ID_MULTISIG_ISM, validators, *threshold)
                        .await?
                }
                ModuleConfig::MerkleRootMultisigIsm { validators, threshold } => {
                    self.deploy_multisig(client, MERKLE_ROOT_MULTISIG_ISM, validators, *threshold)
                        .await?
                }
                ModuleConfig::AggregationIsm { modules, threshold } => {
                    let mut submodules = Vec::with_capacity(modules.len());
                    for module in modules {
                        submodules.push(self.deploy_module(client, module).await?);
                    }
                    let args: Bytes = AddressesAndThreshold::abi_encode_params(&(submodules, *threshold)).into();
                    chain::deploy_bytecode(client, &self.artifacts, AGGREGATION_ISM, &args).await?
                }
                ModuleConfig::RoutingIsm { owner, domains } => {
                    let routing =
                        chain::deploy_bytecode(client, &self.artifacts, DOMAIN_ROUTING_ISM, &Bytes::new())
                            .await?;

                    let mut modules = Vec::with_capacity(domains.len());
                    for routed in domains {
                        modules.push(self.deploy_module(client, &routed.module).await?);
                    }
                    let call = IRoutingIsm::initializeCall {
                        _owner: *owner,
                        _domains: domains.iter().map(|routed| routed.domain).collect(),
                        _modules: modules,
                    };
                    chain::send(client, routing, call).await?;
                    routing
                }
                ModuleConfig::TestIsm => {
                    chain::deploy_bytecode(client, &self.artifacts, TEST_ISM, &Bytes::new()).await?
                }
            };

            tracing::debug!(module = %address, kind = %config.module_type(), "Module deployed");
            Ok(address)
        }
        .boxed()
    }

    async fn deploy_multisig<C: ChainClient>(
        &self,
        client: &C,
        name: &str,
        validators: &[Address],
        threshold: u8,
    ) -> Result<Address> {
        let args = multisig_args(validators, threshold)?;
        chain::deploy_bytecode(client, &self.artifacts, name, &args).await
    }
}

impl ModuleDeployer for ArtifactModuleDeployer {
    fn deploy<C: ChainClient>(
        &self,
        client: &C,
        chain: &str,
        config: &ModuleConfig,
        mailbox: Address,
    ) -> impl Future<Output = Result<Address>> + Send {
        async move {
            tracing::info!(chain, mailbox = %mailbox, kind = %config.module_type(), "Deploying security module");
            self.deploy_module(client, config).await
        }
    }
}
