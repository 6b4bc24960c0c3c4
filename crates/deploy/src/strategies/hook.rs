//! Post-dispatch hook specs and an artifact-backed deployer.

use std::future::Future;

use alloy_core::primitives::{Address, Bytes, U256};
use alloy_sol_types::SolValue;
use anyhow::{Context, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{CoreAddresses, HookDeployer};
use crate::chain::{self, ChainClient};
use crate::contracts::{AGGREGATION_HOOK, ContractArtifacts, MERKLE_TREE_HOOK, PROTOCOL_FEE_HOOK};
use crate::fingerprint;

/// Desired hook: a literal address or a hook to deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HookSpec {
    Address(Address),
    Config(HookConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HookConfig {
    MerkleTreeHook,
    ProtocolFee {
        max_protocol_fee: U256,
        protocol_fee: U256,
        beneficiary: Address,
        owner: Address,
    },
    AggregationHook {
        hooks: Vec<HookConfig>,
    },
}

/// Hex characters of the parameter digest kept in a hook's ledger key.
const KEY_DIGEST_LEN: usize = 16;

impl HookConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MerkleTreeHook => "merkleTreeHook",
            Self::ProtocolFee { .. } => "protocolFee",
            Self::AggregationHook { .. } => "aggregationHook",
        }
    }

    /// Key of the hook in the ledger.
    ///
    /// Parameterized hooks carry a digest of their configuration, so a changed
    /// parameter resolves to a different contract.
    pub fn ledger_key(&self) -> Result<String> {
        if matches!(self, Self::MerkleTreeHook) {
            return Ok(self.type_name().to_string());
        }
        let digest = fingerprint::digest(self)
            .with_context(|| format!("Failed to serialize {} hook", self.type_name()))?;
        Ok(format!("{}:{}", self.type_name(), &digest[..KEY_DIGEST_LEN]))
    }
}

/// Deploys hooks straight from bytecode artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactHookDeployer {
    artifacts: ContractArtifacts,
}

impl ArtifactHookDeployer {
    pub fn new(artifacts: ContractArtifacts) -> Self {
        Self { artifacts }
    }

    fn deploy_hook<'a, C: ChainClient>(
        &'a self,
        client: &'a C,
        config: &'a HookConfig,
        core: &'a CoreAddresses,
    ) -> BoxFuture<'a, Result<Address>> {
        async move {
            match config {
                HookConfig::MerkleTreeHook => {
                    let args: Bytes = (core.mailbox,).abi_encode_params().into();
                    chain::deploy_bytecode(client, &self.artifacts, MERKLE_TREE_HOOK, &args).await
                }
                HookConfig::ProtocolFee {
                    max_protocol_fee,
                    protocol_fee,
                    beneficiary,
                    owner,
                } => {
                    if protocol_fee > max_protocol_fee {
                        anyhow::bail!(
                            "Protocol fee {protocol_fee} exceeds the maximum {max_protocol_fee}"
                        );
                    }
                    let args: Bytes = (*max_protocol_fee, *protocol_fee, *beneficiary, *owner)
                        .abi_encode_params()
                        .into();
                    chain::deploy_bytecode(client, &self.artifacts, PROTOCOL_FEE_HOOK, &args).await
                }
                HookConfig::AggregationHook { hooks } => {
                    let mut children = Vec::with_capacity(hooks.len());
                    for hook in hooks {
                        children.push(self.deploy_hook(client, hook, core).await?);
                    }
                    let args: Bytes = (children,).abi_encode_params().into();
                    chain::deploy_bytecode(client, &self.artifacts, AGGREGATION_HOOK, &args).await
                }
            }
        }
        .boxed()
    }
}

impl HookDeployer for ArtifactHookDeployer {
    fn deploy<C: ChainClient>(
        &self,
        client: &C,
        chain: &str,
        config: &HookConfig,
        core: &CoreAddresses,
    ) -> impl Future<Output = Result<Address>> + Send {
        async move {
            tracing::info!(chain, kind = config.type_name(), "Deploying hook");
            self.deploy_hook(client, config, core).await
        }
    }
}
