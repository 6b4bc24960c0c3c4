//! Target configuration for a multi-chain deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use alloy_core::primitives::Address;
use alloy_signer_local::MnemonicBuilder;
use alloy_signer_local::coins_bip39::English;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::TxOverrides;
use crate::ledger::Slot;
use crate::strategies::{HookSpec, ModuleSpec};

/// The default name of the deployment configuration file.
pub const CONFIG_FILENAME: &str = "Mailstack.toml";

/// Every chain to deploy on, keyed by chain name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub chains: BTreeMap<String, ChainConfig>,
}

impl DeploymentConfig {
    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployment config to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, or from `Mailstack.toml` in a directory.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file or directory not found: {}", path.display());
        }

        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config from {}", config_path.display()))?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse config file as TOML")?;
        tracing::info!(path = %config_path.display(), chains = config.chains.len(), "Configuration loaded");
        Ok(config)
    }

    /// Restrict the configuration to `names`. Unknown names are an error.
    pub fn select(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }

        let mut selected = BTreeMap::new();
        for name in names {
            let chain = self
                .chains
                .remove(name)
                .with_context(|| format!("Chain '{name}' is not configured"))?;
            selected.insert(name.clone(), chain);
        }
        self.chains = selected;
        Ok(self)
    }
}

/// Connection and target state of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Messaging domain of the chain, passed to the Mailbox constructor.
    pub domain_id: u32,
    pub rpc_url: Url,
    pub signer: SignerConfig,
    #[serde(default)]
    pub overrides: TxOverrides,
    pub core: CoreConfig,
}

/// Account that sends transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Explicit signer address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    /// BIP-39 phrase the signer is derived from when no address is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    #[serde(default)]
    pub index: u32,
}

impl SignerConfig {
    /// Address of the configured signer.
    pub fn resolve_address(&self) -> Result<Address> {
        if let Some(address) = self.address {
            return Ok(address);
        }

        let phrase = self
            .mnemonic
            .as_deref()
            .context("Signer needs either an address or a mnemonic")?;
        let wallet = MnemonicBuilder::<English>::default()
            .phrase(phrase)
            .index(self.index)
            .context("Invalid derivation index")?
            .build()
            .context("Failed to derive signer from mnemonic")?;

        Ok(Address::from_slice(wallet.address().as_slice()))
    }
}

/// Declared target state of the core contracts of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Final owner of every ownable contract.
    pub owner: Address,
    /// Per-slot owners taking precedence over `owner`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub owner_overrides: BTreeMap<Slot, Address>,
    pub default_ism: ModuleSpec,
    pub default_hook: HookSpec,
    pub required_hook: HookSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeConfig>,
    /// Slots left out of this chain's topology.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed_slots: BTreeSet<Slot>,
}

impl CoreConfig {
    pub fn is_removed(&self, slot: &Slot) -> bool {
        self.removed_slots.contains(slot)
    }

    pub fn timelock(&self) -> Option<&TimelockConfig> {
        self.upgrade.as_ref().and_then(|upgrade| upgrade.timelock.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timelock: Option<TimelockConfig>,
}

/// Timelock that takes ownership of the ProxyAdmin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockConfig {
    /// Minimum delay in seconds between scheduling and executing an upgrade.
    pub min_delay: u64,
    pub proposers: Vec<Address>,
    #[serde(default)]
    pub executors: Vec<Address>,
}
