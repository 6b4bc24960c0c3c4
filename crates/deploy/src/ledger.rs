//! Address ledger: which address is bound to which slot on which chain.
//!
//! The ledger is seeded from a prior run's output and populated as contracts
//! are deployed. It never invents addresses: a miss always means "deploy".

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use alloy_core::primitives::{Address, Bytes};
use alloy_sol_types::SolValue;
use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::chain::ChainClient;
use crate::contracts::TRANSPARENT_PROXY;
use crate::proxy;

/// A logical contract role within the per-chain topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    ProxyAdmin,
    TimelockController,
    Mailbox,
    ValidatorAnnounce,
    DefaultIsm,
    /// A hook, keyed by its type and a digest of its parameters.
    Hook(String),
    /// A default hook that was requested but could not be applied by this signer.
    CustomHook,
    /// Same as [`Slot::CustomHook`], for the required hook.
    CustomRequiredHook,
    TestRecipient,
    /// Implementation behind the proxy bound to the inner slot.
    Implementation(Box<Slot>),
}

impl Slot {
    pub fn hook(kind: impl Into<String>) -> Self {
        Self::Hook(kind.into())
    }

    pub fn implementation(of: Slot) -> Self {
        Self::Implementation(Box::new(of))
    }

    /// Whether the slot's contract exposes `owner()`/`transferOwnership`.
    pub fn is_ownable(&self) -> bool {
        matches!(self, Self::ProxyAdmin | Self::Mailbox | Self::TestRecipient)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProxyAdmin => f.write_str("proxy-admin"),
            Self::TimelockController => f.write_str("timelock-controller"),
            Self::Mailbox => f.write_str("mailbox"),
            Self::ValidatorAnnounce => f.write_str("validator-announce"),
            Self::DefaultIsm => f.write_str("default-ism"),
            Self::Hook(kind) => write!(f, "hook:{kind}"),
            Self::CustomHook => f.write_str("custom-hook"),
            Self::CustomRequiredHook => f.write_str("custom-required-hook"),
            Self::TestRecipient => f.write_str("test-recipient"),
            Self::Implementation(inner) => write!(f, "{inner}:implementation"),
        }
    }
}

impl FromStr for Slot {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(inner) = s.strip_suffix(":implementation") {
            return Ok(Self::implementation(inner.parse()?));
        }
        if let Some(kind) = s.strip_prefix("hook:") {
            if kind.is_empty() {
                anyhow::bail!("Hook slot without a hook type: '{s}'");
            }
            return Ok(Self::hook(kind));
        }
        Ok(match s {
            "proxy-admin" => Self::ProxyAdmin,
            "timelock-controller" => Self::TimelockController,
            "mailbox" => Self::Mailbox,
            "validator-announce" => Self::ValidatorAnnounce,
            "default-ism" => Self::DefaultIsm,
            "custom-hook" => Self::CustomHook,
            "custom-required-hook" => Self::CustomRequiredHook,
            "test-recipient" => Self::TestRecipient,
            _ => anyhow::bail!("Unknown contract slot: '{s}'"),
        })
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Slot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-chain mapping from slot to deployed address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressLedger {
    chains: BTreeMap<String, BTreeMap<Slot, Address>>,
}

impl AddressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The address bound to `slot`, if any. Zero addresses count as absent.
    pub fn lookup(&self, chain: &str, slot: &Slot) -> Option<Address> {
        self.chains
            .get(chain)
            .and_then(|slots| slots.get(slot))
            .copied()
            .filter(|address| !address.is_zero())
    }

    /// Bind `slot` to `address`. Rebinding overwrites.
    pub fn bind(&mut self, chain: &str, slot: Slot, address: Address) {
        tracing::debug!(chain, slot = %slot, address = %address, "Binding slot");
        self.chains
            .entry(chain.to_string())
            .or_default()
            .insert(slot, address);
    }

    /// All bindings of a chain.
    pub fn chain(&self, chain: &str) -> BTreeMap<Slot, Address> {
        self.chains.get(chain).cloned().unwrap_or_default()
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    /// Overlay another ledger's bindings onto this one.
    pub fn merge(&mut self, other: AddressLedger) {
        for (chain, slots) in other.chains {
            self.chains.entry(chain).or_default().extend(slots);
        }
    }
}

/// Input for source verification of one deployed contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationArtifact {
    pub name: String,
    pub address: Address,
    pub constructor_arguments: Bytes,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_implementation: Option<Address>,
}

impl VerificationArtifact {
    pub fn implementation(name: &str, address: Address, constructor_arguments: Bytes) -> Self {
        Self {
            name: name.to_string(),
            address,
            constructor_arguments,
            is_proxy: false,
            expected_implementation: None,
        }
    }

    pub fn proxy(address: Address, implementation: Address, admin: Address, init_data: Bytes) -> Self {
        Self {
            name: TRANSPARENT_PROXY.to_string(),
            address,
            constructor_arguments: proxy_constructor_args(implementation, admin, init_data),
            is_proxy: true,
            expected_implementation: Some(implementation),
        }
    }
}

/// Encoded `TransparentUpgradeableProxy(address,address,bytes)` arguments.
pub fn proxy_constructor_args(implementation: Address, admin: Address, init_data: Bytes) -> Bytes {
    (implementation, admin, init_data).abi_encode_params().into()
}

/// Rebuild the verification input of an address taken from the ledger.
///
/// Proxies yield an implementation artifact and a proxy artifact whose
/// constructor arguments are re-derived from the live EIP-1967 slots.
pub async fn recover_verification_artifacts<C: ChainClient>(
    client: &C,
    name: &str,
    address: Address,
    constructor_args: &Bytes,
    init_data: Option<&Bytes>,
) -> Result<Vec<VerificationArtifact>> {
    if !proxy::is_proxy(client, address).await? {
        return Ok(vec![VerificationArtifact::implementation(
            name,
            address,
            constructor_args.clone(),
        )]);
    }

    let implementation = proxy::implementation_of(client, address).await?;
    let admin = proxy::admin_of(client, address).await?;
    tracing::debug!(
        contract = name,
        proxy = %address,
        implementation = %implementation,
        admin = %admin,
        "Recovered proxy verification input"
    );

    Ok(vec![
        VerificationArtifact::implementation(name, implementation, constructor_args.clone()),
        VerificationArtifact::proxy(
            address,
            implementation,
            admin,
            init_data.cloned().unwrap_or_default(),
        ),
    ])
}
