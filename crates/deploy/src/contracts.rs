//! Contract interfaces, names and bytecode artifacts.

use std::collections::BTreeMap;
use std::path::Path;

use alloy_core::primitives::{B256, Bytes, b256};
use anyhow::{Context, Result};
use derive_more::Deref;
use serde_json::Value;

/// EIP-1967 implementation slot: `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`.
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");
/// EIP-1967 admin slot: `bytes32(uint256(keccak256("eip1967.proxy.admin")) - 1)`.
pub const ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

pub const PROXY_ADMIN: &str = "ProxyAdmin";
pub const TRANSPARENT_PROXY: &str = "TransparentUpgradeableProxy";
pub const TIMELOCK_CONTROLLER: &str = "TimelockController";
pub const MAILBOX: &str = "Mailbox";
pub const VALIDATOR_ANNOUNCE: &str = "ValidatorAnnounce";
pub const TEST_RECIPIENT: &str = "TestRecipient";
pub const MESSAGE_ID_MULTISIG_ISM: &str = "StaticMessageIdMultisigIsm";
pub const MERKLE_ROOT_MULTISIG_ISM: &str = "StaticMerkleRootMultisigIsm";
pub const AGGREGATION_ISM: &str = "StaticAggregationIsm";
pub const DOMAIN_ROUTING_ISM: &str = "DomainRoutingIsm";
pub const TEST_ISM: &str = "TestIsm";
pub const MERKLE_TREE_HOOK: &str = "MerkleTreeHook";
pub const PROTOCOL_FEE_HOOK: &str = "ProtocolFee";
pub const AGGREGATION_HOOK: &str = "StaticAggregationHook";

alloy_sol_types::sol! {
    interface IOwnable {
        function owner() external view returns (address);
        function transferOwnership(address newOwner) external;
    }

    interface IProxyAdmin {
        function upgrade(address proxy, address implementation) external;
        function upgradeAndCall(address proxy, address implementation, bytes data) external payable;
        function changeProxyAdmin(address proxy, address newAdmin) external;
    }

    interface ITransparentUpgradeableProxy {
        function upgradeTo(address newImplementation) external;
        function upgradeToAndCall(address newImplementation, bytes data) external payable;
        function changeAdmin(address newAdmin) external;
    }

    interface IMailbox {
        function initialize(address _owner, address _defaultIsm, address _defaultHook, address _requiredHook) external;
        function localDomain() external view returns (uint32);
        function defaultIsm() external view returns (address);
        function defaultHook() external view returns (address);
        function requiredHook() external view returns (address);
        function setDefaultIsm(address _module) external;
        function setDefaultHook(address _hook) external;
        function setRequiredHook(address _hook) external;
    }

    interface ITestRecipient {
        function interchainSecurityModule() external view returns (address);
        function setInterchainSecurityModule(address _ism) external;
    }

    interface IInterchainSecurityModule {
        function moduleType() external view returns (uint8);
    }

    interface IMultisigIsm {
        function validatorsAndThreshold(bytes _message) external view returns (address[] validators, uint8 threshold);
    }

    interface IAggregationIsm {
        function modulesAndThreshold(bytes _message) external view returns (address[] modules, uint8 threshold);
    }

    interface IRoutingIsm {
        function initialize(address _owner, uint32[] _domains, address[] _modules) external;
        function domains() external view returns (uint256[]);
        function module(uint32 origin) external view returns (address);
    }
}

/// Creation bytecode of every deployable contract, keyed by contract name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref)]
pub struct ContractArtifacts(BTreeMap<String, Bytes>);

impl ContractArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytecode: impl Into<Bytes>) {
        self.0.insert(name.into(), bytecode.into());
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn init_code(&self, name: &str, constructor_args: &[u8]) -> Result<Bytes> {
        let bytecode = self
            .0
            .get(name)
            .with_context(|| format!("No bytecode artifact for contract {name}"))?;
        let mut init_code = Vec::with_capacity(bytecode.len() + constructor_args.len());
        init_code.extend_from_slice(bytecode);
        init_code.extend_from_slice(constructor_args);
        Ok(init_code.into())
    }

    /// Load every `<Name>.json` file of a directory.
    ///
    /// Accepts Foundry output (`{"bytecode": {"object": "0x.."}}`) as well as a
    /// flat `{"bytecode": "0x.."}`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut artifacts = Self::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read artifacts directory {}", dir.display()))?;

        for entry in entries {
            let path = entry.context("Failed to read artifacts directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let json: Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            let bytecode = json["bytecode"]["object"]
                .as_str()
                .or_else(|| json["bytecode"].as_str())
                .with_context(|| format!("No bytecode in {}", path.display()))?;
            let bytecode = hex::decode(bytecode.trim_start_matches("0x"))
                .with_context(|| format!("Invalid bytecode hex in {}", path.display()))?;

            tracing::debug!(contract = name, size = bytecode.len(), "Loaded artifact");
            artifacts.insert(name, bytecode);
        }

        Ok(artifacts)
    }
}

impl<N: Into<String>, B: Into<Bytes>> FromIterator<(N, B)> for ContractArtifacts {
    fn from_iter<I: IntoIterator<Item = (N, B)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, code)| (name.into(), code.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_init_code_appends_constructor_args() {
        let artifacts = ContractArtifacts::from_iter([(MAILBOX, vec![0xaa, 0xbb])]);
        let init_code = artifacts.init_code(MAILBOX, &[0x01, 0x02]).unwrap();
        assert_eq!(init_code.as_ref(), &[0xaa, 0xbb, 0x01, 0x02]);
    }

    #[test]
    fn test_missing_artifact_is_an_error() {
        let artifacts = ContractArtifacts::new();
        assert!(artifacts.init_code(PROXY_ADMIN, &[]).is_err());
    }

    #[test]
    fn test_load_foundry_and_flat_artifacts() {
        let temp_dir = TempDir::new("mailstack-artifacts").expect("Failed to create temp dir");
        std::fs::write(
            temp_dir.path().join("Mailbox.json"),
            r#"{"abi": [], "bytecode": {"object": "0x6080"}}"#,
        )
        .unwrap();
        std::fs::write(
            temp_dir.path().join("ProxyAdmin.json"),
            r#"{"bytecode": "0x6060"}"#,
        )
        .unwrap();
        std::fs::write(temp_dir.path().join("README.md"), "not an artifact").unwrap();

        let artifacts = ContractArtifacts::load_from_dir(temp_dir.path()).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[MAILBOX].as_ref(), &[0x60, 0x80]);
        assert_eq!(artifacts[PROXY_ADMIN].as_ref(), &[0x60, 0x60]);
    }
}
