//! mailstack-deploy - Resumable deployment of the messaging core contracts.
//!
//! This crate deploys a Mailbox with its ProxyAdmin, security modules, hooks
//! and dependents on any number of EVM chains, and converges contracts left by
//! earlier runs to the declared configuration.

pub mod authority;
pub mod chain;
pub mod config;
pub mod context;
pub mod contracts;
pub mod fingerprint;
pub mod ledger;
pub mod orchestrator;
pub mod output;
pub mod proxy;
pub mod reconcile;
pub mod rpc;
pub mod strategies;

pub use authority::{Authority, AuthorityOutcome};
pub use chain::{ChainClient, TransactionReceipt, TransactionRequest, TxOverrides};
pub use config::{
    ChainConfig, CoreConfig, DeploymentConfig, SignerConfig, TimelockConfig, UpgradeConfig,
};
pub use context::DeployContext;
pub use contracts::ContractArtifacts;
pub use fingerprint::ChainFingerprint;
pub use ledger::{AddressLedger, Slot, VerificationArtifact};
pub use orchestrator::{
    BatchReport, ChainFailure, ChainOutcome, ChainReport, ChainTarget, CoreDeployer, DeployStage,
    InitOutcome, Unreconciled,
};
pub use output::DeploymentOutput;
pub use reconcile::{HookAccessor, ModuleAccessor, OwnershipTransfer, Reconciled};
pub use rpc::JsonRpcChainClient;
pub use strategies::{
    ArtifactHookDeployer, ArtifactModuleDeployer, CoreAddresses, HookConfig, HookDeployer,
    HookSpec, LoggingVerifier, ModuleConfig, ModuleDeployer, ModuleSpec, VerificationSink,
};
