//! Pluggable strategies the engine calls through narrow contracts.
//!
//! - [`ModuleDeployer`] - deploys and compares interchain security modules
//! - [`HookDeployer`] - deploys post-dispatch hooks
//! - [`VerificationSink`] - receives source verification input

pub mod hook;
pub mod ism;
pub mod verification;

use std::future::Future;

use alloy_core::primitives::Address;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::chain::ChainClient;
use crate::ledger::VerificationArtifact;

pub use hook::{ArtifactHookDeployer, HookConfig, HookSpec};
pub use ism::{ArtifactModuleDeployer, ModuleConfig, ModuleSpec, ModuleType, RoutedModule};
pub use verification::LoggingVerifier;

/// Core contracts a hook may need to reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAddresses {
    pub proxy_admin: Address,
    pub mailbox: Address,
}

/// Deploys security modules and decides whether an existing one satisfies a spec.
pub trait ModuleDeployer: Send + Sync {
    fn deploy<C: ChainClient>(
        &self,
        client: &C,
        chain: &str,
        config: &ModuleConfig,
        mailbox: Address,
    ) -> impl Future<Output = Result<Address>> + Send;

    /// Whether the module at `existing` is equivalent to `config`,
    /// regardless of address identity.
    fn structurally_matches<C: ChainClient>(
        &self,
        client: &C,
        chain: &str,
        existing: Address,
        config: &ModuleConfig,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            tracing::trace!(chain, module = %existing, "Comparing module against spec");
            ism::matches_config(client, existing, config).await
        }
    }
}

/// Deploys post-dispatch hooks.
pub trait HookDeployer: Send + Sync {
    fn deploy<C: ChainClient>(
        &self,
        client: &C,
        chain: &str,
        config: &HookConfig,
        core: &CoreAddresses,
    ) -> impl Future<Output = Result<Address>> + Send;
}

/// Receives verification input. Failures are logged by the caller and never
/// abort a deployment.
pub trait VerificationSink: Send + Sync {
    fn submit(
        &self,
        chain: &str,
        artifact: &VerificationArtifact,
    ) -> impl Future<Output = Result<()>> + Send;
}
