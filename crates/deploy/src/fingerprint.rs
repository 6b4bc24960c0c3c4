use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CoreConfig;

/// Compute a SHA-256 hash of a chain's target state.
///
/// Only the domain and the core configuration take part: the RPC endpoint,
/// signer and fee overrides do not change what gets deployed. Maps in the
/// configuration are ordered, so the JSON encoding and the hash are deterministic.
pub fn config_hash(domain_id: u32, core: &CoreConfig) -> Result<String> {
    digest(&(domain_id, core)).context("Failed to serialize chain configuration")
}

/// Hex SHA-256 of the JSON encoding of `value`.
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;

    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Configuration fingerprint stored with a chain's deployment output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFingerprint {
    /// SHA-256 hash of the chain's target configuration.
    pub config_hash: String,
    /// Unix timestamp of the run that produced the deployment.
    pub deployed_at: i64,
    /// Version of the tool that produced the deployment.
    pub version: String,
}

impl ChainFingerprint {
    pub fn new(config_hash: String) -> Self {
        Self {
            config_hash,
            deployed_at: chrono::Utc::now().timestamp(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Compare against the fingerprint of a previous run and log the result.
    pub fn log_drift(&self, chain: &str, previous: Option<&ChainFingerprint>) {
        match previous {
            None => tracing::info!(chain, "No previous deployment fingerprint"),
            Some(previous) if previous.config_hash == self.config_hash => {
                tracing::info!(chain, hash = %self.config_hash, "Configuration unchanged");
            }
            Some(previous) => tracing::info!(
                chain,
                previous = %previous.config_hash,
                current = %self.config_hash,
                "Configuration changed since last deployment"
            ),
        }
    }
}
