use std::future::Future;

use anyhow::Result;

use super::VerificationSink;
use crate::ledger::VerificationArtifact;

/// Sink that only logs verification input, for runs without an explorer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingVerifier;

impl VerificationSink for LoggingVerifier {
    fn submit(
        &self,
        chain: &str,
        artifact: &VerificationArtifact,
    ) -> impl Future<Output = Result<()>> + Send {
        tracing::info!(
            chain,
            contract = %artifact.name,
            address = %artifact.address,
            is_proxy = artifact.is_proxy,
            constructor_args = %artifact.constructor_arguments,
            "Verification input"
        );
        std::future::ready(Ok(()))
    }
}
