//! Deployment output persisted between runs.
//!
//! Layout of the output directory:
//! - `addresses.json` - `{chain: {slot: address}}`
//! - `verification.json` - `{chain: [artifact]}`
//! - `fingerprints.json` - `{chain: fingerprint}`

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::fingerprint::ChainFingerprint;
use crate::ledger::{AddressLedger, VerificationArtifact};

pub const ADDRESSES_FILENAME: &str = "addresses.json";
pub const VERIFICATION_FILENAME: &str = "verification.json";
pub const FINGERPRINTS_FILENAME: &str = "fingerprints.json";

/// Everything a run leaves behind for the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentOutput {
    pub ledger: AddressLedger,
    pub verification: BTreeMap<String, Vec<VerificationArtifact>>,
    pub fingerprints: BTreeMap<String, ChainFingerprint>,
}

impl DeploymentOutput {
    /// Load the output of a previous run. Missing files yield empty sections.
    pub fn load(dir: &Path) -> Result<Self> {
        let output = Self {
            ledger: read_json(&dir.join(ADDRESSES_FILENAME))?.unwrap_or_default(),
            verification: read_json(&dir.join(VERIFICATION_FILENAME))?.unwrap_or_default(),
            fingerprints: read_json(&dir.join(FINGERPRINTS_FILENAME))?.unwrap_or_default(),
        };
        tracing::debug!(
            path = %dir.display(),
            chains = output.ledger.chains().count(),
            "Loaded previous deployment output"
        );
        Ok(output)
    }

    /// Write all three files, creating `dir` if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

        write_json(&dir.join(ADDRESSES_FILENAME), &self.ledger)?;
        write_json(&dir.join(VERIFICATION_FILENAME), &self.verification)?;
        write_json(&dir.join(FINGERPRINTS_FILENAME), &self.fingerprints)?;

        tracing::debug!(path = %dir.display(), "Deployment output saved");
        Ok(())
    }

    /// Merge verification input into `chain`'s list, keeping one entry per address.
    pub fn merge_verification(&mut self, chain: &str, artifacts: &[VerificationArtifact]) {
        let mut by_address = BTreeMap::new();
        let existing = self.verification.remove(chain).unwrap_or_default();
        for artifact in existing.iter().chain(artifacts) {
            by_address.insert(artifact.address, artifact.clone());
        }
        self.verification
            .insert(chain.to_string(), by_address.into_values().collect());
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Slot;
    use alloy_core::primitives::{Bytes, address};
    use tempdir::TempDir;

    #[test]
    fn test_load_missing_directory_is_empty() {
        let temp_dir = TempDir::new("mailstack-test").expect("Failed to create temp dir");
        let output = DeploymentOutput::load(&temp_dir.path().join("absent")).unwrap();
        assert_eq!(output, DeploymentOutput::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new("mailstack-test").expect("Failed to create temp dir");
        let dir = temp_dir.path().join("out");
        let mailbox = address!("00000000000000000000000000000000000000aa");

        let mut output = DeploymentOutput::default();
        output.ledger.bind("alpha", Slot::Mailbox, mailbox);
        output.merge_verification(
            "alpha",
            &[VerificationArtifact::implementation("Mailbox", mailbox, Bytes::new())],
        );
        output
            .fingerprints
            .insert("alpha".to_string(), ChainFingerprint::new("abc".to_string()));
        output.save(&dir).unwrap();

        assert_eq!(DeploymentOutput::load(&dir).unwrap(), output);
    }

    #[test]
    fn test_verification_is_deduplicated_by_address() {
        let mailbox = address!("00000000000000000000000000000000000000aa");
        let artifact = VerificationArtifact::implementation("Mailbox", mailbox, Bytes::new());

        let mut output = DeploymentOutput::default();
        output.merge_verification("alpha", &[artifact.clone(), artifact]);
        assert_eq!(output.verification["alpha"].len(), 1);
    }

    #[test]
    fn test_corrupted_file_is_an_error() {
        let temp_dir = TempDir::new("mailstack-test").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ADDRESSES_FILENAME), "{ invalid json }").unwrap();
        assert!(DeploymentOutput::load(temp_dir.path()).is_err());
    }
}
