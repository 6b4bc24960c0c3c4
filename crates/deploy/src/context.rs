//! Per-chain deployment context shared by every stage.

use alloy_core::primitives::{Address, Bytes};
use anyhow::Result;

use crate::chain::{self, ChainClient, is_already_initialized};
use crate::contracts::ContractArtifacts;
use crate::ledger::{AddressLedger, Slot, VerificationArtifact, recover_verification_artifacts};

/// Everything a stage needs to deploy on one chain.
pub struct DeployContext<'a, C: ChainClient> {
    pub chain: &'a str,
    pub client: &'a C,
    pub artifacts: &'a ContractArtifacts,
    pub ledger: &'a mut AddressLedger,
    /// Verification input gathered during this pass over the chain.
    pub verification: Vec<VerificationArtifact>,
}

impl<'a, C: ChainClient> DeployContext<'a, C> {
    pub fn new(
        chain: &'a str,
        client: &'a C,
        artifacts: &'a ContractArtifacts,
        ledger: &'a mut AddressLedger,
    ) -> Self {
        Self {
            chain,
            client,
            artifacts,
            ledger,
            verification: Vec::new(),
        }
    }

    pub fn signer(&self) -> Address {
        self.client.signer_address()
    }

    pub fn lookup(&self, slot: &Slot) -> Option<Address> {
        self.ledger.lookup(self.chain, slot)
    }

    pub fn bind(&mut self, slot: Slot, address: Address) {
        self.ledger.bind(self.chain, slot, address);
    }

    /// Ledger entry for `slot`, provided code is still deployed there.
    pub async fn live_binding(&self, slot: &Slot) -> Result<Option<Address>> {
        let Some(address) = self.lookup(slot) else {
            return Ok(None);
        };

        if chain::has_code(self.client, address).await? {
            return Ok(Some(address));
        }

        tracing::warn!(
            chain = self.chain,
            slot = %slot,
            address = %address,
            "Ledger address has no code, ignoring it"
        );
        Ok(None)
    }

    /// Reuse the contract bound to `slot` or deploy `name` fresh.
    ///
    /// A fresh contract is initialized right away when `initializer` is set;
    /// an "already initialized" revert there is harmless.
    pub async fn deploy_contract(
        &mut self,
        slot: Slot,
        name: &str,
        constructor_args: Bytes,
        initializer: Option<Bytes>,
    ) -> Result<Address> {
        if let Some(address) = self.live_binding(&slot).await? {
            tracing::info!(
                chain = self.chain,
                slot = %slot,
                address = %address,
                "Reusing deployed contract"
            );
            let recovered = recover_verification_artifacts(
                self.client,
                name,
                address,
                &constructor_args,
                initializer.as_ref(),
            )
            .await?;
            self.verification.extend(recovered);
            return Ok(address);
        }

        let address =
            chain::deploy_bytecode(self.client, self.artifacts, name, &constructor_args).await?;
        self.bind(slot, address);
        self.verification.push(VerificationArtifact::implementation(
            name,
            address,
            constructor_args,
        ));

        if let Some(initializer) = initializer {
            let tx = chain::TransactionRequest::call(address, initializer)
                .with_overrides(self.client.transaction_overrides());
            match self.client.submit(tx).await {
                Ok(_) => {}
                Err(err) if is_already_initialized(&err) => {
                    tracing::debug!(contract = name, address = %address, "Implementation already initialized");
                }
                Err(err) => return Err(err.context(format!("Failed to initialize {name}"))),
            }
        }

        Ok(address)
    }
}
