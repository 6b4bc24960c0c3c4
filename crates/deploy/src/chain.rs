//! Chain client abstraction consumed by the deployment engine.
//!
//! Transaction signing, fee estimation and nonce management live behind
//! [`ChainClient`]. The engine only reads state, submits transactions and waits
//! for their inclusion.

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::SolCall;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::contracts::ContractArtifacts;

/// Fee and gas parameters applied to every transaction sent on a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<u64>,
}

/// A transaction to be sent by the active signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    /// Destination, `None` for a contract creation.
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub overrides: TxOverrides,
}

impl TransactionRequest {
    /// A call to an existing contract.
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to: Some(to),
            data: data.into(),
            value: U256::ZERO,
            overrides: TxOverrides::default(),
        }
    }

    /// A contract creation with the given init code.
    pub fn create(init_code: impl Into<Bytes>) -> Self {
        Self {
            to: None,
            data: init_code.into(),
            value: U256::ZERO,
            overrides: TxOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: TxOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Receipt of an included transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    /// Address of the created contract, for creations.
    pub contract_address: Option<Address>,
}

/// Client for a single chain, bound to the signer that deploys on it.
pub trait ChainClient: Send + Sync {
    /// Address of the active signer.
    fn signer_address(&self) -> Address;

    /// Fee/gas parameters to attach to transactions.
    fn transaction_overrides(&self) -> TxOverrides;

    /// Deployed code at `address` (empty for externally-owned accounts).
    fn get_code(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send;

    /// Raw storage word of `address` at `slot`.
    fn get_storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = Result<B256>> + Send;

    fn get_block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Read-only call.
    fn call(&self, to: Address, data: Bytes) -> impl Future<Output = Result<Bytes>> + Send;

    /// Submit a transaction and block until it is included.
    ///
    /// Reverted transactions are returned as errors carrying the revert reason.
    fn submit(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<TransactionReceipt>> + Send;
}

/// Whether `address` hosts contract code.
pub async fn has_code<C: ChainClient>(client: &C, address: Address) -> Result<bool> {
    if address.is_zero() {
        return Ok(false);
    }
    let code = client
        .get_code(address)
        .await
        .with_context(|| format!("Failed to fetch code at {address}"))?;
    Ok(!code.is_empty())
}

/// Perform a typed read-only call.
pub async fn read<T, C>(client: &C, to: Address, call: T) -> Result<T::Return>
where
    T: SolCall + Send,
    C: ChainClient,
{
    let output = client
        .call(to, call.abi_encode().into())
        .await
        .with_context(|| format!("Call to {}({}) failed", T::SIGNATURE, to))?;
    T::abi_decode_returns(&output, true)
        .with_context(|| format!("Malformed {} return data from {}", T::SIGNATURE, to))
}

/// Send a typed call from the active signer and wait for inclusion.
pub async fn send<T, C>(client: &C, to: Address, call: T) -> Result<TransactionReceipt>
where
    T: SolCall + Send,
    C: ChainClient,
{
    let tx = TransactionRequest::call(to, call.abi_encode())
        .with_overrides(client.transaction_overrides());
    let receipt = client
        .submit(tx)
        .await
        .with_context(|| format!("Transaction {} to {} failed", T::SIGNATURE, to))?;
    tracing::debug!(
        to = %to,
        method = T::SIGNATURE,
        tx_hash = %receipt.transaction_hash,
        "Transaction included"
    );
    Ok(receipt)
}

/// Deploy the artifact `name` with ABI-encoded `constructor_args`.
pub async fn deploy_bytecode<C: ChainClient>(
    client: &C,
    artifacts: &ContractArtifacts,
    name: &str,
    constructor_args: &Bytes,
) -> Result<Address> {
    let init_code = artifacts.init_code(name, constructor_args)?;
    let tx = TransactionRequest::create(init_code).with_overrides(client.transaction_overrides());

    let receipt = client
        .submit(tx)
        .await
        .with_context(|| format!("Failed to deploy {name}"))?;
    let address = receipt
        .contract_address
        .with_context(|| format!("Deployment receipt of {name} has no contract address"))?;

    tracing::info!(contract = name, address = %address, "Contract deployed");
    Ok(address)
}

/// Whether an error chain carries a revert. Reverts are deterministic.
pub fn is_revert(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.to_string().contains("revert"))
}

/// Whether an error chain carries an "already initialized" revert.
///
/// Revert data is not decoded uniformly by chain clients, so this matches on
/// the rendered message.
pub fn is_already_initialized(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.to_string().contains("already initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_initialized_is_found_in_context_chain() {
        let err = anyhow::anyhow!("execution reverted: Initializable: contract is already initialized")
            .context("Transaction initialize(address,address,address,address) failed");
        assert!(is_already_initialized(&err));
    }

    #[test]
    fn test_reverts_are_found_in_context_chain() {
        let err = anyhow::anyhow!("RPC error: execution reverted").context("Call to moduleType() failed");
        assert!(is_revert(&err));
        assert!(!is_revert(&anyhow::anyhow!("connection refused")));
    }

    #[test]
    fn test_other_reverts_are_not_already_initialized() {
        let err = anyhow::anyhow!("execution reverted: Ownable: caller is not the owner");
        assert!(!is_already_initialized(&err));
    }
}
