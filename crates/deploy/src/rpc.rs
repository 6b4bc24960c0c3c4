//! JSON-RPC transport and a [`ChainClient`] backed by an HTTP endpoint.

use std::future::Future;
use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use url::Url;

use crate::chain::{self, ChainClient, TransactionReceipt, TransactionRequest, TxOverrides};

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polling attempts when waiting for a result.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default time to wait for a submitted transaction to be included.
const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts for read-only calls before giving up.
const READ_ATTEMPTS: usize = 3;

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
///
/// # Returns
/// The deserialized result, or an error if the request failed or returned an error response.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, anyhow::Error> {
    let response = client
        .post(url)
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown");
        match error.get("data").and_then(|d| d.as_str()) {
            Some(data) => anyhow::bail!("RPC error: {} ({})", message, data),
            None => anyhow::bail!("RPC error: {}", message),
        }
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Poll `check_fn` until it yields a value or `timeout` elapses.
///
/// # Arguments
/// * `name` - What is being waited for (for error messages)
/// * `timeout` - Maximum time to wait
/// * `check_fn` - Returns `Ok(Some(_))` once ready, `Ok(None)` or an error to keep waiting
pub async fn wait_until_ready<T, F, Fut>(
    name: &str,
    timeout: Duration,
    check_fn: F,
) -> Result<T, anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>, anyhow::Error>>,
{
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            anyhow::bail!("Timeout waiting for {}", name);
        }

        match check_fn().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => tracing::trace!(target_name = %name, "Not ready yet, retrying..."),
            Err(e) => {
                tracing::trace!(error = %e, target_name = %name, "Readiness check failed, retrying...");
            }
        }

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Whether a failed read is worth retrying.
fn is_transient(err: &anyhow::Error) -> bool {
    !chain::is_revert(err)
}

/// Error for a mined transaction that reverted.
///
/// `replay` is the transaction re-run with `eth_call` at its block; its error
/// carries the revert reason the receipt lacks.
fn reverted(hash: B256, replay: anyhow::Result<Bytes>) -> anyhow::Error {
    match replay {
        Err(err) => anyhow::anyhow!("Transaction {hash} reverted: {err:#}"),
        Ok(_) => anyhow::anyhow!("Transaction {hash} reverted"),
    }
}

fn hex_quantity(value: impl Into<U256>) -> String {
    format!("0x{:x}", value.into())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U256>,
    contract_address: Option<Address>,
    status: Option<U256>,
}

/// A [`ChainClient`] speaking Ethereum JSON-RPC.
///
/// Transactions are sent with `eth_sendTransaction`, so the endpoint must hold
/// the signer's key (an unlocked dev account or a signing proxy).
#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    url: Url,
    signer: Address,
    overrides: TxOverrides,
    receipt_timeout: Duration,
}

impl JsonRpcChainClient {
    pub fn new(url: Url, signer: Address, overrides: TxOverrides) -> anyhow::Result<Self> {
        Ok(Self {
            client: create_client()?,
            url,
            signer,
            overrides,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// A read-only call, retried with exponential backoff on transient errors.
    async fn read_call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<Value>,
    ) -> anyhow::Result<T> {
        (|| json_rpc_call::<T>(&self.client, self.url.as_str(), method, params.clone()))
            .retry(ExponentialBuilder::default().with_max_times(READ_ATTEMPTS))
            .when(is_transient)
            .notify(|err, after| {
                tracing::debug!(method, error = %err, retry_in = ?after, "RPC read failed, retrying");
            })
            .await
    }

    fn transaction_object(&self, tx: &TransactionRequest) -> Value {
        let mut object = json!({
            "from": self.signer,
            "data": tx.data,
            "value": hex_quantity(tx.value),
        });
        if let Some(to) = tx.to {
            object["to"] = json!(to);
        }

        let overrides = &tx.overrides;
        if let Some(gas) = overrides.gas_limit {
            object["gas"] = json!(hex_quantity(U256::from(gas)));
        }
        if let Some(price) = overrides.gas_price {
            object["gasPrice"] = json!(hex_quantity(U256::from(price)));
        }
        if let Some(max_fee) = overrides.max_fee_per_gas {
            object["maxFeePerGas"] = json!(hex_quantity(U256::from(max_fee)));
        }
        if let Some(tip) = overrides.max_priority_fee_per_gas {
            object["maxPriorityFeePerGas"] = json!(hex_quantity(U256::from(tip)));
        }
        object
    }
}

impl ChainClient for JsonRpcChainClient {
    fn signer_address(&self) -> Address {
        self.signer
    }

    fn transaction_overrides(&self) -> TxOverrides {
        self.overrides.clone()
    }

    fn get_code(&self, address: Address) -> impl Future<Output = anyhow::Result<Bytes>> + Send {
        self.read_call("eth_getCode", vec![json!(address), json!("latest")])
    }

    fn get_storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = anyhow::Result<B256>> + Send {
        self.read_call(
            "eth_getStorageAt",
            vec![json!(address), json!(slot), json!("latest")],
        )
    }

    fn get_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send {
        async move {
            let number: U256 = self.read_call("eth_blockNumber", vec![]).await?;
            u64::try_from(number).map_err(|_| anyhow::anyhow!("Block number {number} does not fit in u64"))
        }
    }

    fn call(&self, to: Address, data: Bytes) -> impl Future<Output = anyhow::Result<Bytes>> + Send {
        let request = json!({ "from": self.signer, "to": to, "data": data });
        self.read_call("eth_call", vec![request, json!("latest")])
    }

    fn submit(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = anyhow::Result<TransactionReceipt>> + Send {
        async move {
            let request = self.transaction_object(&tx);
            let hash: B256 = json_rpc_call(
                &self.client,
                self.url.as_str(),
                "eth_sendTransaction",
                vec![request.clone()],
            )
            .await?;
            tracing::debug!(tx_hash = %hash, "Transaction submitted, waiting for receipt");

            let receipt: RpcReceipt = wait_until_ready(
                &format!("receipt of {hash}"),
                self.receipt_timeout,
                || {
                    json_rpc_call::<Option<RpcReceipt>>(
                        &self.client,
                        self.url.as_str(),
                        "eth_getTransactionReceipt",
                        vec![json!(hash)],
                    )
                },
            )
            .await?;

            if receipt.status == Some(U256::ZERO) {
                let block = receipt
                    .block_number
                    .map(|number| hex_quantity(number))
                    .unwrap_or_else(|| "latest".to_string());
                let replay: anyhow::Result<Bytes> = json_rpc_call(
                    &self.client,
                    self.url.as_str(),
                    "eth_call",
                    vec![request, json!(block)],
                )
                .await;
                return Err(reverted(receipt.transaction_hash, replay));
            }

            Ok(TransactionReceipt {
                transaction_hash: receipt.transaction_hash,
                block_number: receipt.block_number.map(|number| number.saturating_to()),
                contract_address: receipt.contract_address,
            })
        }
    }
}
