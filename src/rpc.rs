//! Retrying JSON-RPC client for the target chain.
//!
//! Every call is attempted up to [`MAX_RPC_ATTEMPTS`] times. On exhaustion
//! the call resolves to `None` rather than an error: callers must treat an
//! empty result as "unknown outcome" and decide at their own boundary
//! whether that is fatal. Retried calls are idempotent at the chain level
//! (reads, or raw transaction re-broadcasts with an unchanged hash).

use std::future::Future;

use alloy_network::Ethereum;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types::{Block, BlockNumberOrTag, Filter, Log, TransactionRequest};
use eyre::{Result, WrapErr};
use tracing::warn;

/// Maximum attempts for a single logical RPC call.
pub const MAX_RPC_ATTEMPTS: u32 = 5;

/// Runs `op` up to `max_attempts` times, returning `None` once the bound is
/// exhausted. Each attempt after the first emits a `warn` event carrying the
/// attempt counter.
pub async fn with_retries<T, E, F, Fut>(method: &str, max_attempts: u32, op: F) -> Option<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            warn!(method, attempt, max_attempts, "retrying rpc call");
        }
        match op().await {
            Ok(value) => return Some(value),
            Err(err) => {
                warn!(method, attempt, max_attempts, error = %err, "rpc call failed");
            }
        }
    }
    warn!(method, max_attempts, "rpc call exhausted retries, treating outcome as unknown");
    None
}

/// HTTP JSON-RPC client with a fixed per-call retry bound.
#[derive(Debug, Clone)]
pub struct RetryingRpcClient {
    provider: RootProvider<Ethereum>,
    max_attempts: u32,
}

impl RetryingRpcClient {
    /// Creates a client for the given HTTP RPC URL.
    pub fn new(url: &str) -> Result<Self> {
        let url: url::Url = url.parse().wrap_err("invalid rpc url")?;
        let client = RpcClient::builder().http(url);
        Ok(Self { provider: RootProvider::<Ethereum>::new(client), max_attempts: MAX_RPC_ATTEMPTS })
    }

    /// Current chain id (`eth_chainId`).
    pub async fn chain_id(&self) -> Option<u64> {
        let provider = self.provider.clone();
        with_retries("eth_chainId", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_chain_id().await }
        })
        .await
    }

    /// Latest block number (`eth_blockNumber`).
    pub async fn block_number(&self) -> Option<u64> {
        let provider = self.provider.clone();
        with_retries("eth_blockNumber", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_block_number().await }
        })
        .await
    }

    /// Fetches a block by tag (`eth_getBlockByNumber`).
    pub async fn block_by_number(&self, tag: BlockNumberOrTag) -> Option<Option<Block>> {
        let provider = self.provider.clone();
        with_retries("eth_getBlockByNumber", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_block_by_number(tag).await }
        })
        .await
    }

    /// Account balance at the latest block (`eth_getBalance`).
    pub async fn balance(&self, address: Address) -> Option<U256> {
        let provider = self.provider.clone();
        with_retries("eth_getBalance", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_balance(address).await }
        })
        .await
    }

    /// Account transaction count at the latest block (`eth_getTransactionCount`).
    pub async fn transaction_count(&self, address: Address) -> Option<u64> {
        let provider = self.provider.clone();
        with_retries("eth_getTransactionCount", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_transaction_count(address).await }
        })
        .await
    }

    /// Current gas price (`eth_gasPrice`).
    pub async fn gas_price(&self) -> Option<u128> {
        let provider = self.provider.clone();
        with_retries("eth_gasPrice", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_gas_price().await }
        })
        .await
    }

    /// Logs matching `filter` (`eth_getLogs`).
    pub async fn get_logs(&self, filter: &Filter) -> Option<Vec<Log>> {
        let provider = self.provider.clone();
        let filter = filter.clone();
        with_retries("eth_getLogs", self.max_attempts, move || {
            let provider = provider.clone();
            let filter = filter.clone();
            async move { provider.get_logs(&filter).await }
        })
        .await
    }

    /// Read-only contract call (`eth_call`).
    pub async fn call(&self, tx: TransactionRequest) -> Option<Bytes> {
        let provider = self.provider.clone();
        with_retries("eth_call", self.max_attempts, move || {
            let provider = provider.clone();
            let tx = tx.clone();
            async move { provider.call(tx).await }
        })
        .await
    }

    /// Broadcasts a signed raw transaction (`eth_sendRawTransaction`).
    ///
    /// Re-broadcasting on retry does not change the transaction identity, so
    /// the worst case of a retried send is the node seeing the same hash
    /// twice.
    pub async fn send_raw_transaction(&self, raw: &Bytes) -> Option<B256> {
        let provider = self.provider.clone();
        let raw = raw.clone();
        with_retries("eth_sendRawTransaction", self.max_attempts, move || {
            let provider = provider.clone();
            let raw = raw.clone();
            async move {
                provider.send_raw_transaction(raw.as_ref()).await.map(|pending| *pending.tx_hash())
            }
        })
        .await
    }

    /// Transaction receipt lookup (`eth_getTransactionReceipt`). The outer
    /// `Option` is the retry outcome, the inner one is receipt presence.
    pub async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Option<Option<alloy_rpc_types::TransactionReceipt>> {
        let provider = self.provider.clone();
        with_retries("eth_getTransactionReceipt", self.max_attempts, move || {
            let provider = provider.clone();
            async move { provider.get_transaction_receipt(tx_hash).await }
        })
        .await
    }

    /// Mines one block on a manually-mined test backend (`evm_mine`).
    pub async fn evm_mine(&self) -> Option<()> {
        let provider = self.provider.clone();
        with_retries("evm_mine", self.max_attempts, move || {
            let provider = provider.clone();
            async move {
                provider
                    .client()
                    .request_noparams::<serde_json::Value>("evm_mine")
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Toggles automine on a manually-mined test backend (`evm_setAutomine`).
    pub async fn evm_set_automine(&self, enabled: bool) -> Option<()> {
        let provider = self.provider.clone();
        with_retries("evm_setAutomine", self.max_attempts, move || {
            let provider = provider.clone();
            async move {
                provider
                    .client()
                    .request::<_, serde_json::Value>("evm_setAutomine", (enabled,))
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Sets the interval-mining period in milliseconds; `0` disables it
    /// (`evm_setIntervalMining`).
    pub async fn evm_set_interval_mining(&self, interval_ms: u64) -> Option<()> {
        let provider = self.provider.clone();
        with_retries("evm_setIntervalMining", self.max_attempts, move || {
            let provider = provider.clone();
            async move {
                provider
                    .client()
                    .request::<_, serde_json::Value>("evm_setIntervalMining", (interval_ms,))
                    .await
                    .map(|_| ())
            }
        })
        .await
    }
}
