//! Chain access seam, the alloy-backed implementation, and the per-chain
//! setup pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_consensus::SignableTransaction;
use alloy_eips::eip2718::Encodable2718;
use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_rpc_types::{BlockNumberOrTag, Log, TransactionReceipt, TransactionRequest};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use eyre::{eyre, Result, WrapErr};
use futures_util::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::funding::{RequestReceipt, WalletFunding};
use crate::limiter::ConcurrencyLimiter;
use crate::protocol::{self, ContractArtifacts, Rrp};
use crate::rpc::RetryingRpcClient;
use crate::wallet::{OracleKeys, SponsorAccount};

const TRANSFER_GAS: u64 = 21_000;
const CALL_GAS: u64 = 500_000;
const DEPLOY_GAS: u64 = 5_000_000;
const FALLBACK_GAS_PRICE: u128 = 1_000_000_000;
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Mining interval restored after setup so the oracle sees steady blocks.
const RESTORED_MINING_INTERVAL_MS: u64 = 15_000;

/// Write/read access to one chain. The production implementation is
/// [`EvmChain`]; tests substitute fakes at this seam.
///
/// Master-wallet sends are nonce-sequenced internally, so concurrent callers
/// may pipeline transfers without coordinating.
#[allow(async_fn_in_trait)]
pub trait Chain {
    /// Balance of `address`, or `None` when the outcome is unknown.
    async fn balance(&self, address: Address) -> Option<U256>;

    /// Deploys a contract from the master wallet, returning its address.
    async fn deploy_contract(&self, code: Bytes) -> Result<Address>;

    /// Sends a value transfer from the master wallet.
    async fn transfer_from_master(&self, to: Address, value: U256) -> Result<B256>;

    /// Sends a contract call signed by `signer` with an explicit nonce.
    async fn send_call(
        &self,
        signer: &PrivateKeySigner,
        nonce: u64,
        to: Address,
        data: Bytes,
    ) -> Result<B256>;

    /// Read-only contract call.
    async fn read_contract(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Waits until `tx_hash` is mined and did not revert.
    async fn wait_mined(&self, tx_hash: B256) -> Result<()>;

    /// Latest block number, or `None` when unknown.
    async fn block_number(&self) -> Option<u64>;

    /// Logs emitted by `address` in the inclusive block window.
    async fn logs_in_window(&self, address: Address, from: u64, to: u64) -> Option<Vec<Log>>;

    /// Re-primes internally tracked nonces from chain state. No-op where
    /// nonces are not tracked.
    async fn sync_master_nonce(&self) -> Result<()> {
        Ok(())
    }

    /// Mines one block on demand. No-op on auto-mining backends.
    async fn mine_block(&self) {}

    /// Switches a manually-mined backend to on-demand mining.
    async fn prepare_mining(&self) -> Result<()> {
        Ok(())
    }

    /// Restores steady block production after setup.
    async fn restore_mining(&self) -> Result<()> {
        Ok(())
    }
}

/// Alloy-backed [`Chain`] over a [`RetryingRpcClient`].
#[derive(Debug)]
pub struct EvmChain {
    rpc: RetryingRpcClient,
    master: PrivateKeySigner,
    master_nonce: AtomicU64,
    chain_id: u64,
    manual_mining: bool,
}

impl EvmChain {
    /// Connects to the chain, confirming the node serves blocks, and primes
    /// the master wallet's nonce sequence.
    pub async fn connect(
        rpc: RetryingRpcClient,
        master: PrivateKeySigner,
        manual_mining: bool,
    ) -> Result<Self> {
        let chain_id =
            rpc.chain_id().await.ok_or_else(|| eyre!("chain id unavailable after retries"))?;
        rpc.block_by_number(BlockNumberOrTag::Latest)
            .await
            .ok_or_else(|| eyre!("node is not serving blocks"))?;
        let nonce = rpc
            .transaction_count(master.address())
            .await
            .ok_or_else(|| eyre!("master wallet nonce unavailable after retries"))?;

        info!(chain_id, master = %master.address(), nonce, "connected to chain");
        Ok(Self { rpc, master, master_nonce: AtomicU64::new(nonce), chain_id, manual_mining })
    }

    /// The master funding wallet's address.
    pub fn master_address(&self) -> Address {
        self.master.address()
    }

    async fn submit(
        &self,
        signer: &PrivateKeySigner,
        nonce: u64,
        to: Option<Address>,
        value: U256,
        data: Bytes,
        gas_limit: u64,
    ) -> Result<B256> {
        let gas_price = self.rpc.gas_price().await.unwrap_or(FALLBACK_GAS_PRICE);

        let mut tx = TransactionRequest::default()
            .with_from(signer.address())
            .with_nonce(nonce)
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(gas_price * 2)
            .with_max_priority_fee_per_gas(1_000_000)
            .with_chain_id(self.chain_id)
            .with_value(value);
        tx = match to {
            Some(to) => tx.with_to(to).with_input(data),
            None => tx.with_deploy_code(data),
        };

        let tx = tx
            .build_typed_tx()
            .map_err(|e| eyre!("failed to build typed tx: {e:?}"))?;
        let signature = signer.sign_hash_sync(&tx.signature_hash())?;
        let signed = tx.into_signed(signature);
        let raw: Bytes = signed.encoded_2718().into();
        let tx_hash = *signed.hash();

        self.rpc
            .send_raw_transaction(&raw)
            .await
            .ok_or_else(|| eyre!("transaction {tx_hash} was not accepted after retries"))?;

        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<TransactionReceipt> {
        let receipt = timeout(RECEIPT_TIMEOUT, async {
            loop {
                if self.manual_mining {
                    self.rpc.evm_mine().await;
                }
                if let Some(Some(receipt)) = self.rpc.transaction_receipt(tx_hash).await {
                    return receipt;
                }
                sleep(RECEIPT_POLL_INTERVAL).await;
            }
        })
        .await
        .wrap_err_with(|| format!("timed out waiting for receipt of {tx_hash}"))?;

        eyre::ensure!(receipt.status(), "transaction {tx_hash} reverted");
        Ok(receipt)
    }
}

impl Chain for EvmChain {
    async fn balance(&self, address: Address) -> Option<U256> {
        self.rpc.balance(address).await
    }

    async fn deploy_contract(&self, code: Bytes) -> Result<Address> {
        let nonce = self.master_nonce.fetch_add(1, Ordering::SeqCst);
        let tx_hash =
            self.submit(&self.master, nonce, None, U256::ZERO, code, DEPLOY_GAS).await?;
        let receipt = self.wait_for_receipt(tx_hash).await?;
        receipt
            .contract_address
            .ok_or_else(|| eyre!("deploy receipt for {tx_hash} carries no contract address"))
    }

    async fn transfer_from_master(&self, to: Address, value: U256) -> Result<B256> {
        let nonce = self.master_nonce.fetch_add(1, Ordering::SeqCst);
        self.submit(&self.master, nonce, Some(to), value, Bytes::new(), TRANSFER_GAS).await
    }

    async fn send_call(
        &self,
        signer: &PrivateKeySigner,
        nonce: u64,
        to: Address,
        data: Bytes,
    ) -> Result<B256> {
        self.submit(signer, nonce, Some(to), U256::ZERO, data, CALL_GAS).await
    }

    async fn read_contract(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let tx = TransactionRequest::default().with_to(to).with_input(data);
        self.rpc
            .call(tx)
            .await
            .ok_or_else(|| eyre!("eth_call to {to} failed after retries"))
    }

    async fn wait_mined(&self, tx_hash: B256) -> Result<()> {
        self.wait_for_receipt(tx_hash).await.map(|_| ())
    }

    /// A failed submission leaves a gap in the pre-allocated sequence; the
    /// counter is only trustworthy again after re-reading the chain's count.
    async fn sync_master_nonce(&self) -> Result<()> {
        let nonce = self
            .rpc
            .transaction_count(self.master.address())
            .await
            .ok_or_else(|| eyre!("master wallet nonce unavailable after retries"))?;
        self.master_nonce.store(nonce, Ordering::SeqCst);
        Ok(())
    }

    async fn block_number(&self) -> Option<u64> {
        self.rpc.block_number().await
    }

    async fn logs_in_window(&self, address: Address, from: u64, to: u64) -> Option<Vec<Log>> {
        let filter =
            alloy_rpc_types::Filter::new().address(address).from_block(from).to_block(to);
        self.rpc.get_logs(&filter).await
    }

    async fn mine_block(&self) {
        if self.manual_mining && self.rpc.evm_mine().await.is_none() {
            warn!("explicit mine command failed");
        }
    }

    async fn prepare_mining(&self) -> Result<()> {
        if !self.manual_mining {
            return Ok(());
        }
        self.rpc
            .evm_set_automine(false)
            .await
            .ok_or_else(|| eyre!("disabling automine failed"))?;
        self.rpc
            .evm_set_interval_mining(0)
            .await
            .ok_or_else(|| eyre!("disabling interval mining failed"))?;
        Ok(())
    }

    async fn restore_mining(&self) -> Result<()> {
        if !self.manual_mining {
            return Ok(());
        }
        self.rpc.evm_mine().await.ok_or_else(|| eyre!("final mine command failed"))?;
        self.rpc
            .evm_set_interval_mining(RESTORED_MINING_INTERVAL_MS)
            .await
            .ok_or_else(|| eyre!("restoring interval mining failed"))?;
        Ok(())
    }
}

/// Contracts provisioned on one chain for one run. Exactly one of these
/// exists per chain index per run.
#[derive(Debug, Clone)]
pub struct ChainDeployment {
    /// Address of the protocol registry contract.
    pub rrp_address: Address,
    /// Mnemonic the oracle service must be configured with to serve this
    /// deployment.
    pub oracle_mnemonic: String,
}

/// Per-chain orchestrator: deploys the protocol and requester contracts
/// once, then fans the wallet funding protocol out across sponsor slots
/// with bounded concurrency.
pub struct ChainSetupPipeline<'a, C: Chain> {
    chain: &'a C,
    limiter: &'a ConcurrencyLimiter,
    oracle: &'a OracleKeys,
    artifacts: &'a ContractArtifacts,
    salt_length: usize,
}

impl<'a, C: Chain> ChainSetupPipeline<'a, C> {
    /// Creates a pipeline fanning out wallet work through `limiter`.
    pub fn new(
        chain: &'a C,
        limiter: &'a ConcurrencyLimiter,
        oracle: &'a OracleKeys,
        artifacts: &'a ContractArtifacts,
        salt_length: usize,
    ) -> Self {
        Self { chain, limiter, oracle, artifacts, salt_length }
    }

    /// Runs the full setup for `chain_index`: deploy, fund, request, mine.
    ///
    /// Individual wallet failures are swallowed inside their branch; the
    /// returned receipts cover the wallets that completed.
    pub async fn run(
        &self,
        chain_index: usize,
        wallet_count: usize,
    ) -> Result<(ChainDeployment, Vec<RequestReceipt>)> {
        info!(chain_index, wallet_count, "setting up chain");
        self.chain.mine_block().await;

        let rrp_address = self
            .chain
            .deploy_contract(self.artifacts.rrp.clone())
            .await
            .wrap_err("protocol contract deployment failed")?;
        info!(chain_index, %rrp_address, "protocol contract deployed");
        self.verify_rrp(rrp_address).await?;

        let requester_address = self
            .chain
            .deploy_contract(self.artifacts.requester_deploy_code(rrp_address))
            .await
            .wrap_err("requester contract deployment failed")?;
        info!(chain_index, %requester_address, "requester contract deployed");

        let funding = WalletFunding::new(
            self.chain,
            self.oracle,
            rrp_address,
            requester_address,
            self.salt_length,
        );
        let branches = (0..wallet_count).map(|index| {
            let funding = &funding;
            self.limiter.schedule(async move { funding.run(SponsorAccount::random(index)).await })
        });
        let receipts: Vec<RequestReceipt> =
            join_all(branches).await.into_iter().flatten().collect();

        info!(chain_index, receipts = receipts.len(), wallet_count, "wallet branches resolved");
        self.chain.mine_block().await;

        let deployment =
            ChainDeployment { rrp_address, oracle_mnemonic: self.oracle.mnemonic.clone() };
        Ok((deployment, receipts))
    }

    /// Confirms the freshly deployed registry answers a read before any
    /// wallet work is scheduled against it.
    async fn verify_rrp(&self, rrp_address: Address) -> Result<()> {
        let returned = self
            .chain
            .read_contract(rrp_address, protocol::awaiting_fulfillment_calldata(B256::ZERO))
            .await
            .wrap_err("protocol contract is not responding")?;
        Rrp::requestIsAwaitingFulfillmentCall::abi_decode_returns(&returned)
            .wrap_err("protocol contract returned malformed data")?;
        Ok(())
    }
}
