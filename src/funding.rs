//! Per-wallet funding protocol: derive, fund, sponsor, request.

use alloy_primitives::{Address, B256, U256};
use eyre::{Result, WrapErr};
use tracing::{debug, info, warn};

use crate::chain::Chain;
use crate::protocol;
use crate::wallet::{OracleKeys, SponsorAccount};

/// Amount transferred when a wallet needs funding: 0.1 ether.
fn top_up_amount() -> U256 {
    U256::from(100_000_000_000_000_000u128)
}

/// Balance above which a wallet is considered funded already: 0.05 ether.
fn low_water_mark() -> U256 {
    U256::from(50_000_000_000_000_000u128)
}

/// Proof that one wallet branch completed: its request transaction plus the
/// two addresses needed to correlate it with oracle-side processing.
#[derive(Debug, Clone)]
pub struct RequestReceipt {
    /// Hash of the `makeRequest` transaction.
    pub transaction_hash: B256,
    /// The sponsor account that signed the request.
    pub sponsor_address: Address,
    /// The derived wallet the oracle fulfills from.
    pub sponsor_wallet_address: Address,
}

/// Runs the funding protocol for sponsor accounts against one chain's
/// deployed contracts.
///
/// Each branch walks a fixed sequence: derive the sponsor wallet, top it up,
/// top up the sponsor itself, authorize the requester, then submit the
/// request. Sponsor accounts are freshly generated, so the authorization and
/// request transactions carry nonces 0 and 1.
pub struct WalletFunding<'a, C: Chain> {
    chain: &'a C,
    oracle: &'a OracleKeys,
    rrp_address: Address,
    requester_address: Address,
    salt_length: usize,
}

impl<'a, C: Chain> WalletFunding<'a, C> {
    /// Creates a funding runner targeting the given contract pair.
    pub fn new(
        chain: &'a C,
        oracle: &'a OracleKeys,
        rrp_address: Address,
        requester_address: Address,
        salt_length: usize,
    ) -> Self {
        Self { chain, oracle, rrp_address, requester_address, salt_length }
    }

    /// Runs the branch for one sponsor. A failed branch is logged and
    /// dropped; it never aborts its siblings.
    pub async fn run(&self, sponsor: SponsorAccount) -> Option<RequestReceipt> {
        let index = sponsor.index;
        match self.run_branch(sponsor).await {
            Ok(receipt) => Some(receipt),
            Err(error) => {
                warn!(wallet = index, %error, "wallet branch failed");
                None
            }
        }
    }

    async fn run_branch(&self, sponsor: SponsorAccount) -> Result<RequestReceipt> {
        let sponsor_address = sponsor.address();
        let sponsor_wallet_address = self
            .oracle
            .sponsor_wallet_address(sponsor_address)
            .wrap_err("sponsor wallet derivation failed")?;
        debug!(
            wallet = sponsor.index,
            %sponsor_address,
            %sponsor_wallet_address,
            "derived sponsor wallet"
        );

        self.top_up(sponsor.index, sponsor_wallet_address).await?;
        self.top_up(sponsor.index, sponsor_address).await?;

        // Fresh account: authorization is its first transaction, the
        // request its second.
        let authorize = self
            .chain
            .send_call(
                &sponsor.signer,
                0,
                self.rrp_address,
                protocol::sponsorship_calldata(self.requester_address),
            )
            .await
            .wrap_err("sponsorship authorization failed")?;
        self.chain
            .wait_mined(authorize)
            .await
            .wrap_err("sponsorship authorization was not mined")?;

        let transaction_hash = self
            .chain
            .send_call(
                &sponsor.signer,
                1,
                self.requester_address,
                protocol::make_request_calldata(
                    self.oracle.address,
                    sponsor_address,
                    sponsor_wallet_address,
                    self.salt_length,
                ),
            )
            .await
            .wrap_err("request submission failed")?;
        self.chain
            .wait_mined(transaction_hash)
            .await
            .wrap_err("request transaction was not mined")?;

        info!(wallet = sponsor.index, %transaction_hash, "request submitted");
        Ok(RequestReceipt { transaction_hash, sponsor_address, sponsor_wallet_address })
    }

    /// Transfers the top-up amount unless the wallet already holds more
    /// than the low-water mark. An unknown balance is treated as empty.
    async fn top_up(&self, index: usize, to: Address) -> Result<()> {
        let balance = self.chain.balance(to).await.unwrap_or(U256::ZERO);
        if balance > low_water_mark() {
            debug!(wallet = index, %to, %balance, "wallet already funded");
            return Ok(());
        }

        let tx_hash = self
            .chain
            .transfer_from_master(to, top_up_amount())
            .await
            .wrap_err_with(|| format!("top-up transfer to {to} failed"))?;
        self.chain
            .wait_mined(tx_hash)
            .await
            .wrap_err_with(|| format!("top-up transfer to {to} was not mined"))?;
        debug!(wallet = index, %to, "wallet topped up");
        Ok(())
    }
}
