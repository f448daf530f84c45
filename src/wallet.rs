//! Sponsor accounts and deterministic sponsor-wallet derivation.
//!
//! The oracle pays for fulfillments from a wallet derived from its extended
//! public key and the sponsor's address. The derivation path packs the
//! 160-bit sponsor address into six 31-bit chunks under the `1/` prefix, so
//! any party holding the oracle xpub can compute the same address with no
//! I/O.

use alloy_primitives::{Address, U256};
use alloy_signer_local::{
    coins_bip39::{English, Mnemonic},
    MnemonicBuilder, PrivateKeySigner,
};
use coins_bip32::xkeys::{Parent, XPub};
use eyre::{ensure, Result, WrapErr};

/// Builds a signer from a BIP-39 mnemonic's default account path.
pub fn signer_from_mnemonic(mnemonic: &str) -> Result<PrivateKeySigner> {
    MnemonicBuilder::<English>::default()
        .phrase(mnemonic)
        .build()
        .wrap_err("invalid mnemonic phrase")
}

/// Hardened path of the oracle's extended public key.
const ORACLE_XPUB_PATH: &str = "m/44'/60'/0'";
/// Number of 31-bit chunks needed to cover a 160-bit address.
const PATH_CHUNKS: usize = 6;

/// Builds the sponsor-wallet derivation path for a sponsor address:
/// `1/` followed by six 31-bit chunks of the address, least significant
/// chunk first.
pub fn sponsor_wallet_path(sponsor: Address) -> String {
    let sponsor = U256::from_be_slice(sponsor.as_slice());
    let mask = U256::from((1u64 << 31) - 1);
    let mut path = String::from("1");
    for i in 0..PATH_CHUNKS {
        let chunk = (sponsor >> (31 * i)) & mask;
        path.push('/');
        path.push_str(&chunk.to_string());
    }
    path
}

/// Derives the oracle's neutered extended public key from its mnemonic.
pub fn derive_oracle_xpub(mnemonic: &str) -> Result<XPub> {
    let mnemonic = Mnemonic::<English>::new_from_phrase(mnemonic)
        .wrap_err("invalid oracle mnemonic")?;
    let xpriv = mnemonic
        .derive_key(ORACLE_XPUB_PATH, None)
        .wrap_err("oracle xpub derivation failed")?;
    Ok(xpriv.verify_key())
}

/// Checks that `xpub` belongs to the oracle by deriving the default child
/// path `0/0` and comparing the resulting address.
pub fn verify_oracle_xpub(xpub: &XPub, oracle_address: Address) -> Result<()> {
    let child = xpub.derive_path("0/0").wrap_err("xpub child derivation failed")?;
    let derived = alloy_signer::utils::public_key_to_address(child.as_ref());
    ensure!(
        derived == oracle_address,
        "xpub does not belong to oracle {oracle_address}, derived {derived}"
    );
    Ok(())
}

/// Computes the sponsor-wallet address for `(xpub, oracle, sponsor)`.
///
/// Pure and deterministic: the same inputs always produce the same address.
pub fn derive_sponsor_wallet_address(
    xpub: &XPub,
    oracle_address: Address,
    sponsor: Address,
) -> Result<Address> {
    verify_oracle_xpub(xpub, oracle_address)?;
    let path = sponsor_wallet_path(sponsor);
    let derived = xpub
        .derive_path(path.as_str())
        .wrap_err("sponsor wallet derivation failed")?;
    Ok(alloy_signer::utils::public_key_to_address(derived.as_ref()))
}

/// The oracle's key material for one run.
#[derive(Debug, Clone)]
pub struct OracleKeys {
    /// Mnemonic phrase the oracle service itself is configured with.
    pub mnemonic: String,
    /// Address of the oracle's default wallet (`m/44'/60'/0'/0/0`).
    pub address: Address,
    /// Neutered extended public key used for sponsor-wallet derivation.
    pub xpub: XPub,
}

impl OracleKeys {
    /// Derives the oracle address and xpub from a mnemonic phrase.
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let signer = signer_from_mnemonic(mnemonic).wrap_err("invalid oracle mnemonic")?;
        let xpub = derive_oracle_xpub(mnemonic)?;
        verify_oracle_xpub(&xpub, signer.address())?;
        Ok(Self { mnemonic: mnemonic.to_string(), address: signer.address(), xpub })
    }

    /// Sponsor-wallet address for the given sponsor.
    pub fn sponsor_wallet_address(&self, sponsor: Address) -> Result<Address> {
        derive_sponsor_wallet_address(&self.xpub, self.address, sponsor)
    }
}

/// One sponsor slot in a chain: a freshly generated signer plus its slot
/// index. The signer is exclusively owned by the funding branch that created
/// it, so its nonces are trivially sequenced.
#[derive(Debug, Clone)]
pub struct SponsorAccount {
    /// Signing key for the sponsor.
    pub signer: PrivateKeySigner,
    /// Wallet slot index within the chain, for log correlation.
    pub index: usize,
}

impl SponsorAccount {
    /// Generates a random sponsor account for slot `index`.
    pub fn random(index: usize) -> Self {
        Self { signer: PrivateKeySigner::random(), index }
    }

    /// The sponsor's address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn path_recomposes_to_sponsor_address() {
        let sponsor = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let path = sponsor_wallet_path(sponsor);
        let chunks: Vec<&str> = path.split('/').collect();
        assert_eq!(chunks[0], "1");
        assert_eq!(chunks.len(), 1 + 6);

        // Reassembling the chunks must give back the address bits.
        let mut recomposed = U256::ZERO;
        for (i, chunk) in chunks[1..].iter().enumerate() {
            let value: U256 = chunk.parse().unwrap();
            recomposed |= value << (31 * i);
        }
        assert_eq!(recomposed, U256::from_be_slice(sponsor.as_slice()));
    }

    #[test]
    fn derivation_is_deterministic() {
        let keys = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        let sponsor = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

        let first = keys.sponsor_wallet_address(sponsor).unwrap();
        let second = keys.sponsor_wallet_address(sponsor).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, sponsor);
        assert_ne!(first, keys.address);
    }

    #[test]
    fn distinct_sponsors_get_distinct_wallets() {
        let keys = OracleKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        let a = keys.sponsor_wallet_address(SponsorAccount::random(0).address()).unwrap();
        let b = keys.sponsor_wallet_address(SponsorAccount::random(1).address()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn xpub_verification_rejects_foreign_address() {
        let xpub = derive_oracle_xpub(TEST_MNEMONIC).unwrap();
        let stranger = SponsorAccount::random(0).address();
        assert!(verify_oracle_xpub(&xpub, stranger).is_err());
    }
}
