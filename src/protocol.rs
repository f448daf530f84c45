//! ABI bindings and calldata helpers for the RRP protocol and requester
//! contracts.
//!
//! Contract compilation lives outside this crate; deployment bytecode is
//! loaded from pre-built artifacts. Only the entry points and events the
//! stress run touches are bound here.

use std::path::Path;

use alloy_primitives::{b256, Address, Bytes, B256};
use alloy_sol_types::{SolCall, SolValue};
use eyre::{Result, WrapErr};
use rand::Rng;

alloy_sol_macro::sol! {
    /// Request-response protocol registry contract.
    interface Rrp {
        event MadeTemplateRequest(
            address indexed oracle,
            bytes32 indexed requestId,
            uint256 requesterRequestCount,
            uint256 chainId,
            address requester,
            bytes32 templateId,
            address sponsor,
            address sponsorWallet,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes parameters
        );
        event MadeFullRequest(
            address indexed oracle,
            bytes32 indexed requestId,
            uint256 requesterRequestCount,
            uint256 chainId,
            address requester,
            bytes32 endpointId,
            address sponsor,
            address sponsorWallet,
            address fulfillAddress,
            bytes4 fulfillFunctionId,
            bytes parameters
        );
        event FulfilledRequest(address indexed oracle, bytes32 indexed requestId, bytes data);
        event FailedRequest(address indexed oracle, bytes32 indexed requestId, string errorMessage);

        function setSponsorshipStatus(address requester, bool sponsorshipStatus) external;
        function requestIsAwaitingFulfillment(bytes32 requestId) external view returns (bool);
    }

    /// Test requester contract; emits one request event per call.
    interface Requester {
        function makeRequest(
            address oracle,
            bytes32 endpointId,
            address sponsor,
            address sponsorWallet,
            bytes calldata parameters
        ) external;
    }
}

/// Endpoint identifier the oracle's trigger configuration exposes.
pub const ENDPOINT_ID: B256 =
    b256!("0xf466b8feec41e9e50815e0c9dca4db1ff959637e564bb13fefa99e9f9f90453c");

/// Parameter name the mocked API endpoint expects.
const PARAMETER_NAME: &str = "coinId";

/// Encodes protocol-ABI request parameters: a version/type header word
/// followed by one bytes32 name/value pair.
///
/// The value carries a random salt so the oracle's request de-duplication
/// never merges two of our requests: every submitted request must be
/// processed independently.
pub fn encode_parameters(salt: &str) -> Bytes {
    let header = str_to_bytes32("1b");
    let name = str_to_bytes32(PARAMETER_NAME);
    let value = str_to_bytes32(salt);
    Bytes::from((header, name, value).abi_encode())
}

/// Generates a lowercase alphanumeric salt of the given length.
pub fn random_salt(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length.max(1))
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect::<String>()
        .to_lowercase()
}

/// Calldata for `Rrp.setSponsorshipStatus(requester, true)`.
pub fn sponsorship_calldata(requester: Address) -> Bytes {
    Bytes::from(
        Rrp::setSponsorshipStatusCall { requester, sponsorshipStatus: true }.abi_encode(),
    )
}

/// Calldata for a health-check read of the protocol contract.
pub fn awaiting_fulfillment_calldata(request_id: B256) -> Bytes {
    Bytes::from(Rrp::requestIsAwaitingFulfillmentCall { requestId: request_id }.abi_encode())
}

/// Calldata for `Requester.makeRequest(...)` with salted parameters.
pub fn make_request_calldata(
    oracle: Address,
    sponsor: Address,
    sponsor_wallet: Address,
    salt_length: usize,
) -> Bytes {
    Bytes::from(
        Requester::makeRequestCall {
            oracle,
            endpointId: ENDPOINT_ID,
            sponsor,
            sponsorWallet: sponsor_wallet,
            parameters: encode_parameters(&random_salt(salt_length)),
        }
        .abi_encode(),
    )
}

/// Pre-built deployment artifacts for the two on-chain contracts.
#[derive(Debug, Clone)]
pub struct ContractArtifacts {
    /// Protocol registry creation code.
    pub rrp: Bytes,
    /// Requester creation code. The constructor takes the protocol
    /// contract's address, appended at deploy time.
    pub requester: Bytes,
}

impl ContractArtifacts {
    /// Loads hex-encoded creation bytecode from `<dir>/rrp.hex` and
    /// `<dir>/requester.hex`.
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self { rrp: load_artifact(dir, "rrp")?, requester: load_artifact(dir, "requester")? })
    }

    /// Requester creation code with the ABI-encoded protocol address
    /// constructor argument appended.
    pub fn requester_deploy_code(&self, rrp_address: Address) -> Bytes {
        let mut code = self.requester.to_vec();
        code.extend_from_slice(&rrp_address.abi_encode());
        Bytes::from(code)
    }
}

fn str_to_bytes32(s: &str) -> B256 {
    let mut word = [0u8; 32];
    let bytes = s.as_bytes();
    let len = bytes.len().min(31);
    word[..len].copy_from_slice(&bytes[..len]);
    B256::from(word)
}

fn load_artifact(dir: &Path, name: &str) -> Result<Bytes> {
    let path = dir.join(format!("{name}.hex"));
    let raw = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read artifact {}", path.display()))?;
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .wrap_err_with(|| format!("artifact {} is not valid hex", path.display()))?;
    Ok(Bytes::from(bytes))
}
