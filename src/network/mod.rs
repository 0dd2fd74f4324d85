//! Remote ledger collaborator.
//!
//! Everything the crate needs from the Hedera network goes through
//! [`LedgerClient`]: resolving an account's authoritative public key,
//! preparing a signable transfer, and reading a transaction's outcome.
//! [`MirrorNodeClient`] is the REST implementation; tests plug in fakes.

pub mod mirror;

pub use mirror::MirrorNodeClient;

use crate::error::{GateError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tinybars per HBAR.
pub const TINYBARS_PER_HBAR: u64 = 100_000_000;

/// DER prefix of an ED25519 SubjectPublicKeyInfo (followed by 32 key bytes).
const ED25519_DER_PREFIX: &str = "302a300506032b6570032100";

/// DER prefix of a compressed secp256k1 SubjectPublicKeyInfo (followed by 33 key bytes).
const ECDSA_SECP256K1_DER_PREFIX: &str = "3036301006072a8648ce3d020106052b8104000a032200";

// ── Network ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Previewnet,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Previewnet => "previewnet",
        }
    }

    /// Public mirror node for this network.
    pub fn mirror_url(self) -> &'static str {
        match self {
            Self::Mainnet => "https://mainnet-public.mirrornode.hedera.com",
            Self::Testnet => "https://testnet.mirrornode.hedera.com",
            Self::Previewnet => "https://previewnet.mirrornode.hedera.com",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "previewnet" => Ok(Self::Previewnet),
            other => Err(GateError::Config(format!("unknown network: {other}"))),
        }
    }
}

// ── Account keys ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Ed25519,
    EcdsaSecp256k1,
}

/// A single public key controlling an account, in raw (non-DER) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    pub key_type: KeyType,
    pub bytes: Vec<u8>,
}

impl AccountKey {
    /// Parse a hex public key, raw or DER-encoded, with or without `0x`.
    ///
    /// Raw 32-byte keys are ED25519; raw 33-byte keys starting with 0x02/0x03
    /// are compressed secp256k1.
    pub fn parse(hex_key: &str) -> Option<Self> {
        let trimmed = hex_key.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let lowered = trimmed.to_ascii_lowercase();

        if let Some(rest) = lowered.strip_prefix(ED25519_DER_PREFIX) {
            return Self::from_hex(KeyType::Ed25519, rest);
        }
        if let Some(rest) = lowered.strip_prefix(ECDSA_SECP256K1_DER_PREFIX) {
            return Self::from_hex(KeyType::EcdsaSecp256k1, rest);
        }

        let bytes = hex::decode(&lowered).ok()?;
        match bytes.len() {
            32 => Some(Self {
                key_type: KeyType::Ed25519,
                bytes,
            }),
            33 if bytes[0] == 0x02 || bytes[0] == 0x03 => Some(Self {
                key_type: KeyType::EcdsaSecp256k1,
                bytes,
            }),
            _ => None,
        }
    }

    /// Decode a raw hex key of a known type, checking its length.
    pub fn from_hex(key_type: KeyType, hex_key: &str) -> Option<Self> {
        let bytes = hex::decode(hex_key.trim()).ok()?;
        let expected = match key_type {
            KeyType::Ed25519 => 32,
            KeyType::EcdsaSecp256k1 => 33,
        };
        (bytes.len() == expected).then_some(Self { key_type, bytes })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

// ── Transfers ────────────────────────────────────────────────────

/// What the pipeline asks the ledger to prepare for a credit purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub payer_account_id: String,
    pub treasury_account_id: String,
    pub tinybars: u64,
    pub memo: String,
}

/// Unsigned transfer the payer's wallet must sign and submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    /// `payer@seconds.nanos`
    pub transaction_id: String,
    pub payer_account_id: String,
    pub treasury_account_id: String,
    pub node_account_id: String,
    pub tinybars: u64,
    pub memo: String,
    pub network: Network,
}

/// One leg of a settled CryptoTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub account: String,
    /// Signed tinybar delta for `account`.
    pub amount: i64,
}

/// Outcome of a transaction as seen by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerStatus {
    /// Not visible yet; keep polling.
    Unknown,
    Success {
        consensus_timestamp: Option<String>,
        transfers: Vec<Transfer>,
    },
    Failed {
        result: String,
    },
}

impl LedgerStatus {
    /// Tinybars credited to `account` by a successful transaction.
    pub fn credited_to(&self, account: &str) -> i64 {
        match self {
            Self::Success { transfers, .. } => transfers
                .iter()
                .filter(|t| t.account == account)
                .map(|t| t.amount)
                .sum(),
            _ => 0,
        }
    }
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Authoritative key for `account_id`. Threshold/key-list accounts are
    /// reported as a ledger error.
    async fn account_key(&self, account_id: &str) -> Result<AccountKey>;

    /// Build an unsigned transfer for the payer's wallet.
    async fn prepare_transfer(&self, request: &TransferRequest) -> Result<PaymentInstruction>;

    /// Current outcome of `transaction_id` (`payer@seconds.nanos` form).
    async fn transaction_status(&self, transaction_id: &str) -> Result<LedgerStatus>;
}

/// Convert `0.0.123@1700000000.000000042` to the mirror node form
/// `0.0.123-1700000000-000000042`.
pub fn to_mirror_transaction_id(transaction_id: &str) -> Option<String> {
    let (account, valid_start) = transaction_id.trim().split_once('@')?;
    let (secs, nanos) = valid_start.split_once('.')?;
    if !crate::auth::is_valid_account_id(account)
        || secs.is_empty()
        || nanos.is_empty()
        || !secs.chars().all(|c| c.is_ascii_digit())
        || !nanos.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{account}-{secs}-{nanos:0>9}"))
}

pub fn hbar_to_tinybars(hbar: f64) -> Result<u64> {
    if !hbar.is_finite() {
        return Err(GateError::InvalidAmount(format!("{hbar} is not a finite HBAR amount")));
    }
    if hbar <= 0.0 {
        return Ok(0);
    }
    let tinybars = (hbar * TINYBARS_PER_HBAR as f64).round();
    if tinybars > u64::MAX as f64 {
        return Err(GateError::InvalidAmount(format!("{hbar} HBAR is out of range")));
    }
    Ok(tinybars as u64)
}

pub fn tinybars_to_hbar(tinybars: u64) -> f64 {
    tinybars as f64 / TINYBARS_PER_HBAR as f64
}
