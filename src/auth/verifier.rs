//! Challenge signature verification.
//!
//! Wallets return a base64 protobuf `SignatureMap`. The verifier resolves
//! the account's key from the ledger, checks the caller's claimed key
//! against it, and verifies the matching signature pair over the prefixed
//! message. Any failure yields `false`; causes are only logged.

use super::message::prefix_message;
use crate::network::{AccountKey, KeyType, LedgerClient};
use base64::Engine;
use prost::Message;
use std::sync::Arc;

// ── Signature envelope ───────────────────────────────────────────

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignatureMap {
    #[prost(message, repeated, tag = "1")]
    pub sig_pair: Vec<SignaturePair>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignaturePair {
    /// Leading bytes of the signer's public key; empty matches any key.
    #[prost(bytes = "vec", tag = "1")]
    pub pub_key_prefix: Vec<u8>,
    #[prost(oneof = "signature_pair::Signature", tags = "2, 3, 4, 5, 6")]
    pub signature: Option<signature_pair::Signature>,
}

pub mod signature_pair {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Signature {
        #[prost(bytes = "vec", tag = "2")]
        Contract(Vec<u8>),
        #[prost(bytes = "vec", tag = "3")]
        Ed25519(Vec<u8>),
        #[prost(bytes = "vec", tag = "4")]
        Rsa3072(Vec<u8>),
        #[prost(bytes = "vec", tag = "5")]
        Ecdsa384(Vec<u8>),
        #[prost(bytes = "vec", tag = "6")]
        EcdsaSecp256k1(Vec<u8>),
    }
}

/// Why a verification failed. Only ever logged.
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error("empty input")]
    EmptyInput,
    #[error("invalid account id")]
    InvalidAccount,
    #[error("key lookup failed: {0}")]
    KeyLookup(String),
    #[error("claimed public key is malformed")]
    MalformedClaim,
    #[error("claimed public key does not control the account")]
    KeyMismatch,
    #[error("signature envelope is malformed")]
    MalformedEnvelope,
    #[error("no signature pair for the account key")]
    NoMatchingPair,
    #[error("signature does not verify")]
    BadSignature,
}

pub struct SignatureVerifier {
    ledger: Arc<dyn LedgerClient>,
}

impl SignatureVerifier {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    /// Verify `envelope_b64` as `account_id`'s signature over `message`.
    pub async fn verify(
        &self,
        account_id: &str,
        message: &str,
        envelope_b64: &str,
        claimed_public_key: &str,
    ) -> bool {
        match self
            .check(account_id, message, envelope_b64, claimed_public_key)
            .await
        {
            Ok(()) => {
                tracing::debug!(account = %account_id, "Signature verified");
                true
            }
            Err(failure) => {
                tracing::warn!(account = %account_id, reason = %failure, "Signature rejected");
                false
            }
        }
    }

    async fn check(
        &self,
        account_id: &str,
        message: &str,
        envelope_b64: &str,
        claimed_public_key: &str,
    ) -> Result<(), Failure> {
        if [account_id, message, envelope_b64, claimed_public_key]
            .iter()
            .any(|s| s.trim().is_empty())
        {
            return Err(Failure::EmptyInput);
        }
        if !super::is_valid_account_id(account_id) {
            return Err(Failure::InvalidAccount);
        }

        let claimed = AccountKey::parse(claimed_public_key).ok_or(Failure::MalformedClaim)?;
        let actual = self
            .ledger
            .account_key(account_id)
            .await
            .map_err(|e| Failure::KeyLookup(e.to_string()))?;
        if claimed != actual {
            return Err(Failure::KeyMismatch);
        }

        let raw = base64::engine::general_purpose::STANDARD
            .decode(envelope_b64.trim())
            .map_err(|_| Failure::MalformedEnvelope)?;
        let map = SignatureMap::decode(raw.as_slice()).map_err(|_| Failure::MalformedEnvelope)?;

        let signature = find_signature(&map, &actual).ok_or(Failure::NoMatchingPair)?;
        let payload = prefix_message(message);

        if verify_raw(&actual, &payload, signature) {
            Ok(())
        } else {
            Err(Failure::BadSignature)
        }
    }
}

/// First pair whose prefix matches `key` and whose signature type fits it.
fn find_signature<'a>(map: &'a SignatureMap, key: &AccountKey) -> Option<&'a [u8]> {
    use signature_pair::Signature;

    map.sig_pair
        .iter()
        .filter(|pair| key.bytes.starts_with(&pair.pub_key_prefix))
        .find_map(|pair| match (&pair.signature, key.key_type) {
            (Some(Signature::Ed25519(sig)), KeyType::Ed25519) => Some(sig.as_slice()),
            (Some(Signature::EcdsaSecp256k1(sig)), KeyType::EcdsaSecp256k1) => {
                Some(sig.as_slice())
            }
            _ => None,
        })
}

fn verify_raw(key: &AccountKey, payload: &[u8], signature: &[u8]) -> bool {
    match key.key_type {
        KeyType::Ed25519 => verify_ed25519(&key.bytes, payload, signature),
        KeyType::EcdsaSecp256k1 => verify_secp256k1(&key.bytes, payload, signature),
    }
}

fn verify_ed25519(public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    verifying_key
        .verify(payload, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// 64-byte `r || s` over the Keccak-256 digest of the payload. High-S
/// signatures are normalized first.
fn verify_secp256k1(public_key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    use k256::ecdsa::signature::hazmat::PrehashVerifier;
    use k256::ecdsa::{Signature, VerifyingKey};
    use sha3::{Digest, Keccak256};

    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    let sig = sig.normalize_s().unwrap_or(sig);
    let digest = Keccak256::digest(payload);
    verifying_key.verify_prehash(&digest, &sig).is_ok()
}
