//! Signature-gated API credentials.
//!
//! Provides:
//! - Challenge messages in the Hedera signed-message format
//! - Signature verification against the account's on-ledger key
//! - Credential issuance, rotation and revocation (per-account state machine)
//! - A bearer-authenticated HTTP channel with single-retry rotation handling
//!
//! ## Design Decisions
//! - API keys are opaque random tokens; only their SHA-256 hash is stored,
//!   consistent with the session handling in `store`.
//! - Every verification failure is fail-closed and indistinguishable to the
//!   caller. The cause is logged and counted as a `Rejection`.

pub mod authority;
pub mod channel;
pub mod message;
pub mod store;
pub mod verifier;

pub use authority::{
    AuthState, AuthorityConfig, ChallengeSigner, CredentialAuthority, SignedChallenge,
};
pub use channel::{AuthenticatedChannel, ListenerRegistration, RotationWatch};
pub use message::{create_challenge_message, prefix_message};
pub use store::{CredentialCache, KeyStore, StoredKey};
pub use verifier::SignatureVerifier;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// `shard.realm.num`, each part a non-empty run of ASCII digits.
pub fn is_valid_account_id(account_id: &str) -> bool {
    let parts: Vec<&str> = account_id.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 19 && p.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Purchase,
    Admin,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Purchase => "purchase",
            Self::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = crate::error::GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "purchase" => Ok(Self::Purchase),
            "admin" => Ok(Self::Admin),
            other => Err(crate::error::GateError::Config(format!(
                "unknown permission: {other}"
            ))),
        }
    }
}

/// Single-use challenge handed to an account holder for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub account_id: String,
    pub nonce: String,
    /// The exact text the holder must sign (before the ledger prefix).
    pub message: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A bearer API key and its scope. `token` is the plaintext value and is
/// only ever revealed once, at issue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub account_id: String,
    pub permissions: BTreeSet<Permission>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// True once `now` is inside `threshold` of expiry (or past it).
    pub fn should_rotate_at(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.remaining_at(now) <= threshold
    }

    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&permission)
    }
}
