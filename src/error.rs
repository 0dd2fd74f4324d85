//! Error taxonomy shared by every component.
//!
//! Verification failures never show up here as distinct kinds: a consumed,
//! expired or unknown challenge and a bad signature all surface as
//! [`GateError::AuthenticationFailed`]. The precise cause is only visible as a
//! [`Rejection`] in logs and metric labels.

use crate::billing::PaymentStatus;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, GateError>;

/// Why a challenge redemption was refused. Logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    ChallengeExpired,
    ChallengeAlreadyUsed,
    ChallengeUnknown,
    SignatureMismatch,
    InvalidAccount,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChallengeExpired => "challenge_expired",
            Self::ChallengeAlreadyUsed => "challenge_already_used",
            Self::ChallengeUnknown => "challenge_unknown",
            Self::SignatureMismatch => "signature_mismatch",
            Self::InvalidAccount => "invalid_account",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// No credential, or the challenge/signature was rejected.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The credential is inside its rotation window (or past expiry).
    /// Recoverable by signing a fresh challenge.
    #[error("API key rotation needed (expires at {expires_at})")]
    RotationNeeded {
        expires_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("payment not found: {0}")]
    PaymentNotFound(String),

    /// Polling gave up. The payment is left in `confirming`.
    #[error("timed out waiting for payment {0} to settle")]
    PaymentTimeout(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("payment {transaction_id} cannot move from {from} to {to}")]
    InvalidTransition {
        transaction_id: String,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    /// The remote ledger (mirror node, payment builder) failed.
    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GateError {
    /// True when the host should ask the account holder to sign a new
    /// challenge instead of failing the request outright.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::RotationNeeded { .. })
    }

    /// Short, stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "authentication_failed",
            Self::RotationNeeded { .. } => "rotation_needed",
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::PaymentTimeout(_) => "payment_timeout",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InsufficientCredits { .. } => "insufficient_credits",
            Self::Ledger(_) => "ledger",
            Self::Storage(_) | Self::Pool(_) => "storage",
            Self::Http(_) => "http",
            Self::Config(_) => "config",
            Self::Metrics(_) => "metrics",
        }
    }
}
