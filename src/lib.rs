//! Signature-gated API keys and tiered HBAR credit settlement.
//!
//! An account holder proves control of a Hedera account by signing a
//! server-issued challenge and receives a short-lived, permission-scoped API
//! key. Usage is metered in credits bought with HBAR at tiered volume prices;
//! purchases are credited once the ledger confirms the transfer.

pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;

pub use config::Config;
pub use error::{GateError, Rejection, Result};
