//! Credit pricing, purchase settlement and the credit ledger.
//!
//! Credits are bought with HBAR at tiered volume prices and spent by the
//! metered service.
//!
//! ## Design
//! - Pricing runs in tinybars so tier arithmetic is exact
//! - SQLite-based append-only credit ledger; balances and ledger rows change
//!   in one transaction
//! - Purchases settle only on ledger confirmation, at most once per transaction id
//! - Settlement operations are also exposed as named JSON tools

pub mod payment;
pub mod pricing;
pub mod settlement;
pub mod tools;

pub use payment::{
    CreditBalance, CreditLedger, CreditTransaction, LedgerAudit, Payment, PaymentStatus,
    TransactionKind,
};
pub use pricing::{PricingEngine, PricingTier, Quote};
pub use settlement::{PaymentOrder, PollHandle, SettlementPipeline, Verification};
pub use tools::{SettlementTools, ToolResult, ToolSpec};
