//! Payment records and the append-only credit ledger.
//!
//! ## Design
//! - SQLite-backed payment ledger behind an r2d2 pool
//! - Every balance mutation runs in one `IMMEDIATE` transaction that updates
//!   `credit_balances` and appends a `credit_transactions` row together
//! - Completion is idempotent per transaction id: a unique index on
//!   `(related_payment_id, kind)` backs the status check
//! - Triggers reject UPDATE/DELETE on ledger rows

use crate::error::{GateError, Result};
use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;

const POOL_SIZE: u32 = 8;

// ── Payment status ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Recorded, waiting for the payer to sign and submit.
    Pending,
    /// Submitted, not yet confirmed by the ledger.
    Confirming,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    fn from_db(s: &str) -> rusqlite::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirming" => Ok(Self::Confirming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("payment status '{other}'"),
                rusqlite::types::Type::Text,
            )),
        }
    }

    /// No further settlement happens from here. `Completed` can still be
    /// refunded by an operator.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Refunded)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirming)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Confirming, Completed)
                | (Confirming, Failed)
                | (Completed, Refunded)
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Ledger transaction id, `payer@seconds.nanos`.
    pub transaction_id: String,
    pub payer_account_id: String,
    pub tinybars: u64,
    pub credits_allocated: u64,
    pub memo: String,
    pub status: PaymentStatus,
    /// Ledger result code when the payment failed.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn hbar(&self) -> f64 {
        crate::network::tinybars_to_hbar(self.tinybars)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Purchase,
    Consumption,
    Refund,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Consumption => "consumption",
            Self::Refund => "refund",
            Self::Adjustment => "adjustment",
        }
    }

    fn from_db(s: &str) -> rusqlite::Result<Self> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "consumption" => Ok(Self::Consumption),
            "refund" => Ok(Self::Refund),
            "adjustment" => Ok(Self::Adjustment),
            other => Err(rusqlite::Error::InvalidColumnType(
                0,
                format!("transaction kind '{other}'"),
                rusqlite::types::Type::Text,
            )),
        }
    }
}

/// Immutable ledger row. `amount` is the signed change to `current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: i64,
    pub account_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub description: Option<String>,
    pub related_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub account_id: String,
    pub current: i64,
    pub total_purchased: i64,
    pub total_consumed: i64,
}

impl CreditBalance {
    fn empty(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            current: 0,
            total_purchased: 0,
            total_consumed: 0,
        }
    }
}

/// What `complete_payment` did. `entry` is `None` when the payment had
/// already been credited.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub payment: Payment,
    pub entry: Option<CreditTransaction>,
}

/// Result of re-folding an account's ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerAudit {
    pub account_id: String,
    pub rows: usize,
    pub folded_balance: i64,
    pub balance: CreditBalance,
    /// Id of the first row whose `balance_after` disagrees with the fold.
    pub first_mismatch: Option<i64>,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.first_mismatch.is_none()
            && self.folded_balance == self.balance.current
            && self.balance.current == self.balance.total_purchased - self.balance.total_consumed
    }
}

// ── Ledger store ─────────────────────────────────────────────────

/// Signed effect of one ledger row on the balance columns.
struct Delta<'a> {
    kind: TransactionKind,
    amount: i64,
    purchased: i64,
    consumed: i64,
    description: Option<&'a str>,
    related_payment_id: Option<&'a str>,
}

pub struct CreditLedger {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl CreditLedger {
    /// Open (or create) the ledger database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = r2d2::Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS payments (
                transaction_id TEXT PRIMARY KEY,
                payer_account_id TEXT NOT NULL,
                tinybars INTEGER NOT NULL,
                credits_allocated INTEGER NOT NULL,
                memo TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                failure_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer_account_id);
            CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);

            CREATE TABLE IF NOT EXISTS credit_balances (
                account_id TEXT PRIMARY KEY,
                current INTEGER NOT NULL DEFAULT 0,
                total_purchased INTEGER NOT NULL DEFAULT 0,
                total_consumed INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credit_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                description TEXT,
                related_payment_id TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credit_tx_account ON credit_transactions(account_id, id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credit_tx_payment
                ON credit_transactions(related_payment_id, kind)
                WHERE related_payment_id IS NOT NULL;

            CREATE TRIGGER IF NOT EXISTS credit_transactions_no_update
                BEFORE UPDATE ON credit_transactions
                BEGIN SELECT RAISE(ABORT, 'credit_transactions is append-only'); END;
            CREATE TRIGGER IF NOT EXISTS credit_transactions_no_delete
                BEFORE DELETE ON credit_transactions
                BEGIN SELECT RAISE(ABORT, 'credit_transactions is append-only'); END;",
        )?;

        Ok(Self { pool })
    }

    // ── Payments ─────────────────────────────────────────────────

    pub fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let tinybars = to_signed(payment.tinybars, "tinybars")?;
        let credits = to_signed(payment.credits_allocated, "credits")?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO payments (transaction_id, payer_account_id, tinybars, credits_allocated,
                                   memo, status, failure_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                payment.transaction_id,
                payment.payer_account_id,
                tinybars,
                credits,
                payment.memo,
                payment.status.as_str(),
                payment.failure_reason,
                payment.created_at.timestamp_millis(),
                payment.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn payment(&self, transaction_id: &str) -> Result<Option<Payment>> {
        let conn = self.pool.get()?;
        Ok(load_payment(&conn, transaction_id)?)
    }

    /// Move a payment forward without touching balances (`confirming`,
    /// `failed`). Re-applying the current status is a no-op.
    pub fn transition(
        &self,
        transaction_id: &str,
        to: PaymentStatus,
        failure_reason: Option<&str>,
    ) -> Result<Payment> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let payment = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        if payment.status == to {
            return Ok(payment);
        }
        ensure_transition(&payment, to)?;

        tx.execute(
            "UPDATE payments SET status = ?1, failure_reason = COALESCE(?2, failure_reason),
                                 updated_at = ?3
             WHERE transaction_id = ?4",
            params![to.as_str(), failure_reason, now_millis(), transaction_id],
        )?;
        let updated = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Mark a payment completed and credit the payer, atomically.
    ///
    /// Idempotent: completing an already-completed payment returns it with
    /// no new ledger row.
    pub fn complete_payment(&self, transaction_id: &str) -> Result<Settlement> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let payment = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        if payment.status == PaymentStatus::Completed {
            return Ok(Settlement {
                payment,
                entry: None,
            });
        }
        ensure_transition(&payment, PaymentStatus::Completed)?;

        tx.execute(
            "UPDATE payments SET status = 'completed', updated_at = ?1 WHERE transaction_id = ?2",
            params![now_millis(), transaction_id],
        )?;
        let credits = to_signed(payment.credits_allocated, "credits")?;
        let entry = append_entry(
            &tx,
            &payment.payer_account_id,
            &Delta {
                kind: TransactionKind::Purchase,
                amount: credits,
                purchased: credits,
                consumed: 0,
                description: Some(&payment.memo),
                related_payment_id: Some(transaction_id),
            },
        )?;
        let payment = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        tx.commit()?;

        Ok(Settlement {
            payment,
            entry: Some(entry),
        })
    }

    /// Reverse a completed purchase. Fails if the credits were already spent.
    pub fn refund_payment(&self, transaction_id: &str, reason: &str) -> Result<Settlement> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let payment = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        if payment.status == PaymentStatus::Refunded {
            return Ok(Settlement {
                payment,
                entry: None,
            });
        }
        ensure_transition(&payment, PaymentStatus::Refunded)?;

        tx.execute(
            "UPDATE payments SET status = 'refunded', updated_at = ?1 WHERE transaction_id = ?2",
            params![now_millis(), transaction_id],
        )?;
        let credits = to_signed(payment.credits_allocated, "credits")?;
        let entry = append_entry(
            &tx,
            &payment.payer_account_id,
            &Delta {
                kind: TransactionKind::Refund,
                amount: -credits,
                purchased: -credits,
                consumed: 0,
                description: Some(reason),
                related_payment_id: Some(transaction_id),
            },
        )?;
        let payment = load_payment(&tx, transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        tx.commit()?;

        Ok(Settlement {
            payment,
            entry: Some(entry),
        })
    }

    pub fn payment_history(&self, account_id: &str, limit: usize) -> Result<Vec<Payment>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id, payer_account_id, tinybars, credits_allocated, memo, status,
                    failure_reason, created_at, updated_at
             FROM payments WHERE payer_account_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let payments = stmt
            .query_map(params![account_id, limit as i64], payment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(payments)
    }

    // ── Credits ──────────────────────────────────────────────────

    /// Spend credits for metered usage.
    pub fn consume(
        &self,
        account_id: &str,
        credits: u64,
        description: &str,
    ) -> Result<CreditTransaction> {
        if credits == 0 {
            return Err(GateError::InvalidAmount("cannot consume zero credits".into()));
        }
        let amount = to_signed(credits, "credits")?;
        self.with_entry(
            account_id,
            &Delta {
                kind: TransactionKind::Consumption,
                amount: -amount,
                purchased: 0,
                consumed: amount,
                description: Some(description),
                related_payment_id: None,
            },
        )
    }

    /// Operator correction. Positive deltas count as purchased volume,
    /// negative deltas as consumed.
    pub fn adjust(&self, account_id: &str, delta: i64, reason: &str) -> Result<CreditTransaction> {
        if delta == 0 {
            return Err(GateError::InvalidAmount("adjustment cannot be zero".into()));
        }
        let (purchased, consumed) = if delta > 0 {
            (delta, 0)
        } else {
            let spent = delta.checked_neg().ok_or_else(|| {
                GateError::InvalidAmount(format!("adjustment {delta} out of range"))
            })?;
            (0, spent)
        };
        self.with_entry(
            account_id,
            &Delta {
                kind: TransactionKind::Adjustment,
                amount: delta,
                purchased,
                consumed,
                description: Some(reason),
                related_payment_id: None,
            },
        )
    }

    fn with_entry(&self, account_id: &str, delta: &Delta<'_>) -> Result<CreditTransaction> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let entry = append_entry(&tx, account_id, delta)?;
        tx.commit()?;
        Ok(entry)
    }

    pub fn balance(&self, account_id: &str) -> Result<CreditBalance> {
        let conn = self.pool.get()?;
        Ok(load_balance(&conn, account_id)?)
    }

    /// Newest first.
    pub fn credit_history(&self, account_id: &str, limit: usize) -> Result<Vec<CreditTransaction>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, kind, amount, balance_after, description, related_payment_id,
                    created_at
             FROM credit_transactions WHERE account_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, limit as i64], transaction_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fold every ledger row for `account_id` in creation order and compare
    /// against the stored balance.
    pub fn audit(&self, account_id: &str) -> Result<LedgerAudit> {
        let mut conn = self.pool.get()?;
        // Deferred read transaction: one consistent snapshot under WAL.
        let tx = conn.transaction()?;
        let balance = load_balance(&tx, account_id)?;

        let mut stmt = tx.prepare(
            "SELECT id, amount, balance_after FROM credit_transactions
             WHERE account_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut folded = 0i64;
        let mut first_mismatch = None;
        for (id, amount, balance_after) in &rows {
            folded = folded.saturating_add(*amount);
            if first_mismatch.is_none() && folded != *balance_after {
                first_mismatch = Some(*id);
            }
        }

        Ok(LedgerAudit {
            account_id: account_id.to_string(),
            rows: rows.len(),
            folded_balance: folded,
            balance,
            first_mismatch,
        })
    }
}

// ── Row helpers ──────────────────────────────────────────────────

fn ensure_transition(payment: &Payment, to: PaymentStatus) -> Result<()> {
    if payment.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(GateError::InvalidTransition {
            transaction_id: payment.transaction_id.clone(),
            from: payment.status,
            to,
        })
    }
}

/// Update the balance row and append the matching ledger row. Must run
/// inside the caller's transaction.
fn append_entry(
    conn: &rusqlite::Connection,
    account_id: &str,
    delta: &Delta<'_>,
) -> Result<CreditTransaction> {
    let before = load_balance(conn, account_id)?;
    let current = before
        .current
        .checked_add(delta.amount)
        .ok_or_else(|| overflow(account_id))?;
    if current < 0 {
        return Err(GateError::InsufficientCredits {
            required: delta.amount.unsigned_abs(),
            available: before.current.max(0) as u64,
        });
    }
    let total_purchased = before
        .total_purchased
        .checked_add(delta.purchased)
        .ok_or_else(|| overflow(account_id))?;
    let total_consumed = before
        .total_consumed
        .checked_add(delta.consumed)
        .ok_or_else(|| overflow(account_id))?;
    let now = now_millis();

    conn.execute(
        "INSERT INTO credit_balances (account_id, current, total_purchased, total_consumed,
                                      updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(account_id) DO UPDATE SET
             current = excluded.current,
             total_purchased = excluded.total_purchased,
             total_consumed = excluded.total_consumed,
             updated_at = excluded.updated_at",
        params![
            account_id,
            current,
            total_purchased,
            total_consumed,
            now,
        ],
    )?;

    conn.execute(
        "INSERT INTO credit_transactions (account_id, kind, amount, balance_after, description,
                                          related_payment_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            account_id,
            delta.kind.as_str(),
            delta.amount,
            current,
            delta.description,
            delta.related_payment_id,
            now,
        ],
    )?;

    Ok(CreditTransaction {
        id: conn.last_insert_rowid(),
        account_id: account_id.to_string(),
        kind: delta.kind,
        amount: delta.amount,
        balance_after: current,
        description: delta.description.map(str::to_string),
        related_payment_id: delta.related_payment_id.map(str::to_string),
        created_at: from_millis(now),
    })
}

fn to_signed(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| GateError::InvalidAmount(format!("{what} {value} out of range")))
}

fn overflow(account_id: &str) -> GateError {
    GateError::InvalidAmount(format!("balance for {account_id} would overflow"))
}

fn load_balance(conn: &rusqlite::Connection, account_id: &str) -> rusqlite::Result<CreditBalance> {
    let balance = conn
        .query_row(
            "SELECT account_id, current, total_purchased, total_consumed
             FROM credit_balances WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(CreditBalance {
                    account_id: row.get(0)?,
                    current: row.get(1)?,
                    total_purchased: row.get(2)?,
                    total_consumed: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(balance.unwrap_or_else(|| CreditBalance::empty(account_id)))
}

fn load_payment(
    conn: &rusqlite::Connection,
    transaction_id: &str,
) -> rusqlite::Result<Option<Payment>> {
    conn.query_row(
        "SELECT transaction_id, payer_account_id, tinybars, credits_allocated, memo, status,
                failure_reason, created_at, updated_at
         FROM payments WHERE transaction_id = ?1",
        params![transaction_id],
        payment_from_row,
    )
    .optional()
}

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    let status: String = row.get(5)?;
    Ok(Payment {
        transaction_id: row.get(0)?,
        payer_account_id: row.get(1)?,
        tinybars: row.get::<_, i64>(2)? as u64,
        credits_allocated: row.get::<_, i64>(3)? as u64,
        memo: row.get(4)?,
        status: PaymentStatus::from_db(&status)?,
        failure_reason: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
    })
}

fn transaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CreditTransaction> {
    let kind: String = row.get(2)?;
    Ok(CreditTransaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: TransactionKind::from_db(&kind)?,
        amount: row.get(3)?,
        balance_after: row.get(4)?,
        description: row.get(5)?,
        related_payment_id: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_ledger() -> (TempDir, CreditLedger) {
        let tmp = TempDir::new().unwrap();
        let ledger = CreditLedger::open(&tmp.path().join("credits.db")).unwrap();
        (tmp, ledger)
    }

    fn pending(id: &str, payer: &str, credits: u64) -> Payment {
        let now = Utc::now();
        Payment {
            transaction_id: id.to_string(),
            payer_account_id: payer.to_string(),
            tinybars: credits * 1_000_000,
            credits_allocated: credits,
            memo: "credit purchase".into(),
            status: PaymentStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Confirming));
        assert!(Confirming.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Refunded));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Completed));
        assert!(!Confirming.can_transition_to(Pending));
        assert!(Failed.is_terminal() && Completed.is_terminal() && Refunded.is_terminal());
        assert!(!Confirming.is_terminal());
    }

    #[test]
    fn complete_payment_grants_credits() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 350)).unwrap();

        let settlement = ledger.complete_payment("0.0.5@1.1").unwrap();
        assert_eq!(settlement.payment.status, PaymentStatus::Completed);
        let entry = settlement.entry.unwrap();
        assert_eq!(entry.kind, TransactionKind::Purchase);
        assert_eq!(entry.amount, 350);
        assert_eq!(entry.balance_after, 350);
        assert_eq!(entry.related_payment_id.as_deref(), Some("0.0.5@1.1"));

        let balance = ledger.balance("0.0.5").unwrap();
        assert_eq!(balance.current, 350);
        assert_eq!(balance.total_purchased, 350);
    }

    #[test]
    fn complete_payment_is_idempotent() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 100)).unwrap();

        assert!(ledger.complete_payment("0.0.5@1.1").unwrap().entry.is_some());
        assert!(ledger.complete_payment("0.0.5@1.1").unwrap().entry.is_none());

        let balance = ledger.balance("0.0.5").unwrap();
        assert_eq!(balance.current, 100);
        assert_eq!(balance.total_purchased, 100);
        assert_eq!(ledger.credit_history("0.0.5", 10).unwrap().len(), 1);
    }

    #[test]
    fn failed_payment_cannot_complete() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 100)).unwrap();
        ledger
            .transition("0.0.5@1.1", PaymentStatus::Failed, Some("INVALID_SIGNATURE"))
            .unwrap();

        let err = ledger.complete_payment("0.0.5@1.1").unwrap_err();
        assert!(matches!(err, GateError::InvalidTransition { .. }));
        assert_eq!(ledger.balance("0.0.5").unwrap().current, 0);

        let failed = ledger.payment("0.0.5@1.1").unwrap().unwrap();
        assert_eq!(failed.failure_reason.as_deref(), Some("INVALID_SIGNATURE"));
    }

    #[test]
    fn unknown_payment_is_not_found() {
        let (_tmp, ledger) = make_ledger();
        assert!(ledger.payment("0.0.1@0.0").unwrap().is_none());
        assert!(matches!(
            ledger.complete_payment("0.0.1@0.0"),
            Err(GateError::PaymentNotFound(_))
        ));
    }

    #[test]
    fn consume_and_insufficient_credits() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 1_500)).unwrap();
        ledger.complete_payment("0.0.5@1.1").unwrap();

        let entry = ledger.consume("0.0.5", 500, "api call").unwrap();
        assert_eq!(entry.amount, -500);
        assert_eq!(entry.balance_after, 1_000);

        let err = ledger.consume("0.0.5", 5_000, "big call").unwrap_err();
        assert!(matches!(
            err,
            GateError::InsufficientCredits {
                required: 5_000,
                available: 1_000
            }
        ));

        let balance = ledger.balance("0.0.5").unwrap();
        assert_eq!(balance.current, 1_000);
        assert_eq!(balance.total_consumed, 500);
    }

    #[test]
    fn refund_reverses_purchase_once() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 200)).unwrap();
        ledger.complete_payment("0.0.5@1.1").unwrap();

        let refund = ledger.refund_payment("0.0.5@1.1", "operator refund").unwrap();
        assert_eq!(refund.payment.status, PaymentStatus::Refunded);
        assert_eq!(refund.entry.unwrap().balance_after, 0);
        assert!(ledger.refund_payment("0.0.5@1.1", "again").unwrap().entry.is_none());

        let audit = ledger.audit("0.0.5").unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.balance.total_purchased, 0);
    }

    #[test]
    fn refund_of_spent_credits_fails() {
        let (_tmp, ledger) = make_ledger();
        ledger.insert_payment(&pending("0.0.5@1.1", "0.0.5", 200)).unwrap();
        ledger.complete_payment("0.0.5@1.1").unwrap();
        ledger.consume("0.0.5", 150, "usage").unwrap();

        assert!(matches!(
            ledger.refund_payment("0.0.5@1.1", "too late"),
            Err(GateError::InsufficientCredits { .. })
        ));
        // Rolled back: still completed.
        assert_eq!(
            ledger.payment("0.0.5@1.1").unwrap().unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[test]
    fn adjustments_keep_invariant() {
        let (_tmp, ledger) = make_ledger();
        ledger.adjust("0.0.9", 40, "promo").unwrap();
        ledger.adjust("0.0.9", -15, "correction").unwrap();

        let audit = ledger.audit("0.0.9").unwrap();
        assert!(audit.is_consistent());
        assert_eq!(audit.balance.current, 25);
        assert_eq!(audit.rows, 2);
        assert!(ledger.adjust("0.0.9", 0, "noop").is_err());
    }

    #[test]
    fn out_of_range_amounts_are_rejected() {
        let (_tmp, ledger) = make_ledger();
        ledger.adjust("0.0.5", 10, "seed").unwrap();

        assert!(matches!(
            ledger.consume("0.0.5", u64::MAX, "huge"),
            Err(GateError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.consume("0.0.5", 1 << 63, "huge"),
            Err(GateError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.adjust("0.0.5", i64::MIN, "huge"),
            Err(GateError::InvalidAmount(_))
        ));
        let mut oversized = pending("0.0.5@1.1", "0.0.5", 1);
        oversized.credits_allocated = u64::MAX;
        assert!(matches!(
            ledger.insert_payment(&oversized),
            Err(GateError::InvalidAmount(_))
        ));
        assert!(ledger.payment("0.0.5@1.1").unwrap().is_none());

        let balance = ledger.balance("0.0.5").unwrap();
        assert_eq!(balance.current, 10);
        assert_eq!(balance.total_purchased, 10);
        assert_eq!(balance.total_consumed, 0);
        assert!(ledger.audit("0.0.5").unwrap().is_consistent());
    }

    #[test]
    fn balance_overflow_is_rejected() {
        let (_tmp, ledger) = make_ledger();
        ledger.adjust("0.0.5", i64::MAX, "seed").unwrap();

        assert!(matches!(
            ledger.adjust("0.0.5", 1, "one more"),
            Err(GateError::InvalidAmount(_))
        ));
        assert_eq!(ledger.balance("0.0.5").unwrap().current, i64::MAX);
    }

    #[test]
    fn ledger_rows_are_append_only() {
        let (tmp, ledger) = make_ledger();
        ledger.adjust("0.0.9", 10, "seed").unwrap();

        let conn = rusqlite::Connection::open(tmp.path().join("credits.db")).unwrap();
        assert!(conn
            .execute("UPDATE credit_transactions SET amount = 999", [])
            .is_err());
        assert!(conn.execute("DELETE FROM credit_transactions", []).is_err());
    }

    #[test]
    fn history_is_newest_first() {
        let (_tmp, ledger) = make_ledger();
        for (i, credits) in [100u64, 200, 300].iter().enumerate() {
            let id = format!("0.0.5@1.{i}");
            ledger.insert_payment(&pending(&id, "0.0.5", *credits)).unwrap();
            ledger.complete_payment(&id).unwrap();
        }

        let history = ledger.credit_history("0.0.5", 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].balance_after, 600);
        assert_eq!(history[1].balance_after, 300);

        let payments = ledger.payment_history("0.0.5", 10).unwrap();
        assert_eq!(payments.len(), 3);
        assert!(payments.iter().all(|p| p.status == PaymentStatus::Completed));
    }

    #[test]
    fn concurrent_purchases_and_consumption_stay_consistent() {
        let (_tmp, ledger) = make_ledger();
        let ledger = Arc::new(ledger);
        for i in 0..20 {
            ledger
                .insert_payment(&pending(&format!("0.0.5@2.{i}"), "0.0.5", 10))
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                ledger.complete_payment(&format!("0.0.5@2.{i}")).unwrap();
                // Duplicate completion notifications are harmless.
                ledger.complete_payment(&format!("0.0.5@2.{i}")).unwrap();
            }));
        }
        for _ in 0..10 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                // May race ahead of purchases; insufficient balance is fine.
                let _ = ledger.consume("0.0.5", 5, "usage");
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let audit = ledger.audit("0.0.5").unwrap();
        assert!(audit.is_consistent(), "{audit:?}");
        assert_eq!(audit.balance.total_purchased, 200);
    }
}
