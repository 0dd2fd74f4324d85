//! Payment-to-credit settlement.
//!
//! ```text
//! pending -> confirming -> completed -> (refunded)
//!         \-------------\-> failed
//! ```
//!
//! `submit` prices the purchase and records it as `pending`. After the payer
//! signs and executes the transfer, `verify`/`check_status` ask the ledger
//! once each; `poll` repeats that on an interval until a terminal state. Only
//! a ledger-reported failure moves a payment to `failed`: timeouts and lookup
//! errors leave it where it is.

use super::payment::{
    CreditBalance, CreditLedger, CreditTransaction, LedgerAudit, Payment, PaymentStatus,
};
use super::pricing::PricingEngine;
use crate::error::{GateError, Result};
use crate::metrics::MetricsSink;
use crate::network::{
    hbar_to_tinybars, LedgerClient, LedgerStatus, PaymentInstruction, TransferRequest,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failure reason recorded when the treasury received less than quoted.
pub const UNDERPAID: &str = "TREASURY_UNDERPAID";

/// A recorded purchase and the transfer the payer must sign.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrder {
    pub payment: Payment,
    pub instruction: PaymentInstruction,
}

/// Result of one ledger check.
#[derive(Debug, Clone)]
pub struct Verification {
    pub payment: Payment,
    /// The purchase row appended by this check, if it was the one that
    /// completed the payment.
    pub credited: Option<CreditTransaction>,
}

/// Handle to a background poll. Dropping it cancels the poll.
pub struct PollHandle {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<Result<Payment>>>,
}

impl PollHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for a terminal state, or for cancellation (which yields the
    /// payment as last stored).
    pub async fn wait(mut self) -> Result<Payment> {
        let Some(handle) = self.handle.take() else {
            return Err(GateError::Ledger("poll already awaited".into()));
        };
        handle
            .await
            .map_err(|e| GateError::Ledger(format!("poll task failed: {e}")))?
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct SettlementPipeline {
    pricing: PricingEngine,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<CreditLedger>,
    metrics: MetricsSink,
    treasury_account: String,
}

impl SettlementPipeline {
    pub fn new(
        pricing: PricingEngine,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<CreditLedger>,
        metrics: MetricsSink,
        treasury_account: &str,
    ) -> Self {
        Self {
            pricing,
            ledger,
            store,
            metrics,
            treasury_account: treasury_account.to_string(),
        }
    }

    /// Price `hbar` and record a pending purchase for `payer_account_id`.
    pub async fn submit(
        &self,
        payer_account_id: &str,
        hbar: f64,
        memo: &str,
    ) -> Result<PaymentOrder> {
        let tinybars = hbar_to_tinybars(hbar)?;
        if tinybars == 0 {
            return Err(GateError::InvalidAmount(format!("{hbar} HBAR must be positive")));
        }
        let credits = self.pricing.credits_for_tinybars(tinybars);
        if credits == 0 {
            return Err(GateError::InvalidAmount(format!("{hbar} HBAR buys no credits")));
        }

        let instruction = self
            .ledger
            .prepare_transfer(&TransferRequest {
                payer_account_id: payer_account_id.to_string(),
                treasury_account_id: self.treasury_account.clone(),
                tinybars,
                memo: memo.to_string(),
            })
            .await?;

        let now = Utc::now();
        let payment = Payment {
            transaction_id: instruction.transaction_id.clone(),
            payer_account_id: payer_account_id.to_string(),
            tinybars,
            credits_allocated: credits,
            memo: memo.to_string(),
            status: PaymentStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payment(&payment)?;
        self.metrics.record_payment(PaymentStatus::Pending.as_str());

        tracing::info!(
            transaction = %payment.transaction_id,
            payer = %payer_account_id,
            tinybars,
            credits,
            "Recorded pending payment"
        );
        Ok(PaymentOrder {
            payment,
            instruction,
        })
    }

    /// Check the ledger once and apply the outcome.
    pub async fn verify(&self, transaction_id: &str) -> Result<Verification> {
        let _timer = self.metrics.start_timer("verify_payment");
        let payment = self
            .store
            .payment(transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))?;
        if payment.status.is_terminal() {
            return Ok(Verification {
                payment,
                credited: None,
            });
        }

        let status = self.ledger.transaction_status(transaction_id).await?;
        self.apply(payment, status)
    }

    /// Current status after one ledger check.
    pub async fn check_status(&self, transaction_id: &str) -> Result<PaymentStatus> {
        Ok(self.verify(transaction_id).await?.payment.status)
    }

    fn apply(&self, payment: Payment, status: LedgerStatus) -> Result<Verification> {
        let id = payment.transaction_id.as_str();
        match status {
            LedgerStatus::Unknown => {
                let payment = self.advance(id, PaymentStatus::Confirming, None)?;
                tracing::debug!(transaction = %id, "Payment not yet confirmed");
                Ok(Verification {
                    payment,
                    credited: None,
                })
            }
            LedgerStatus::Failed { result } => {
                let payment = self.advance(id, PaymentStatus::Failed, Some(&result))?;
                self.metrics.record_payment(PaymentStatus::Failed.as_str());
                tracing::warn!(transaction = %id, result = %result, "Payment failed on ledger");
                Ok(Verification {
                    payment,
                    credited: None,
                })
            }
            success @ LedgerStatus::Success { .. } => {
                let received = success.credited_to(&self.treasury_account);
                if received < 0 || (received as u64) < payment.tinybars {
                    let payment = self.advance(id, PaymentStatus::Failed, Some(UNDERPAID))?;
                    self.metrics.record_payment(PaymentStatus::Failed.as_str());
                    tracing::warn!(
                        transaction = %id,
                        expected = payment.tinybars,
                        received,
                        "Treasury received less than quoted"
                    );
                    return Ok(Verification {
                        payment,
                        credited: None,
                    });
                }

                let settlement = self.store.complete_payment(id)?;
                if let Some(entry) = &settlement.entry {
                    self.metrics.record_payment(PaymentStatus::Completed.as_str());
                    self.metrics.record_credits_purchased(
                        &entry.account_id,
                        settlement.payment.credits_allocated,
                    );
                    tracing::info!(
                        transaction = %id,
                        account = %entry.account_id,
                        credits = entry.amount,
                        balance = entry.balance_after,
                        "Payment settled"
                    );
                }
                Ok(Verification {
                    payment: settlement.payment,
                    credited: settlement.entry,
                })
            }
        }
    }

    /// Move forward, or return the stored payment if a concurrent check
    /// already took it somewhere this status cannot follow.
    fn advance(&self, id: &str, to: PaymentStatus, reason: Option<&str>) -> Result<Payment> {
        match self.store.transition(id, to, reason) {
            Err(GateError::InvalidTransition { .. }) => self.payment(id),
            other => other,
        }
    }

    /// Poll `check_status` every `interval` until the payment is terminal.
    /// Lookup errors are logged and retried on the next tick.
    pub fn poll(self: &Arc<Self>, transaction_id: &str, interval: Duration) -> PollHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pipeline = Arc::clone(self);
        let transaction_id = transaction_id.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!(transaction = %transaction_id, "Payment poll cancelled");
                        return pipeline
                            .store
                            .payment(&transaction_id)?
                            .ok_or(GateError::PaymentNotFound(transaction_id));
                    }
                    _ = ticker.tick() => {
                        match pipeline.verify(&transaction_id).await {
                            Ok(v) if v.payment.status.is_terminal() => return Ok(v.payment),
                            Ok(_) => {}
                            Err(e @ GateError::PaymentNotFound(_)) => return Err(e),
                            Err(e) => {
                                tracing::warn!(
                                    transaction = %transaction_id,
                                    error = %e,
                                    "Payment status check failed, will retry"
                                );
                            }
                        }
                    }
                }
            }
        });

        PollHandle {
            cancel,
            handle: Some(handle),
        }
    }

    /// `poll` with a host-imposed deadline. On timeout the poll is cancelled
    /// and the payment stays `confirming`.
    pub async fn poll_until(
        self: &Arc<Self>,
        transaction_id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Payment> {
        let handle = self.poll(transaction_id, interval);
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(transaction = %transaction_id, "Gave up waiting for payment");
                Err(GateError::PaymentTimeout(transaction_id.to_string()))
            }
        }
    }

    // ── Balance operations ───────────────────────────────────────

    pub fn refund(&self, transaction_id: &str, reason: &str) -> Result<Payment> {
        let settlement = self.store.refund_payment(transaction_id, reason)?;
        if settlement.entry.is_some() {
            self.metrics.record_payment(PaymentStatus::Refunded.as_str());
            tracing::info!(transaction = %transaction_id, reason = %reason, "Payment refunded");
        }
        Ok(settlement.payment)
    }

    /// Spend credits for metered usage.
    pub fn consume(
        &self,
        account_id: &str,
        credits: u64,
        description: &str,
    ) -> Result<CreditTransaction> {
        let entry = self.store.consume(account_id, credits, description)?;
        self.metrics.record_credits_consumed(account_id, credits);
        Ok(entry)
    }

    pub fn adjust(&self, account_id: &str, delta: i64, reason: &str) -> Result<CreditTransaction> {
        let entry = self.store.adjust(account_id, delta, reason)?;
        tracing::info!(account = %account_id, delta, reason = %reason, "Credit adjustment");
        Ok(entry)
    }

    pub fn balance(&self, account_id: &str) -> Result<CreditBalance> {
        self.store.balance(account_id)
    }

    pub fn payment(&self, transaction_id: &str) -> Result<Payment> {
        self.store
            .payment(transaction_id)?
            .ok_or_else(|| GateError::PaymentNotFound(transaction_id.to_string()))
    }

    pub fn payment_history(&self, account_id: &str, limit: usize) -> Result<Vec<Payment>> {
        self.store.payment_history(account_id, limit)
    }

    pub fn credit_history(&self, account_id: &str, limit: usize) -> Result<Vec<CreditTransaction>> {
        self.store.credit_history(account_id, limit)
    }

    pub fn audit(&self, account_id: &str) -> Result<LedgerAudit> {
        let audit = self.store.audit(account_id)?;
        if !audit.is_consistent() {
            tracing::error!(account = %account_id, ?audit, "Credit ledger is inconsistent");
        }
        Ok(audit)
    }
}
