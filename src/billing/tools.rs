//! Settlement operations exposed as named tools (JSON in, JSON out).

use super::payment::{CreditTransaction, Payment};
use super::settlement::SettlementPipeline;
use crate::error::GateError;
use crate::network::tinybars_to_hbar;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_PAYMENT_HISTORY: usize = 20;
const DEFAULT_CREDIT_HISTORY: usize = 50;
const MAX_HISTORY: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid argument {0}: {1}")]
    InvalidArgument(&'static str, String),
    #[error(transparent)]
    Gate(#[from] GateError),
}

pub struct SettlementTools {
    pipeline: Arc<SettlementPipeline>,
}

impl SettlementTools {
    pub fn new(pipeline: Arc<SettlementPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn specs() -> Vec<ToolSpec> {
        let account = json!({
            "type": "object",
            "properties": {"account_id": {"type": "string"}},
            "required": ["account_id"]
        });
        let transaction = json!({
            "type": "object",
            "properties": {"transaction_id": {"type": "string"}},
            "required": ["transaction_id"]
        });
        let history = json!({
            "type": "object",
            "properties": {
                "account_id": {"type": "string"},
                "limit": {"type": "integer", "minimum": 1}
            },
            "required": ["account_id"]
        });

        vec![
            ToolSpec {
                name: "check_credit_balance",
                description: "Current, purchased and consumed credits for an account",
                parameters: account,
            },
            ToolSpec {
                name: "create_payment_transaction",
                description: "Price an HBAR amount and prepare the transfer to sign",
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "account_id": {"type": "string"},
                        "hbar_amount": {"type": "number", "exclusiveMinimum": 0},
                        "memo": {"type": "string"}
                    },
                    "required": ["account_id", "hbar_amount"]
                }),
            },
            ToolSpec {
                name: "verify_payment",
                description: "Check a submitted payment on the ledger and credit it once confirmed",
                parameters: transaction.clone(),
            },
            ToolSpec {
                name: "check_payment_status",
                description: "Refresh and report a payment's status",
                parameters: transaction,
            },
            ToolSpec {
                name: "get_payment_history",
                description: "Recent payments for an account, newest first",
                parameters: history.clone(),
            },
            ToolSpec {
                name: "get_credit_history",
                description: "Recent credit ledger entries for an account, newest first",
                parameters: history,
            },
        ]
    }

    /// Run tool `name`. Failures are reported in the result, never raised.
    pub async fn execute(&self, name: &str, args: Value) -> ToolResult {
        match self.dispatch(name, &args).await {
            Ok(output) => ToolResult {
                success: true,
                output,
                error: None,
            },
            Err(e) => {
                tracing::debug!(tool = %name, error = %e, "Tool call failed");
                let kind = match &e {
                    ToolError::Gate(inner) => inner.kind(),
                    ToolError::UnknownTool(_) => "unknown_tool",
                    ToolError::MissingArgument(_) | ToolError::InvalidArgument(..) => {
                        "invalid_arguments"
                    }
                };
                ToolResult {
                    success: false,
                    output: json!({"error_kind": kind}),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        match name {
            "check_credit_balance" => {
                let balance = self.pipeline.balance(str_arg(args, "account_id")?)?;
                Ok(json!({
                    "account_id": balance.account_id,
                    "current": balance.current,
                    "total_purchased": balance.total_purchased,
                    "total_consumed": balance.total_consumed,
                }))
            }
            "create_payment_transaction" => {
                let account_id = str_arg(args, "account_id")?;
                let hbar = args
                    .get("hbar_amount")
                    .ok_or(ToolError::MissingArgument("hbar_amount"))?
                    .as_f64()
                    .ok_or_else(|| {
                        ToolError::InvalidArgument("hbar_amount", "not a number".into())
                    })?;
                let memo = args
                    .get("memo")
                    .and_then(Value::as_str)
                    .unwrap_or("credit purchase");

                let order = self.pipeline.submit(account_id, hbar, memo).await?;
                Ok(json!({
                    "transaction_id": order.instruction.transaction_id,
                    "payer_account_id": order.instruction.payer_account_id,
                    "treasury_account_id": order.instruction.treasury_account_id,
                    "node_account_id": order.instruction.node_account_id,
                    "network": order.instruction.network,
                    "tinybars": order.instruction.tinybars,
                    "hbar_amount": tinybars_to_hbar(order.instruction.tinybars),
                    "credits": order.payment.credits_allocated,
                    "memo": order.instruction.memo,
                    "status": order.payment.status,
                }))
            }
            "verify_payment" => {
                let verification = self.pipeline.verify(str_arg(args, "transaction_id")?).await?;
                let mut out = payment_json(&verification.payment);
                out["credited"] = json!(verification.credited.is_some());
                if let Some(entry) = &verification.credited {
                    out["balance_after"] = json!(entry.balance_after);
                }
                Ok(out)
            }
            "check_payment_status" => {
                let id = str_arg(args, "transaction_id")?;
                self.pipeline.check_status(id).await?;
                Ok(payment_json(&self.pipeline.payment(id)?))
            }
            "get_payment_history" => {
                let account_id = str_arg(args, "account_id")?;
                let limit = limit_arg(args, DEFAULT_PAYMENT_HISTORY)?;
                let payments = self.pipeline.payment_history(account_id, limit)?;
                Ok(json!({
                    "account_id": account_id,
                    "payments": payments.iter().map(payment_json).collect::<Vec<_>>(),
                }))
            }
            "get_credit_history" => {
                let account_id = str_arg(args, "account_id")?;
                let limit = limit_arg(args, DEFAULT_CREDIT_HISTORY)?;
                let entries = self.pipeline.credit_history(account_id, limit)?;
                Ok(json!({
                    "account_id": account_id,
                    "transactions": entries.iter().map(transaction_json).collect::<Vec<_>>(),
                }))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn str_arg<'a>(args: &'a Value, key: &'static str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ToolError::MissingArgument(key))
}

fn limit_arg(args: &Value, default: usize) -> Result<usize, ToolError> {
    match args.get("limit") {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .filter(|n| *n > 0)
            .map(|n| (n as usize).min(MAX_HISTORY))
            .ok_or_else(|| ToolError::InvalidArgument("limit", v.to_string())),
    }
}

fn payment_json(payment: &Payment) -> Value {
    json!({
        "transaction_id": payment.transaction_id,
        "payer_account_id": payment.payer_account_id,
        "hbar_amount": payment.hbar(),
        "credits_allocated": payment.credits_allocated,
        "status": payment.status,
        "failure_reason": payment.failure_reason,
        "created_at": payment.created_at.to_rfc3339(),
    })
}

fn transaction_json(entry: &CreditTransaction) -> Value {
    json!({
        "id": entry.id,
        "kind": entry.kind,
        "amount": entry.amount,
        "balance_after": entry.balance_after,
        "description": entry.description,
        "related_payment_id": entry.related_payment_id,
        "created_at": entry.created_at.to_rfc3339(),
    })
}
