//! Mirror node REST client.

use super::{
    to_mirror_transaction_id, AccountKey, KeyType, LedgerClient, LedgerStatus, Network,
    PaymentInstruction, Transfer, TransferRequest,
};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Consensus node that transfers are addressed to by default.
const DEFAULT_NODE_ACCOUNT: &str = "0.0.3";

#[derive(Debug, Deserialize)]
struct AccountResponse {
    key: Option<KeyResponse>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    #[serde(rename = "_type")]
    key_type: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<TransactionResponse>,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    result: String,
    consensus_timestamp: Option<String>,
    #[serde(default)]
    transfers: Vec<Transfer>,
}

pub struct MirrorNodeClient {
    base_url: String,
    network: Network,
    http: reqwest::Client,
}

impl MirrorNodeClient {
    pub fn new(base_url: &str, network: Network, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            network,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }
}

#[async_trait]
impl LedgerClient for MirrorNodeClient {
    async fn account_key(&self, account_id: &str) -> Result<AccountKey> {
        if !crate::auth::is_valid_account_id(account_id) {
            return Err(GateError::Ledger(format!("invalid account id: {account_id}")));
        }

        let resp = self
            .http
            .get(self.url(&format!("accounts/{account_id}")))
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GateError::Ledger(format!("account not found: {account_id}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GateError::Ledger(format!(
                "account lookup failed ({status}): {body}"
            )));
        }

        let account: AccountResponse = resp.json().await?;
        let key = account
            .key
            .ok_or_else(|| GateError::Ledger(format!("account {account_id} has no key")))?;

        let key_type = match key.key_type.as_str() {
            "ED25519" => KeyType::Ed25519,
            "ECDSA_SECP256K1" => KeyType::EcdsaSecp256k1,
            other => {
                return Err(GateError::Ledger(format!(
                    "unsupported key type {other} for account {account_id}"
                )))
            }
        };

        AccountKey::from_hex(key_type, &key.key).ok_or_else(|| {
            GateError::Ledger(format!("malformed key returned for account {account_id}"))
        })
    }

    async fn prepare_transfer(&self, request: &TransferRequest) -> Result<PaymentInstruction> {
        if !crate::auth::is_valid_account_id(&request.payer_account_id) {
            return Err(GateError::Ledger(format!(
                "invalid payer account: {}",
                request.payer_account_id
            )));
        }

        let valid_start = chrono::Utc::now();
        let transaction_id = format!(
            "{}@{}.{:09}",
            request.payer_account_id,
            valid_start.timestamp(),
            valid_start.timestamp_subsec_nanos()
        );

        Ok(PaymentInstruction {
            transaction_id,
            payer_account_id: request.payer_account_id.clone(),
            treasury_account_id: request.treasury_account_id.clone(),
            node_account_id: DEFAULT_NODE_ACCOUNT.to_string(),
            tinybars: request.tinybars,
            memo: request.memo.clone(),
            network: self.network,
        })
    }

    async fn transaction_status(&self, transaction_id: &str) -> Result<LedgerStatus> {
        let mirror_id = to_mirror_transaction_id(transaction_id).ok_or_else(|| {
            GateError::Ledger(format!("invalid transaction id: {transaction_id}"))
        })?;

        let resp = self
            .http
            .get(self.url(&format!("transactions/{mirror_id}")))
            .send()
            .await?;

        // The mirror node lags consensus by a few seconds.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(LedgerStatus::Unknown);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GateError::Ledger(format!(
                "transaction lookup failed ({status}): {body}"
            )));
        }

        let body: TransactionsResponse = resp.json().await?;
        let Some(first) = body.transactions.first() else {
            return Ok(LedgerStatus::Unknown);
        };
        let tx = body
            .transactions
            .iter()
            .find(|t| t.result == "SUCCESS")
            .unwrap_or(first);

        if tx.result == "SUCCESS" {
            Ok(LedgerStatus::Success {
                consensus_timestamp: tx.consensus_timestamp.clone(),
                transfers: tx.transfers.clone(),
            })
        } else {
            Ok(LedgerStatus::Failed {
                result: tx.result.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MirrorNodeClient {
        MirrorNodeClient::new(&server.uri(), Network::Testnet, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn account_key_resolves_ed25519() {
        let server = MockServer::start().await;
        let key = "ab".repeat(32);
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/0.0.1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account": "0.0.1234",
                "key": {"_type": "ED25519", "key": key}
            })))
            .mount(&server)
            .await;

        let resolved = client(&server).account_key("0.0.1234").await.unwrap();
        assert_eq!(resolved.key_type, KeyType::Ed25519);
        assert_eq!(resolved.to_hex(), key);
    }

    #[tokio::test]
    async fn account_key_missing_account_is_ledger_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/0.0.9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server).account_key("0.0.9").await.unwrap_err();
        assert!(matches!(err, GateError::Ledger(_)));
    }

    #[tokio::test]
    async fn account_key_rejects_threshold_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/accounts/0.0.77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "account": "0.0.77",
                "key": {"_type": "ProtobufEncoded", "key": "2a0c0a"}
            })))
            .mount(&server)
            .await;

        assert!(client(&server).account_key("0.0.77").await.is_err());
    }

    #[tokio::test]
    async fn transaction_status_maps_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/transactions/0.0.5-1700000000-000000001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactions": [{
                    "result": "SUCCESS",
                    "consensus_timestamp": "1700000002.000000001",
                    "transfers": [
                        {"account": "0.0.5", "amount": -100000000},
                        {"account": "0.0.800", "amount": 100000000}
                    ]
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/transactions/0.0.5-1700000000-000000002"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactions": [{"result": "INSUFFICIENT_PAYER_BALANCE"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/transactions/0.0.5-1700000000-000000003"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mirror = client(&server);
        let ok = mirror
            .transaction_status("0.0.5@1700000000.000000001")
            .await
            .unwrap();
        assert_eq!(ok.credited_to("0.0.800"), 100_000_000);

        let failed = mirror
            .transaction_status("0.0.5@1700000000.000000002")
            .await
            .unwrap();
        assert_eq!(
            failed,
            LedgerStatus::Failed {
                result: "INSUFFICIENT_PAYER_BALANCE".into()
            }
        );

        let pending = mirror
            .transaction_status("0.0.5@1700000000.000000003")
            .await
            .unwrap();
        assert_eq!(pending, LedgerStatus::Unknown);
    }

    #[tokio::test]
    async fn prepare_transfer_builds_instruction() {
        let server = MockServer::start().await;
        let instruction = client(&server)
            .prepare_transfer(&TransferRequest {
                payer_account_id: "0.0.5".into(),
                treasury_account_id: "0.0.800".into(),
                tinybars: 42,
                memo: "credits".into(),
            })
            .await
            .unwrap();

        assert!(instruction.transaction_id.starts_with("0.0.5@"));
        assert!(to_mirror_transaction_id(&instruction.transaction_id).is_some());
        assert_eq!(instruction.network, Network::Testnet);
        assert_eq!(instruction.tinybars, 42);
    }
}
