use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hbar_gate::auth::{create_challenge_message, KeyStore, SignatureVerifier};
use hbar_gate::billing::{CreditLedger, PricingEngine, SettlementPipeline};
use hbar_gate::metrics::MetricsSink;
use hbar_gate::network::{tinybars_to_hbar, LedgerClient, MirrorNodeClient};
use hbar_gate::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hbar-gate",
    version,
    about = "Signature-gated API keys and HBAR credit settlement"
)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the pricing tiers
    Tiers,
    /// Price an HBAR amount or a credit amount
    Quote {
        #[arg(long, conflicts_with = "credits", required_unless_present = "credits")]
        hbar: Option<f64>,
        #[arg(long)]
        credits: Option<u64>,
    },
    /// Print a challenge message for an account to sign
    Challenge { account: String },
    /// Check a signature envelope over a message file
    VerifySignature {
        account: String,
        #[arg(long)]
        message_file: PathBuf,
        #[arg(long)]
        envelope: String,
        #[arg(long)]
        public_key: String,
    },
    /// Unexpired API keys issued to an account
    Keys { account: String },
    /// Credit balance for an account
    Balance { account: String },
    /// Credit ledger entries, newest first
    History {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Payments, newest first
    Payments {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-fold an account's ledger and compare with its balance
    Audit { account: String },
    /// Check a payment on the ledger, optionally waiting for it to settle
    VerifyPayment {
        transaction_id: String,
        /// Keep polling until settled, for SECS or the configured poll timeout
        #[arg(long, value_name = "SECS")]
        wait: Option<Option<u64>>,
    },
    /// Reverse a completed purchase
    Refund {
        transaction_id: String,
        #[arg(long, default_value = "operator refund")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hbar_gate=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Tiers => {
            let pricing = PricingEngine::new(config.pricing.tiers.clone())?;
            println!(
                "{:<12} {:>12} {:>12} {:>12} {:>9}",
                "tier", "from", "to", "HBAR/credit", "discount"
            );
            for tier in pricing.tiers() {
                let to = tier
                    .max_credits
                    .map_or_else(|| "-".to_string(), |m| m.to_string());
                println!(
                    "{:<12} {:>12} {:>12} {:>12} {:>8}%",
                    tier.name, tier.min_credits, to, tier.hbar_per_credit, tier.discount_percent
                );
            }
        }
        Command::Quote { hbar, credits } => {
            let pricing = PricingEngine::new(config.pricing.tiers.clone())?;
            if let Some(hbar) = hbar {
                let quote = pricing.quote(hbar)?;
                println!("{}", serde_json::to_string_pretty(&quote)?);
            } else if let Some(credits) = credits {
                println!(
                    "{credits} credits cost {:.4} HBAR ({} tier)",
                    pricing.coin_for_credits(credits),
                    pricing.tier_for_amount(credits).name
                );
            }
        }
        Command::Challenge { account } => {
            if !hbar_gate::auth::is_valid_account_id(&account) {
                anyhow::bail!("Not an account id: {account}");
            }
            let nonce = hex::encode(rand::random::<[u8; 16]>());
            let message = create_challenge_message(
                &nonce,
                chrono::Utc::now().timestamp_millis(),
                &account,
                config.service.network,
                &config.service.name,
            );
            println!("{message}");
        }
        Command::VerifySignature {
            account,
            message_file,
            envelope,
            public_key,
        } => {
            let message = std::fs::read_to_string(&message_file)
                .with_context(|| format!("Failed to read {}", message_file.display()))?;
            let verifier = SignatureVerifier::new(mirror_client(&config)?);
            let ok = verifier.verify(&account, &message, &envelope, &public_key).await;
            println!("{}", if ok { "valid" } else { "invalid" });
            if !ok {
                std::process::exit(1);
            }
        }
        Command::Keys { account } => {
            let keys = open_key_store(&config)?.active_keys(&account)?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Command::Balance { account } => {
            let balance = open_pipeline(&config)?.balance(&account)?;
            println!("{}", serde_json::to_string_pretty(&balance)?);
        }
        Command::History { account, limit } => {
            let rows = open_pipeline(&config)?.credit_history(&account, limit)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Payments { account, limit } => {
            let payments = open_pipeline(&config)?.payment_history(&account, limit)?;
            println!("{}", serde_json::to_string_pretty(&payments)?);
        }
        Command::Audit { account } => {
            let audit = open_pipeline(&config)?.audit(&account)?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
            if !audit.is_consistent() {
                anyhow::bail!("Ledger for {account} is inconsistent");
            }
        }
        Command::VerifyPayment {
            transaction_id,
            wait,
        } => {
            let pipeline = Arc::new(open_pipeline(&config)?);
            let payment = match wait {
                Some(secs) => {
                    pipeline
                        .poll_until(
                            &transaction_id,
                            Duration::from_secs(config.settlement.poll_interval_secs),
                            poll_timeout(secs, &config),
                        )
                        .await?
                }
                None => pipeline.verify(&transaction_id).await?.payment,
            };
            println!(
                "{} {} ({:.8} HBAR, {} credits)",
                payment.transaction_id,
                payment.status,
                tinybars_to_hbar(payment.tinybars),
                payment.credits_allocated
            );
        }
        Command::Refund {
            transaction_id,
            reason,
        } => {
            let payment = open_pipeline(&config)?.refund(&transaction_id, &reason)?;
            println!("{} {}", payment.transaction_id, payment.status);
        }
    }

    Ok(())
}

/// `--wait` without a value falls back to the configured poll timeout.
fn poll_timeout(requested: Option<u64>, config: &Config) -> Duration {
    Duration::from_secs(requested.unwrap_or(config.settlement.poll_timeout_secs))
}

fn mirror_client(config: &Config) -> Result<Arc<dyn LedgerClient>> {
    let client = MirrorNodeClient::new(
        &config.mirror_url(),
        config.service.network,
        Duration::from_secs(config.mirror.timeout_secs),
    )?;
    Ok(Arc::new(client))
}

fn data_dir(config: &Config) -> Result<&Path> {
    let data_dir = config.service.data_dir.as_path();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;
    Ok(data_dir)
}

fn open_key_store(config: &Config) -> Result<KeyStore> {
    KeyStore::open(&data_dir(config)?.join("auth.db")).context("Failed to open key store")
}

fn open_pipeline(config: &Config) -> Result<SettlementPipeline> {
    let data_dir = data_dir(config)?;
    let store = CreditLedger::open(&data_dir.join("credits.db"))
        .context("Failed to open credit ledger")?;
    Ok(SettlementPipeline::new(
        PricingEngine::new(config.pricing.tiers.clone())?,
        mirror_client(config)?,
        Arc::new(store),
        MetricsSink::new()?,
        &config.settlement.treasury_account,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_arg(args: &[&str]) -> Option<Option<u64>> {
        match Cli::try_parse_from(args).unwrap().command {
            Command::VerifyPayment { wait, .. } => wait,
            _ => panic!("expected verify-payment"),
        }
    }

    #[test]
    fn wait_flag_value_is_optional() {
        let mut config = Config::default();
        config.settlement.poll_timeout_secs = 42;

        assert_eq!(wait_arg(&["hbar-gate", "verify-payment", "0.0.5@1.2"]), None);

        let bare = wait_arg(&["hbar-gate", "verify-payment", "0.0.5@1.2", "--wait"]);
        assert_eq!(bare, Some(None));
        assert_eq!(poll_timeout(None, &config), Duration::from_secs(42));

        let explicit = wait_arg(&["hbar-gate", "verify-payment", "0.0.5@1.2", "--wait", "5"]);
        assert_eq!(explicit, Some(Some(5)));
        assert_eq!(poll_timeout(Some(5), &config), Duration::from_secs(5));
    }
}
