//! Credential issuance and the per-account authentication state machine.
//!
//! ```text
//! Unauthenticated -> ChallengeIssued -> Verified -> KeyIssued -> NeedsRotation -> Expired
//!                                    \-> Rejected
//! ```
//!
//! Each account has its own async lock, so a challenge is issued, signed and
//! redeemed without interleaving with another flow for the same account.
//! Different accounts never contend. Rotation is additive: issuing a new key
//! leaves earlier keys valid until they expire or are revoked.

use super::store::{generate_token, KeyStore, StoredKey};
use super::{create_challenge_message, Challenge, Credential, Permission, SignatureVerifier};
use crate::config::Config;
use crate::error::{GateError, Rejection, Result};
use crate::metrics::MetricsSink;
use crate::network::Network;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

const NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengeIssued,
    Verified,
    KeyIssued,
    NeedsRotation,
    Expired,
    Rejected,
}

/// What the account holder's wallet returns for a challenge.
#[derive(Debug, Clone)]
pub struct SignedChallenge {
    /// Base64 protobuf `SignatureMap`.
    pub signature_envelope: String,
    /// Hex public key, raw or DER.
    pub public_key: String,
}

/// Obtains the holder's signature over a challenge (wallet, HSM, remote
/// client).
#[async_trait]
pub trait ChallengeSigner: Send + Sync {
    async fn sign(&self, challenge: &Challenge) -> Result<SignedChallenge>;
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Shown in the challenge purpose line.
    pub service: String,
    pub network: Network,
    pub challenge_ttl: Duration,
    pub default_key_ttl: Duration,
    pub max_key_ttl: Duration,
    pub rotation_threshold: Duration,
}

impl AuthorityConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service: config.service.name.clone(),
            network: config.service.network,
            challenge_ttl: secs(config.auth.challenge_ttl_secs),
            default_key_ttl: secs(config.auth.default_key_ttl_secs),
            max_key_ttl: secs(config.auth.max_key_ttl_secs),
            rotation_threshold: secs(config.auth.rotation_threshold_secs),
        }
    }
}

fn secs(s: u64) -> Duration {
    Duration::try_seconds(i64::try_from(s).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

struct ChallengeEntry {
    challenge: Challenge,
    consumed: bool,
}

/// Held for the length of one flow on an account. The map entry is dropped
/// with the last holder so the lock table only tracks accounts in flight.
struct AccountLock<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    account_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for AccountLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock();
        // Map entry plus `self.lock`: nobody else holds or waits on it.
        let idle = Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.account_id)
                .is_some_and(|held| Arc::ptr_eq(held, &self.lock));
        if idle {
            locks.remove(&self.account_id);
        }
    }
}

#[derive(Clone, Copy)]
struct AccountState {
    phase: AuthState,
    key_expires_at: Option<DateTime<Utc>>,
}

pub struct CredentialAuthority {
    config: AuthorityConfig,
    verifier: SignatureVerifier,
    keys: KeyStore,
    metrics: MetricsSink,
    challenges: Mutex<HashMap<String, ChallengeEntry>>,
    states: Mutex<HashMap<String, AccountState>>,
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialAuthority {
    pub fn new(
        config: AuthorityConfig,
        verifier: SignatureVerifier,
        keys: KeyStore,
        metrics: MetricsSink,
    ) -> Self {
        Self {
            config,
            verifier,
            keys,
            metrics,
            challenges: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Current state for `account_id`, with key expiry applied.
    pub fn state(&self, account_id: &str) -> AuthState {
        self.state_at(account_id, Utc::now())
    }

    fn state_at(&self, account_id: &str, now: DateTime<Utc>) -> AuthState {
        let Some(state) = self.states.lock().get(account_id).copied() else {
            return AuthState::Unauthenticated;
        };
        match (state.phase, state.key_expires_at) {
            (AuthState::KeyIssued, Some(expires_at)) if now >= expires_at => AuthState::Expired,
            (AuthState::KeyIssued, Some(expires_at))
                if expires_at - now <= self.config.rotation_threshold =>
            {
                AuthState::NeedsRotation
            }
            (phase, _) => phase,
        }
    }

    fn set_phase(&self, account_id: &str, phase: AuthState) {
        let mut states = self.states.lock();
        let entry = states.entry(account_id.to_string()).or_insert(AccountState {
            phase,
            key_expires_at: None,
        });
        entry.phase = phase;
    }

    async fn lock_account(&self, account_id: &str) -> AccountLock<'_> {
        let lock = self
            .account_locks
            .lock()
            .entry(account_id.to_string())
            .or_default()
            .clone();
        let mut held = AccountLock {
            locks: &self.account_locks,
            account_id: account_id.to_string(),
            lock: Arc::clone(&lock),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    // ── Split flow ───────────────────────────────────────────────

    /// Issue a single-use challenge for `account_id`.
    pub fn issue_challenge(&self, account_id: &str) -> Result<Challenge> {
        self.metrics.record_auth_request("challenge");
        if !super::is_valid_account_id(account_id) {
            tracing::warn!(account = %account_id, "Challenge requested for invalid account id");
            return Err(GateError::AuthenticationFailed);
        }

        let now = Utc::now();
        let nonce = hex::encode(rand::random::<[u8; NONCE_BYTES]>());
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            message: create_challenge_message(
                &nonce,
                now.timestamp_millis(),
                account_id,
                self.config.network,
                &self.config.service,
            ),
            nonce,
            issued_at: now,
            expires_at: now
                .checked_add_signed(self.config.challenge_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        {
            let mut challenges = self.challenges.lock();
            // Consumed entries linger one extra TTL so replays are reported as reuse.
            let horizon = now
                .checked_sub_signed(self.config.challenge_ttl)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            challenges.retain(|_, entry| entry.challenge.expires_at > horizon);
            challenges.insert(
                challenge.id.clone(),
                ChallengeEntry {
                    challenge: challenge.clone(),
                    consumed: false,
                },
            );
        }
        self.set_phase(account_id, AuthState::ChallengeIssued);

        tracing::debug!(account = %account_id, challenge = %challenge.id, "Issued challenge");
        Ok(challenge)
    }

    /// Redeem a signed challenge for a new credential.
    pub async fn redeem_challenge(
        &self,
        challenge_id: &str,
        signature_envelope: &str,
        public_key: &str,
        permissions: &BTreeSet<Permission>,
        ttl: Option<Duration>,
    ) -> Result<Credential> {
        self.metrics.record_auth_request("redeem");
        let account_id = {
            let challenges = self.challenges.lock();
            challenges
                .get(challenge_id)
                .map(|entry| entry.challenge.account_id.clone())
        };
        let Some(account_id) = account_id else {
            return Err(self.reject("redeem", None, Rejection::ChallengeUnknown));
        };

        let _lock = self.lock_account(&account_id).await;
        self.redeem_locked(
            "redeem",
            challenge_id,
            signature_envelope,
            public_key,
            permissions,
            ttl,
        )
        .await
    }

    // ── One-shot flow ────────────────────────────────────────────

    /// Challenge, sign, verify and issue in one step, serialized per account.
    pub async fn authenticate(
        &self,
        account_id: &str,
        permissions: &BTreeSet<Permission>,
        ttl: Option<Duration>,
        signer: &dyn ChallengeSigner,
    ) -> Result<Credential> {
        let _timer = self.metrics.start_timer("authenticate");
        if !super::is_valid_account_id(account_id) {
            tracing::warn!(
                account = %account_id,
                reason = %Rejection::InvalidAccount,
                "Authentication rejected"
            );
            self.metrics.record_auth_failure("authenticate", Rejection::InvalidAccount.as_str());
            return Err(GateError::AuthenticationFailed);
        }
        let _lock = self.lock_account(account_id).await;

        let challenge = self.issue_challenge(account_id)?;
        let signed = match signer.sign(&challenge).await {
            Ok(signed) => signed,
            Err(e) => {
                tracing::warn!(account = %account_id, error = %e, "Signer failed");
                self.set_phase(account_id, AuthState::Rejected);
                self.metrics.record_auth_failure("authenticate", "signer_error");
                return Err(GateError::AuthenticationFailed);
            }
        };

        self.redeem_locked(
            "authenticate",
            &challenge.id,
            &signed.signature_envelope,
            &signed.public_key,
            permissions,
            ttl,
        )
        .await
    }

    async fn redeem_locked(
        &self,
        method: &str,
        challenge_id: &str,
        signature_envelope: &str,
        public_key: &str,
        permissions: &BTreeSet<Permission>,
        ttl: Option<Duration>,
    ) -> Result<Credential> {
        if permissions.is_empty() {
            tracing::warn!(challenge = %challenge_id, "Credential requested with no permissions");
            return Err(GateError::AuthenticationFailed);
        }

        // Taking the challenge consumes it, whether or not the signature holds.
        let now = Utc::now();
        let taken = self.challenges.lock().get_mut(challenge_id).map(|entry| {
            let first_use = !entry.consumed;
            entry.consumed = true;
            (first_use, entry.challenge.clone())
        });
        let challenge = match taken {
            None => return Err(self.reject(method, None, Rejection::ChallengeUnknown)),
            Some((false, used)) => {
                return Err(self.reject(
                    method,
                    Some(&used.account_id),
                    Rejection::ChallengeAlreadyUsed,
                ))
            }
            Some((true, fresh)) => fresh,
        };
        if challenge.is_expired_at(now) {
            return Err(self.reject(
                method,
                Some(&challenge.account_id),
                Rejection::ChallengeExpired,
            ));
        }

        let verified = self
            .verifier
            .verify(
                &challenge.account_id,
                &challenge.message,
                signature_envelope,
                public_key,
            )
            .await;
        if !verified {
            return Err(self.reject(
                method,
                Some(&challenge.account_id),
                Rejection::SignatureMismatch,
            ));
        }
        self.set_phase(&challenge.account_id, AuthState::Verified);

        let rotating = self
            .states
            .lock()
            .get(&challenge.account_id)
            .and_then(|state| state.key_expires_at)
            .is_some_and(|expires_at| expires_at - now <= self.config.rotation_threshold);
        let credential = self.issue_credential(&challenge.account_id, permissions, ttl, now)?;
        if rotating {
            self.metrics.record_key_rotation(&challenge.account_id);
        }

        tracing::info!(
            account = %credential.account_id,
            expires_at = %credential.expires_at,
            rotated = rotating,
            "Issued API key"
        );
        Ok(credential)
    }

    fn issue_credential(
        &self,
        account_id: &str,
        permissions: &BTreeSet<Permission>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Credential> {
        let ttl = ttl
            .unwrap_or(self.config.default_key_ttl)
            .min(self.config.max_key_ttl)
            .max(Duration::zero());
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| GateError::Config("key ttl out of range".into()))?;

        let credential = Credential {
            token: generate_token(),
            account_id: account_id.to_string(),
            permissions: permissions.clone(),
            issued_at: now,
            expires_at,
        };
        self.keys.insert(&credential)?;

        self.states.lock().insert(
            account_id.to_string(),
            AccountState {
                phase: AuthState::KeyIssued,
                key_expires_at: Some(expires_at),
            },
        );
        Ok(credential)
    }

    fn reject(&self, method: &str, account_id: Option<&str>, reason: Rejection) -> GateError {
        tracing::warn!(
            account = account_id.unwrap_or("-"),
            reason = %reason,
            "Authentication rejected"
        );
        self.metrics.record_auth_failure(method, reason.as_str());
        if let Some(account_id) = account_id {
            self.set_phase(account_id, AuthState::Rejected);
        }
        GateError::AuthenticationFailed
    }

    // ── Key lifecycle ────────────────────────────────────────────

    /// True once the credential is inside the rotation window.
    pub fn should_rotate(&self, credential: &Credential) -> bool {
        credential.should_rotate_at(self.config.rotation_threshold, Utc::now())
    }

    /// Resolve a bearer token to its key, recording the key's age.
    pub fn validate(&self, token: &str) -> Result<StoredKey> {
        let Some(key) = self.keys.validate(token)? else {
            self.metrics.record_auth_failure("bearer", "invalid_token");
            return Err(GateError::AuthenticationFailed);
        };
        self.metrics.observe_key_age(key.age_days_at(Utc::now()));
        Ok(key)
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        let revoked = self.keys.revoke(token)?;
        if revoked {
            tracing::info!("Revoked API key");
        }
        Ok(revoked)
    }

    pub fn revoke_all(&self, account_id: &str) -> Result<u64> {
        let revoked = self.keys.revoke_all(account_id)?;
        self.states.lock().remove(account_id);
        tracing::info!(account = %account_id, revoked, "Revoked all API keys");
        Ok(revoked)
    }

    /// Unexpired keys for `account_id`, newest first.
    pub fn active_keys(&self, account_id: &str) -> Result<Vec<StoredKey>> {
        self.keys.active_keys(account_id)
    }

    /// Drop expired keys, stale challenges and state for accounts with no
    /// live key or flow.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let horizon = now
            .checked_sub_signed(self.config.challenge_ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.challenges
            .lock()
            .retain(|_, entry| entry.challenge.expires_at > horizon);
        self.states.lock().retain(|_, state| match state.key_expires_at {
            Some(expires_at) => expires_at > now,
            None => matches!(state.phase, AuthState::ChallengeIssued | AuthState::Verified),
        });
        self.keys.cleanup_expired()
    }
}
