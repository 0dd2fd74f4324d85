//! SQLite-backed credential storage.
//!
//! Tables:
//! - `api_keys`: token_hash, account_id, permissions, issued_at, expires_at
//!   (server side, plaintext tokens are never stored)
//! - `current_credentials`: account_id, token, permissions, issued_at,
//!   expires_at (client side cache of the holder's own key)

use super::{Credential, Permission};
use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Metadata of an issued key, as recovered from its token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StoredKey {
    pub account_id: String,
    pub permissions: BTreeSet<Permission>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StoredKey {
    pub fn age_days_at(&self, now: DateTime<Utc>) -> f64 {
        (now - self.issued_at).num_seconds().max(0) as f64 / 86_400.0
    }
}

fn open_connection(db_path: &Path) -> Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(db_path)?;
    // WAL mode for concurrent reads + crash safety
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

// ── Server-side key store ────────────────────────────────────────

pub struct KeyStore {
    conn: Mutex<rusqlite::Connection>,
}

impl KeyStore {
    /// Open (or create) the key database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_connection(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                token_hash TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                permissions TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_account ON api_keys(account_id);
            CREATE INDEX IF NOT EXISTS idx_api_keys_expires ON api_keys(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert(&self, credential: &Credential) -> Result<()> {
        let permissions = encode_permissions(&credential.permissions);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_keys (token_hash, account_id, permissions, issued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                hash_token(&credential.token),
                credential.account_id,
                permissions,
                credential.issued_at.timestamp(),
                credential.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Look up an unexpired key by its plaintext token.
    pub fn validate(&self, token: &str) -> Result<Option<StoredKey>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let key = conn
            .query_row(
                "SELECT account_id, permissions, issued_at, expires_at
                 FROM api_keys
                 WHERE token_hash = ?1 AND expires_at > ?2",
                rusqlite::params![hash_token(token), now],
                stored_key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Unexpired keys for `account_id`, newest first.
    pub fn active_keys(&self, account_id: &str) -> Result<Vec<StoredKey>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, permissions, issued_at, expires_at
             FROM api_keys
             WHERE account_id = ?1 AND expires_at > ?2
             ORDER BY issued_at DESC",
        )?;
        let keys = stmt
            .query_map(rusqlite::params![account_id, now], stored_key_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn revoke(&self, token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM api_keys WHERE token_hash = ?1",
            rusqlite::params![hash_token(token)],
        )?;
        Ok(deleted > 0)
    }

    pub fn revoke_all(&self, account_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM api_keys WHERE account_id = ?1",
            rusqlite::params![account_id],
        )?;
        Ok(deleted as u64)
    }

    pub fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM api_keys WHERE expires_at <= ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted as u64)
    }
}

fn stored_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredKey> {
    let permissions: String = row.get(1)?;
    Ok(StoredKey {
        account_id: row.get(0)?,
        permissions: decode_permissions(&permissions),
        issued_at: from_secs(row.get(2)?),
        expires_at: from_secs(row.get(3)?),
    })
}

// ── Client-side credential cache ─────────────────────────────────

/// Persists the holder's current credential so it survives restarts and
/// can be picked up by other processes sharing the file.
pub struct CredentialCache {
    conn: Mutex<rusqlite::Connection>,
}

impl CredentialCache {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_connection(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS current_credentials (
                account_id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                permissions TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace the stored credential for the credential's account.
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO current_credentials (account_id, token, permissions, issued_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(account_id) DO UPDATE SET
                token = excluded.token,
                permissions = excluded.permissions,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at",
            rusqlite::params![
                credential.account_id,
                credential.token,
                encode_permissions(&credential.permissions),
                credential.issued_at.timestamp(),
                credential.expires_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn load(&self, account_id: &str) -> Result<Option<Credential>> {
        let conn = self.conn.lock();
        let credential = conn
            .query_row(
                "SELECT account_id, token, permissions, issued_at, expires_at
                 FROM current_credentials WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| {
                    let permissions: String = row.get(2)?;
                    Ok(Credential {
                        account_id: row.get(0)?,
                        token: row.get(1)?,
                        permissions: decode_permissions(&permissions),
                        issued_at: from_secs(row.get(3)?),
                        expires_at: from_secs(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    pub fn clear(&self, account_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM current_credentials WHERE account_id = ?1",
            rusqlite::params![account_id],
        )?;
        Ok(deleted > 0)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Generate a random API key (hex-encoded).
pub(crate) fn generate_token() -> String {
    hex::encode(rand::random::<[u8; TOKEN_BYTES]>())
}

/// Hash an API key (SHA-256, single pass; tokens are already high-entropy).
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

fn encode_permissions(permissions: &BTreeSet<Permission>) -> String {
    serde_json::to_string(permissions).unwrap_or_else(|_| "[]".into())
}

/// Unknown entries are dropped rather than failing the row.
fn decode_permissions(raw: &str) -> BTreeSet<Permission> {
    serde_json::from_str::<Vec<serde_json::Value>>(raw)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}

fn from_secs(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, KeyStore) {
        let tmp = TempDir::new().unwrap();
        let store = KeyStore::open(&tmp.path().join("auth.db")).unwrap();
        (tmp, store)
    }

    fn credential(account: &str, ttl: Duration) -> Credential {
        let now = Utc::now();
        Credential {
            token: generate_token(),
            account_id: account.into(),
            permissions: [Permission::Read, Permission::Purchase].into_iter().collect(),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    #[test]
    fn insert_and_validate() {
        let (_tmp, store) = test_store();
        let cred = credential("0.0.5", Duration::days(30));
        store.insert(&cred).unwrap();

        let key = store.validate(&cred.token).unwrap().unwrap();
        assert_eq!(key.account_id, "0.0.5");
        assert_eq!(key.permissions, cred.permissions);
        assert!(store.validate("unknown").unwrap().is_none());
    }

    #[test]
    fn plaintext_token_is_not_stored() {
        let (tmp, store) = test_store();
        let cred = credential("0.0.5", Duration::days(1));
        store.insert(&cred).unwrap();

        let conn = rusqlite::Connection::open(tmp.path().join("auth.db")).unwrap();
        let stored: String = conn
            .query_row("SELECT token_hash FROM api_keys", [], |r| r.get(0))
            .unwrap();
        assert_ne!(stored, cred.token);
        assert_eq!(stored.len(), 64);
    }

    #[test]
    fn expired_keys_do_not_validate_and_are_cleaned() {
        let (_tmp, store) = test_store();
        let expired = credential("0.0.5", Duration::seconds(-10));
        let live = credential("0.0.5", Duration::days(1));
        store.insert(&expired).unwrap();
        store.insert(&live).unwrap();

        assert!(store.validate(&expired.token).unwrap().is_none());
        assert_eq!(store.active_keys("0.0.5").unwrap().len(), 1);
        assert_eq!(store.cleanup_expired().unwrap(), 1);
        assert!(store.validate(&live.token).unwrap().is_some());
    }

    #[test]
    fn key_age_is_counted_in_days() {
        let (_tmp, store) = test_store();
        let cred = credential("0.0.5", Duration::days(30));
        store.insert(&cred).unwrap();

        let key = store.validate(&cred.token).unwrap().unwrap();
        assert!((key.age_days_at(key.issued_at + Duration::days(3)) - 3.0).abs() < 1e-9);
        assert_eq!(key.age_days_at(key.issued_at - Duration::days(1)), 0.0);
    }

    #[test]
    fn revoke_and_revoke_all() {
        let (_tmp, store) = test_store();
        let a = credential("0.0.5", Duration::days(1));
        let b = credential("0.0.5", Duration::days(1));
        let other = credential("0.0.6", Duration::days(1));
        for c in [&a, &b, &other] {
            store.insert(c).unwrap();
        }

        assert!(store.revoke(&a.token).unwrap());
        assert!(!store.revoke(&a.token).unwrap());
        assert_eq!(store.revoke_all("0.0.5").unwrap(), 1);
        assert!(store.validate(&other.token).unwrap().is_some());
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_round_trips_and_replaces() {
        let tmp = TempDir::new().unwrap();
        let cache = CredentialCache::open(&tmp.path().join("credentials.db")).unwrap();
        assert!(cache.load("0.0.5").unwrap().is_none());

        let first = credential("0.0.5", Duration::days(1));
        cache.save(&first).unwrap();
        let second = credential("0.0.5", Duration::days(2));
        cache.save(&second).unwrap();

        let loaded = cache.load("0.0.5").unwrap().unwrap();
        assert_eq!(loaded.token, second.token);
        assert_eq!(loaded.expires_at.timestamp(), second.expires_at.timestamp());
        assert!(cache.clear("0.0.5").unwrap());
        assert!(cache.load("0.0.5").unwrap().is_none());
    }

    #[test]
    fn cache_is_shared_across_handles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("credentials.db");
        let writer = CredentialCache::open(&path).unwrap();
        let reader = CredentialCache::open(&path).unwrap();

        let cred = credential("0.0.5", Duration::days(1));
        writer.save(&cred).unwrap();
        assert_eq!(reader.load("0.0.5").unwrap().unwrap().token, cred.token);
    }
}
