//! Bearer-authenticated HTTP channel for API key holders.
//!
//! Each call injects `Authorization: Bearer <token>`. On 401 the channel
//! reloads the credential from the [`CredentialCache`] and retries once if
//! another process committed a newer key. Otherwise it reports
//! `RotationNeeded` (key inside its rotation window, listener notified) or
//! `AuthenticationFailed`. There is never more than one retry per call, and a
//! call that hits 401 while another call on the same channel is already
//! retrying fails immediately.

use super::{Credential, CredentialCache};
use crate::error::{GateError, Result};
use crate::metrics::MetricsSink;
use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};
use reqwest::{Method, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

type RotationListener = Arc<dyn Fn(&Credential) + Send + Sync>;

struct ListenerSlot {
    id: u64,
    callback: RotationListener,
}

pub struct AuthenticatedChannel {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    cache: Arc<CredentialCache>,
    current: RwLock<Option<Credential>>,
    rotation_threshold: Duration,
    retrying: AtomicBool,
    listener: Arc<Mutex<Option<ListenerSlot>>>,
    next_listener_id: AtomicU64,
    metrics: Option<MetricsSink>,
}

/// Keeps a rotation listener registered. Dropping it unregisters the
/// listener unless a newer registration already replaced it.
pub struct ListenerRegistration {
    id: u64,
    slot: Weak<Mutex<Option<ListenerSlot>>>,
}

impl ListenerRegistration {
    pub fn unregister(self) {}
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            let mut slot = slot.lock();
            if slot.as_ref().is_some_and(|l| l.id == self.id) {
                *slot = None;
            }
        }
    }
}

/// Periodic rotation check. Cancelled on drop.
pub struct RotationWatch {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl RotationWatch {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RotationWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Clears the channel's retry flag when the retry ends.
struct RetryGuard<'a>(&'a AtomicBool);

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AuthenticatedChannel {
    /// Create a channel for `account_id`, picking up any cached credential.
    pub fn new(
        base_url: &str,
        account_id: &str,
        cache: Arc<CredentialCache>,
        rotation_threshold: Duration,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let current = cache.load(account_id)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            cache,
            current: RwLock::new(current),
            rotation_threshold,
            retrying: AtomicBool::new(false),
            listener: Arc::new(Mutex::new(None)),
            next_listener_id: AtomicU64::new(1),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn credential(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    /// Adopt a freshly issued credential and persist it.
    pub fn set_credential(&self, credential: Credential) -> Result<()> {
        self.cache.save(&credential)?;
        *self.current.write() = Some(credential);
        Ok(())
    }

    /// Forget the current credential here and in the cache.
    pub fn clear_credential(&self) -> Result<()> {
        self.cache.clear(&self.account_id)?;
        *self.current.write() = None;
        Ok(())
    }

    /// Register the rotation-due listener, replacing any previous one.
    pub fn on_rotation_needed<F>(&self, callback: F) -> ListenerRegistration
    where
        F: Fn(&Credential) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        *self.listener.lock() = Some(ListenerSlot {
            id,
            callback: Arc::new(callback),
        });
        ListenerRegistration {
            id,
            slot: Arc::downgrade(&self.listener),
        }
    }

    fn notify_rotation(&self, credential: &Credential) {
        let callback = self.listener.lock().as_ref().map(|l| Arc::clone(&l.callback));
        if let Some(callback) = callback {
            callback(credential);
        }
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let Some(credential) = self.credential() else {
            tracing::debug!(account = %self.account_id, "No credential for request");
            return Err(GateError::AuthenticationFailed);
        };

        let resp = self.send(&method, path, body, &credential.token).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        if self
            .retrying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(account = %self.account_id, "Retry already in flight, failing fast");
            return Err(GateError::AuthenticationFailed);
        }
        let _guard = RetryGuard(&self.retrying);

        let refreshed = self.cache.load(&self.account_id)?;
        let now = Utc::now();
        if let Some(fresh) = refreshed
            .filter(|c| c.token != credential.token && !c.is_expired_at(now))
        {
            tracing::info!(account = %self.account_id, "Retrying with refreshed credential");
            *self.current.write() = Some(fresh.clone());
            let retry = self.send(&method, path, body, &fresh.token).await?;
            if retry.status() == StatusCode::UNAUTHORIZED {
                tracing::warn!(account = %self.account_id, "Refreshed API key rejected");
                self.discard_rejected(&fresh.token);
                return Err(GateError::AuthenticationFailed);
            }
            return Ok(retry);
        }

        if credential.should_rotate_at(self.rotation_threshold, now) {
            tracing::warn!(
                account = %self.account_id,
                expires_at = %credential.expires_at,
                "API key rejected inside rotation window"
            );
            self.notify_rotation(&credential);
            return Err(GateError::RotationNeeded {
                expires_at: credential.expires_at,
            });
        }

        tracing::warn!(account = %self.account_id, "API key rejected");
        self.discard_rejected(&credential.token);
        Err(GateError::AuthenticationFailed)
    }

    /// Forget `token` locally and in the cache, unless something newer has
    /// replaced it in the meantime.
    fn discard_rejected(&self, token: &str) {
        {
            let mut current = self.current.write();
            if current.as_ref().is_some_and(|c| c.token == token) {
                *current = None;
            }
        }
        let cleared = match self.cache.load(&self.account_id) {
            Ok(Some(cached)) if cached.token == token => self.cache.clear(&self.account_id).map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = cleared {
            tracing::warn!(account = %self.account_id, error = %e, "Failed to clear rejected key");
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = self.http.request(method.clone(), &url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_api_request(path, resp.status().as_u16());
        }
        Ok(resp)
    }

    /// Periodically check the current credential and notify the listener
    /// once per key when it enters its rotation window.
    pub fn spawn_rotation_watch(self: &Arc<Self>, interval: std::time::Duration) -> RotationWatch {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let channel = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut notified: Option<String> = None;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(channel) = channel.upgrade() else { break };
                        let Some(credential) = channel.credential() else {
                            continue;
                        };
                        if notified.as_deref() == Some(credential.token.as_str()) {
                            continue;
                        }
                        if credential.should_rotate_at(channel.rotation_threshold, Utc::now()) {
                            tracing::info!(
                                account = %channel.account_id,
                                "API key due for rotation"
                            );
                            channel.notify_rotation(&credential);
                            notified = Some(credential.token);
                        }
                    }
                }
            }
        });

        RotationWatch { cancel, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permission;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential(token: &str, ttl: Duration) -> Credential {
        let now = Utc::now();
        Credential {
            token: token.into(),
            account_id: "0.0.5".into(),
            permissions: [Permission::Read].into_iter().collect(),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    fn make_channel(server: &MockServer) -> (TempDir, Arc<CredentialCache>, AuthenticatedChannel) {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(CredentialCache::open(&tmp.path().join("credentials.db")).unwrap());
        let channel = AuthenticatedChannel::new(
            &server.uri(),
            "0.0.5",
            Arc::clone(&cache),
            Duration::days(7),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        (tmp, cache, channel)
    }

    #[tokio::test]
    async fn injects_bearer_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/usage"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (_tmp, _cache, channel) = make_channel(&server);
        channel.set_credential(credential("tok-1", Duration::days(30))).unwrap();
        let resp = channel.get("/v1/usage").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credential_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (_tmp, _cache, channel) = make_channel(&server);
        assert!(matches!(
            channel.get("/v1/usage").await,
            Err(GateError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn cached_credential_survives_restart() {
        let server = MockServer::start().await;
        let (tmp, cache, channel) = make_channel(&server);
        channel.set_credential(credential("tok-1", Duration::days(30))).unwrap();
        drop(channel);

        let reopened = AuthenticatedChannel::new(
            &server.uri(),
            "0.0.5",
            cache,
            Duration::days(7),
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(reopened.credential().unwrap().token, "tok-1");
        drop(tmp);
    }

    #[tokio::test]
    async fn retries_once_with_refreshed_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer old"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer new"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (_tmp, cache, channel) = make_channel(&server);
        channel.set_credential(credential("old", Duration::days(30))).unwrap();
        // Another process commits a rotated key.
        cache.save(&credential("new", Duration::days(30))).unwrap();

        let resp = channel.get("/v1/usage").await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(channel.credential().unwrap().token, "new");
    }

    #[tokio::test]
    async fn second_unauthorized_does_not_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let (_tmp, cache, channel) = make_channel(&server);
        channel.set_credential(credential("old", Duration::days(30))).unwrap();
        cache.save(&credential("new", Duration::days(30))).unwrap();

        assert!(matches!(
            channel.get("/v1/usage").await,
            Err(GateError::AuthenticationFailed)
        ));
        // Both keys were refused: nothing is kept for later calls.
        assert!(channel.credential().is_none());
        assert!(cache.load("0.0.5").unwrap().is_none());
        assert!(matches!(
            channel.get("/v1/usage").await,
            Err(GateError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn rotation_due_signals_listener() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (_tmp, _cache, channel) = make_channel(&server);
        channel.set_credential(credential("old", Duration::days(2))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _registration = channel.on_rotation_needed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let err = channel.get("/v1/usage").await.unwrap_err();
        assert!(err.requires_reauthentication());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Still usable until the rotated key replaces it.
        assert_eq!(channel.credential().unwrap().token, "old");
    }

    #[tokio::test]
    async fn rejected_key_outside_window_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (_tmp, cache, channel) = make_channel(&server);
        channel.set_credential(credential("old", Duration::days(30))).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _registration = channel.on_rotation_needed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            channel.get("/v1/usage").await,
            Err(GateError::AuthenticationFailed)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(channel.credential().is_none());
        assert!(cache.load("0.0.5").unwrap().is_none());
    }

    #[tokio::test]
    async fn overlapping_retry_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (_tmp, cache, channel) = make_channel(&server);
        channel.set_credential(credential("old", Duration::days(30))).unwrap();
        cache.save(&credential("new", Duration::days(30))).unwrap();

        // Simulate another call on this channel mid-retry.
        channel.retrying.store(true, Ordering::SeqCst);
        assert!(matches!(
            channel.get("/v1/usage").await,
            Err(GateError::AuthenticationFailed)
        ));
        // The in-flight retry owns the flag; it is not cleared here.
        assert!(channel.retrying.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn newer_listener_replaces_older_and_drop_unregisters() {
        let server = MockServer::start().await;
        let (_tmp, _cache, channel) = make_channel(&server);
        let cred = credential("old", Duration::days(1));

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&first);
        let reg1 = channel.on_rotation_needed(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&second);
        let reg2 = channel.on_rotation_needed(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        // Dropping the stale registration must not remove the newer one.
        drop(reg1);
        channel.notify_rotation(&cred);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        reg2.unregister();
        channel.notify_rotation(&cred);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_watch_notifies_once_per_key() {
        let server = MockServer::start().await;
        let (_tmp, _cache, channel) = make_channel(&server);
        let channel = Arc::new(channel);
        channel.set_credential(credential("old", Duration::days(1))).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _registration = channel.on_rotation_needed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let watch = channel.spawn_rotation_watch(std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        watch.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(watch.is_finished());
    }
}
