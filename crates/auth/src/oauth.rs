use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt as _;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::Instrument;

use crate::credential::Credential;
use crate::error::AuthError;
use crate::exchange::{
    DeviceAuthorization, HttpTokenExchange, OAuthClientConfig, TokenExchange,
    TokenPoll,
};
use crate::store::CredentialStore;

/// Refresh tokens this long before they actually expire.
const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Poll interval used when the device authorization omits one.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Added to the poll interval each time the server answers `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Lifecycle of a provider's OAuth credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthState {
    Unauthenticated,
    /// A device flow is waiting for the user.
    Authorizing,
    Authenticated,
    Refreshing,
    /// The refresh token was rejected. The next access reports the
    /// credential as unavailable and moves back to `Unauthenticated`.
    Expired,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

/// Builder for [`OAuthManager`].
pub struct OAuthManagerBuilder {
    store: CredentialStore,
    exchange: Option<Arc<dyn TokenExchange>>,
    clients: HashMap<String, OAuthClientConfig>,
    safety_margin: Duration,
}

impl OAuthManagerBuilder {
    #[inline]
    pub fn with_store(store: CredentialStore) -> Self {
        Self {
            store,
            exchange: None,
            clients: HashMap::new(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Registers the OAuth client settings of `provider`.
    #[inline]
    pub fn with_client<S: Into<String>>(
        mut self,
        provider: S,
        client: OAuthClientConfig,
    ) -> Self {
        self.clients.insert(provider.into(), client);
        self
    }

    /// Replaces the HTTP token exchange.
    #[inline]
    pub fn with_exchange<E: TokenExchange + 'static>(
        mut self,
        exchange: E,
    ) -> Self {
        self.exchange = Some(Arc::new(exchange));
        self
    }

    #[inline]
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn build(self) -> OAuthManager {
        let exchange = self
            .exchange
            .unwrap_or_else(|| Arc::new(HttpTokenExchange::default()));
        OAuthManager {
            inner: Arc::new(Inner {
                store: self.store,
                exchange,
                clients: self.clients,
                safety_margin: self.safety_margin,
                cache: Default::default(),
                states: Default::default(),
                inflight: Default::default(),
            }),
        }
    }
}

/// Hands out valid OAuth credentials and drives their lifecycle.
///
/// The manager is cheap to clone and can be shared by every provider
/// adapter. Refreshes are single-flight per provider: callers arriving
/// while a refresh is running wait for that refresh instead of starting
/// another one.
#[derive(Clone)]
pub struct OAuthManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: CredentialStore,
    exchange: Arc<dyn TokenExchange>,
    clients: HashMap<String, OAuthClientConfig>,
    safety_margin: Duration,
    cache: Mutex<HashMap<String, Credential>>,
    states: Mutex<HashMap<String, AuthState>>,
    inflight: Mutex<HashMap<String, SharedRefresh>>,
}

impl OAuthManager {
    /// Returns `true` if OAuth client settings exist for `provider`.
    #[inline]
    pub fn is_configured(&self, provider: &str) -> bool {
        self.inner.clients.contains_key(provider)
    }

    pub async fn state(&self, provider: &str) -> AuthState {
        if let Some(state) = self.inner.states.lock().await.get(provider) {
            return *state;
        }
        match self.current_credential(provider).await {
            Ok(Some(_)) => AuthState::Authenticated,
            _ => AuthState::Unauthenticated,
        }
    }

    /// Runs the device authorization flow for `provider`.
    ///
    /// `on_code` receives the user code and verification URL, which the
    /// caller must show to the user. The call then polls the token endpoint
    /// until the user approves, denies, or the code expires.
    pub async fn authenticate<F>(
        &self,
        provider: &str,
        on_code: F,
    ) -> Result<Credential, AuthError>
    where
        F: FnOnce(&DeviceAuthorization) + Send,
    {
        let client = self.client_config(provider)?;
        self.set_state(provider, AuthState::Authorizing).await;

        let result = self
            .run_device_flow(provider, &client, on_code)
            .instrument(info_span!("oauth device flow", provider))
            .await;
        match result {
            Ok(credential) => {
                self.persist(credential.clone()).await?;
                self.set_state(provider, AuthState::Authenticated).await;
                info!(provider, "logged in");
                Ok(credential)
            }
            Err(err) => {
                warn!(provider, "device flow failed: {err}");
                self.set_state(provider, AuthState::Unauthenticated).await;
                Err(err)
            }
        }
    }

    async fn run_device_flow<F>(
        &self,
        provider: &str,
        client: &OAuthClientConfig,
        on_code: F,
    ) -> Result<Credential, AuthError>
    where
        F: FnOnce(&DeviceAuthorization) + Send,
    {
        let authorization =
            self.inner.exchange.request_device_code(client).await?;
        on_code(&authorization);

        let mut interval = authorization
            .interval
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let deadline =
            Instant::now() + Duration::from_secs(authorization.expires_in);
        loop {
            sleep(interval).await;
            if Instant::now() >= deadline {
                return Err(AuthError::AuthorizationExpired);
            }
            match self
                .inner
                .exchange
                .poll_device_token(client, &authorization.device_code)
                .await?
            {
                TokenPoll::Granted(token) => {
                    return Ok(Credential::from_token_response(
                        provider,
                        token,
                        None,
                        now(),
                    ));
                }
                TokenPoll::Pending => trace!("authorization pending"),
                TokenPoll::SlowDown => {
                    interval += SLOW_DOWN_STEP;
                    debug!("slowing down polling to {interval:?}");
                }
            }
        }
    }

    /// Returns a credential that stays valid for at least the safety
    /// margin, refreshing it first if necessary.
    pub async fn get(&self, provider: &str) -> Result<Credential, AuthError> {
        {
            let mut states = self.inner.states.lock().await;
            if states.get(provider) == Some(&AuthState::Expired) {
                states.insert(provider.to_owned(), AuthState::Unauthenticated);
                return Err(AuthError::unavailable(
                    provider,
                    "the session expired, log in again",
                ));
            }
        }

        let credential = self
            .current_credential(provider)
            .await?
            .ok_or_else(|| AuthError::unavailable(provider, "not logged in"))?;
        if credential.needs_refresh(now(), self.inner.safety_margin) {
            debug!(provider, "credential is about to expire, refreshing");
            return self
                .refresh_if_current(provider, &credential.access_token)
                .await;
        }
        Ok(credential)
    }

    /// Refreshes the credential of `provider` regardless of its expiry.
    ///
    /// Concurrent calls for the same provider share one token exchange.
    #[inline]
    pub async fn refresh(
        &self,
        provider: &str,
    ) -> Result<Credential, AuthError> {
        self.start_refresh(provider, None).await
    }

    /// Refreshes the credential of `provider` unless it has already been
    /// replaced since `access_token` was handed out.
    ///
    /// This is what a caller whose token was just rejected should use: if
    /// another caller refreshed in the meantime, the new token is returned
    /// without another exchange.
    #[inline]
    pub async fn refresh_if_current(
        &self,
        provider: &str,
        access_token: &str,
    ) -> Result<Credential, AuthError> {
        self.start_refresh(provider, Some(access_token.to_owned()))
            .await
    }

    async fn start_refresh(
        &self,
        provider: &str,
        seen_token: Option<String>,
    ) -> Result<Credential, AuthError> {
        let refresh = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.get(provider) {
                Some(refresh) => {
                    trace!(provider, "joining in-flight refresh");
                    refresh.clone()
                }
                None => {
                    let this = self.clone();
                    let key = provider.to_owned();
                    let refresh = async move {
                        let result = this.refresh_now(&key, seen_token).await;
                        this.inner.inflight.lock().await.remove(&key);
                        result
                    }
                    .instrument(debug_span!("oauth refresh", provider))
                    .boxed()
                    .shared();
                    inflight.insert(provider.to_owned(), refresh.clone());
                    refresh
                }
            }
        };
        refresh.await
    }

    async fn refresh_now(
        &self,
        provider: &str,
        seen_token: Option<String>,
    ) -> Result<Credential, AuthError> {
        let client = self.client_config(provider)?;
        let current = self
            .current_credential(provider)
            .await?
            .ok_or_else(|| AuthError::unavailable(provider, "not logged in"))?;
        if seen_token.is_some_and(|seen| seen != current.access_token) {
            trace!(provider, "credential already replaced");
            return Ok(current);
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(AuthError::unavailable(
                provider,
                "credential has no refresh token",
            ));
        };

        self.set_state(provider, AuthState::Refreshing).await;
        match self.inner.exchange.refresh(&client, &refresh_token).await {
            Ok(token) => {
                let credential = Credential::from_token_response(
                    provider,
                    token,
                    Some(&current),
                    now(),
                );
                self.persist(credential.clone()).await?;
                self.set_state(provider, AuthState::Authenticated).await;
                debug!(provider, expiry = credential.expiry, "token refreshed");
                Ok(credential)
            }
            Err(err) if err.is_irrecoverable() => {
                warn!(provider, "refresh rejected: {err}");
                self.forget(provider).await?;
                self.set_state(provider, AuthState::Expired).await;
                Err(AuthError::unavailable(provider, err.to_string()))
            }
            Err(err) => {
                // Keep the old credential, the next request may still
                // succeed with it or retry the refresh.
                self.set_state(provider, AuthState::Authenticated).await;
                Err(err)
            }
        }
    }

    /// Deletes the stored credential of `provider`.
    pub async fn logout(&self, provider: &str) -> Result<bool, AuthError> {
        let existed = self.forget(provider).await?;
        self.set_state(provider, AuthState::Unauthenticated).await;
        info!(provider, "logged out");
        Ok(existed)
    }

    async fn forget(&self, provider: &str) -> Result<bool, AuthError> {
        self.inner.cache.lock().await.remove(provider);
        self.inner.store.delete(provider)
    }

    async fn persist(&self, credential: Credential) -> Result<(), AuthError> {
        self.inner.store.save(&credential)?;
        self.inner
            .cache
            .lock()
            .await
            .insert(credential.provider.clone(), credential);
        Ok(())
    }

    async fn current_credential(
        &self,
        provider: &str,
    ) -> Result<Option<Credential>, AuthError> {
        let mut cache = self.inner.cache.lock().await;
        if let Some(credential) = cache.get(provider) {
            return Ok(Some(credential.clone()));
        }
        let loaded = self.inner.store.load(provider)?;
        if let Some(credential) = &loaded {
            cache.insert(provider.to_owned(), credential.clone());
        }
        Ok(loaded)
    }

    async fn set_state(&self, provider: &str, state: AuthState) {
        self.inner
            .states
            .lock()
            .await
            .insert(provider.to_owned(), state);
    }

    fn client_config(
        &self,
        provider: &str,
    ) -> Result<OAuthClientConfig, AuthError> {
        self.inner
            .clients
            .get(provider)
            .cloned()
            .ok_or_else(|| AuthError::NotConfigured(provider.to_owned()))
    }
}

#[inline]
fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::exchange::TokenResponse;

    #[derive(Default)]
    struct FakeExchange {
        refresh_calls: Arc<AtomicUsize>,
        poll_calls: Arc<AtomicUsize>,
        reject_refresh: bool,
        pending_polls: usize,
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn request_device_code(
            &self,
            _client: &OAuthClientConfig,
        ) -> Result<DeviceAuthorization, AuthError> {
            Ok(DeviceAuthorization {
                device_code: "dc".to_owned(),
                user_code: "WXYZ-1234".to_owned(),
                verification_uri: "https://example.com/device".to_owned(),
                verification_uri_complete: None,
                expires_in: 600,
                interval: Some(1),
            })
        }

        async fn poll_device_token(
            &self,
            _client: &OAuthClientConfig,
            _device_code: &str,
        ) -> Result<TokenPoll, AuthError> {
            let n = self.poll_calls.fetch_add(1, Ordering::SeqCst);
            if n < self.pending_polls {
                return Ok(TokenPoll::Pending);
            }
            Ok(TokenPoll::Granted(TokenResponse {
                access_token: "device-at".to_owned(),
                refresh_token: Some("device-rt".to_owned()),
                expires_in: Some(3600),
                scope: None,
            }))
        }

        async fn refresh(
            &self,
            _client: &OAuthClientConfig,
            _refresh_token: &str,
        ) -> Result<TokenResponse, AuthError> {
            let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            if self.reject_refresh {
                return Err(AuthError::Rejected {
                    reason: "invalid_grant".to_owned(),
                });
            }
            Ok(TokenResponse {
                access_token: format!("refreshed-{n}"),
                refresh_token: None,
                expires_in: Some(3600),
                scope: None,
            })
        }
    }

    fn client() -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: "cid".to_owned(),
            client_secret: None,
            device_authorization_url: "https://example.com/device/code"
                .to_owned(),
            token_url: "https://example.com/token".to_owned(),
            scope: None,
        }
    }

    fn seed(store: &CredentialStore, expiry: i64) {
        store
            .save(&Credential {
                provider: "gemini".to_owned(),
                access_token: "stale".to_owned(),
                refresh_token: Some("rt".to_owned()),
                expiry,
                scope: None,
            })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_is_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        seed(&store, now() - 10);

        let exchange = FakeExchange::default();
        let refresh_calls = Arc::clone(&exchange.refresh_calls);
        let manager = OAuthManagerBuilder::with_store(store.clone())
            .with_client("gemini", client())
            .with_exchange(exchange)
            .build();

        let mut handles = vec![];
        for _ in 0..10 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get("gemini").await.unwrap()
            }));
        }
        let mut tokens = vec![];
        for handle in handles {
            tokens.push(handle.await.unwrap().access_token);
        }

        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "refreshed-0"));
        // The refresh token was carried over and the file rewritten.
        let stored = store.load("gemini").unwrap().unwrap();
        assert_eq!(stored.access_token, "refreshed-0");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt"));
        assert_eq!(
            manager.state("gemini").await,
            AuthState::Authenticated
        );
    }

    #[tokio::test]
    async fn test_valid_credential_is_not_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        seed(&store, now() + 3600);

        let exchange = FakeExchange::default();
        let refresh_calls = Arc::clone(&exchange.refresh_calls);
        let manager = OAuthManagerBuilder::with_store(store)
            .with_client("gemini", client())
            .with_exchange(exchange)
            .build();

        let credential = manager.get("gemini").await.unwrap();
        assert_eq!(credential.access_token, "stale");
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_expires_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        seed(&store, now() + 30);

        let manager = OAuthManagerBuilder::with_store(store.clone())
            .with_client("gemini", client())
            .with_exchange(FakeExchange {
                reject_refresh: true,
                ..Default::default()
            })
            .build();

        let err = manager.get("gemini").await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialUnavailable { .. }));
        assert_eq!(manager.state("gemini").await, AuthState::Expired);
        assert_eq!(store.load("gemini").unwrap(), None);

        let err = manager.get("gemini").await.unwrap_err();
        assert!(matches!(err, AuthError::CredentialUnavailable { .. }));
        assert_eq!(
            manager.state("gemini").await,
            AuthState::Unauthenticated
        );
    }

    #[tokio::test]
    async fn test_missing_credential_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            OAuthManagerBuilder::with_store(CredentialStore::new(dir.path()))
                .with_client("gemini", client())
                .with_exchange(FakeExchange::default())
                .build();
        assert!(matches!(
            manager.get("gemini").await,
            Err(AuthError::CredentialUnavailable { .. })
        ));
        assert!(matches!(
            manager.refresh("qwen").await,
            Err(AuthError::NotConfigured(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_flow_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        let exchange = FakeExchange {
            pending_polls: 2,
            ..Default::default()
        };
        let poll_calls = Arc::clone(&exchange.poll_calls);
        let manager = OAuthManagerBuilder::with_store(store.clone())
            .with_client("gemini", client())
            .with_exchange(exchange)
            .build();

        let mut shown_code = None;
        let credential = manager
            .authenticate("gemini", |auth| {
                shown_code = Some(auth.user_code.clone());
            })
            .await
            .unwrap();
        assert_eq!(shown_code.as_deref(), Some("WXYZ-1234"));
        assert_eq!(credential.access_token, "device-at");
        assert_eq!(poll_calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state("gemini").await, AuthState::Authenticated);
        assert!(store.load("gemini").unwrap().is_some());

        assert!(manager.logout("gemini").await.unwrap());
        assert_eq!(
            manager.state("gemini").await,
            AuthState::Unauthenticated
        );
        assert_eq!(store.load("gemini").unwrap(), None);
    }
}
