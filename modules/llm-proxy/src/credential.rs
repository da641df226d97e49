//! Per-scope bearer token cache with single-flight refresh.
//!
//! Readers take an atomic snapshot of the cached [`Credential`]; only a
//! caller that finds the snapshot stale takes the scope's refresh lock, and
//! the first one through it is the only one that talks to the identity
//! provider.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use azproxy_auth::TokenSource;
use azproxy_utils::SecretString;
use dashmap::DashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::AuthError;
use crate::events::{EventSink, ProxyEvent};

/// A bearer token for one scope. Never mutated; a refresh swaps in a new one.
pub struct Credential {
    token: SecretString,
    expires_at: OffsetDateTime,
    scope: String,
}

impl Credential {
    #[must_use]
    pub fn new(token: SecretString, expires_at: OffsetDateTime, scope: impl Into<String>) -> Self {
        Self {
            token,
            expires_at,
            scope: scope.into(),
        }
    }

    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// True while `now` is before `expires_at - margin`. A margin too large to
    /// add to `now` counts as stale.
    #[must_use]
    pub fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
        add_duration(now, margin).is_some_and(|limit| limit < self.expires_at)
    }
}

/// `at + d`, or `None` when the result is outside the representable range.
fn add_duration(at: OffsetDateTime, d: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(d)
        .ok()
        .and_then(|d| at.checked_add(d))
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.token)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Default)]
struct ScopeSlot {
    current: ArcSwapOption<Credential>,
    refresh: Mutex<()>,
}

pub struct CredentialCache {
    source: Arc<dyn TokenSource>,
    slots: DashMap<String, Arc<ScopeSlot>>,
    safety_margin: Duration,
    events: Arc<dyn EventSink>,
}

impl CredentialCache {
    #[must_use]
    pub fn new(
        source: Arc<dyn TokenSource>,
        safety_margin: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            source,
            slots: DashMap::new(),
            safety_margin,
            events,
        }
    }

    fn slot(&self, scope: &str) -> Arc<ScopeSlot> {
        if let Some(slot) = self.slots.get(scope) {
            return Arc::clone(slot.value());
        }
        Arc::clone(self.slots.entry(scope.to_owned()).or_default().value())
    }

    /// A credential for `scope` that is valid for at least the safety margin.
    ///
    /// # Errors
    /// `AuthError::RefreshFailed` when a refresh was needed and failed. A
    /// cached credential inside its safety margin is not handed out instead.
    pub async fn get_token(&self, scope: &str) -> Result<Arc<Credential>, AuthError> {
        let slot = self.slot(scope);
        if let Some(cred) = self.fresh(&slot) {
            return Ok(cred);
        }

        let _guard = slot.refresh.lock().await;
        // Someone else may have refreshed while we waited.
        if let Some(cred) = self.fresh(&slot) {
            return Ok(cred);
        }

        let fetched = self
            .source
            .fetch_token(scope)
            .await
            .map_err(|e| e.to_string())
            .and_then(|acquired| {
                let ttl = acquired.expires_in;
                match add_duration(OffsetDateTime::now_utc(), ttl) {
                    Some(expires_at) => Ok((acquired, expires_at)),
                    None => Err(format!(
                        "invalid token response: expires_in of {}s is out of range",
                        ttl.as_secs()
                    )),
                }
            });
        match fetched {
            Ok((acquired, expires_at)) => {
                let cred = Arc::new(Credential::new(acquired.access_token, expires_at, scope));
                slot.current.store(Some(Arc::clone(&cred)));
                self.events.emit(ProxyEvent::TokenRefreshed {
                    scope: scope.to_owned(),
                    expires_at,
                });
                Ok(cred)
            }
            Err(message) => {
                self.events.emit(ProxyEvent::TokenRefreshFailed {
                    scope: scope.to_owned(),
                    message: message.clone(),
                });
                Err(AuthError::RefreshFailed {
                    scope: scope.to_owned(),
                    message,
                })
            }
        }
    }

    fn fresh(&self, slot: &ScopeSlot) -> Option<Arc<Credential>> {
        let snapshot = slot.current.load_full()?;
        snapshot
            .is_fresh(OffsetDateTime::now_utc(), self.safety_margin)
            .then_some(snapshot)
    }

    /// Fetch a token now so the first request does not pay for it.
    ///
    /// # Errors
    /// Same as [`get_token`](Self::get_token).
    pub async fn prewarm(&self, scope: &str) -> Result<OffsetDateTime, AuthError> {
        self.get_token(scope).await.map(|c| c.expires_at())
    }

    /// Expiry of the cached credential, if any.
    #[must_use]
    pub fn cached_expiry(&self, scope: &str) -> Option<OffsetDateTime> {
        let slot = self.slots.get(scope)?;
        slot.current.load_full().map(|c| c.expires_at())
    }

    /// Drop whatever is cached for `scope`.
    pub fn invalidate(&self, scope: &str) {
        if let Some(slot) = self.slots.get(scope)
            && slot.current.swap(None).is_some()
        {
            self.events.emit(ProxyEvent::CredentialInvalidated {
                scope: scope.to_owned(),
            });
        }
    }

    /// Drop `cred` only if it is still the cached one.
    ///
    /// Concurrent requests rejected with the same stale token then cause a
    /// single invalidation rather than discarding a token that was already
    /// refreshed.
    pub fn invalidate_stale(&self, cred: &Arc<Credential>) {
        let Some(slot) = self.slots.get(cred.scope()) else {
            return;
        };
        let previous = slot.current.compare_and_swap(cred, None::<Arc<Credential>>);
        if matches!(&*previous, Some(prev) if Arc::ptr_eq(prev, cred)) {
            self.events.emit(ProxyEvent::CredentialInvalidated {
                scope: cred.scope().to_owned(),
            });
        }
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("scopes", &self.slots.len())
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use async_trait::async_trait;
    use azproxy_auth::{AcquiredToken, TokenError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        ttl: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(ttl: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                ttl,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch_token(&self, _scope: &str) -> Result<AcquiredToken, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(TokenError::Http("token endpoint: HTTP 400".into()));
            }
            Ok(AcquiredToken {
                access_token: SecretString::new(format!("tok-{n}")),
                expires_in: self.ttl,
            })
        }
    }

    fn cache(source: Arc<CountingSource>, sink: Arc<MemoryEventSink>) -> CredentialCache {
        CredentialCache::new(source, Duration::from_secs(60), sink)
    }

    #[tokio::test]
    async fn fresh_token_is_reused() {
        let source = CountingSource::new(Duration::from_secs(3600));
        let cache = cache(Arc::clone(&source), Arc::new(MemoryEventSink::new()));

        let a = cache.get_token("s").await.unwrap();
        let b = cache.get_token("s").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed() {
        // Expires in 30s, margin is 60s: never fresh.
        let source = CountingSource::new(Duration::from_secs(30));
        let cache = cache(Arc::clone(&source), Arc::new(MemoryEventSink::new()));

        let a = cache.get_token("s").await.unwrap();
        let b = cache.get_token("s").await.unwrap();
        assert_eq!(a.token().expose(), "tok-1");
        assert_eq!(b.token().expose(), "tok-2");
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let source = CountingSource::new(Duration::from_secs(3600));
        let cache = cache(Arc::clone(&source), Arc::new(MemoryEventSink::new()));
        cache.get_token("a").await.unwrap();
        cache.get_token("b").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_is_surfaced_and_reported() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            ttl: Duration::from_secs(3600),
            fail: true,
        });
        let sink = Arc::new(MemoryEventSink::new());
        let cache = cache(source, Arc::clone(&sink));

        let err = cache.get_token("s").await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed { ref scope, .. } if scope == "s"));
        assert_eq!(
            sink.count(|e| matches!(e, ProxyEvent::TokenRefreshFailed { .. })),
            1
        );
        assert!(cache.cached_expiry("s").is_none());
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let source = CountingSource::new(Duration::from_secs(3600));
        let sink = Arc::new(MemoryEventSink::new());
        let cache = cache(Arc::clone(&source), Arc::clone(&sink));

        cache.get_token("s").await.unwrap();
        assert!(cache.cached_expiry("s").is_some());
        cache.invalidate("s");
        assert!(cache.cached_expiry("s").is_none());
        let again = cache.get_token("s").await.unwrap();
        assert_eq!(again.token().expose(), "tok-2");
        assert_eq!(
            sink.count(|e| matches!(e, ProxyEvent::CredentialInvalidated { .. })),
            1
        );
    }

    #[tokio::test]
    async fn invalidate_stale_keeps_newer_token() {
        let source = CountingSource::new(Duration::from_secs(3600));
        let cache = cache(Arc::clone(&source), Arc::new(MemoryEventSink::new()));

        let old = cache.get_token("s").await.unwrap();
        cache.invalidate_stale(&old);
        let new = cache.get_token("s").await.unwrap();
        // A second rejection of the old token must not drop the new one.
        cache.invalidate_stale(&old);
        let still = cache.get_token("s").await.unwrap();
        assert!(Arc::ptr_eq(&new, &still));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unrepresentable_lifetime_is_a_refresh_failure() {
        let source = CountingSource::new(Duration::from_secs(u64::MAX));
        let sink = Arc::new(MemoryEventSink::new());
        let cache = cache(source, Arc::clone(&sink));

        let err = cache.get_token("s").await.unwrap_err();
        let AuthError::RefreshFailed { message, .. } = err;
        assert!(message.contains("expires_in"), "{message}");
        assert!(cache.cached_expiry("s").is_none());
        assert_eq!(
            sink.count(|e| matches!(e, ProxyEvent::TokenRefreshFailed { .. })),
            1
        );
    }

    #[test]
    fn huge_margin_is_never_fresh() {
        let cred = Credential::new(
            SecretString::new("t"),
            OffsetDateTime::now_utc() + time::Duration::hours(1),
            "scope",
        );
        assert!(cred.is_fresh(OffsetDateTime::now_utc(), Duration::from_secs(60)));
        assert!(!cred.is_fresh(OffsetDateTime::now_utc(), Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn debug_redacts_token() {
        let cred = Credential::new(
            SecretString::new("eyJ0eXAi"),
            OffsetDateTime::UNIX_EPOCH,
            "scope",
        );
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("eyJ0eXAi"));
        assert!(rendered.contains("scope"));
    }
}
