//! Verification key source with demand-driven refresh
//!
//! `JwksKeySource` keeps the identity provider's published keys in memory and
//! only goes back to the provider when a token names a key id it has not seen.
//!
//! ## Concurrency
//!
//! - The cache is an immutable `Arc<HashMap>` snapshot. A refresh builds the
//!   next snapshot off to the side and swaps it in, so readers see either the
//!   old set or the new one, never a half-merged one.
//! - At most one fetch is in flight. Callers that miss while it runs await the
//!   same shared result instead of starting their own.
//! - The fetch runs on its own task: a caller that goes away does not cancel
//!   it, and its keys still land in the cache.
//! - No lock is held across an `.await`.
//!
//! ## Rotation
//!
//! Keys are never replaced in place. A refresh only adds key ids that are not
//! cached yet; keys that disappeared from the published set stay usable until
//! `invalidate` or `invalidate_all` is called.

use crate::error::KeySourceError;
use crate::jwks::{parse_key_set, VerificationKey};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Resolves a key id named in a token header to a verification key
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn resolve(&self, kid: &str) -> Result<VerificationKey, KeySourceError>;

    /// Check that the identity provider can currently be reached
    async fn probe(&self) -> Result<(), KeySourceError> {
        Ok(())
    }
}

/// Retrieves the currently published key set
#[async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Vec<VerificationKey>, KeySourceError>;
}

/// Fetches a JWKS document over HTTP
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySetFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, KeySourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeySourceError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self) -> Result<Vec<VerificationKey>, KeySourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeySourceError::Unavailable(format!("key set request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeySourceError::Unavailable(format!(
                "key set endpoint returned {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| KeySourceError::Unavailable(format!("key set body unreadable: {e}")))?;

        parse_key_set(&body)
    }
}

type KeyMap = HashMap<String, VerificationKey>;
type SharedFetch = Shared<BoxFuture<'static, Result<(), KeySourceError>>>;

/// The single in-flight fetch, recorded under the key id that triggered it
struct Flight {
    kid: String,
    fetch: SharedFetch,
}

struct Inner {
    fetcher: Arc<dyn KeySetFetcher>,
    keys: RwLock<Arc<KeyMap>>,
    in_flight: Mutex<Option<Flight>>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_cooldown: Duration,
}

enum Miss {
    Cached(VerificationKey),
    Await { fetch: SharedFetch, authoritative: bool },
    CoolingDown,
}

/// Caching key source backed by a `KeySetFetcher`
///
/// Cheap to clone; clones share the cache and the in-flight registry.
#[derive(Clone)]
pub struct JwksKeySource {
    inner: Arc<Inner>,
}

impl JwksKeySource {
    pub fn new(fetcher: Arc<dyn KeySetFetcher>) -> Self {
        Self::with_refresh_cooldown(fetcher, Duration::ZERO)
    }

    /// Refuse to re-fetch on a miss within `cooldown` of the last successful fetch
    ///
    /// Bounds the fetch rate when callers present tokens with made-up key ids.
    pub fn with_refresh_cooldown(fetcher: Arc<dyn KeySetFetcher>, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                keys: RwLock::new(Arc::new(KeyMap::new())),
                in_flight: Mutex::new(None),
                last_refresh: Mutex::new(None),
                refresh_cooldown: cooldown,
            }),
        }
    }

    /// Drop one cached key; the next token naming it triggers a refresh
    pub fn invalidate(&self, kid: &str) -> bool {
        let mut guard = write(&self.inner.keys);
        if !guard.contains_key(kid) {
            return false;
        }
        let mut next = KeyMap::clone(&guard);
        next.remove(kid);
        *guard = Arc::new(next);
        true
    }

    /// Drop every cached key and forget the cooldown
    pub fn invalidate_all(&self) {
        *write(&self.inner.keys) = Arc::new(KeyMap::new());
        *lock(&self.inner.last_refresh) = None;
    }

    /// Key ids currently cached, sorted
    pub fn cached_key_ids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.inner.snapshot().keys().cloned().collect();
        kids.sort();
        kids
    }

    fn begin(&self, kid: &str) -> Miss {
        let mut in_flight = lock(&self.inner.in_flight);

        // A fetch may have landed between the caller's cache check and here.
        if let Some(key) = self.inner.cached(kid) {
            return Miss::Cached(key);
        }

        if let Some(flight) = in_flight.as_ref() {
            return Miss::Await {
                fetch: flight.fetch.clone(),
                authoritative: flight.kid == kid,
            };
        }

        if self.inner.cooling_down() {
            return Miss::CoolingDown;
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.refresh().await });
        let fetch = async move {
            task.await.unwrap_or_else(|e| {
                Err(KeySourceError::Unavailable(format!("key fetch task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        *in_flight = Some(Flight {
            kid: kid.to_string(),
            fetch: fetch.clone(),
        });

        Miss::Await {
            fetch,
            authoritative: true,
        }
    }
}

impl Inner {
    fn snapshot(&self) -> Arc<KeyMap> {
        Arc::clone(&read(&self.keys))
    }

    fn cached(&self, kid: &str) -> Option<VerificationKey> {
        self.snapshot().get(kid).cloned()
    }

    fn cooling_down(&self) -> bool {
        match *lock(&self.last_refresh) {
            Some(at) => at.elapsed() < self.refresh_cooldown,
            None => false,
        }
    }

    async fn refresh(&self) -> Result<(), KeySourceError> {
        // Cleared on every exit, including a panicking or aborted fetch.
        let _flight = EndFlight(&self.in_flight);
        let result = self.fetcher.fetch().await;

        if let Ok(fetched) = &result {
            let mut guard = write(&self.keys);
            let mut next = KeyMap::clone(&guard);
            let before = next.len();
            for key in fetched {
                next.entry(key.kid().to_string())
                    .or_insert_with(|| key.clone());
            }
            debug!(
                published = fetched.len(),
                added = next.len() - before,
                "Merged refreshed key set"
            );
            *guard = Arc::new(next);
            drop(guard);

            *lock(&self.last_refresh) = Some(Instant::now());
        }

        result.map(|_| ())
    }
}

/// Empties the in-flight slot when the refresh ends
///
/// Dropped before the task's output is published, so waiters woken by the
/// result already see the new cache and a free slot.
struct EndFlight<'a>(&'a Mutex<Option<Flight>>);

impl Drop for EndFlight<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

#[async_trait]
impl KeySource for JwksKeySource {
    async fn resolve(&self, kid: &str) -> Result<VerificationKey, KeySourceError> {
        if let Some(key) = self.inner.cached(kid) {
            return Ok(key);
        }

        // A fetch started for another key id may predate this key's
        // publication, so a miss after joining one earns a single retry.
        for _ in 0..2 {
            let (fetch, authoritative) = match self.begin(kid) {
                Miss::Cached(key) => return Ok(key),
                Miss::CoolingDown => break,
                Miss::Await {
                    fetch,
                    authoritative,
                } => (fetch, authoritative),
            };

            fetch.await?;

            if let Some(key) = self.inner.cached(kid) {
                return Ok(key);
            }
            if authoritative {
                break;
            }
        }

        Err(KeySourceError::NotFound {
            kid: kid.to_string(),
        })
    }

    async fn probe(&self) -> Result<(), KeySourceError> {
        self.inner.fetcher.fetch().await.map(|_| ())
    }
}

/// Fixed in-memory key set
#[derive(Clone, Debug, Default)]
pub struct StaticKeySource {
    keys: HashMap<String, VerificationKey>,
}

impl StaticKeySource {
    pub fn new(keys: impl IntoIterator<Item = VerificationKey>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|key| (key.kid().to_string(), key))
                .collect(),
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn resolve(&self, kid: &str) -> Result<VerificationKey, KeySourceError> {
        self.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| KeySourceError::NotFound {
                kid: kid.to_string(),
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{rotated_key, trusted_key, CountingFetcher, ROTATED_KID, TRUSTED_KID};

    #[tokio::test]
    async fn test_first_resolve_fetches_then_serves_from_cache() {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let source = JwksKeySource::new(fetcher.clone());

        let key = source.resolve(TRUSTED_KID).await.unwrap();
        assert_eq!(key.kid(), TRUSTED_KID);
        source.resolve(TRUSTED_KID).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_is_not_found_after_one_fetch() {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let source = JwksKeySource::new(fetcher.clone());

        let err = source.resolve("ghost").await.unwrap_err();
        assert_eq!(err, KeySourceError::NotFound { kid: "ghost".into() });
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_unavailable_and_keeps_cache() {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let source = JwksKeySource::new(fetcher.clone());
        source.resolve(TRUSTED_KID).await.unwrap();

        fetcher.set_failing(true);
        let err = source.resolve(ROTATED_KID).await.unwrap_err();
        assert!(matches!(err, KeySourceError::Unavailable(_)));

        // Stale key still served without another fetch.
        source.resolve(TRUSTED_KID).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_rotated_out_key_stays_until_invalidated() {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let source = JwksKeySource::new(fetcher.clone());
        source.resolve(TRUSTED_KID).await.unwrap();

        // Provider rotates: only the new key is published now.
        fetcher.set_keys(vec![rotated_key()]);
        source.resolve(ROTATED_KID).await.unwrap();
        assert_eq!(
            source.cached_key_ids(),
            vec![TRUSTED_KID.to_string(), ROTATED_KID.to_string()]
        );

        assert!(source.invalidate(TRUSTED_KID));
        assert!(!source.invalidate(TRUSTED_KID));
        let err = source.resolve(TRUSTED_KID).await.unwrap_err();
        assert!(matches!(err, KeySourceError::NotFound { .. }));
    }

    /// Panics on the first fetch, then serves the trusted key
    struct PanicOnceFetcher {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl KeySetFetcher for PanicOnceFetcher {
        async fn fetch(&self) -> Result<Vec<VerificationKey>, KeySourceError> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                panic!("key set fetch blew up");
            }
            Ok(vec![trusted_key()])
        }
    }

    #[tokio::test]
    async fn test_panicked_fetch_does_not_wedge_later_refreshes() {
        let fetcher = Arc::new(PanicOnceFetcher {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let source = JwksKeySource::new(fetcher.clone());

        let err = source.resolve(TRUSTED_KID).await.unwrap_err();
        assert!(matches!(err, KeySourceError::Unavailable(_)));
        assert!(lock(&source.inner.in_flight).is_none());

        let key = source.resolve(TRUSTED_KID).await.unwrap();
        assert_eq!(key.kid(), TRUSTED_KID);
        assert_eq!(fetcher.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_refetch_for_unknown_kids() {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let source = JwksKeySource::with_refresh_cooldown(fetcher.clone(), Duration::from_secs(60));

        source.resolve(TRUSTED_KID).await.unwrap();
        for _ in 0..5 {
            assert!(source.resolve("made-up").await.is_err());
        }
        assert_eq!(fetcher.calls(), 1);

        source.invalidate_all();
        source.resolve(TRUSTED_KID).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_static_key_source() {
        let source = StaticKeySource::new(vec![trusted_key()]);
        assert!(source.resolve(TRUSTED_KID).await.is_ok());
        assert!(source.resolve(ROTATED_KID).await.is_err());
        assert!(source.probe().await.is_ok());
    }
}
