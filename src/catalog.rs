//! Process-scoped model-catalog and endpoint caches.
//!
//! One `CatalogCache` is created at client construction and injected into
//! every provider instance that needs dynamic model metadata; there is no
//! implicit singleton. Entries are keyed by provider, base URL, and an API
//! key fingerprint so distinct credentials never see each other's catalogs.

use crate::providers::ProviderError;
use crate::types::{ModelCatalog, ModelEndpoint};
use base64::Engine;
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache key for one (provider, base URL, credential) scope. The API key is
/// fingerprinted, never stored.
pub fn cache_key(provider: &str, base_url: &str, api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    let fp = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    format!("{}|{}|{}", provider, base_url, &fp[..16])
}

type FetchResult<V> = Result<V, ProviderError>;

/// TTL-bounded map where concurrent fetches for the same key share one
/// in-flight operation, and fetch failures degrade to the stale value (or a
/// provided empty value) instead of propagating.
struct TimedSingleFlight<V: Clone + Send + Sync + 'static> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (V, Instant)>>,
    inflight: Mutex<HashMap<String, Shared<BoxFuture<'static, V>>>>,
}

impl<V: Clone + Send + Sync + 'static> TimedSingleFlight<V> {
    fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Cached value regardless of age, without triggering a fetch. This is
    /// what synchronous model resolution reads.
    fn peek(&self, key: &str) -> Option<V> {
        self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }

    async fn get<F>(self: &Arc<Self>, key: &str, fetch: F, empty: V) -> V
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<V>>,
    {
        let stale = {
            let entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some((v, at)) if at.elapsed() < self.ttl => return v.clone(),
                Some((v, _)) => Some(v.clone()),
                None => None,
            }
        };

        let fut = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(f) => f.clone(),
                None => {
                    let this = self.clone();
                    let key_owned = key.to_string();
                    let fetch_fut = fetch();
                    let f: Shared<BoxFuture<'static, V>> = async move {
                        let value = match fetch_fut.await {
                            Ok(v) => {
                                this.entries
                                    .lock()
                                    .unwrap()
                                    .insert(key_owned.clone(), (v.clone(), Instant::now()));
                                v
                            }
                            Err(e) => {
                                tracing::warn!(key = %key_owned, error = %e,
                                    "catalog fetch failed; serving stale or empty data");
                                stale.unwrap_or(empty)
                            }
                        };
                        this.inflight.lock().unwrap().remove(&key_owned);
                        value
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key.to_string(), f.clone());
                    f
                }
            }
        };
        fut.await
    }
}

/// The injected cache service: model catalogs plus per-model endpoint lists.
#[derive(Clone)]
pub struct CatalogCache {
    models: Arc<TimedSingleFlight<Arc<ModelCatalog>>>,
    endpoints: Arc<TimedSingleFlight<Arc<Vec<ModelEndpoint>>>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            models: TimedSingleFlight::new(ttl),
            endpoints: TimedSingleFlight::new(ttl),
        }
    }

    /// Cached catalog for synchronous resolution; may be stale or absent.
    pub fn peek_models(&self, key: &str) -> Option<Arc<ModelCatalog>> {
        self.models.peek(key)
    }

    /// Catalog for `key`, fetching if stale. Failures never reach the caller:
    /// they degrade to the previous catalog or an empty one.
    pub async fn get_models<F>(&self, key: &str, fetch: F) -> Arc<ModelCatalog>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<Arc<ModelCatalog>>>,
    {
        self.models
            .get(key, fetch, Arc::new(ModelCatalog::new()))
            .await
    }

    /// Serving endpoints for one logical model id under `key`.
    pub async fn get_endpoints<F>(
        &self,
        key: &str,
        model_id: &str,
        fetch: F,
    ) -> Arc<Vec<ModelEndpoint>>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<Arc<Vec<ModelEndpoint>>>>,
    {
        let scoped = format!("{}|{}", key, model_id);
        self.endpoints.get(&scoped, fetch, Arc::new(Vec::new())).await
    }
}

impl Default for CatalogCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn one_model_catalog(id: &str) -> Arc<ModelCatalog> {
        let mut m = ModelCatalog::new();
        m.insert(id.to_string(), ModelInfo::default());
        Arc::new(m)
    }

    #[test]
    fn cache_key_fingerprints_the_api_key() {
        let a = cache_key("openrouter", "https://openrouter.ai/api/v1", "sk-secret");
        let b = cache_key("openrouter", "https://openrouter.ai/api/v1", "sk-other");
        assert_ne!(a, b);
        assert!(!a.contains("sk-secret"));
        // Stable for the same inputs.
        assert_eq!(
            a,
            cache_key("openrouter", "https://openrouter.ai/api/v1", "sk-secret")
        );
    }

    #[tokio::test]
    async fn second_get_within_ttl_uses_cache() {
        let cache = CatalogCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let got = cache
                .get_models("k", move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(one_model_catalog("m"))
                    }
                    .boxed()
                })
                .await;
            assert!(got.contains_key("m"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_fetch() {
        let cache = CatalogCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_models("k", move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(one_model_catalog("m"))
                        }
                        .boxed()
                    })
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().contains_key("m"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_serves_stale_value() {
        let cache = CatalogCache::with_ttl(Duration::ZERO);
        let got = cache
            .get_models("k", || async { Ok(one_model_catalog("kept")) }.boxed())
            .await;
        assert!(got.contains_key("kept"));

        // TTL zero: the entry is already stale, so this refetches and fails.
        let got = cache
            .get_models("k", || {
                async { Err(ProviderError::Other("down".into())) }.boxed()
            })
            .await;
        assert!(got.contains_key("kept"));
    }

    #[tokio::test]
    async fn fetch_failure_without_cache_yields_empty() {
        let cache = CatalogCache::new();
        let got = cache
            .get_models("k", || {
                async { Err(ProviderError::Other("down".into())) }.boxed()
            })
            .await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn peek_is_synchronous_and_ignores_ttl() {
        let cache = CatalogCache::with_ttl(Duration::ZERO);
        assert!(cache.peek_models("k").is_none());
        cache
            .get_models("k", || async { Ok(one_model_catalog("m")) }.boxed())
            .await;
        assert!(cache.peek_models("k").unwrap().contains_key("m"));
    }

    #[tokio::test]
    async fn endpoints_are_scoped_per_model() {
        let cache = CatalogCache::new();
        let eps = cache
            .get_endpoints("k", "model-a", || {
                async {
                    Ok(Arc::new(vec![ModelEndpoint {
                        name: "us-east".into(),
                        info: ModelInfo::default(),
                    }]))
                }
                .boxed()
            })
            .await;
        assert_eq!(eps.len(), 1);

        let other = cache
            .get_endpoints("k", "model-b", || async { Ok(Arc::new(Vec::new())) }.boxed())
            .await;
        assert!(other.is_empty());
    }
}
