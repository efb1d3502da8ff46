//! Cache retrieval API.
//!
//! `CacheService` owns the registry and the eviction worker and answers
//! requests for JSON, data and HTML of a key by running the freshness check
//! of the key's entry and refetching through the supplied strategy on a miss.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument};

use super::config::CacheConfig;
use super::frontend::{FrontEnd, HtmlFrontEnd};
use super::keys::Key;
use super::registry::Registry;
use super::store::{Snapshot, Store, StoreState};
use super::worker::EvictionWorker;

const METRIC_HIT_TOTAL: &str = "boardcache_hit_total";
const METRIC_MISS_TOTAL: &str = "boardcache_miss_total";
const METRIC_FRONTEND_ERROR_TOTAL: &str = "boardcache_frontend_error_total";
const METRIC_FETCH_MS: &str = "boardcache_fetch_ms";

/// Encoded JSON of a resource with its update counter.
#[derive(Debug, Clone)]
pub struct CachedJson {
    pub json: Bytes,
    pub counter: u64,
}

/// Encoded JSON and decoded data of a resource with its update counter.
///
/// `data` is shared with the cache and must be treated as immutable.
#[derive(Debug)]
pub struct CachedData<D> {
    pub json: Bytes,
    pub data: Arc<D>,
    pub counter: u64,
}

/// Rendered HTML and decoded data of a resource with its update counter.
#[derive(Debug)]
pub struct CachedHtml<D> {
    pub html: Bytes,
    pub data: Arc<D>,
    pub counter: u64,
}

/// In-process cache for board, catalog and thread resources.
///
/// Concurrent requests for the same key are serialized on that key's entry,
/// so a resource is fetched at most once at a time. Requests for different
/// keys only contend on the registry lock for the duration of a lookup.
pub struct CacheService {
    config: CacheConfig,
    registry: Arc<Registry>,
    worker: EvictionWorker,
}

impl CacheService {
    /// Creates a cache and spawns its eviction worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: CacheConfig) -> Self {
        let registry = Arc::new(Registry::new(config.max_memory_bytes));
        let worker = EvictionWorker::spawn(Arc::clone(&registry), config.eviction_queue_capacity);

        info!(
            max_memory_bytes = config.max_memory_bytes,
            freshness_window_ms = config.freshness_window_ms,
            eviction_queue_capacity = config.eviction_queue_capacity,
            "Cache initialized"
        );

        Self {
            config,
            registry,
            worker,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the JSON of the resource, validating or refetching as needed.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn get_json<F: FrontEnd>(
        &self,
        key: &Key,
        frontend: &F,
    ) -> Result<CachedJson, F::Error> {
        let CachedData { json, counter, .. } = self.get_json_and_data(key, frontend).await?;
        Ok(CachedJson { json, counter })
    }

    /// Returns the JSON and the decoded data of the resource.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn get_json_and_data<F: FrontEnd>(
        &self,
        key: &Key,
        frontend: &F,
    ) -> Result<CachedData<F::Data>, F::Error> {
        let store = self.registry.get_or_create(key);

        let (snapshot, delta) = {
            let mut state = store.lock().await;
            let snapshot = self.resolve(&mut state, key, frontend).await?;
            let delta = snapshot
                .is_fetched()
                .then(|| state.update(frontend, &snapshot, None));
            (snapshot, delta)
        };
        self.report(&store, delta).await;

        Ok(CachedData {
            json: snapshot.json,
            data: snapshot.data,
            counter: snapshot.counter,
        })
    }

    /// Returns the HTML and the decoded data of the resource.
    ///
    /// HTML is rendered when the payload was just refetched or when the entry
    /// has only been filled by JSON requests so far; otherwise the stored
    /// rendering is returned.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn get_html<F: HtmlFrontEnd>(
        &self,
        key: &Key,
        frontend: &F,
    ) -> Result<CachedHtml<F::Data>, F::Error> {
        let store = self.registry.get_or_create(key);

        let (snapshot, html, delta) = {
            let mut state = store.lock().await;
            let snapshot = self.resolve(&mut state, key, frontend).await?;

            match state.html().filter(|_| !snapshot.is_fetched()) {
                Some(html) => (snapshot, html, None),
                None => {
                    let html = frontend.render_html(&snapshot.data, &snapshot.json);
                    let delta = state.update(frontend, &snapshot, Some(html.clone()));
                    debug!(%key, bytes = html.len(), "Rendered HTML");
                    (snapshot, html, Some(delta))
                }
            }
        };
        self.report(&store, delta).await;

        Ok(CachedHtml {
            html,
            data: snapshot.data,
            counter: snapshot.counter,
        })
    }

    async fn resolve<F: FrontEnd>(
        &self,
        state: &mut StoreState,
        key: &Key,
        frontend: &F,
    ) -> Result<Snapshot<F::Data>, F::Error> {
        let started_at = Instant::now();

        match state
            .resolve(key, frontend, self.config.freshness_window())
            .await
        {
            Ok(snapshot) if snapshot.is_fetched() => {
                counter!(METRIC_MISS_TOTAL).increment(1);
                histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
                debug!(%key, counter = snapshot.counter, "Cache miss, fetched fresh data");
                Ok(snapshot)
            }
            Ok(snapshot) => {
                counter!(METRIC_HIT_TOTAL, "state" => snapshot.freshness.as_str()).increment(1);
                debug!(
                    %key,
                    counter = snapshot.counter,
                    state = snapshot.freshness.as_str(),
                    "Cache hit"
                );
                Ok(snapshot)
            }
            Err(err) => {
                counter!(METRIC_FRONTEND_ERROR_TOTAL).increment(1);
                debug!(%key, error = %err, "Frontend failed, cache entry left unchanged");
                Err(err)
            }
        }
    }

    /// Forwards a size change to the eviction worker, outside any entry lock.
    async fn report(&self, store: &Store, delta: Option<isize>) {
        if let Some(delta) = delta.filter(|delta| *delta != 0) {
            self.worker
                .size_changed(store.key().clone(), store.id(), delta)
                .await;
        }
    }

    /// Removes one entry. Returns false if it was not cached.
    pub fn delete(&self, key: &Key) -> bool {
        let removed = self.registry.delete(key);
        debug!(%key, removed, "Cache entry deleted");
        removed
    }

    /// Removes every entry of a board. Returns the number of removed entries.
    ///
    /// Thread entries are never matched, not even by an empty board name.
    pub fn delete_by_board(&self, board: &str) -> usize {
        let removed = self
            .registry
            .delete_where("delete_by_board", |key| {
                !key.is_thread() && key.board == board
            });
        info!(board, removed, "Board evicted from cache");
        removed
    }

    /// Removes every cached variant of a thread.
    pub fn delete_thread(&self, id: u64) -> usize {
        let removed = self
            .registry
            .delete_where("delete_thread", |key| key.is_thread() && key.id == id);
        debug!(thread = id, removed, "Thread evicted from cache");
        removed
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Checks whether an entry exists, without affecting its recency.
    pub fn contains(&self, key: &Key) -> bool {
        self.registry.contains(key)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes held, as of the last applied size change.
    pub fn total_bytes(&self) -> usize {
        self.registry.total_bytes()
    }

    pub fn max_bytes(&self) -> usize {
        self.registry.max_bytes()
    }

    /// Waits until every size change reported so far has been applied.
    pub async fn sync(&self) {
        self.worker.sync().await;
    }

    /// Applies pending size changes and stops the eviction worker.
    ///
    /// The cache keeps serving afterwards but no longer tracks sizes.
    pub async fn shutdown(&self) {
        self.worker.shutdown().await;
        info!(
            entries = self.len(),
            total_bytes = self.total_bytes(),
            "Cache eviction worker shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error(transparent)]
    struct StubError(#[from] serde_json::Error);

    #[derive(Default)]
    struct Pages {
        renders: AtomicUsize,
    }

    #[async_trait]
    impl FrontEnd for Pages {
        type Data = String;
        type Error = StubError;

        async fn counter(&self, _key: &Key) -> Result<u64, StubError> {
            Ok(1)
        }

        async fn fresh(&self, key: &Key) -> Result<String, StubError> {
            Ok(format!("page-{}", key.page))
        }
    }

    impl HtmlFrontEnd for Pages {
        fn render_html(&self, data: &String, _json: &Bytes) -> Bytes {
            self.renders.fetch_add(1, Ordering::SeqCst);
            Bytes::from(format!("<p>{data}</p>"))
        }
    }

    #[tokio::test]
    async fn sizes_follow_json_and_html() {
        let cache = CacheService::new(CacheConfig::default());
        let key = Key::board("a", 0, true);

        let cached = cache.get_json(&key, &Pages::default()).await.unwrap();
        assert_eq!(&cached.json[..], br#""page-0""#);
        cache.sync().await;
        assert_eq!(cache.total_bytes(), cached.json.len() * 2);

        let pages = Pages::default();
        let html = cache.get_html(&key, &pages).await.unwrap();
        assert_eq!(&html.html[..], b"<p>page-0</p>");
        cache.sync().await;
        assert_eq!(cache.total_bytes(), cached.json.len() * 2 + html.html.len());
    }

    #[tokio::test]
    async fn html_is_rendered_once_per_payload() {
        let cache = CacheService::new(CacheConfig::default());
        let key = Key::board("a", 1, true);
        let pages = Pages::default();

        cache.get_json(&key, &pages).await.unwrap();
        assert_eq!(pages.renders.load(Ordering::SeqCst), 0);

        let first = cache.get_html(&key, &pages).await.unwrap();
        let second = cache.get_html(&key, &pages).await.unwrap();

        assert_eq!(first.html, second.html);
        assert_eq!(*second.data, "page-1");
        assert_eq!(pages.renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_thread_removes_all_variants() {
        let cache = CacheService::new(CacheConfig::default());
        let pages = Pages::default();
        for key in [Key::thread(9, 0), Key::thread(9, 5), Key::thread(10, 5)] {
            cache.get_json(&key, &pages).await.unwrap();
        }

        assert_eq!(cache.delete_thread(9), 2);
        assert!(!cache.contains(&Key::thread(9, 0)));
        assert!(!cache.contains(&Key::thread(9, 5)));
        assert!(cache.contains(&Key::thread(10, 5)));
    }

    #[tokio::test]
    async fn empty_board_name_spares_threads() {
        let cache = CacheService::new(CacheConfig::default());
        let pages = Pages::default();
        cache.get_json(&Key::thread(3, 0), &pages).await.unwrap();
        cache.get_json(&Key::board("a", 0, true), &pages).await.unwrap();

        assert_eq!(cache.delete_by_board(""), 0);
        assert!(cache.contains(&Key::thread(3, 0)));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_keeps_serving() {
        let cache = CacheService::new(CacheConfig::default());
        let pages = Pages::default();
        cache.get_json(&Key::thread(1, 0), &pages).await.unwrap();
        cache.shutdown().await;
        let bytes = cache.total_bytes();

        let cached = cache.get_json(&Key::thread(2, 0), &pages).await.unwrap();
        cache.sync().await;

        assert_eq!(&cached.json[..], br#""page-0""#);
        assert_eq!(cache.total_bytes(), bytes);
    }
}
