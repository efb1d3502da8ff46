//! Per-resource cache entries.
//!
//! A `Store` holds the last validated payload of one key together with its
//! freshness metadata. Its async mutex is held for the whole of a freshness
//! check and any refetch or render, so at most one fetch is in flight per key.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use super::frontend::FrontEnd;
use super::keys::Key;

type Payload = Arc<dyn Any + Send + Sync>;

/// How a payload was obtained by [`StoreState::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    /// Served from the cache inside the freshness window, no strategy call.
    Unverified,
    /// Window elapsed, counter re-checked and unchanged.
    Verified,
    /// Fetched from the strategy and not yet stored.
    Fetched,
}

impl Freshness {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Fetched => "fetched",
        }
    }
}

/// A validated payload as seen by one caller.
pub(crate) struct Snapshot<D> {
    pub data: Arc<D>,
    pub json: Bytes,
    pub counter: u64,
    pub freshness: Freshness,
}

impl<D> Snapshot<D> {
    pub(crate) fn is_fetched(&self) -> bool {
        self.freshness == Freshness::Fetched
    }
}

/// One cached resource instance.
pub(crate) struct Store {
    id: u64,
    key: Key,
    state: Mutex<StoreState>,
}

impl Store {
    pub(crate) fn new(id: u64, key: Key) -> Self {
        Self {
            id,
            key,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Generation id, unique for the lifetime of the owning registry.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    /// Locks the entry for a freshness check, waiting behind any in-flight fetch.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }
}

/// Mutable part of a [`Store`], only reachable through its lock.
#[derive(Default)]
pub(crate) struct StoreState {
    update_counter: u64,
    last_checked: Option<Instant>,
    data: Option<Payload>,
    json: Bytes,
    html: Option<Bytes>,
    size: usize,
}

impl StoreState {
    fn is_fresh(&self, window: Duration) -> bool {
        self.last_checked
            .is_some_and(|checked| checked.elapsed() < window)
    }

    /// Cached data, if any and if it was produced by a strategy of type `F`.
    fn cached<F: FrontEnd>(&self) -> Option<Arc<F::Data>> {
        self.data
            .clone()
            .and_then(|data| data.downcast::<F::Data>().ok())
    }

    /// Cached HTML, if it has been rendered since the last payload change.
    pub(crate) fn html(&self) -> Option<Bytes> {
        self.html.clone()
    }

    /// Runs the freshness check and refetches on a miss.
    ///
    /// Nothing is stored on a refetch; callers commit the result with
    /// [`StoreState::update`]. On error the entry is left exactly as it was.
    pub(crate) async fn resolve<F: FrontEnd>(
        &mut self,
        key: &Key,
        frontend: &F,
        window: Duration,
    ) -> Result<Snapshot<F::Data>, F::Error> {
        let mut counter = None;

        if let Some(data) = self.cached::<F>() {
            if self.is_fresh(window) {
                return Ok(Snapshot {
                    data,
                    json: self.json.clone(),
                    counter: self.update_counter,
                    freshness: Freshness::Unverified,
                });
            }

            let current = frontend.counter(key).await?;
            if current == self.update_counter {
                self.last_checked = Some(Instant::now());
                return Ok(Snapshot {
                    data,
                    json: self.json.clone(),
                    counter: current,
                    freshness: Freshness::Verified,
                });
            }

            debug!(%key, cached = self.update_counter, current, "Cache entry stale");
            counter = Some(current);
        }

        let counter = match counter {
            Some(counter) => counter,
            None => frontend.counter(key).await?,
        };
        let data = frontend.fresh(key).await?;
        let json = frontend.encode_json(&data)?;

        Ok(Snapshot {
            data: Arc::new(data),
            json,
            counter,
            freshness: Freshness::Fetched,
        })
    }

    /// Stores a payload and returns the resulting size delta.
    ///
    /// A fetched snapshot also resets the update counter and the freshness
    /// window. Storing without HTML clears any previous rendering.
    pub(crate) fn update<F: FrontEnd>(
        &mut self,
        frontend: &F,
        snapshot: &Snapshot<F::Data>,
        html: Option<Bytes>,
    ) -> isize {
        if snapshot.is_fetched() {
            self.update_counter = snapshot.counter;
            self.last_checked = Some(Instant::now());
        }

        let size = frontend.size(&snapshot.data, &snapshot.json, html.as_ref());
        let delta = size as isize - self.size as isize;

        let data: Payload = snapshot.data.clone();
        self.data = Some(data);
        self.json = snapshot.json.clone();
        self.html = html;
        self.size = size;

        delta
    }
}
