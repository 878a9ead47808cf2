//! Shared pair cache.

use candlewick_types::Pair;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::ExchangeError;

/// Pairs keyed by symbol.
pub type PairMap = BTreeMap<String, Pair>;

type Refresh = Shared<BoxFuture<'static, Result<Arc<PairMap>, Arc<ExchangeError>>>>;

enum CacheState {
    Stale,
    Refreshing { generation: u64, refresh: Refresh },
    Fresh(Arc<PairMap>),
}

struct Inner {
    state: CacheState,
    generation: u64,
}

/// Pair cache where concurrent readers share a single pending refresh.
///
/// The cache is `Stale` until first read, `Refreshing` while a load is in
/// flight and `Fresh` once it completes. A failed load returns the cache to
/// `Stale`. [`PairCache::invalidate`] discards both cached data and any
/// refresh in flight.
pub struct PairCache {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PairCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.lock().state {
            CacheState::Stale => "stale",
            CacheState::Refreshing { .. } => "refreshing",
            CacheState::Fresh(_) => "fresh",
        };
        f.debug_struct("PairCache").field("state", &state).finish()
    }
}

impl Default for PairCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PairCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self { inner: Mutex::new(Inner { state: CacheState::Stale, generation: 0 }) }
    }

    /// Returns the cached pairs, loading them with `loader` when stale.
    ///
    /// Callers arriving while a load is in flight await that load instead of
    /// starting another.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Refresh`] if the load fails.
    pub async fn get_or_refresh<F, Fut>(&self, loader: F) -> Result<Arc<PairMap>, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PairMap, ExchangeError>> + Send + 'static,
    {
        let (generation, refresh) = {
            let mut inner = self.lock();
            match &inner.state {
                CacheState::Fresh(pairs) => return Ok(Arc::clone(pairs)),
                CacheState::Refreshing { generation, refresh } => (*generation, refresh.clone()),
                CacheState::Stale => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let refresh = loader().map(|result| result.map(Arc::new).map_err(Arc::new)).boxed().shared();
                    inner.state = CacheState::Refreshing { generation, refresh: refresh.clone() };
                    debug!(generation, "refreshing pairs");
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;

        {
            let mut inner = self.lock();
            let current = matches!(&inner.state, CacheState::Refreshing { generation: g, .. } if *g == generation);
            if current {
                inner.state = match &outcome {
                    Ok(pairs) => CacheState::Fresh(Arc::clone(pairs)),
                    Err(_) => CacheState::Stale,
                };
            }
        }

        outcome.map_err(ExchangeError::Refresh)
    }

    /// Returns the cached pairs without loading.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<PairMap>> {
        match &self.lock().state {
            CacheState::Fresh(pairs) => Some(Arc::clone(pairs)),
            _ => None,
        }
    }

    /// Marks the cache stale, discarding any refresh in flight.
    pub fn invalidate(&self) {
        self.lock().state = CacheState::Stale;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candlewick_types::Precision;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn load(loads: &Arc<AtomicUsize>, symbols: &'static [&'static str]) -> BoxFuture<'static, Result<PairMap, ExchangeError>> {
        let loads = Arc::clone(loads);
        async move {
            loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(symbols
                .iter()
                .map(|s| (s.to_string(), Pair::new(*s, "BASE", "QUOTE", Precision::new(2, 3))))
                .collect())
        }
        .boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_readers_share_one_refresh() {
        let cache = PairCache::new();
        let loads = Arc::new(AtomicUsize::new(0));

        let (a, b, c) = tokio::join!(
            cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])),
            cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])),
            cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])),
        );

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(a.unwrap().contains_key("BTCUSDT"));
        assert!(Arc::ptr_eq(&b.unwrap(), &c.unwrap()));
        assert!(cache.cached().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_reload() {
        let cache = PairCache::new();
        let loads = Arc::new(AtomicUsize::new(0));

        cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])).await.unwrap();
        cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(cache.cached().is_none());

        let pairs = cache.get_or_refresh(|| load(&loads, &["BTCUSDT", "ETHUSDT"])).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(pairs.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_cache_stale() {
        let cache = PairCache::new();

        let err = cache
            .get_or_refresh(|| async { Err(ExchangeError::Parse("bad payload".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Refresh(_)));
        assert!(cache.cached().is_none());

        let loads = Arc::new(AtomicUsize::new(0));
        cache.get_or_refresh(|| load(&loads, &["BTCUSDT"])).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
