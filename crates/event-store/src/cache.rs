//! Read-through aggregate cache fronting an event store.
//!
//! Caches whole aggregate streams keyed by aggregate id, with TTL expiry and
//! LRU eviction. Global streaming operations bypass the cache; appends
//! invalidate the target aggregate before returning success so a subsequent
//! load never observes a stale stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};

use common::AggregateId;

use crate::error::Result;
use crate::event::{Event, Version};
use crate::store::{AggregateInspector, CursorPage, EventStore, EventStream, StreamOptions};

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an entry may be served after it was created.
    pub ttl: Duration,

    /// Maximum number of cached aggregates before LRU eviction kicks in.
    pub max_aggregates: usize,

    /// How often the background sweeper removes expired entries.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_aggregates: 10_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

struct CacheEntry<ID> {
    events: Vec<Event<ID>>,
    latest_version: Version,
    created_at: Instant,
    last_access: Instant,
}

impl<ID> CacheEntry<ID> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
    pub hit_rate: f64,
}

type EntryMap<ID> = HashMap<String, CacheEntry<ID>>;

/// Read-through cache wrapping an event store.
pub struct CachingEventStore<ID: AggregateId, S> {
    inner: Arc<S>,
    entries: Arc<RwLock<EntryMap<ID>>>,
    config: CacheConfig,
    counters: Arc<CacheCounters>,
    shutdown: watch::Sender<bool>,
}

impl<ID: AggregateId, S> Clone for CachingEventStore<ID, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            entries: Arc::clone(&self.entries),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<ID: AggregateId, S: EventStore<ID>> CachingEventStore<ID, S> {
    /// Creates a cache in front of `inner` and starts the background sweeper.
    pub fn new(inner: S, config: CacheConfig) -> Self {
        let entries: Arc<RwLock<EntryMap<ID>>> = Arc::new(RwLock::new(HashMap::new()));
        let counters = Arc::new(CacheCounters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);

        spawn_sweeper(
            Arc::downgrade(&entries),
            Arc::clone(&counters),
            config.ttl,
            config.cleanup_interval,
            shutdown_rx,
        );

        Self {
            inner: Arc::new(inner),
            entries,
            config,
            counters,
            shutdown,
        }
    }

    /// Stops the background sweeper. Cached entries stay readable.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Returns a reference to the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a snapshot of the cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            size: self.entries.read().await.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    async fn lookup(&self, key: &str) -> Option<Vec<Event<ID>>> {
        let cached = {
            let entries = self.entries.read().await;
            entries
                .get(key)
                .filter(|entry| !entry.is_expired(self.config.ttl))
                .map(|entry| entry.events.clone())
        };

        if cached.is_some() {
            // Recency updates mutate the entry, so the touch runs in its own
            // short exclusive section rather than under the shared lock.
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(key) {
                entry.last_access = Instant::now();
            }
        }
        cached
    }

    async fn populate(&self, key: String, events: Vec<Event<ID>>) {
        let latest_version = match events.last() {
            Some(event) => event.version,
            None => return,
        };
        let now = Instant::now();

        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CacheEntry {
                events,
                latest_version,
                created_at: now,
                last_access: now,
            },
        );

        while entries.len() > self.config.max_aggregates {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("cache_eviction").increment(1);
                }
                None => break,
            }
        }
    }

    async fn invalidate(&self, aggregate_id: &ID, aggregate_type: &str) {
        let untyped = aggregate_id.to_string();
        let typed = format!("{aggregate_type}:{aggregate_id}");

        let mut entries = self.entries.write().await;
        let removed = entries.remove(&untyped).is_some() | entries.remove(&typed).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache_invalidation").increment(1);
        }
    }
}

#[async_trait]
impl<ID: AggregateId, S: EventStore<ID>> EventStore<ID> for CachingEventStore<ID, S> {
    async fn append_events(
        &self,
        aggregate_id: &ID,
        events: Vec<Event<ID>>,
        expected_version: Version,
    ) -> Result<Version> {
        let aggregate_type = events
            .first()
            .map(|e| e.aggregate_type.clone())
            .unwrap_or_default();

        let version = self
            .inner
            .append_events(aggregate_id, events, expected_version)
            .await?;

        // Only a successful append invalidates; a failed one leaves the
        // cached stream intact and still correct.
        self.invalidate(aggregate_id, &aggregate_type).await;
        Ok(version)
    }

    async fn load_events(
        &self,
        aggregate_id: &ID,
        after_version: Version,
    ) -> Result<Vec<Event<ID>>> {
        let key = aggregate_id.to_string();

        if let Some(events) = self.lookup(&key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache_hit").increment(1);
            return Ok(events
                .into_iter()
                .filter(|e| e.version > after_version)
                .collect());
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_miss").increment(1);

        let events = self.inner.load_events(aggregate_id, after_version).await?;

        // Only a full load is a faithful copy of the stream; partial loads
        // must not seed the entry.
        if after_version == Version::initial() && !events.is_empty() {
            self.populate(key, events.clone()).await;
        }
        Ok(events)
    }

    async fn stream_events(&self, from_time: DateTime<Utc>) -> Result<EventStream<ID>> {
        self.inner.stream_events(from_time).await
    }

    async fn stream_with_cursor(&self, options: StreamOptions) -> Result<CursorPage<ID>> {
        self.inner.stream_with_cursor(options).await
    }
}

#[async_trait]
impl<ID: AggregateId, S: AggregateInspector<ID>> AggregateInspector<ID>
    for CachingEventStore<ID, S>
{
    async fn aggregate_version(&self, aggregate_id: &ID) -> Result<Option<Version>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&aggregate_id.to_string())
                && !entry.is_expired(self.config.ttl)
            {
                return Ok(Some(entry.latest_version));
            }
        }
        self.inner.aggregate_version(aggregate_id).await
    }
}

fn spawn_sweeper<ID: AggregateId>(
    entries: std::sync::Weak<RwLock<EntryMap<ID>>>,
    counters: Arc<CacheCounters>,
    ttl: Duration,
    cleanup_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(entries) = entries.upgrade() else { break };
                    let mut map = entries.write().await;
                    let before = map.len();
                    map.retain(|_, entry| !entry.is_expired(ttl));
                    let removed = (before - map.len()) as u64;
                    drop(map);

                    if removed > 0 {
                        counters.evictions.fetch_add(removed, Ordering::Relaxed);
                        metrics::counter!("cache_eviction").increment(removed);
                        tracing::debug!(removed, "cache sweep removed expired entries");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventStore;

    fn create_test_event(aggregate_id: i64, version: u64) -> Event<i64> {
        Event::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type("TestEvent")
            .version(Version::new(version))
            .payload_json(serde_json::json!({"test": true}))
            .build()
    }

    fn cache_with_defaults() -> CachingEventStore<i64, InMemoryEventStore<i64>> {
        CachingEventStore::new(InMemoryEventStore::new(), CacheConfig::default())
    }

    async fn seed(store: &impl EventStore<i64>, aggregate_id: i64, count: u64) {
        let events: Vec<Event<i64>> = (1..=count)
            .map(|v| create_test_event(aggregate_id, v))
            .collect();
        store
            .append_events(&aggregate_id, events, Version::initial())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_load_populates_and_hits() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;

        let first = cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(first.len(), 3);

        let second = cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(second.len(), 3);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.size, 1);
        assert!(stats.hit_rate > 0.49 && stats.hit_rate < 0.51);
    }

    #[tokio::test]
    async fn cached_entry_serves_partial_reads() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;

        cache.load_events(&1, Version::initial()).await.unwrap();
        let tail = cache.load_events(&1, Version::first()).await.unwrap();

        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].version, Version::new(2));
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn partial_load_does_not_populate() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;

        let tail = cache.load_events(&1, Version::first()).await.unwrap();
        assert_eq!(tail.len(), 2);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn append_invalidates_cached_aggregate() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;

        cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(cache.stats().await.size, 1);

        cache
            .append_events(&1, vec![create_test_event(1, 4)], Version::new(3))
            .await
            .unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.invalidations, 1);

        // The next read misses and observes the appended event.
        let events = cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(cache.stats().await.misses, 2);
    }

    #[tokio::test]
    async fn failed_append_leaves_cache_untouched() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;
        cache.load_events(&1, Version::initial()).await.unwrap();

        let result = cache
            .append_events(&1, vec![create_test_event(1, 1)], Version::initial())
            .await;
        assert!(result.is_err());

        let stats = cache.stats().await;
        assert_eq!(stats.size, 1);
        assert_eq!(stats.invalidations, 0);
    }

    #[tokio::test]
    async fn lru_eviction_caps_entries() {
        let config = CacheConfig {
            max_aggregates: 2,
            ..CacheConfig::default()
        };
        let cache = CachingEventStore::new(InMemoryEventStore::new(), config);

        for aggregate_id in 1..=3i64 {
            seed(cache.inner(), aggregate_id, 1).await;
        }

        cache.load_events(&1, Version::initial()).await.unwrap();
        cache.load_events(&2, Version::initial()).await.unwrap();
        // Touch aggregate 1 so aggregate 2 is the LRU victim.
        cache.load_events(&1, Version::initial()).await.unwrap();
        cache.load_events(&3, Version::initial()).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.evictions, 1);

        // Aggregate 2 was evicted; loading it again is a miss.
        cache.load_events(&2, Version::initial()).await.unwrap();
        assert_eq!(cache.stats().await.misses, 4);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let config = CacheConfig {
            ttl: Duration::from_millis(10),
            cleanup_interval: Duration::from_secs(3600),
            ..CacheConfig::default()
        };
        let cache = CachingEventStore::new(InMemoryEventStore::new(), config);
        seed(cache.inner(), 1, 1).await;

        cache.load_events(&1, Version::initial()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(cache.stats().await.misses, 2);
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let config = CacheConfig {
            ttl: Duration::from_millis(5),
            cleanup_interval: Duration::from_millis(10),
            ..CacheConfig::default()
        };
        let cache = CachingEventStore::new(InMemoryEventStore::new(), config);
        seed(cache.inner(), 1, 1).await;
        cache.load_events(&1, Version::initial()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert!(stats.evictions >= 1);

        cache.close();
    }

    #[tokio::test]
    async fn streaming_bypasses_cache() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 2).await;

        let page = cache
            .stream_with_cursor(StreamOptions::new())
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);

        let stats = cache.stats().await;
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(stats.size, 0);
    }

    #[tokio::test]
    async fn aggregate_version_served_from_cache() {
        let cache = cache_with_defaults();
        seed(cache.inner(), 1, 3).await;

        cache.load_events(&1, Version::initial()).await.unwrap();
        assert_eq!(
            cache.aggregate_version(&1).await.unwrap(),
            Some(Version::new(3))
        );
    }
}
