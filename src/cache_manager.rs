//! Two-tier cache with in-flight request deduplication
//!
//! This module provides the cache that sits in front of every read:
//! - Memory tier: Moka cache bounded by entry count, LRU eviction
//! - Durable tier: pluggable [`DurableStore`] (Redis in production)
//! - Fetch: caller-supplied closure, run at most once per key at a time
//!
//! The cache supports:
//! - Per-entry TTL checked on every read
//! - Tag-based group invalidation across both tiers
//! - Promotion of durable hits into memory
//! - Best-effort durability: durable failures are logged and absorbed

use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::durable::DurableStore;
use crate::{CacheConfig, CacheError};

/// Format version stamped on every entry. Durable entries written with a
/// different version are treated as absent.
pub const ENTRY_VERSION: &str = "1";

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A cached value with its expiry metadata.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub data: Arc<V>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Time-to-live in milliseconds
    pub ttl: u64,
    pub tags: BTreeSet<String>,
    pub version: String,
}

impl<V> CacheEntry<V> {
    fn new(data: Arc<V>, ttl: Duration, tags: BTreeSet<String>) -> Self {
        Self {
            data,
            created_at: now_ms(),
            ttl: ttl.as_millis() as u64,
            tags,
            version: ENTRY_VERSION.to_owned(),
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        now < self.created_at.saturating_add(self.ttl)
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }

    fn has_any_tag(&self, tags: &HashSet<&str>) -> bool {
        self.tags.iter().any(|t| tags.contains(t.as_str()))
    }
}

/// Entry metadata read during durable scans without decoding the payload.
#[derive(Deserialize)]
struct EntryHeader {
    created_at: u64,
    ttl: u64,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    version: String,
}

impl EntryHeader {
    fn is_current(&self, now: u64) -> bool {
        self.version == ENTRY_VERSION && now < self.created_at.saturating_add(self.ttl)
    }
}

/// Options for [`CacheManager::get`]
#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Entry TTL; the configured default when `None`
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Skip both tiers and fetch
    pub force_refresh: bool,
    /// Join an in-flight fetch for the same key instead of starting another
    pub dedup: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            force_refresh: false,
            dedup: true,
        }
    }
}

impl GetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }

    pub fn dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }
}

/// Options for [`CacheManager::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// What to drop from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// One entry by cache key
    Key(String),
    /// Every entry carrying at least one of the tags
    Tags(Vec<String>),
}

impl Invalidation {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tags(tags.into_iter().map(Into::into).collect())
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries in the memory tier
    pub size: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup
    pub hit_rate: f64,
    /// Durable tier operations that failed and were absorbed
    pub durable_errors: u64,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    durable_errors: AtomicU64,
}

impl CacheMetrics {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_durable_error(&self) {
        self.durable_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Distinct keys and tags remembered before the clock folds them into its floor.
const INVALIDATION_HISTORY_LIMIT: usize = 4096;

/// Logical clock of invalidations.
///
/// Each invalidation takes a tick and stamps the keys and tags it covered.
/// A write that read the clock at tick `since` is stale when anything it
/// touches was stamped after `since`.
#[derive(Default)]
struct InvalidationClock {
    state: Mutex<ClockState>,
}

#[derive(Default)]
struct ClockState {
    tick: u64,
    /// Every key and tag counts as invalidated at this tick
    floor: u64,
    keys: HashMap<String, u64>,
    tags: HashMap<String, u64>,
}

impl ClockState {
    fn advance(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn fold_if_full(&mut self) {
        if self.keys.len() + self.tags.len() > INVALIDATION_HISTORY_LIMIT {
            self.floor = self.tick;
            self.keys.clear();
            self.tags.clear();
        }
    }
}

impl InvalidationClock {
    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> u64 {
        self.lock().tick
    }

    fn record_key(&self, key: &str) {
        let mut state = self.lock();
        let tick = state.advance();
        state.keys.insert(key.to_owned(), tick);
        state.fold_if_full();
    }

    fn record_tags(&self, tags: &[String]) {
        let mut state = self.lock();
        let tick = state.advance();
        for tag in tags {
            state.tags.insert(tag.clone(), tick);
        }
        state.fold_if_full();
    }

    fn record_all(&self) {
        let mut state = self.lock();
        state.floor = state.advance();
        state.keys.clear();
        state.tags.clear();
    }

    fn is_stale(&self, key: &str, tags: &BTreeSet<String>, since: u64) -> bool {
        let state = self.lock();
        state.floor > since
            || state.keys.get(key).is_some_and(|&tick| tick > since)
            || tags
                .iter()
                .any(|tag| state.tags.get(tag).is_some_and(|&tick| tick > since))
    }
}

/// A durable SET for an entry written at clock tick `since`.
///
/// When an overlapping invalidation lands while the SET is in flight, the
/// invalidation's durable sweep may have run before the key existed, so the
/// key is deleted again once the SET returns.
struct DurableWrite {
    store: Arc<dyn DurableStore>,
    clock: Arc<InvalidationClock>,
    metrics: Arc<CacheMetrics>,
    key: String,
    durable_key: String,
    tags: BTreeSet<String>,
    json: String,
    ttl: Duration,
    since: u64,
}

impl DurableWrite {
    fn is_stale(&self) -> bool {
        self.clock.is_stale(&self.key, &self.tags, self.since)
    }

    async fn run(self) {
        if self.is_stale() {
            return;
        }
        if let Err(e) = self.store.set(&self.durable_key, &self.json, self.ttl).await {
            warn!("Durable SET error for key {}: {}. Continuing.", self.durable_key, e);
            self.metrics.record_durable_error();
            return;
        }
        if self.is_stale() {
            debug!("Invalidated during durable write, removing key: {}", self.durable_key);
            if let Err(e) = self.store.delete(&self.durable_key).await {
                warn!("Durable DEL error for key {}: {}. Continuing.", self.durable_key, e);
                self.metrics.record_durable_error();
            }
        }
    }
}

/// Represents an in-flight fetch that other requests can wait on
type InFlightFetch<V> = watch::Receiver<Option<Result<Arc<V>, CacheError>>>;
type InFlightSender<V> = watch::Sender<Option<Result<Arc<V>, CacheError>>>;

struct InFlight<V> {
    id: u64,
    rx: InFlightFetch<V>,
}

type InFlightMap<V> = Arc<RwLock<HashMap<String, InFlight<V>>>>;

/// Remove the in-flight marker for `key` if it still belongs to fetch `id`.
async fn release_marker<V>(in_flight: &InFlightMap<V>, key: &str, id: u64) {
    let mut guard = in_flight.write().await;
    if guard.get(key).is_some_and(|f| f.id == id) {
        guard.remove(key);
    }
}

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped without completing, notifies waiters with
/// [`CacheError::Cancelled`] and removes the marker.
struct InFlightGuard<V: Cacheable> {
    key: String,
    id: u64,
    in_flight: InFlightMap<V>,
    tx: Option<InFlightSender<V>>,
}

impl<V: Cacheable> InFlightGuard<V> {
    /// Clear the marker, then hand the result to every waiter.
    async fn complete(mut self, result: Result<Arc<V>, CacheError>) {
        if let Some(tx) = self.tx.take() {
            release_marker(&self.in_flight, &self.key, self.id).await;
            let _ = tx.send(Some(result));
        }
    }
}

impl<V: Cacheable> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let _ = tx.send(Some(Err(CacheError::Cancelled)));

        let key = std::mem::take(&mut self.key);
        let id = self.id;
        let in_flight = Arc::clone(&self.in_flight);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                release_marker(&in_flight, &key, id).await;
            });
        }
    }
}

async fn wait_for<V>(mut rx: InFlightFetch<V>) -> Result<Arc<V>, CacheError> {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::Cancelled);
        }
    }
}

/// Two-tier cache with request deduplication.
pub struct CacheManager<V: Cacheable> {
    inner: Arc<CacheManagerInner<V>>,
}

struct CacheManagerInner<V: Cacheable> {
    memory: Cache<String, Arc<CacheEntry<V>>>,
    durable: Option<Arc<dyn DurableStore>>,
    config: CacheConfig,
    in_flight: InFlightMap<V>,
    next_fetch_id: AtomicU64,
    /// Writes that began before an overlapping invalidation are discarded
    clock: Arc<InvalidationClock>,
    metrics: Arc<CacheMetrics>,
}

impl<V: Cacheable> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> CacheManager<V> {
    /// Create a cache over an optional durable tier.
    pub fn new(config: CacheConfig, durable: Option<Arc<dyn DurableStore>>) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            inner: Arc::new(CacheManagerInner {
                memory,
                durable,
                config,
                in_flight: Arc::new(RwLock::new(HashMap::new())),
                next_fetch_id: AtomicU64::new(0),
                clock: Arc::new(InvalidationClock::default()),
                metrics: Arc::new(CacheMetrics::default()),
            }),
        }
    }

    /// Create a memory-only cache.
    pub fn memory_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.durable_prefix, key)
    }

    /// Get value by key, fetching it on a miss.
    ///
    /// Lookup order: in-flight fetch (when `dedup`), memory tier, durable
    /// tier, then `fetch`. Every caller joined to one fetch receives the same
    /// value or the same error.
    pub async fn get<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: GetOptions,
    ) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>>,
    {
        if options.dedup
            && let Some(rx) = self.in_flight_receiver(key).await
        {
            debug!("Waiting for in-flight fetch for key: {}", key);
            return wait_for(rx).await;
        }

        if !options.force_refresh {
            if let Some(value) = self.lookup_memory(key).await {
                debug!("Cache hit memory for key: {}", key);
                self.inner.metrics.record_hit();
                return Ok(value);
            }
            if let Some(value) = self.lookup_durable(key).await {
                debug!("Cache hit durable for key: {}", key);
                self.inner.metrics.record_hit();
                return Ok(value);
            }
        }

        debug!("Cache miss for key: {}", key);
        self.inner.metrics.record_miss();
        let since = self.inner.clock.now();

        if !options.dedup {
            let value = Arc::new(fetch().await?);
            self.store_fetched(key, &value, &options, since).await;
            return Ok(value);
        }

        let guard = {
            let mut in_flight = self.inner.in_flight.write().await;
            // Another task might have registered a fetch while we were reading the tiers
            if let Some(existing) = in_flight.get(key) {
                let rx = existing.rx.clone();
                drop(in_flight);
                debug!("Waiting for in-flight fetch for key (race): {}", key);
                return wait_for(rx).await;
            }
            let (tx, rx) = watch::channel(None);
            let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
            in_flight.insert(key.to_owned(), InFlight { id, rx });
            InFlightGuard {
                key: key.to_owned(),
                id,
                in_flight: Arc::clone(&self.inner.in_flight),
                tx: Some(tx),
            }
        };

        // The guard ensures cleanup happens even on panic/cancellation
        let result = match fetch().await {
            Ok(value) => {
                let value = Arc::new(value);
                self.store_fetched(key, &value, &options, since).await;
                Ok(value)
            }
            Err(e) => {
                error!("Fetch error for key {}: {}", key, e);
                Err(e)
            }
        };

        guard.complete(result.clone()).await;
        result
    }

    /// Unconditionally write both tiers.
    pub async fn set(&self, key: &str, data: V, options: SetOptions) {
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let entry = CacheEntry::new(Arc::new(data), ttl, options.tags.into_iter().collect());
        let since = self.inner.clock.now();
        self.write_entry(key, Arc::new(entry), since).await;
    }

    /// Drop one key or every entry carrying any of the given tags, from both
    /// tiers. Returns the number of distinct keys removed.
    pub async fn invalidate(&self, target: Invalidation) -> usize {
        // Stamp first so writes racing with the sweep below see it
        match target {
            Invalidation::Key(key) => {
                self.inner.clock.record_key(&key);
                self.invalidate_key(&key).await
            }
            Invalidation::Tags(tags) => {
                self.inner.clock.record_tags(&tags);
                self.invalidate_tags(&tags).await
            }
        }
    }

    async fn invalidate_key(&self, key: &str) -> usize {
        debug!("Invalidating cache for key: {}", key);
        let removed = self.inner.memory.remove(key).await.is_some();

        let durable_removed = self.durable_delete(&self.durable_key(key)).await;
        usize::from(removed || durable_removed)
    }

    async fn invalidate_tags(&self, tags: &[String]) -> usize {
        debug!("Invalidating cache for tags: {:?}", tags);
        let tags: HashSet<&str> = tags.iter().map(String::as_str).collect();
        if tags.is_empty() {
            return 0;
        }

        let mut removed: HashSet<String> = self
            .inner
            .memory
            .iter()
            .filter(|(_, entry)| entry.has_any_tag(&tags))
            .map(|(key, _)| String::clone(&key))
            .collect();
        for key in &removed {
            self.inner.memory.invalidate(key).await;
        }

        let prefix = &self.inner.config.durable_prefix;
        for durable_key in self.durable_keys().await {
            let Some(header) = self.durable_header(&durable_key).await else {
                continue;
            };
            if header.tags.iter().any(|t| tags.contains(t.as_str())) {
                self.durable_delete(&durable_key).await;
                removed.insert(durable_key[prefix.len()..].to_owned());
            }
        }

        self.inner.memory.run_pending_tasks().await;
        removed.len()
    }

    /// Empty both tiers and forget every in-flight fetch.
    pub async fn clear(&self) {
        debug!("Clearing cache");
        self.inner.clock.record_all();
        self.inner.memory.invalidate_all();
        self.inner.memory.run_pending_tasks().await;
        self.inner.in_flight.write().await.clear();

        for durable_key in self.durable_keys().await {
            self.durable_delete(&durable_key).await;
        }
    }

    /// Remove expired entries from both tiers. Returns the number of
    /// distinct keys removed.
    pub async fn cleanup(&self) -> usize {
        let now = now_ms();
        let expired: Vec<String> = self
            .inner
            .memory
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| String::clone(&key))
            .collect();
        let mut removed = HashSet::new();
        for key in expired {
            if self.remove_expired(&key, now).await {
                removed.insert(key);
            }
        }
        self.inner.memory.run_pending_tasks().await;

        let prefix = &self.inner.config.durable_prefix;
        for durable_key in self.durable_keys().await {
            if let Some(header) = self.durable_header(&durable_key).await
                && !header.is_current(now)
            {
                self.durable_delete(&durable_key).await;
                removed.insert(durable_key[prefix.len()..].to_owned());
            }
        }

        if !removed.is_empty() {
            debug!("Cache cleanup removed {} expired entries", removed.len());
        }
        removed.len()
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the returned
    /// handle is dropped.
    pub fn spawn_cleanup(&self, interval: Duration) -> CleanupTask {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup().await;
            }
        });
        CleanupTask { handle }
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        self.inner.memory.run_pending_tasks().await;
        let hits = self.inner.metrics.hits.load(Ordering::Relaxed);
        let misses = self.inner.metrics.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.inner.memory.entry_count(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            durable_errors: self.inner.metrics.durable_errors.load(Ordering::Relaxed),
        }
    }

    /// Remove `key` from memory if the entry currently stored is expired.
    /// The check and removal are atomic, so a refreshed entry survives.
    async fn remove_expired(&self, key: &str, now: u64) -> bool {
        let result = self
            .inner
            .memory
            .entry_by_ref(key)
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if !entry.value().is_live(now) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Removed(_))
    }

    async fn in_flight_receiver(&self, key: &str) -> Option<InFlightFetch<V>> {
        let in_flight = self.inner.in_flight.read().await;
        in_flight.get(key).map(|f| f.rx.clone())
    }

    async fn lookup_memory(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.inner.memory.get(key).await?;
        let now = now_ms();
        if entry.is_live(now) {
            Some(Arc::clone(&entry.data))
        } else {
            self.remove_expired(key, now).await;
            None
        }
    }

    async fn lookup_durable(&self, key: &str) -> Option<Arc<V>> {
        let store = self.inner.durable.as_ref()?;
        let durable_key = self.durable_key(key);

        let json = match store.get(&durable_key).await {
            Ok(json) => json?,
            Err(e) => {
                self.durable_failure("GET", &durable_key, &e);
                return None;
            }
        };

        let entry = match serde_json::from_str::<CacheEntry<V>>(&json) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    "Failed to deserialize durable entry for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                self.durable_delete(&durable_key).await;
                return None;
            }
        };

        if entry.version != ENTRY_VERSION || !entry.is_live(now_ms()) {
            self.durable_delete(&durable_key).await;
            return None;
        }

        let data = Arc::clone(&entry.data);
        self.insert_memory(key, Arc::new(entry)).await;
        Some(data)
    }

    async fn store_fetched(&self, key: &str, value: &Arc<V>, options: &GetOptions, since: u64) {
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let entry = CacheEntry::new(
            Arc::clone(value),
            ttl,
            options.tags.iter().cloned().collect(),
        );
        self.write_entry(key, Arc::new(entry), since).await;
    }

    /// Write an entry to both tiers unless an invalidation covering its key
    /// or one of its tags ran after clock tick `since`.
    async fn write_entry(&self, key: &str, entry: Arc<CacheEntry<V>>, since: u64) {
        let clock = &self.inner.clock;
        if clock.is_stale(key, &entry.tags, since) {
            debug!("Skipping stale write for key: {}", key);
            return;
        }
        self.insert_memory(key, Arc::clone(&entry)).await;
        if clock.is_stale(key, &entry.tags, since) {
            debug!("Invalidated during write, dropping key: {}", key);
            self.inner
                .memory
                .entry_by_ref(key)
                .and_compute_with(|current| {
                    let op = match current {
                        Some(current) if Arc::ptr_eq(current.value(), &entry) => Op::Remove,
                        _ => Op::Nop,
                    };
                    std::future::ready(op)
                })
                .await;
            return;
        }

        let Some(store) = self.inner.durable.clone() else {
            return;
        };
        let json = match serde_json::to_string(entry.as_ref()) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize entry for key {}: {}. Skipping durable write.", key, e);
                self.inner.metrics.record_durable_error();
                return;
            }
        };

        let write = DurableWrite {
            store,
            clock: Arc::clone(&self.inner.clock),
            metrics: Arc::clone(&self.inner.metrics),
            key: key.to_owned(),
            durable_key: self.durable_key(key),
            tags: entry.tags.clone(),
            json,
            ttl: entry.ttl(),
            since,
        };
        if self.inner.config.write_behind {
            tokio::spawn(write.run());
        } else {
            write.run().await;
        }
    }

    async fn insert_memory(&self, key: &str, entry: Arc<CacheEntry<V>>) {
        self.inner.memory.insert(key.to_owned(), entry).await;
        // Apply evictions now so the capacity bound holds on return
        self.inner.memory.run_pending_tasks().await;
    }

    async fn durable_keys(&self) -> Vec<String> {
        let Some(store) = &self.inner.durable else {
            return Vec::new();
        };
        let prefix = &self.inner.config.durable_prefix;
        match store.keys(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                self.durable_failure("SCAN", prefix, &e);
                Vec::new()
            }
        }
    }

    async fn durable_header(&self, durable_key: &str) -> Option<EntryHeader> {
        let store = self.inner.durable.as_ref()?;
        let json = match store.get(durable_key).await {
            Ok(json) => json?,
            Err(e) => {
                self.durable_failure("GET", durable_key, &e);
                return None;
            }
        };
        match serde_json::from_str::<EntryHeader>(&json) {
            Ok(header) => Some(header),
            Err(e) => {
                warn!("Corrupt durable entry {}: {}. Deleting.", durable_key, e);
                self.durable_delete(durable_key).await;
                None
            }
        }
    }

    /// Delete from the durable tier. Returns whether the key was present.
    async fn durable_delete(&self, durable_key: &str) -> bool {
        let Some(store) = &self.inner.durable else {
            return false;
        };
        match store.delete(durable_key).await {
            Ok(existed) => existed,
            Err(e) => {
                self.durable_failure("DEL", durable_key, &e);
                false
            }
        }
    }

    fn durable_failure(&self, op: &str, durable_key: &str, e: &crate::DurableError) {
        warn!(
            "Durable {} error for key {}: {}. Continuing memory-only.",
            op, durable_key, e
        );
        self.inner.metrics.record_durable_error();
    }
}

/// Handle to a periodic cleanup task; aborts the task when dropped.
pub struct CleanupTask {
    handle: JoinHandle<()>,
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
