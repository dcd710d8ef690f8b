//! Cache, batcher and service configuration

use std::time::Duration;

/// Configuration for the two-tier cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held in the memory tier
    pub max_entries: u64,
    /// Time-to-live used when a caller does not give one
    pub default_ttl: Duration,
    /// Prefix for every key written to the durable tier
    pub durable_prefix: String,
    /// Write durable entries from a spawned task instead of inline
    pub write_behind: bool,
    /// Interval for the periodic expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            default_ttl: Duration::from_secs(300), // 5 minutes
            durable_prefix: "qcache:".to_owned(),
            write_behind: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_durable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.durable_prefix = prefix.into();
        self
    }

    pub fn with_write_behind(mut self, write_behind: bool) -> Self {
        self.write_behind = write_behind;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Configuration for the request batcher
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Quiet period after the latest arrival before a bucket flushes
    pub batch_delay: Duration,
    /// Bucket size that triggers an immediate flush
    pub max_batch_size: usize,
    /// Upper bound between a bucket's first arrival and its flush
    pub max_wait_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(50),
            max_batch_size: 10,
            max_wait_time: Duration::from_millis(200),
        }
    }
}

impl BatchConfig {
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_max_wait_time(mut self, max_wait: Duration) -> Self {
        self.max_wait_time = max_wait;
        self
    }
}

/// Configuration for [`OptimizedApiService`](crate::OptimizedApiService)
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    /// Page size used when a query gives no pagination
    pub default_page_size: usize,
    /// Shortest search term that reaches the backing store
    pub search_min_len: usize,
    /// Chunk size for bulk inserts
    pub bulk_batch_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            default_page_size: 50,
            search_min_len: 2,
            bulk_batch_size: 100,
        }
    }
}

impl ServiceConfig {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.default_page_size = page_size.max(1);
        self
    }
}
