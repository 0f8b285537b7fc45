//! Client configuration.
//!
//! Plain structs with defaults; [`Settings::validate`] runs when a client is
//! created.

use std::time::Duration;

use crate::error::{invalid_argument, SyncResult};
use crate::local::lru_garbage_collector::DEFAULT_CACHE_SIZE_BYTES;
use crate::local::{LruParams, QueryEngine, CACHE_SIZE_UNLIMITED};
use crate::remote::online_state_tracker::DEFAULT_ONLINE_STATE_TIMEOUT;
use crate::remote::RemoteStoreConfig;

/// Smallest cache size accepted, other than [`CACHE_SIZE_UNLIMITED`].
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_REGULAR_DELAY: Duration = Duration::from_secs(5 * 60);

/// Reconnection tuning shared by the watch and write streams.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// A stream that has sent nothing for this long is closed.
    pub idle_timeout: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Garbage collection starts once the cache is larger than this.
    /// [`CACHE_SIZE_UNLIMITED`] turns collection off.
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub gc_percentile_to_collect: u32,
    pub gc_maximum_sequence_numbers_to_collect: usize,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
    pub index_auto_creation_enabled: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
    pub online_state_timeout: Duration,
    pub backoff: BackoffSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let lru = LruParams::default();
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            gc_percentile_to_collect: lru.percentile_to_collect,
            gc_maximum_sequence_numbers_to_collect: lru.maximum_sequence_numbers_to_collect,
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_regular_delay: DEFAULT_GC_REGULAR_DELAY,
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: 100,
            relative_index_read_cost_per_document: 2.0,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            backoff: BackoffSettings::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> SyncResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES} or CACHE_SIZE_UNLIMITED"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument("max_concurrent_limbo_resolutions must be at least 1"));
        }
        if self.gc_percentile_to_collect > 100 {
            return Err(invalid_argument("gc_percentile_to_collect must be between 0 and 100"));
        }
        if self.gc_maximum_sequence_numbers_to_collect == 0 {
            return Err(invalid_argument(
                "gc_maximum_sequence_numbers_to_collect must be greater than zero",
            ));
        }
        if self.gc_regular_delay.is_zero() {
            return Err(invalid_argument("gc_regular_delay must be greater than zero"));
        }
        if !(self.relative_index_read_cost_per_document > 0.0) {
            return Err(invalid_argument(
                "relative_index_read_cost_per_document must be greater than zero",
            ));
        }
        if self.online_state_timeout.is_zero() {
            return Err(invalid_argument("online_state_timeout must be greater than zero"));
        }
        self.backoff.validate()
    }

    pub fn lru_params(&self) -> LruParams {
        LruParams {
            cache_size_collection_threshold: self.cache_size_bytes,
            percentile_to_collect: self.gc_percentile_to_collect,
            maximum_sequence_numbers_to_collect: self.gc_maximum_sequence_numbers_to_collect,
        }
    }

    pub fn gc_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }

    pub fn query_engine(&self) -> QueryEngine {
        QueryEngine::new(
            self.index_auto_creation_enabled,
            self.index_auto_creation_min_collection_size,
            self.relative_index_read_cost_per_document,
        )
    }

    pub fn remote_store_config(&self) -> RemoteStoreConfig {
        RemoteStoreConfig {
            initial_backoff_delay: self.backoff.initial_delay,
            backoff_factor: self.backoff.backoff_factor,
            max_backoff_delay: self.backoff.max_delay,
            idle_timeout: self.backoff.idle_timeout,
            online_state_timeout: self.online_state_timeout,
        }
    }
}

impl BackoffSettings {
    pub fn validate(&self) -> SyncResult<()> {
        if !(self.backoff_factor >= 1.0) {
            return Err(invalid_argument("backoff_factor must be at least 1.0"));
        }
        if self.initial_delay > self.max_delay {
            return Err(invalid_argument("initial_delay must not exceed max_delay"));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid_argument("idle_timeout must be greater than zero"));
        }
        Ok(())
    }
}
