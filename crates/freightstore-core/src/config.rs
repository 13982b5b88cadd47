//! Engine configuration.
//!
//! One Config is shared by the store front-end and every truck it spawns.
//! The defaults match the thresholds the engine was tuned with; `validate`
//! rejects configurations that would disable flushing or caching outright.

use std::time::Duration;

/// FreightStore configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Buffered entries that force an immediate flush
    pub flush_count_threshold: usize,
    /// Delay before a partially filled write buffer is flushed
    pub flush_interval: Duration,
    /// Index mutations between background index saves
    pub save_threshold: u64,
    /// Record appends between opportunistic compactions
    pub compact_threshold: u64,
    /// Per-truck value cache capacity (entries)
    pub truck_cache_capacity: usize,
    /// Store-wide value cache capacity (entries)
    pub store_cache_capacity: usize,
    /// Live truck workers kept by the front-end before recency eviction
    pub max_active_trucks: usize,
    /// Worker request/response timeout
    pub request_timeout: Duration,
    /// Bounded queue depth per change-event subscriber
    pub subscriber_queue_depth: usize,
}

impl Config {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.flush_count_threshold == 0 {
            return Err("flush_count_threshold must be > 0".into());
        }
        if self.flush_interval.as_millis() == 0 {
            return Err("flush_interval must be > 0".into());
        }
        if self.save_threshold == 0 || self.compact_threshold == 0 {
            return Err("save_threshold and compact_threshold must be > 0".into());
        }
        if self.truck_cache_capacity == 0 || self.store_cache_capacity == 0 {
            return Err("cache capacities must be > 0".into());
        }
        if self.max_active_trucks == 0 {
            return Err("max_active_trucks must be > 0".into());
        }
        if self.request_timeout.as_secs() == 0 {
            return Err("request_timeout must be >= 1s".into());
        }
        if self.subscriber_queue_depth == 0 {
            return Err("subscriber_queue_depth must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_count_threshold: 100,
            flush_interval: Duration::from_millis(500),
            save_threshold: 100,
            compact_threshold: 500,
            truck_cache_capacity: 10_000,
            store_cache_capacity: 50_000,
            max_active_trucks: 50,
            request_timeout: Duration::from_secs(30),
            subscriber_queue_depth: 64,
        }
    }
}
