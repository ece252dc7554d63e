use std::sync::atomic::{AtomicU64, Ordering};

/// Cache telemetry counters.
///
/// Updated from both the command path and the fault path, so everything is a relaxed atomic.
#[derive(Debug, Default)]
pub struct CacheStats {
    flush_requests: AtomicU64,
    sections_flushed: AtomicU64,
    speculative_flushes: AtomicU64,
    mispredictions: AtomicU64,
    cache_misses: AtomicU64,
    uploads: AtomicU64,
    blits: AtomicU64,
    invalidations_handled: AtomicU64,
    invalidations_unhandled: AtomicU64,
    protection_calls: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_flush_requests(&self) {
        self.flush_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sections_flushed(&self) {
        self.sections_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_speculative_flushes(&self) {
        self.speculative_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mispredictions(&self) {
        self.mispredictions.fetch_add(1, Ordering::Relaxed);
    }

    /// A flush had to read device data back synchronously.
    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blits(&self) {
        self.blits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self, handled: bool) {
        let counter = if handled {
            &self.invalidations_handled
        } else {
            &self.invalidations_unhandled
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_protection_calls(&self, calls: u64) {
        self.protection_calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            flush_requests: self.flush_requests.load(Ordering::Relaxed),
            sections_flushed: self.sections_flushed.load(Ordering::Relaxed),
            speculative_flushes: self.speculative_flushes.load(Ordering::Relaxed),
            mispredictions: self.mispredictions.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            blits: self.blits.load(Ordering::Relaxed),
            invalidations_handled: self.invalidations_handled.load(Ordering::Relaxed),
            invalidations_unhandled: self.invalidations_unhandled.load(Ordering::Relaxed),
            protection_calls: self.protection_calls.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub flush_requests: u64,
    pub sections_flushed: u64,
    pub speculative_flushes: u64,
    pub mispredictions: u64,
    pub cache_misses: u64,
    pub uploads: u64,
    pub blits: u64,
    pub invalidations_handled: u64,
    pub invalidations_unhandled: u64,
    pub protection_calls: u64,
}

impl CacheStatsSnapshot {
    pub fn to_json(self) -> String {
        format!(
            "{{\"flush_requests\":{},\"sections_flushed\":{},\"speculative_flushes\":{},\"mispredictions\":{},\"cache_misses\":{},\"uploads\":{},\"blits\":{},\"invalidations\":{{\"handled\":{},\"unhandled\":{}}},\"protection_calls\":{}}}",
            self.flush_requests,
            self.sections_flushed,
            self.speculative_flushes,
            self.mispredictions,
            self.cache_misses,
            self.uploads,
            self.blits,
            self.invalidations_handled,
            self.invalidations_unhandled,
            self.protection_calls,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = CacheStats::new();
        stats.inc_flush_requests();
        stats.inc_sections_flushed();
        stats.inc_sections_flushed();
        stats.record_invalidation(true);
        stats.record_invalidation(false);
        stats.add_protection_calls(2);
        let json = stats.to_json();
        assert!(json.contains("\"flush_requests\":1"));
        assert!(json.contains("\"sections_flushed\":2"));
        assert!(json.contains("\"invalidations\":{\"handled\":1,\"unhandled\":1}"));
        assert!(json.contains("\"protection_calls\":2"));
    }
}
