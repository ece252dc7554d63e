use surfcache_mem::PAGE_SIZE;

use crate::types::SectionBounds;

/// Tuning knobs for [`crate::TextureCache`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// Size of a storage block. Power of two, at least one page.
    pub block_size: u32,
    /// Overlap-test granularity used by invalidation.
    pub overlap_bounds: SectionBounds,
    /// Flush even when a framebuffer is about to overwrite the memory, and give partially
    /// overlapping flushables flush exclusions instead of discarding them.
    pub strict_texture_flushing: bool,
    /// Read faults leave read-only sections protected when nothing needs flushing.
    pub keep_ro_during_read: bool,
    /// Unsynchronized flushables that do not touch the fault range are left alone.
    pub ignore_unsynchronized: bool,
    /// Unreleased (dirty, unlocked, still allocated) sections kept before a purge.
    pub max_zombie_sections: u32,
    /// Released host images kept for reuse.
    pub max_pooled_images: usize,
    pub speculative_flushes_per_frame: u32,
    pub predictor: PredictorConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024 * 1024,
            overlap_bounds: SectionBounds::Locked,
            strict_texture_flushing: false,
            keep_ro_during_read: true,
            ignore_unsynchronized: true,
            max_zombie_sections: 128,
            max_pooled_images: 64,
            speculative_flushes_per_frame: 8,
            predictor: PredictorConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.block_size.is_power_of_two() || self.block_size < PAGE_SIZE {
            return Err("block_size must be a power of two no smaller than a page");
        }
        self.predictor.validate()
    }
}

/// Write/flush predictor thresholds.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PredictorConfig {
    /// Samples kept per entry.
    pub history_len: usize,
    pub max_confidence: u8,
    /// Confidence required before a speculative flush is attempted.
    pub confident_threshold: u8,
    pub starting_confidence: u8,
    pub correct_flush_bonus: u8,
    pub correct_write_bonus: u8,
    pub wrong_guess_penalty: u8,
    pub misprediction_penalty: u8,
    /// Entries untouched for this many frames are dropped.
    pub stale_after_frames: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            history_len: 16,
            max_confidence: 8,
            confident_threshold: 6,
            starting_confidence: 3,
            correct_flush_bonus: 2,
            correct_write_bonus: 1,
            wrong_guess_penalty: 2,
            misprediction_penalty: 4,
            stale_after_frames: 1000,
        }
    }
}

impl PredictorConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.history_len == 0 {
            return Err("predictor history_len must be non-zero");
        }
        if self.confident_threshold > self.max_confidence
            || self.starting_confidence > self.max_confidence
        {
            return Err("predictor thresholds exceed max_confidence");
        }
        Ok(())
    }
}

/// Tuning knobs for [`crate::SurfaceStore`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SurfaceStoreConfig {
    /// Invalidated surfaces older than this are destroyed by `free_invalidated`.
    pub pool_max_age_frames: u64,
    pub max_pooled_surfaces: usize,
}

impl Default for SurfaceStoreConfig {
    fn default() -> Self {
        Self {
            pool_max_age_frames: 120,
            max_pooled_surfaces: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CacheConfig::default().validate().unwrap();
        assert_eq!(CacheConfig::default().block_size, 16 << 20);
    }

    #[test]
    fn bad_block_size_is_rejected() {
        let config = CacheConfig {
            block_size: 3 * PAGE_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
