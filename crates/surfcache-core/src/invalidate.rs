//! Fault-driven invalidation.
//!
//! An invalidation runs in three steps:
//!
//! 1. [`TextureCache::get_intersecting_set`] collects every locked section reachable from the
//!    fault range. A section overlapping the fault range widens the invalidate range, and the
//!    walk repeats until the range stops growing. Each section is tagged once per walk.
//! 2. Every candidate is classified as excluded (a false positive), to be flushed, or to be
//!    unprotected.
//! 3. Flushables are written back oldest first, then protection is dropped for the union of
//!    all flushed and unprotected pages in two coalesced passes (to RW, then back to RO for
//!    pages only shared with excluded read-only sections).
//!
//! Deferred causes stop after step 2 and hand the partition back tagged with the cache tag;
//! [`TextureCache::flush_all`] redeems it or restarts from scratch if the cache changed.

use surfcache_mem::{AddressRange, AddressRangeVector, PageProtector, Protection};
use tracing::{debug, error, trace};

use crate::backend::Backend;
use crate::cache::{CacheState, TextureCache};
use crate::error::Result;
use crate::predictor::PredictorKey;
use crate::storage::{SectionHandle, SectionId};
use crate::types::{InvalidationCause, ReadbackBehaviour, SectionBounds};

/// Outcome of an invalidation.
#[derive(Debug, Clone)]
pub struct ThrashedSet {
    pub cause: InvalidationCause,
    /// The requested range, before page alignment.
    pub request: AddressRange,
    pub fault_range: AddressRange,
    /// The fault range widened by every section chained into the invalidation.
    pub invalidate_range: AddressRange,
    /// Whether the faulting access may be retried.
    pub violation_handled: bool,
    pub flushed: bool,
    /// Cache tag at deferral time; the set is only redeemable while the cache still carries it.
    pub cache_tag: u64,
    pub num_flushable: usize,
    pub num_excluded: usize,
    pub num_discarded: usize,
    sections_to_flush: Vec<SectionHandle>,
    sections_to_unprotect: Vec<SectionHandle>,
    sections_to_exclude: Vec<SectionHandle>,
}

impl ThrashedSet {
    pub(crate) fn new(cause: InvalidationCause, request: AddressRange) -> Self {
        let fault_range = request.to_page_range();
        Self {
            cause,
            request,
            fault_range,
            invalidate_range: fault_range,
            violation_handled: false,
            flushed: false,
            cache_tag: 0,
            num_flushable: 0,
            num_excluded: 0,
            num_discarded: 0,
            sections_to_flush: Vec::new(),
            sections_to_unprotect: Vec::new(),
            sections_to_exclude: Vec::new(),
        }
    }

    pub fn sections_to_flush(&self) -> &[SectionHandle] {
        &self.sections_to_flush
    }

    pub fn sections_to_unprotect(&self) -> &[SectionHandle] {
        &self.sections_to_unprotect
    }

    pub fn sections_to_exclude(&self) -> &[SectionHandle] {
        &self.sections_to_exclude
    }

    /// Flushables are pending until the set is passed to [`TextureCache::flush_all`].
    pub fn is_deferred(&self) -> bool {
        self.cause.deferred_flush() && !self.flushed && self.num_flushable > 0
    }

    fn clear_sections(&mut self) {
        self.sections_to_flush.clear();
        self.sections_to_unprotect.clear();
        self.sections_to_exclude.clear();
    }
}

pub(crate) struct IntersectingSet {
    pub sections: Vec<SectionId>,
    pub invalidate_range: AddressRange,
    pub has_flushables: bool,
}

impl<B: Backend> TextureCache<B> {
    pub(crate) fn get_intersecting_set(
        &self,
        state: &mut CacheState<B::Image>,
        fault_range: AddressRange,
    ) -> IntersectingSet {
        debug_assert!(fault_range.is_page_range());

        let tag = state.update_cache_tag();
        let bounds = self.config().overlap_bounds;
        let mut result = IntersectingSet {
            sections: Vec::new(),
            invalidate_range: fault_range,
            has_flushables: false,
        };

        let mut last_dirty_block = u32::MAX;
        let mut repeat_loop = false;
        let mut cursor = state
            .storage
            .range_begin(fault_range, SectionBounds::Locked, true);

        loop {
            let Some(id) = cursor.next(&state.storage) else {
                if !repeat_loop {
                    break;
                }
                // The range grew below the cursor start; walk again from the new start.
                cursor = state
                    .storage
                    .range_begin(result.invalidate_range, SectionBounds::Locked, true);
                repeat_loop = false;
                continue;
            };

            // On a repeat walk, blocks past the last one that grew the range hold nothing new.
            let block = cursor.current_block();
            if !repeat_loop && block > last_dirty_block {
                break;
            }

            let tex = state.storage.section(id);
            if tex.cache_tag == tag {
                continue;
            }
            if bounds != SectionBounds::Locked && !tex.overlaps(&result.invalidate_range, bounds) {
                continue;
            }

            let new_range = tex
                .get_bounds(bounds)
                .get_min_max(&result.invalidate_range)
                .to_page_range();
            if tex.overlaps(&fault_range, bounds) && new_range != result.invalidate_range {
                if new_range.end > result.invalidate_range.end {
                    cursor.set_end(new_range.end);
                }
                result.invalidate_range = new_range;
                repeat_loop = true;
                last_dirty_block = block;
            }

            result.has_flushables |= tex.is_flushable();
            result.sections.push(id);
            state.storage.update(id, |s| s.cache_tag = tag);
        }

        debug_assert!(result.invalidate_range.is_page_range());
        result
    }

    /// Core invalidation. `request` may be unaligned; it is widened to pages.
    pub(crate) fn invalidate_range_impl(
        &self,
        state: &mut CacheState<B::Image>,
        request: AddressRange,
        cause: InvalidationCause,
    ) -> Result<ThrashedSet> {
        let mut result = ThrashedSet::new(cause, request);
        if !request.valid() || !self.intersects_locked(state, request, !cause.is_read()) {
            return Ok(result);
        }

        let fault_range = result.fault_range;
        let trampled = self.get_intersecting_set(state, fault_range);
        result.invalidate_range = trampled.invalidate_range;
        if trampled.sections.is_empty() {
            return Ok(result);
        }

        let strict = self.config().strict_texture_flushing;
        if cause.keep_fault_range_protection() && cause.skip_flush(strict) {
            self.discard_in_place(state, &trampled, &mut result);
            return Ok(result);
        }

        let bounds = self.config().overlap_bounds;
        let keep_ro_during_read = self.config().keep_ro_during_read;
        let ignore_unsynchronized = self.config().ignore_unsynchronized;

        for &id in &trampled.sections {
            let tex = state.storage.section(id);
            if !tex.is_locked() {
                continue;
            }
            let handle = state.storage.handle(id);
            let flushable = tex.is_flushable();
            let overlaps_fault_range = tex.overlaps(&fault_range, bounds);

            let false_positive =
                // Read-only data survives a read unless a flush could overwrite it.
                (keep_ro_during_read && !trampled.has_flushables && cause.is_read() && !flushable)
                    || !tex.get_bounds(bounds).inside(&trampled.invalidate_range)
                    || (ignore_unsynchronized
                        && flushable
                        && (cause.skip_flush(strict) || !tex.is_synchronized())
                        && !overlaps_fault_range)
                    // A framebuffer taking over the range keeps flushables based elsewhere.
                    || (overlaps_fault_range
                        && flushable
                        && cause.skip_fbos()
                        && tex.base() != request.start);

            if false_positive {
                result.sections_to_exclude.push(handle);
                result.num_excluded += 1;
                continue;
            }

            if flushable {
                if tex.is_dirty() {
                    // Contents were clobbered already; nothing worth writing back.
                    result.sections_to_unprotect.push(handle);
                } else {
                    result.sections_to_flush.push(handle);
                }
            } else {
                state.storage.update(id, |s| s.set_dirty(true));
                result.sections_to_unprotect.push(handle);
            }
        }

        if result.sections_to_flush.is_empty() && result.sections_to_unprotect.is_empty() {
            trace!(
                range = %result.invalidate_range,
                excluded = result.num_excluded,
                ?cause,
                "invalidation matched only false positives"
            );
            result.clear_sections();
            result.violation_handled = false;
            return Ok(result);
        }

        result.violation_handled = true;
        if !result.sections_to_flush.is_empty() {
            if cause.deferred_flush() {
                result.num_flushable = result.sections_to_flush.len();
                result.cache_tag = state.cache_tag;
                trace!(
                    range = %result.invalidate_range,
                    flushable = result.num_flushable,
                    "invalidation deferred"
                );
                return Ok(result);
            }
            self.flush_set(state, &mut result)?;
        }

        self.unprotect_set(state, &mut result);
        Ok(result)
    }

    /// Fast path for causes that neither flush nor touch the fault range's protection.
    fn discard_in_place(
        &self,
        state: &mut CacheState<B::Image>,
        trampled: &IntersectingSet,
        result: &mut ThrashedSet,
    ) {
        debug_assert!(result.cause != InvalidationCause::CommittedAsFbo);
        let strict = self.config().strict_texture_flushing;
        let fault_range = result.fault_range;
        let mut touched = 0usize;

        for &id in &trampled.sections {
            let tex = state.storage.section(id);
            if !tex.overlaps(&fault_range, SectionBounds::Locked) {
                continue;
            }
            if result.cause == InvalidationCause::SupersededByFbo
                && tex.is_flushable()
                && tex.base() != result.request.start
            {
                continue;
            }

            touched += 1;
            if tex.get_bounds(SectionBounds::Locked).inside(&fault_range) {
                state.storage.update(id, |s| s.discard(true));
                result.num_discarded += 1;
            } else if strict && tex.is_flushable() {
                state
                    .storage
                    .update(id, |s| s.add_flush_exclusion(fault_range));
            } else {
                state.storage.update(id, |s| s.set_dirty(true));
            }
        }

        result.violation_handled = touched > 0;
        result.clear_sections();
        trace!(
            range = %fault_range,
            cause = ?result.cause,
            discarded = result.num_discarded,
            touched,
            "invalidation without flush"
        );
    }

    pub(crate) fn flush_set(
        &self,
        state: &mut CacheState<B::Image>,
        data: &mut ThrashedSet,
    ) -> Result<()> {
        debug_assert!(!data.flushed);
        self.stats().inc_flush_requests();
        state.flushes_this_frame += 1;

        // Oldest data first, so newer writes land last.
        {
            let storage = &state.storage;
            data.sections_to_flush
                .sort_by_key(|h| storage.section(h.id).last_write_tag);
        }

        for handle in &data.sections_to_flush {
            let tex = state.storage.section(handle.id);
            let needs_transfer = !tex.is_synchronized()
                || (tex.readback_behaviour() == ReadbackBehaviour::FlushAlways
                    && tex.last_write_tag > tex.sync_timestamp());
            if needs_transfer {
                self.readback_section(state, handle.id, true)?;
            }
        }

        let memory = self.memory();
        for handle in &data.sections_to_flush {
            let id = handle.id;
            let flushed = state.storage.update(id, |s| s.flush(memory))?;

            let tex = state.storage.section(id);
            let confirmed = tex.get_bounds(SectionBounds::Confirmed);
            let write_tag = tex.last_write_tag;
            if flushed {
                self.stats().inc_sections_flushed();
                if tex.tracked_by_predictor() {
                    let key = PredictorKey::for_section(tex);
                    state.predictor.on_flush(key);
                }
            }

            for other in &data.sections_to_exclude {
                let excluded = state.storage.section(other.id);
                if !excluded.is_flushable() {
                    if excluded.overlaps(&confirmed, SectionBounds::Confirmed) {
                        error!(
                            excluded = %excluded.section_range(),
                            flushed = %confirmed,
                            "excluded read-only section overlaps flushed data"
                        );
                        state.storage.update(other.id, |s| s.set_dirty(true));
                    }
                } else if write_tag > excluded.last_write_tag {
                    state
                        .storage
                        .update(other.id, |s| s.add_flush_exclusion(confirmed));
                }
            }
        }

        data.flushed = true;
        state.update_cache_tag();
        Ok(())
    }

    pub(crate) fn unprotect_set(&self, state: &mut CacheState<B::Image>, data: &mut ThrashedSet) {
        debug_assert!(data.fault_range.is_page_range());
        debug_assert!(data.invalidate_range.is_page_range());
        debug_assert!(data.flushed || data.sections_to_flush.is_empty());

        let mut to_unprotect = AddressRangeVector::with_capacity(
            data.sections_to_unprotect.len() + data.sections_to_flush.len(),
        );
        let mut to_protect_ro = AddressRangeVector::new();

        for handle in data.sections_to_unprotect.iter().chain(&data.sections_to_flush) {
            to_unprotect.merge(state.storage.section(handle.id).get_bounds(SectionBounds::Locked));
        }

        if !data.sections_to_exclude.is_empty() {
            let mut no_access = 0usize;
            for handle in &data.sections_to_exclude {
                let excluded = state.storage.section(handle.id);
                debug_assert!(excluded.is_locked());
                let exclusion = excluded
                    .get_bounds(SectionBounds::Locked)
                    .get_intersect(&data.invalidate_range);

                to_unprotect.exclude(exclusion);
                match excluded.protection() {
                    Protection::ReadOnly => to_protect_ro.merge(exclusion),
                    Protection::NoAccess => no_access += 1,
                    Protection::ReadWrite => debug_assert!(false, "excluded section is not locked"),
                }
            }

            // Pages shared with a no-access exclusion keep their stricter protection.
            if no_access > 0 && !to_protect_ro.is_empty() {
                for handle in &data.sections_to_exclude {
                    let excluded = state.storage.section(handle.id);
                    if excluded.protection() != Protection::ReadOnly {
                        to_protect_ro.exclude(excluded.get_bounds(SectionBounds::Locked));
                    }
                }
            }
        }

        if data.cause.keep_fault_range_protection() {
            to_unprotect.exclude(data.fault_range);
            to_protect_ro.exclude(data.fault_range);
        }

        let protector = self.protector();
        for range in &to_unprotect {
            protector.protect(*range, Protection::ReadWrite);
        }
        for range in &to_protect_ro {
            protector.protect(*range, Protection::ReadOnly);
        }

        for handle in data.sections_to_unprotect.iter().chain(&data.sections_to_flush) {
            state.storage.update(handle.id, |s| {
                debug_assert!(s.is_flushed() || s.is_dirty());
                s.discard(false);
            });
        }

        trace!(
            range = %data.invalidate_range,
            cause = ?data.cause,
            flushed = data.sections_to_flush.len(),
            unprotected = data.sections_to_unprotect.len(),
            excluded = data.sections_to_exclude.len(),
            rw_runs = to_unprotect.len(),
            ro_runs = to_protect_ro.len(),
            "invalidation complete"
        );
    }

    /// Completes a deferred invalidation, or restarts it if the cache changed since.
    pub(crate) fn flush_all_impl(
        &self,
        state: &mut CacheState<B::Image>,
        data: &mut ThrashedSet,
    ) -> Result<()> {
        if !data.is_deferred() {
            return Ok(());
        }

        let live = data
            .sections_to_flush
            .iter()
            .chain(&data.sections_to_unprotect)
            .chain(&data.sections_to_exclude)
            .all(|h| state.storage.is_live(*h));

        if live && state.cache_tag == data.cache_tag {
            self.flush_set(state, data)?;
            self.unprotect_set(state, data);
            return Ok(());
        }

        debug!(
            range = %data.fault_range,
            "cache changed since deferral; restarting invalidation"
        );
        *data = self.invalidate_range_impl(state, data.request, data.cause.undefer())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use surfcache_mem::{GuestMemory, ProtectionMap, SparseGuestMemory};

    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::CacheConfig;
    use crate::types::{TextureDescriptor, TextureFormat};

    fn cache() -> (TextureCache<SoftwareBackend>, Arc<ProtectionMap>, Arc<SparseGuestMemory>) {
        let map = Arc::new(ProtectionMap::new());
        let backend = Arc::new(SoftwareBackend::new(map.clone()));
        let memory = Arc::new(SparseGuestMemory::new(1 << 26));
        let cache = TextureCache::new(CacheConfig::default(), backend, memory.clone())
            .expect("valid config");
        (cache, map, memory)
    }

    fn framebuffer(cache: &TextureCache<SoftwareBackend>, address: u32, rows: u32) -> SectionHandle {
        let desc = TextureDescriptor::new_2d(address, 1024, rows, 4096, TextureFormat::A8R8G8B8);
        let image = cache.backend().create_image(&desc.image_desc()).unwrap();
        cache
            .lock_memory_region(image, desc.memory_range(), 1024, rows, 4096, desc.format, false)
            .unwrap()
    }

    #[test]
    fn chained_sections_widen_the_invalidate_range() {
        let (cache, map, _memory) = cache();
        framebuffer(&cache, 0x10_0000, 2);
        framebuffer(&cache, 0x10_2000, 2);

        let result = cache
            .invalidate_range(AddressRange::start_length(0x10_1000, 0x1000), InvalidationCause::Write)
            .unwrap();
        assert!(result.violation_handled);
        assert_eq!(result.invalidate_range, AddressRange::start_end(0x10_0000, 0x10_1fff));
        assert_eq!(result.sections_to_flush().len(), 1);
        assert_eq!(map.protection(0x10_0000), Protection::ReadWrite);
        assert_eq!(map.protection(0x10_2000), Protection::NoAccess);
    }

    #[test]
    fn deferred_flush_is_redeemed_when_cache_is_unchanged() {
        let (cache, map, memory) = cache();
        let fb = framebuffer(&cache, 0x20_0000, 1);
        let image = cache.section_info(fb).unwrap().image.unwrap();
        cache.backend().fill_image(image, &[0x5a; 4096]).unwrap();

        let mut result = cache
            .invalidate_range(AddressRange::start_length(0x20_0000, 4), InvalidationCause::DeferredRead)
            .unwrap();
        assert!(result.is_deferred());
        assert_eq!(map.protection(0x20_0000), Protection::NoAccess);

        cache.flush_all(&mut result).unwrap();
        assert!(result.flushed);
        assert_eq!(map.protection(0x20_0000), Protection::ReadWrite);
        let mut out = [0u8; 4];
        memory.read(0x20_0000, &mut out).unwrap();
        assert_eq!(out, [0x5a; 4]);
    }

    #[test]
    fn deferred_flush_restarts_after_cache_changes() {
        let (cache, map, _memory) = cache();
        framebuffer(&cache, 0x20_0000, 1);

        let mut result = cache
            .invalidate_range(AddressRange::start_length(0x20_0000, 4), InvalidationCause::DeferredWrite)
            .unwrap();
        let stale_tag = result.cache_tag;
        // Locking another region bumps the cache tag.
        framebuffer(&cache, 0x30_0000, 1);

        cache.flush_all(&mut result).unwrap();
        assert_eq!(result.cause, InvalidationCause::Write);
        assert!(result.flushed);
        assert_ne!(result.cache_tag, stale_tag);
        assert_eq!(map.protection(0x20_0000), Protection::ReadWrite);
    }

    #[test]
    fn unmap_discards_without_touching_protection() {
        let (cache, map, _memory) = cache();
        let fb = framebuffer(&cache, 0x40_0000, 1);
        let calls = map.calls();

        let result = cache
            .invalidate_range(AddressRange::start_length(0x40_0000, 0x1000), InvalidationCause::Unmap)
            .unwrap();
        assert_eq!(result.num_discarded, 1);
        assert_eq!(map.calls(), calls);
        let info = cache.section_info(fb).unwrap();
        assert!(info.dirty);
        assert_eq!(info.protection, Protection::ReadWrite);
    }
}
