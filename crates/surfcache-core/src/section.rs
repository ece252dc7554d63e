//! One cached, memory-backed resource and its protection/dirty state machine.
//!
//! Mutators are crate-private and only reachable through
//! [`RangedStorage::update`](crate::storage::RangedStorage::update), which observes the state
//! before and after every mutation and applies the resulting [`Edges`](crate::storage::Edges) to
//! the block and storage counters.

use surfcache_mem::{AddressRange, AddressRangeVector, GuestMemory, GuestMemoryError, PageProtector, Protection};

use crate::types::{
    ImageDimension, ReadbackBehaviour, SectionAttributes, SectionBounds, TextureFormat,
    UploadContext,
};

/// State the storage observes around each mutation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Observed {
    pub valid: bool,
    pub exists: bool,
    pub locked: bool,
    pub unreleased: bool,
    pub memory: u64,
}

#[derive(Debug)]
pub struct CachedSection<I> {
    generation: u32,

    cpu_range: AddressRange,
    locked_range: AddressRange,
    confirmed_range: AddressRange,
    protection: Protection,
    dirty: bool,

    context: UploadContext,
    format: TextureFormat,
    dimension: ImageDimension,
    attrs: SectionAttributes,
    readback: ReadbackBehaviour,

    image: Option<I>,
    managed: bool,
    memory_size: u64,

    synchronized: bool,
    flushed: bool,
    speculatively_flushed: bool,
    sync_timestamp: u64,
    /// Device data read back for the next flush, `staging_pitch` bytes per row.
    staging: Vec<u8>,
    staging_pitch: u32,

    flush_exclusions: AddressRangeVector,
    refs: u32,

    pub(crate) cache_tag: u64,
    pub(crate) last_write_tag: u64,
    pub(crate) last_use: u64,
}

impl<I: Copy> CachedSection<I> {
    pub(crate) fn new() -> Self {
        Self {
            generation: 0,
            cpu_range: AddressRange::INVALID,
            locked_range: AddressRange::INVALID,
            confirmed_range: AddressRange::INVALID,
            protection: Protection::ReadWrite,
            dirty: true,
            context: UploadContext::ShaderRead,
            format: TextureFormat::B8,
            dimension: ImageDimension::D2,
            attrs: SectionAttributes::default(),
            readback: ReadbackBehaviour::FlushOnce,
            image: None,
            managed: true,
            memory_size: 0,
            synchronized: false,
            flushed: false,
            speculatively_flushed: false,
            sync_timestamp: 0,
            staging: Vec::new(),
            staging_pitch: 0,
            flush_exclusions: AddressRangeVector::new(),
            refs: 0,
            cache_tag: 0,
            last_write_tag: 0,
            last_use: 0,
        }
    }

    pub(crate) fn observe(&self) -> Observed {
        let exists = self.exists();
        Observed {
            valid: self.valid_range(),
            exists,
            locked: self.is_locked(),
            unreleased: self.is_unreleased(),
            memory: if exists && self.managed {
                self.memory_size
            } else {
                0
            },
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Repurposes the section for `range`. Returns the managed image it held, if any.
    pub(crate) fn reset(&mut self, range: AddressRange) -> Option<I> {
        debug_assert!(range.valid());
        debug_assert!(!self.is_locked(), "reset of a locked section");

        let image = self.destroy();
        let generation = self.generation;
        *self = Self::new();
        self.generation = generation;
        self.cpu_range = range;
        self.locked_range = range.to_page_range();
        image
    }

    /// Releases the host image and invalidates the range. Returns the image if it was owned.
    pub(crate) fn destroy(&mut self) -> Option<I> {
        debug_assert!(!self.is_locked(), "destroy of a locked section");

        let image = self.image.take();
        let owned = if self.managed { image } else { None };
        self.generation = self.generation.wrapping_add(1);
        self.dirty = true;
        self.synchronized = false;
        self.flushed = false;
        self.speculatively_flushed = false;
        self.staging = Vec::new();
        self.flush_exclusions.clear();
        self.cpu_range.invalidate();
        self.locked_range.invalidate();
        self.confirmed_range.invalidate();
        owned
    }

    /// Attaches a host image. Unmanaged images (framebuffer-owned) are never returned by
    /// `destroy`.
    pub(crate) fn set_image(&mut self, image: I, managed: bool, memory_size: u64) {
        debug_assert!(self.image.is_none());
        self.image = Some(image);
        self.managed = managed;
        self.memory_size = memory_size;
    }

    pub(crate) fn take_image(&mut self) -> Option<I> {
        debug_assert!(!self.is_locked());
        self.image.take()
    }

    pub(crate) fn configure(
        &mut self,
        context: UploadContext,
        format: TextureFormat,
        dimension: ImageDimension,
        attrs: SectionAttributes,
    ) {
        debug_assert!(!self.is_locked() || self.context == context);
        self.context = context;
        self.format = format;
        self.dimension = dimension;
        self.attrs = attrs;
    }

    pub(crate) fn set_readback_behaviour(&mut self, readback: ReadbackBehaviour) {
        self.readback = readback;
    }

    // ---------------------------------------------------------------------
    // Dirty flag
    // ---------------------------------------------------------------------

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        // Unlocked shader-read sections are never clean: nothing traps writes to them.
        if !dirty && !self.is_locked() && self.context == UploadContext::ShaderRead {
            return;
        }
        self.dirty = dirty;
        debug_assert!(self.dirty || self.exists());
    }

    // ---------------------------------------------------------------------
    // Protection
    // ---------------------------------------------------------------------

    pub(crate) fn protect<P: PageProtector + ?Sized>(&mut self, prot: Protection, protector: &P) {
        self.protect_impl(prot, false, protector);
    }

    /// Protects with a confirmed sub-range `(offset, length)` relative to the section base. The
    /// confirmed range only grows until the section is unprotected.
    pub(crate) fn protect_confirmed<P: PageProtector + ?Sized>(
        &mut self,
        prot: Protection,
        confirm: (u32, u32),
        protector: &P,
    ) {
        if prot != Protection::ReadWrite && confirm.1 != 0 {
            let start = self.cpu_range.start.saturating_add(confirm.0);
            let added = AddressRange::start_length(start, confirm.1).get_intersect(&self.cpu_range);
            self.confirmed_range = self.confirmed_range.get_min_max(&added);

            let new_locked = self.confirmed_range.to_page_range();
            if self.is_locked() && !self.locked_range.inside(&new_locked) {
                // Pages no longer covered must not stay trapped.
                let mut stale = AddressRangeVector::new();
                stale.merge(self.locked_range);
                stale.exclude(new_locked);
                for range in &stale {
                    protector.protect(*range, Protection::ReadWrite);
                }
            }
            self.locked_range = new_locked;
        }
        self.protect_impl(prot, true, protector);
    }

    pub(crate) fn unprotect<P: PageProtector + ?Sized>(&mut self, protector: &P) {
        self.protect_impl(Protection::ReadWrite, false, protector);
    }

    /// Protection was already dropped by a batched call; only the bookkeeping changes.
    pub(crate) fn discard(&mut self, set_dirty: bool) {
        let old = self.protection;
        self.protection = Protection::ReadWrite;
        self.post_protect(old, Protection::ReadWrite);
        if set_dirty {
            self.set_dirty(true);
        }
    }

    /// Resets synchronization state and protects again, optionally confirming a sub-range.
    pub(crate) fn reprotect<P: PageProtector + ?Sized>(
        &mut self,
        prot: Protection,
        confirm: Option<(u32, u32)>,
        protector: &P,
    ) {
        self.flushed = false;
        self.synchronized = false;
        self.sync_timestamp = 0;
        self.staging.clear();
        match confirm {
            Some(confirm) => self.protect_confirmed(prot, confirm, protector),
            None => self.protect(prot, protector),
        }
    }

    fn protect_impl<P: PageProtector + ?Sized>(
        &mut self,
        prot: Protection,
        force: bool,
        protector: &P,
    ) {
        let old = self.protection;
        if prot == old && !force {
            return;
        }
        debug_assert!(self.locked_range.is_page_range());
        if prot != old || force {
            protector.protect(self.locked_range, prot);
        }
        self.protection = prot;
        self.post_protect(old, prot);
    }

    fn post_protect(&mut self, old: Protection, new: Protection) {
        if old != Protection::ReadWrite && new == Protection::ReadWrite {
            self.confirmed_range.invalidate();
            if self.cpu_range.valid() {
                self.locked_range = self.cpu_range.to_page_range();
            }
            if self.context == UploadContext::ShaderRead {
                self.set_dirty(true);
            }
        } else if old == Protection::ReadWrite && new != Protection::ReadWrite {
            self.set_dirty(false);
        }
    }

    // ---------------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------------

    /// Stores device data read back ahead of a flush.
    pub(crate) fn set_synchronized(&mut self, data: Vec<u8>, pitch: u32, timestamp: u64) {
        self.staging = data;
        self.staging_pitch = pitch;
        self.synchronized = true;
        self.sync_timestamp = timestamp;
    }

    pub(crate) fn set_speculatively_flushed(&mut self) {
        self.speculatively_flushed = true;
    }

    /// Records a GPU write. Returns true if the section had been speculatively flushed, i.e. the
    /// speculation was wasted.
    pub(crate) fn touch(&mut self, tag: u64) -> bool {
        self.last_write_tag = tag;
        let mispredicted = self.speculatively_flushed;
        self.speculatively_flushed = false;
        self.flush_exclusions.clear();
        mispredicted
    }

    pub(crate) fn add_flush_exclusion(&mut self, range: AddressRange) {
        debug_assert!(self.is_locked() && self.is_flushable());
        let range = range.get_intersect(&self.cpu_range);
        self.flush_exclusions.merge(range);
    }

    /// Copies synchronized device data to guest memory. Returns false if the section was already
    /// flushed and nothing happened.
    pub(crate) fn flush(&mut self, memory: &dyn GuestMemory) -> Result<bool, GuestMemoryError> {
        if self.flushed {
            return Ok(false);
        }
        debug_assert!(self.exists());
        debug_assert!(self.is_locked());

        let confirmed = self.get_bounds(SectionBounds::Confirmed);
        if !self.flush_exclusions.covers(&confirmed) {
            debug_assert!(self.synchronized);
            self.write_back(memory, confirmed)?;
        }

        self.flushed = true;
        self.speculatively_flushed = false;
        self.flush_exclusions.clear();
        Ok(true)
    }

    fn write_back(&self, memory: &dyn GuestMemory, valid: AddressRange) -> Result<(), GuestMemoryError> {
        let base = self.cpu_range.start;
        let guest_pitch = self.attrs.pitch;
        let host_pitch = self.staging_pitch;
        let row_bytes = self.attrs.width.saturating_mul(u32::from(self.format.bpp));

        if host_pitch == guest_pitch || guest_pitch == 0 {
            let offset = (valid.start - base) as usize;
            let end = (offset + valid.length() as usize).min(self.staging.len());
            if offset < end {
                self.write_excluding(memory, valid.start, &self.staging[offset..end])?;
            }
            return Ok(());
        }

        if !self.flush_exclusions.is_empty() {
            tracing::warn!(
                exclusions = self.flush_exclusions.len(),
                bytes = valid.length(),
                "pitch-converting flush with flush exclusions"
            );
        }

        let rows = self.attrs.height.saturating_mul(self.attrs.depth.max(1));
        for row in 0..rows {
            let Some(row_start) = row
                .checked_mul(guest_pitch)
                .and_then(|offset| base.checked_add(offset))
            else {
                break;
            };
            let row_range = AddressRange::start_length(row_start, row_bytes.min(guest_pitch));
            let copy = row_range.get_intersect(&valid);
            if !copy.valid() {
                if row_range.start > valid.end {
                    break;
                }
                continue;
            }
            let Some(src) = row
                .checked_mul(host_pitch)
                .and_then(|offset| offset.checked_add(copy.start - row_start))
            else {
                break;
            };
            let src = src as usize;
            let end = src + copy.length() as usize;
            if end > self.staging.len() {
                break;
            }
            self.write_excluding(memory, copy.start, &self.staging[src..end])?;
        }
        Ok(())
    }

    fn write_excluding(
        &self,
        memory: &dyn GuestMemory,
        addr: u32,
        data: &[u8],
    ) -> Result<(), GuestMemoryError> {
        let range = AddressRange::start_length(addr, data.len() as u32);
        if self.flush_exclusions.is_empty() || !self.flush_exclusions.overlaps(&range) {
            return memory.write(addr, data);
        }
        if self.flush_exclusions.covers(&range) {
            return Ok(());
        }

        let mut pieces = AddressRangeVector::new();
        pieces.merge(range);
        pieces.exclude_all(&self.flush_exclusions);
        for piece in &pieces {
            let offset = (piece.start - addr) as usize;
            memory.write(piece.start, &data[offset..offset + piece.length() as usize])?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Refcount
    // ---------------------------------------------------------------------

    pub(crate) fn add_ref(&mut self) {
        self.refs += 1;
    }

    pub(crate) fn release(&mut self) {
        debug_assert!(self.refs > 0, "release without add_ref");
        self.refs = self.refs.saturating_sub(1);
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn valid_range(&self) -> bool {
        self.cpu_range.valid()
    }

    pub fn section_range(&self) -> AddressRange {
        self.cpu_range
    }

    pub fn base(&self) -> u32 {
        self.cpu_range.start
    }

    pub fn get_bounds(&self, bounds: SectionBounds) -> AddressRange {
        match bounds {
            SectionBounds::Full => self.cpu_range,
            SectionBounds::Locked => self.locked_range,
            SectionBounds::Confirmed => {
                if self.confirmed_range.valid() {
                    self.confirmed_range
                } else {
                    self.cpu_range
                }
            }
        }
    }

    pub fn overlaps(&self, range: &AddressRange, bounds: SectionBounds) -> bool {
        self.get_bounds(bounds).overlaps(range)
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn is_locked(&self) -> bool {
        self.protection != Protection::ReadWrite
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_flushable(&self) -> bool {
        self.protection == Protection::NoAccess
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn is_speculatively_flushed(&self) -> bool {
        self.speculatively_flushed
    }

    pub fn sync_timestamp(&self) -> u64 {
        self.sync_timestamp
    }

    pub fn exists(&self) -> bool {
        self.image.is_some() || (self.context == UploadContext::Dma && self.is_locked())
    }

    pub fn is_unreleased(&self) -> bool {
        self.exists() && self.dirty && !self.is_locked()
    }

    pub fn has_refs(&self) -> bool {
        self.refs > 0
    }

    pub fn refs(&self) -> u32 {
        self.refs
    }

    pub fn can_be_reused(&self) -> bool {
        !self.has_refs() && (!self.exists() || (self.dirty && !self.is_locked()))
    }

    pub fn image(&self) -> Option<I> {
        self.image
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn memory_size(&self) -> u64 {
        self.memory_size
    }

    pub fn context(&self) -> UploadContext {
        self.context
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn dimension(&self) -> ImageDimension {
        self.dimension
    }

    pub fn attributes(&self) -> SectionAttributes {
        self.attrs
    }

    pub fn readback_behaviour(&self) -> ReadbackBehaviour {
        self.readback
    }

    pub fn flush_exclusions(&self) -> &AddressRangeVector {
        &self.flush_exclusions
    }

    pub fn last_write_tag(&self) -> u64 {
        self.last_write_tag
    }

    pub fn cache_tag(&self) -> u64 {
        self.cache_tag
    }

    /// Whether flushes of this section feed the predictor.
    pub fn tracked_by_predictor(&self) -> bool {
        self.context != UploadContext::ShaderRead && self.readback != ReadbackBehaviour::FlushAlways
    }

    pub fn matches_range(&self, range: &AddressRange) -> bool {
        self.valid_range() && self.cpu_range == *range
    }

    /// Zero-valued parameters match anything; `mipmaps` matches sections with at least as many.
    pub fn matches(&self, format: Option<TextureFormat>, width: u32, height: u32, depth: u32, mipmaps: u32) -> bool {
        if !self.valid_range() {
            return false;
        }
        if format.is_some_and(|f| f != self.format) {
            return false;
        }
        (width == 0 || width == self.attrs.width)
            && (height == 0 || height == self.attrs.height)
            && (depth == 0 || depth == self.attrs.depth)
            && (mipmaps == 0 || mipmaps <= self.attrs.mipmaps)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use surfcache_mem::{ProtectionMap, SparseGuestMemory};

    use super::*;

    fn section(range: AddressRange, context: UploadContext) -> CachedSection<u32> {
        let mut s = CachedSection::new();
        s.reset(range);
        s.configure(
            context,
            TextureFormat::B8,
            ImageDimension::D2,
            SectionAttributes {
                width: 16,
                height: 4,
                depth: 1,
                mipmaps: 1,
                pitch: 32,
            },
        );
        s.set_image(7, true, 64);
        s
    }

    #[test]
    fn shader_read_sections_stay_dirty_while_unlocked() {
        let mut s = section(AddressRange::start_length(0x1000, 128), UploadContext::ShaderRead);
        s.set_dirty(false);
        assert!(s.is_dirty());

        let map = ProtectionMap::new();
        s.protect(Protection::ReadOnly, &map);
        assert!(!s.is_dirty());
        assert!(s.is_locked());
        assert_eq!(map.protection(0x1000), Protection::ReadOnly);

        s.unprotect(&map);
        assert!(s.is_dirty());
        assert!(s.is_unreleased());
        assert_eq!(map.protection(0x1000), Protection::ReadWrite);
    }

    #[test]
    fn blit_destinations_can_be_clean_when_unlocked() {
        let mut s = section(AddressRange::start_length(0x1000, 128), UploadContext::BlitDst);
        let map = ProtectionMap::new();
        s.protect(Protection::NoAccess, &map);
        s.unprotect(&map);
        assert!(!s.is_dirty());
        assert!(!s.can_be_reused());
    }

    #[test]
    fn confirmed_range_shrinks_locked_pages() {
        let mut s = section(AddressRange::start_length(0x1000, 0x3000), UploadContext::Framebuffer);
        let map = ProtectionMap::new();
        s.protect(Protection::NoAccess, &map);
        assert_eq!(map.pages(AddressRange::start_end(0x1000, 0x3fff)).len(), 3);

        s.protect_confirmed(Protection::NoAccess, (0x1000, 0x100), &map);
        assert_eq!(s.get_bounds(SectionBounds::Confirmed), AddressRange::start_length(0x2000, 0x100));
        assert_eq!(s.get_bounds(SectionBounds::Locked), AddressRange::start_end(0x2000, 0x2fff));
        assert_eq!(map.protection(0x1000), Protection::ReadWrite);
        assert_eq!(map.protection(0x2000), Protection::NoAccess);
        assert_eq!(map.protection(0x3000), Protection::ReadWrite);
    }

    #[test]
    fn flush_converts_pitch_and_honours_exclusions() {
        // 16 bytes per row, guest pitch 32, host pitch 256.
        let mut s = section(AddressRange::start_length(0x1000, 4 * 32), UploadContext::BlitDst);
        let map = ProtectionMap::new();
        s.protect(Protection::NoAccess, &map);

        let mut staging = vec![0u8; 256 * 4];
        for row in 0..4 {
            staging[row * 256..row * 256 + 16].fill(row as u8 + 1);
        }
        s.set_synchronized(staging, 256, 1);
        s.add_flush_exclusion(AddressRange::start_length(0x1000 + 32, 4));

        let mem = Arc::new(SparseGuestMemory::new(1 << 16));
        mem.write(0x1000 + 32, &[0xee; 4]).unwrap();
        assert!(s.flush(mem.as_ref()).unwrap());
        assert!(!s.flush(mem.as_ref()).unwrap());

        let mut out = [0u8; 128];
        mem.read(0x1000, &mut out).unwrap();
        assert_eq!(&out[0..16], &[1; 16]);
        assert_eq!(&out[16..32], &[0; 16]);
        assert_eq!(&out[32..36], &[0xee; 4]);
        assert_eq!(&out[36..48], &[2; 12]);
        assert_eq!(&out[96..112], &[4; 16]);
    }

    struct RecordingMemory(spin::Mutex<Vec<(u32, usize)>>);

    impl GuestMemory for RecordingMemory {
        fn read(&self, _addr: u32, _dst: &mut [u8]) -> Result<(), GuestMemoryError> {
            Ok(())
        }

        fn write(&self, addr: u32, src: &[u8]) -> Result<(), GuestMemoryError> {
            self.0.lock().push((addr, src.len()));
            Ok(())
        }
    }

    #[test]
    fn pitched_write_back_stops_at_the_end_of_the_address_space() {
        let range = AddressRange::start_end(0x1000, u32::MAX);
        let mut s: CachedSection<u32> = CachedSection::new();
        s.reset(range);
        s.configure(
            UploadContext::BlitDst,
            TextureFormat::B8,
            ImageDimension::D2,
            SectionAttributes {
                width: 16,
                height: 8,
                depth: 1,
                mipmaps: 1,
                pitch: 0x6000_0000,
            },
        );
        s.set_image(7, true, 16 * 8);
        s.set_synchronized(vec![0x42; 16 * 8], 16, 1);

        let memory = RecordingMemory(spin::Mutex::new(Vec::new()));
        s.write_back(&memory, range).unwrap();
        assert_eq!(
            *memory.0.lock(),
            vec![(0x1000, 16), (0x6000_1000, 16), (0xc000_1000, 16)]
        );
    }
}
