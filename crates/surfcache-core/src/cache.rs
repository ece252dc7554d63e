//! The texture cache.
//!
//! [`TextureCache`] owns every CPU-memory-backed GPU resource: sampled textures uploaded from
//! guest memory, blit sources and destinations, and the framebuffer memory of render targets
//! owned by a [`SurfaceStore`]. It keeps the host page protection of that memory in step with
//! each section's state, and resolves protection faults through the invalidation engine in
//! [`crate::invalidate`].
//!
//! All state sits behind one upgradable `RwLock`. The fault path first consults two lock-free
//! bounds (the union of read-only and of no-access sections) so faults on unrelated memory
//! never touch the lock.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashSet;
use spin::RwLock;
use surfcache_mem::{
    page_start, AccessKind, AddressRange, FaultHandler, GuestMemory, PageProtector, Protection,
    PAGE_SIZE,
};
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::config::CacheConfig;
use crate::error::{BackendError, CacheError, Result};
use crate::invalidate::ThrashedSet;
use crate::pool::ImagePool;
use crate::predictor::{Predictor, PredictorKey};
use crate::stats::CacheStats;
use crate::storage::{BlockCounters, RangedStorage, SectionHandle, SectionId};
use crate::surface::{covers, SurfaceId, SurfaceStore};
use crate::types::{
    ImageDesc, ImageDimension, InvalidationCause, ReadbackBehaviour, Rect, SectionAttributes,
    SectionBounds, TextureDescriptor, TextureFormat, UploadContext,
};

pub(crate) struct CacheState<I> {
    pub storage: RangedStorage<I>,
    pub predictor: Predictor,
    pub pool: ImagePool<I>,
    /// Bumped on every structural change; stamps writes and deferred invalidations.
    pub cache_tag: u64,
    pub flushes_this_frame: u32,
    pub speculations_this_frame: u32,
    /// Composite images handed out this frame.
    pub temporaries: Vec<I>,
    /// Format pairs already reported as incompatible for blits.
    pub warned_blits: HashSet<(u32, u32)>,
}

impl<I> CacheState<I> {
    pub(crate) fn update_cache_tag(&mut self) -> u64 {
        self.cache_tag += 1;
        self.cache_tag
    }
}

/// Min/max bounds readable without the cache lock.
#[derive(Debug)]
struct AtomicRange(AtomicU64);

impl AtomicRange {
    const EMPTY: u64 = (u32::MAX as u64) << 32;

    fn new() -> Self {
        Self(AtomicU64::new(Self::EMPTY))
    }

    fn pack(range: AddressRange) -> u64 {
        if range.valid() {
            (u64::from(range.start) << 32) | u64::from(range.end)
        } else {
            Self::EMPTY
        }
    }

    fn unpack(value: u64) -> AddressRange {
        AddressRange::start_end((value >> 32) as u32, value as u32)
    }

    fn load(&self) -> AddressRange {
        Self::unpack(self.0.load(Ordering::Acquire))
    }

    fn extend(&self, range: AddressRange) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(Self::pack(Self::unpack(current).get_min_max(&range)))
            });
    }

    fn store(&self, range: AddressRange) {
        self.0.store(Self::pack(range), Ordering::Release);
    }
}

/// Forwards protection changes to the backend, counting them.
pub(crate) struct CountingProtector<'a, P: ?Sized> {
    inner: &'a P,
    stats: &'a CacheStats,
}

impl<P: PageProtector + ?Sized> PageProtector for CountingProtector<'_, P> {
    fn protect(&self, range: AddressRange, protection: Protection) {
        self.stats.add_protection_calls(1);
        self.inner.protect(range, protection);
    }
}

/// Where a sampled image came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampledSource {
    Cached(SectionHandle),
    Surface(SurfaceId),
    /// Composited from several surfaces into a temporary image released at frame end.
    Composite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledImage<I> {
    pub image: I,
    pub source: SampledSource,
    /// Texel region of `image` holding the texture.
    pub region: Rect,
    pub format: TextureFormat,
}

/// One side of a blit, in guest terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlitSurface {
    pub address: u32,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Region of the surface taking part in the blit.
    pub rect: Rect,
}

impl BlitSurface {
    fn descriptor(&self) -> TextureDescriptor {
        TextureDescriptor::new_2d(self.address, self.width, self.height, self.pitch, self.format)
    }

    fn is_valid(&self) -> bool {
        self.descriptor().is_valid() && !self.rect.is_empty() && self.rect.fits_within(self.width, self.height)
    }

    /// `(offset, length)` of the bytes covered by `rect`.
    fn rect_span(&self) -> (u32, u32) {
        let bpp = u32::from(self.format.bpp);
        let pitch = self.descriptor().row_pitch();
        let offset = self.rect.y * pitch + self.rect.x * bpp;
        let length = (self.rect.height - 1) * pitch + self.rect.width * bpp;
        (offset, length)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlitOutcome {
    /// False when the blit could not run on the GPU and the caller must copy on the CPU.
    pub succeeded: bool,
    pub dst_section: Option<SectionHandle>,
    pub dst_surface: Option<SurfaceId>,
}

/// Point-in-time view of a section for callers outside the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionInfo<I> {
    pub range: AddressRange,
    pub locked_range: AddressRange,
    pub protection: Protection,
    pub context: UploadContext,
    pub format: TextureFormat,
    pub dirty: bool,
    pub exists: bool,
    pub synchronized: bool,
    pub flushed: bool,
    pub refs: u32,
    pub image: Option<I>,
    pub last_write_tag: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct SectionQuery {
    format: Option<TextureFormat>,
    width: u32,
    height: u32,
    depth: u32,
    mipmaps: u32,
}

impl SectionQuery {
    fn for_descriptor(desc: &TextureDescriptor) -> Self {
        Self {
            format: Some(desc.format),
            width: desc.width,
            height: desc.height,
            depth: desc.depth.max(1),
            mipmaps: desc.mipmaps.max(1),
        }
    }
}

pub struct TextureCache<B: Backend> {
    config: CacheConfig,
    backend: Arc<B>,
    memory: Arc<dyn GuestMemory>,
    state: RwLock<CacheState<B::Image>>,
    stats: CacheStats,
    read_only_range: AtomicRange,
    no_access_range: AtomicRange,
}

impl<B: Backend> core::fmt::Debug for TextureCache<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TextureCache")
            .field("config", &self.config)
            .field("read_only_range", &self.read_only_range.load())
            .field("no_access_range", &self.no_access_range.load())
            .finish_non_exhaustive()
    }
}

impl<B: Backend> TextureCache<B> {
    pub fn new(config: CacheConfig, backend: Arc<B>, memory: Arc<dyn GuestMemory>) -> Result<Self> {
        config.validate().map_err(CacheError::InvalidConfig)?;
        let state = CacheState {
            storage: RangedStorage::new(config.block_size),
            predictor: Predictor::new(config.predictor.clone()),
            pool: ImagePool::new(config.max_pooled_images),
            cache_tag: 0,
            flushes_this_frame: 0,
            speculations_this_frame: 0,
            temporaries: Vec::new(),
            warned_blits: HashSet::new(),
        };
        Ok(Self {
            config,
            backend,
            memory,
            state: RwLock::new(state),
            stats: CacheStats::new(),
            read_only_range: AtomicRange::new(),
            no_access_range: AtomicRange::new(),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn memory(&self) -> &dyn GuestMemory {
        self.memory.as_ref()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub(crate) fn protector(&self) -> CountingProtector<'_, B> {
        CountingProtector {
            inner: self.backend.as_ref(),
            stats: &self.stats,
        }
    }

    // ---------------------------------------------------------------------
    // Invalidation entry points
    // ---------------------------------------------------------------------

    fn quick_check(&self, range: AddressRange, is_writing: bool) -> bool {
        let no_access = self.no_access_range.load();
        if no_access.valid() && no_access.overlaps(&range) {
            return true;
        }
        let read_only = self.read_only_range.load();
        is_writing && read_only.valid() && read_only.overlaps(&range)
    }

    pub(crate) fn intersects_locked(
        &self,
        state: &CacheState<B::Image>,
        range: AddressRange,
        is_writing: bool,
    ) -> bool {
        self.quick_check(range, is_writing)
            && state
                .storage
                .range_begin(range, SectionBounds::Locked, true)
                .next(&state.storage)
                .is_some()
    }

    /// Whether an access to `range` could hit a protected section.
    pub fn region_intersects_cache(&self, range: AddressRange, is_writing: bool) -> bool {
        if !range.valid() || !self.quick_check(range, is_writing) {
            return false;
        }
        let state = self.state.read();
        self.intersects_locked(&state, range, is_writing)
    }

    pub fn invalidate_range(&self, range: AddressRange, cause: InvalidationCause) -> Result<ThrashedSet> {
        if !range.valid() || !self.quick_check(range, !cause.is_read()) {
            return Ok(ThrashedSet::new(cause, range));
        }
        let state = self.state.upgradeable_read();
        if !self.intersects_locked(&state, range, !cause.is_read()) {
            return Ok(ThrashedSet::new(cause, range));
        }
        let mut state = state.upgrade();
        self.invalidate_range_impl(&mut state, range, cause)
    }

    /// Invalidates the page holding `address`. This is what the fault path calls.
    pub fn invalidate_address(&self, address: u32, cause: InvalidationCause) -> Result<ThrashedSet> {
        let range = AddressRange::start_length(page_start(address), PAGE_SIZE);
        let result = self.invalidate_range(range, cause)?;
        self.stats.record_invalidation(result.violation_handled);
        Ok(result)
    }

    /// Redeems a deferred [`ThrashedSet`]. If the cache changed since it was produced, the
    /// invalidation is redone synchronously and `data` replaced with the new result.
    pub fn flush_all(&self, data: &mut ThrashedSet) -> Result<()> {
        let mut state = self.state.write();
        self.flush_all_impl(&mut state, data)
    }

    /// A framebuffer now owns `range`: texture data there is obsolete.
    pub fn commit_framebuffer_memory_region(&self, range: AddressRange) -> Result<()> {
        if !self.region_intersects_cache(range, true) {
            return Ok(());
        }
        let mut state = self.state.write();
        self.invalidate_range_impl(&mut state, range, InvalidationCause::CommittedAsFbo)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Images
    // ---------------------------------------------------------------------

    fn create_image(&self, state: &mut CacheState<B::Image>, desc: &ImageDesc) -> Result<B::Image> {
        if let Some(image) = state.pool.take(desc) {
            return Ok(image);
        }
        match self.backend.create_image(desc) {
            Ok(image) => Ok(image),
            Err(BackendError::OutOfMemory { bytes }) => {
                warn!(bytes, "host image allocation failed; purging unlocked sections");
                for image in state.pool.drain() {
                    self.backend.destroy_image(image);
                }
                for image in state.storage.purge_unlocked() {
                    self.backend.destroy_image(image);
                }
                Ok(self.backend.create_image(desc)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns a managed image to the reuse pool.
    fn release_image(&self, state: &mut CacheState<B::Image>, image: B::Image) {
        match self.backend.image_desc(image) {
            Some(desc) => {
                for evicted in state.pool.put(image, desc) {
                    self.backend.destroy_image(evicted);
                }
            }
            None => self.backend.destroy_image(image),
        }
    }

    fn release_images(&self, state: &mut CacheState<B::Image>, images: Vec<B::Image>) -> usize {
        let count = images.len();
        for image in images {
            self.release_image(state, image);
        }
        count
    }

    // ---------------------------------------------------------------------
    // Section lookup
    // ---------------------------------------------------------------------

    /// A section covering exactly `range` and matching `query`.
    fn find_cached_texture(
        &self,
        state: &CacheState<B::Image>,
        range: AddressRange,
        query: &SectionQuery,
        confirm_dimensions: bool,
        allow_dirty: bool,
    ) -> Option<SectionId> {
        let block = state.storage.block(state.storage.block_for(range.start));
        let mut dimensions_mismatch = None;

        for (id, tex) in block.sections() {
            if !tex.matches_range(&range) || !(allow_dirty || !tex.is_dirty()) {
                continue;
            }
            if !confirm_dimensions
                || tex.matches(query.format, query.width, query.height, query.depth, query.mipmaps)
            {
                return Some(id);
            }
            if dimensions_mismatch.is_none() {
                dimensions_mismatch = Some(tex);
            }
        }

        if let Some(tex) = dimensions_mismatch {
            let attrs = tex.attributes();
            warn!(
                address = range.start,
                width = query.width,
                cached_width = attrs.width,
                height = query.height,
                cached_height = attrs.height,
                depth = query.depth,
                cached_depth = attrs.depth,
                mipmaps = query.mipmaps,
                cached_mipmaps = attrs.mipmaps,
                "cached section found but its dimensions do not match"
            );
        }
        None
    }

    /// An unlocked, image-less section set to `range`, preferring slots already holding the
    /// same range, then any reusable slot in the block, then a new one.
    fn acquire_section(&self, state: &mut CacheState<B::Image>, range: AddressRange) -> Result<SectionId> {
        let block = state.storage.block_for(range.start);

        // Locked sections claiming the same range are evicted first, so the range stays
        // claimed by a single section.
        let conflicting: Vec<SectionId> = state
            .storage
            .block(block)
            .sections()
            .filter(|(_, tex)| tex.matches_range(&range) && tex.is_locked() && !tex.has_refs())
            .map(|(id, _)| id)
            .collect();
        if !conflicting.is_empty() {
            self.invalidate_range_impl(state, range, InvalidationCause::Write)?;
        }

        let mut best_fit = None;
        let mut reuse = None;
        for (id, tex) in state.storage.block(block).sections() {
            if !tex.can_be_reused() {
                continue;
            }
            if tex.matches_range(&range) {
                best_fit = Some(id);
                break;
            }
            if reuse.is_none() {
                reuse = Some(id);
            }
        }

        let id = match best_fit.or(reuse) {
            Some(id) => {
                if let Some(image) = state.storage.reset(id, range) {
                    self.release_image(state, image);
                }
                id
            }
            None => {
                state.update_cache_tag();
                state.storage.create_section(range)
            }
        };
        Ok(id)
    }

    pub fn find_section(&self, range: AddressRange) -> Option<SectionHandle> {
        let state = self.state.read();
        let block = state.storage.block(state.storage.block_for(range.start));
        let mut fallback = None;
        for (id, tex) in block.sections() {
            if !tex.matches_range(&range) {
                continue;
            }
            if tex.exists() {
                return Some(state.storage.handle(id));
            }
            fallback.get_or_insert(id);
        }
        fallback.map(|id| state.storage.handle(id))
    }

    pub fn section_info(&self, handle: SectionHandle) -> Option<SectionInfo<B::Image>> {
        let state = self.state.read();
        let tex = state.storage.get(handle)?;
        Some(SectionInfo {
            range: tex.section_range(),
            locked_range: tex.get_bounds(SectionBounds::Locked),
            protection: tex.protection(),
            context: tex.context(),
            format: tex.format(),
            dirty: tex.is_dirty(),
            exists: tex.exists(),
            synchronized: tex.is_synchronized(),
            flushed: tex.is_flushed(),
            refs: tex.refs(),
            image: tex.image(),
            last_write_tag: tex.last_write_tag(),
        })
    }

    pub fn block_counters(&self, address: u32) -> BlockCounters {
        let state = self.state.read();
        state.storage.block(state.storage.block_for(address)).counters()
    }

    pub fn unreleased_count(&self) -> u32 {
        self.state.read().storage.unreleased_count()
    }

    pub fn memory_in_use(&self) -> u64 {
        self.state.read().storage.memory_in_use()
    }

    pub fn pooled_images(&self) -> usize {
        self.state.read().pool.len()
    }

    // ---------------------------------------------------------------------
    // Sampling
    // ---------------------------------------------------------------------

    /// Resolves a texture for sampling: render targets first, then cached sections, then a
    /// fresh upload from guest memory.
    pub fn upload_texture(
        &self,
        desc: &TextureDescriptor,
        surfaces: &mut SurfaceStore<B>,
    ) -> Result<SampledImage<B::Image>> {
        if !desc.is_valid() {
            return Err(CacheError::InvalidDescriptor(format!(
                "{}x{}x{} at {:#010x}, pitch {}",
                desc.width, desc.height, desc.depth, desc.address, desc.pitch
            )));
        }
        let range = desc.memory_range();

        if desc.dimension == ImageDimension::D2 && desc.mipmaps <= 1 {
            if let Some(sampled) = self.sample_from_surfaces(desc, surfaces)? {
                return Ok(sampled);
            }
        }

        {
            let state = self.state.read();
            let query = SectionQuery::for_descriptor(desc);
            if let Some(id) = self.find_cached_texture(&state, range, &query, true, false) {
                let tex = state.storage.section(id);
                if let Some(image) = tex.image() {
                    return Ok(SampledImage {
                        image,
                        source: SampledSource::Cached(state.storage.handle(id)),
                        region: Rect::sized(desc.width, desc.height),
                        format: tex.format(),
                    });
                }
            }
            if let Some(sampled) = self.find_blit_subresource(&state, desc) {
                return Ok(sampled);
            }
        }

        let mut state = self.state.write();
        let id = self.upload_from_cpu(&mut state, desc, UploadContext::ShaderRead)?;
        let tex = state.storage.section(id);
        let image = tex.image().ok_or(BackendError::UnknownImage)?;
        Ok(SampledImage {
            image,
            source: SampledSource::Cached(state.storage.handle(id)),
            region: Rect::sized(desc.width, desc.height),
            format: desc.format,
        })
    }

    fn sample_from_surfaces(
        &self,
        desc: &TextureDescriptor,
        surfaces: &mut SurfaceStore<B>,
    ) -> Result<Option<SampledImage<B::Image>>> {
        let overlaps = surfaces.get_merged_texture_memory_region(
            desc.memory_range(),
            desc.row_pitch(),
            desc.format.bpp,
        );
        if overlaps.is_empty() {
            return Ok(None);
        }

        let full = Rect::sized(desc.width, desc.height);
        if let [only] = overlaps.as_slice() {
            if only.dst_rect == full && only.format.is_compatible(&desc.format) {
                surfaces.read_barrier(only.surface)?;
                return Ok(Some(SampledImage {
                    image: only.image,
                    source: SampledSource::Surface(only.surface),
                    region: only.src_rect,
                    format: only.format,
                }));
            }
        }

        let rects: Vec<Rect> = overlaps.iter().map(|o| o.dst_rect).collect();
        if !covers(&rects, desc.width, desc.height) {
            debug!(
                address = desc.address,
                surfaces = overlaps.len(),
                "render targets only partially cover the texture; uploading from guest memory"
            );
            return Ok(None);
        }
        if let Some(bad) = overlaps.iter().find(|o| !o.format.is_compatible(&desc.format)) {
            let mut state = self.state.write();
            self.warn_incompatible(&mut state, bad.format, desc.format);
            return Ok(None);
        }

        let mut state = self.state.write();
        let composite = self.create_image(&mut state, &desc.image_desc())?;
        state.temporaries.push(composite);
        drop(state);

        // Oldest first, so newer surfaces land on top.
        for overlap in &overlaps {
            surfaces.read_barrier(overlap.surface)?;
            self.backend
                .blit(overlap.image, overlap.src_rect, composite, overlap.dst_rect)?;
        }
        Ok(Some(SampledImage {
            image: composite,
            source: SampledSource::Composite,
            region: full,
            format: desc.format,
        }))
    }

    /// A clean blit destination containing the texture at a compatible layout.
    fn find_blit_subresource(
        &self,
        state: &CacheState<B::Image>,
        desc: &TextureDescriptor,
    ) -> Option<SampledImage<B::Image>> {
        let range = desc.memory_range();
        let pitch = desc.row_pitch();
        let bpp = u32::from(desc.format.bpp);

        for id in state.storage.find_overlapping(range, SectionBounds::Full, true) {
            let tex = state.storage.section(id);
            let attrs = tex.attributes();
            if tex.context() != UploadContext::BlitDst
                || tex.is_dirty()
                || tex.format() != desc.format
                || attrs.pitch != pitch
                || !range.inside(&tex.section_range())
            {
                continue;
            }
            let offset = range.start - tex.base();
            let region = Rect::new((offset % pitch) / bpp, offset / pitch, desc.width, desc.height);
            if !region.fits_within(attrs.width, attrs.height) {
                continue;
            }
            let image = tex.image()?;
            return Some(SampledImage {
                image,
                source: SampledSource::Cached(state.storage.handle(id)),
                region,
                format: desc.format,
            });
        }
        None
    }

    /// Uploads `desc` from guest memory into a read-only protected section.
    fn upload_from_cpu(
        &self,
        state: &mut CacheState<B::Image>,
        desc: &TextureDescriptor,
        context: UploadContext,
    ) -> Result<SectionId> {
        let range = desc.memory_range();
        // Flush GPU-side data first so the upload sees it.
        self.invalidate_range_impl(state, range, InvalidationCause::Read)?;

        let query = SectionQuery::for_descriptor(desc);
        if let Some(id) = self.find_cached_texture(state, range, &query, true, false) {
            if state.storage.section(id).exists() {
                return Ok(id);
            }
        }

        let id = self.acquire_section(state, range)?;
        let image_desc = desc.image_desc();
        let image = self.create_image(state, &image_desc)?;

        let locked = range.to_page_range();
        self.read_only_range.extend(locked);
        let protector = self.protector();
        state.storage.update(id, |s| {
            s.configure(context, desc.format, desc.dimension, desc.attributes());
            s.set_image(image, true, image_desc.base_level_size());
            s.protect(Protection::ReadOnly, &protector);
        });

        if let Err(err) = self.fill_from_guest(desc, image) {
            let image = state.storage.update(id, |s| {
                s.unprotect(&protector);
                s.destroy()
            });
            if let Some(image) = image {
                self.release_image(state, image);
            }
            return Err(err);
        }

        self.stats.inc_uploads();
        state.update_cache_tag();
        Ok(id)
    }

    fn fill_from_guest(&self, desc: &TextureDescriptor, image: B::Image) -> Result<()> {
        let length = usize::try_from(desc.base_level_length())
            .map_err(|_| CacheError::InvalidDescriptor("texture too large".into()))?;
        let mut data = vec![0u8; length];
        self.memory.read(desc.address, &mut data)?;
        self.backend.upload_image(image, &data, desc.row_pitch())?;
        Ok(())
    }

    fn warn_incompatible(&self, state: &mut CacheState<B::Image>, src: TextureFormat, dst: TextureFormat) {
        if state.warned_blits.insert((src.code, dst.code)) {
            warn!(
                src = src.code,
                dst = dst.code,
                "incompatible formats; falling back to a CPU copy"
            );
        }
    }

    // ---------------------------------------------------------------------
    // GPU writes
    // ---------------------------------------------------------------------

    /// Stamps a GPU write on a section and feeds the predictor.
    fn record_write(&self, state: &mut CacheState<B::Image>, id: SectionId) {
        let tag = state.update_cache_tag();
        let (mispredicted, key) = state.storage.update(id, |s| {
            let mispredicted = s.touch(tag);
            (mispredicted, s.tracked_by_predictor().then(|| PredictorKey::for_section(s)))
        });
        if mispredicted {
            self.stats.inc_mispredictions();
            debug!(range = %state.storage.section(id).section_range(), "speculative flush wasted by a write");
        }
        if let Some(key) = key {
            state.predictor.on_write(key, mispredicted);
        }
    }

    /// Registers render-target memory: `image` (owned by the caller) is locked no-access over
    /// `range` so CPU accesses fault and flush it. `is_active_surface` marks surfaces read back on
    /// every flush.
    #[allow(clippy::too_many_arguments)]
    pub fn lock_memory_region(
        &self,
        image: B::Image,
        range: AddressRange,
        width: u32,
        height: u32,
        pitch: u32,
        format: TextureFormat,
        is_active_surface: bool,
    ) -> Result<SectionHandle> {
        if !range.valid() {
            return Err(CacheError::InvalidDescriptor(format!("invalid range {range}")));
        }
        let mut state = self.state.write();
        let query = SectionQuery {
            format: None,
            width,
            height,
            ..Default::default()
        };

        let mut id = match self.find_cached_texture(&state, range, &query, true, true) {
            Some(id) => id,
            None => self.acquire_section(&mut state, range)?,
        };

        let tex = state.storage.section(id);
        if !tex.is_locked() || tex.context() != UploadContext::Framebuffer {
            self.invalidate_range_impl(&mut state, range, InvalidationCause::SupersededByFbo)?;
        } else if tex.image() != Some(image) {
            // Same memory, different render target: write the old one back first.
            self.invalidate_range_impl(&mut state, range, InvalidationCause::Write)?;
        }

        let tex = state.storage.section(id);
        if tex.is_locked() && tex.image() == Some(image) {
            debug_assert!(tex.matches_range(&range));
            debug_assert_eq!(tex.context(), UploadContext::Framebuffer);
        } else {
            if tex.is_locked() || tex.has_refs() {
                id = self.acquire_section(&mut state, range)?;
            } else if let Some(old) = state.storage.reset(id, range) {
                self.release_image(&mut state, old);
            }
            state.storage.update(id, |s| {
                s.configure(
                    UploadContext::Framebuffer,
                    format,
                    ImageDimension::D2,
                    SectionAttributes {
                        width,
                        height,
                        depth: 1,
                        mipmaps: 1,
                        pitch,
                    },
                );
                s.set_image(image, false, 0);
            });
        }

        self.no_access_range.extend(range.to_page_range());
        let protector = self.protector();
        state.storage.update(id, |s| {
            s.reprotect(Protection::NoAccess, Some((0, range.length())), &protector);
            s.set_dirty(false);
            if is_active_surface {
                s.set_readback_behaviour(ReadbackBehaviour::FlushAlways);
            }
        });
        self.record_write(&mut state, id);
        Ok(state.storage.handle(id))
    }

    /// Drops the cache's claim on render-target memory whose image is about to be destroyed.
    /// Data the GPU wrote there is flushed first.
    pub fn release_framebuffer_image(&self, range: AddressRange, image: B::Image) -> Result<()> {
        let mut state = self.state.write();
        let owners: Vec<SectionId> = state
            .storage
            .find_overlapping(range, SectionBounds::Full, false)
            .into_iter()
            .filter(|id| state.storage.section(*id).image() == Some(image))
            .collect();

        for id in owners {
            let tex = state.storage.section(id);
            if tex.is_locked() {
                let locked = tex.get_bounds(SectionBounds::Locked);
                self.invalidate_range_impl(&mut state, locked, InvalidationCause::Write)?;
            }
            let tex = state.storage.section(id);
            if tex.is_locked() {
                error!(range = %tex.section_range(), "framebuffer section still locked on release");
                let protector = self.protector();
                state.storage.update(id, |s| s.unprotect(&protector));
            }
            if let Some(owned) = state.storage.destroy(id) {
                self.release_image(&mut state, owned);
            }
        }
        Ok(())
    }

    /// Scaled copy between two guest surfaces on the GPU.
    pub fn upload_scaled_image(
        &self,
        src: &BlitSurface,
        dst: &BlitSurface,
        surfaces: &mut SurfaceStore<B>,
    ) -> Result<BlitOutcome> {
        if !src.is_valid() || !dst.is_valid() {
            return Err(CacheError::InvalidDescriptor("blit region outside its surface".into()));
        }
        if !src.format.is_compatible(&dst.format) {
            let mut state = self.state.write();
            self.warn_incompatible(&mut state, src.format, dst.format);
            return Ok(BlitOutcome::default());
        }

        // Source: a render target if one lives there, else a cached or fresh upload.
        let src_image = match surfaces.surface_at(src.address, src.pitch) {
            Some(id) if surfaces.fits(id, src.format, src.rect) => {
                surfaces.read_barrier(id)?;
                surfaces.image(id).ok_or(CacheError::UnknownSurface)?
            }
            _ => {
                let desc = src.descriptor();
                let mut state = self.state.write();
                let query = SectionQuery::for_descriptor(&desc);
                let id = match self.find_cached_texture(&state, desc.memory_range(), &query, true, false) {
                    Some(id) if state.storage.section(id).exists() => id,
                    _ => self.upload_from_cpu(&mut state, &desc, UploadContext::BlitSrc)?,
                };
                state
                    .storage
                    .section(id)
                    .image()
                    .ok_or(BackendError::UnknownImage)?
            }
        };

        if let Some(id) = surfaces.surface_at(dst.address, dst.pitch) {
            if surfaces.fits(id, dst.format, dst.rect) {
                let dst_image = surfaces.image(id).ok_or(CacheError::UnknownSurface)?;
                surfaces.read_barrier(id)?;
                self.backend.blit(src_image, src.rect, dst_image, dst.rect)?;
                surfaces.on_write(id);
                self.stats.inc_blits();
                return Ok(BlitOutcome {
                    succeeded: true,
                    dst_section: None,
                    dst_surface: Some(id),
                });
            }
        }

        let desc = dst.descriptor();
        let range = desc.memory_range();
        let mut state = self.state.write();
        let query = SectionQuery::for_descriptor(&desc);
        let existing = self
            .find_cached_texture(&state, range, &query, true, false)
            .filter(|id| {
                let tex = state.storage.section(*id);
                tex.context() == UploadContext::BlitDst && tex.exists()
            });

        let id = match existing {
            Some(id) => id,
            None => {
                // Pending GPU data in the range lands in guest memory before it is captured.
                self.invalidate_range_impl(&mut state, range, InvalidationCause::Write)?;
                let id = self.acquire_section(&mut state, range)?;
                let image_desc = desc.image_desc();
                let image = self.create_image(&mut state, &image_desc)?;
                if dst.rect != Rect::sized(dst.width, dst.height) {
                    if let Err(err) = self.fill_from_guest(&desc, image) {
                        self.release_image(&mut state, image);
                        return Err(err);
                    }
                }
                state.storage.update(id, |s| {
                    s.configure(UploadContext::BlitDst, desc.format, desc.dimension, desc.attributes());
                    s.set_image(image, true, image_desc.base_level_size());
                });
                id
            }
        };

        let dst_image = state
            .storage
            .section(id)
            .image()
            .ok_or(BackendError::UnknownImage)?;
        self.backend.blit(src_image, src.rect, dst_image, dst.rect)?;
        self.stats.inc_blits();

        self.no_access_range.extend(range.to_page_range());
        let protector = self.protector();
        let confirm = dst.rect_span();
        state.storage.update(id, |s| {
            s.reprotect(Protection::NoAccess, Some(confirm), &protector);
            s.set_dirty(false);
        });
        self.record_write(&mut state, id);

        Ok(BlitOutcome {
            succeeded: true,
            dst_section: Some(state.storage.handle(id)),
            dst_surface: None,
        })
    }

    // ---------------------------------------------------------------------
    // Prediction
    // ---------------------------------------------------------------------

    /// Reads back a flushable section over `range` ahead of the guest's own read when the
    /// predictor expects one. Returns whether anything was read back.
    pub fn flush_if_cache_miss_likely(&self, range: AddressRange) -> Result<bool> {
        let budget = self.config.speculative_flushes_per_frame;
        let state = self.state.upgradeable_read();
        let mut spent = state.flushes_this_frame + state.speculations_this_frame;
        if spent >= budget || !range.valid() {
            return Ok(false);
        }

        let block = state.storage.block(state.storage.block_for(range.start));
        if block.is_empty() {
            return Ok(false);
        }
        let candidates: Vec<SectionId> = block
            .sections()
            .filter(|(_, tex)| {
                !tex.is_dirty()
                    && !tex.is_synchronized()
                    && tex.is_flushable()
                    && tex.matches_range(&range)
                    && tex.tracked_by_predictor()
                    && state.predictor.predict(&PredictorKey::for_section(tex))
            })
            .map(|(id, _)| id)
            .collect();
        if candidates.is_empty() {
            return Ok(false);
        }

        let mut state = state.upgrade();
        let mut result = false;
        for id in candidates {
            if spent >= budget {
                break;
            }
            self.readback_section(&mut state, id, false)?;
            state.speculations_this_frame += 1;
            spent += 1;
            result = true;
        }
        Ok(result)
    }

    /// Copies a section's image into its staging buffer. `miss` marks a transfer forced by a
    /// fault rather than a speculative one.
    pub(crate) fn readback_section(
        &self,
        state: &mut CacheState<B::Image>,
        id: SectionId,
        miss: bool,
    ) -> Result<()> {
        let tex = state.storage.section(id);
        let Some(image) = tex.image() else {
            return Ok(());
        };
        let attrs = tex.attributes();
        let timestamp = tex.last_write_tag();
        let range = tex.section_range();

        let mut data = Vec::new();
        let pitch = self
            .backend
            .readback_image(image, Rect::sized(attrs.width, attrs.height), &mut data)?;

        if miss {
            self.stats.inc_cache_misses();
            warn!(%range, "cache miss: flushing unsynchronized section");
        } else {
            self.stats.inc_speculative_flushes();
        }
        state.storage.update(id, |s| {
            s.set_synchronized(data, pitch, timestamp);
            if !miss {
                s.set_speculatively_flushed();
            }
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifetime
    // ---------------------------------------------------------------------

    /// Pins a section against reuse. Returns false if the handle is stale.
    pub fn add_ref(&self, handle: SectionHandle) -> bool {
        let mut state = self.state.write();
        if !state.storage.is_live(handle) {
            return false;
        }
        state.storage.update(handle.id, |s| s.add_ref());
        true
    }

    pub fn release(&self, handle: SectionHandle) -> bool {
        let mut state = self.state.write();
        if !state.storage.is_live(handle) || !state.storage.section(handle.id).has_refs() {
            return false;
        }
        state.storage.update(handle.id, |s| s.release());
        true
    }

    pub fn on_frame_end(&self) {
        let mut state = self.state.write();
        if state.storage.unreleased_count() > self.config.max_zombie_sections {
            let images = state.storage.purge_unreleased();
            let purged = self.release_images(&mut state, images);
            debug!(purged, "purged unreleased sections");
        }

        state.predictor.on_frame_end();
        state.flushes_this_frame = 0;
        state.speculations_this_frame = 0;

        let temporaries = core::mem::take(&mut state.temporaries);
        self.release_images(&mut state, temporaries);
        self.recompute_bounds(&state);
    }

    /// Shrinks the quick-reject bounds to the sections still locked.
    fn recompute_bounds(&self, state: &CacheState<B::Image>) {
        let mut read_only = AddressRange::INVALID;
        let mut no_access = AddressRange::INVALID;
        for block in state.storage.in_use_blocks() {
            let block = state.storage.block(block);
            if block.counters().locked == 0 {
                continue;
            }
            for (_, tex) in block.sections() {
                let locked = tex.get_bounds(SectionBounds::Locked);
                match tex.protection() {
                    Protection::ReadOnly => read_only = read_only.get_min_max(&locked),
                    Protection::NoAccess => no_access = no_access.get_min_max(&locked),
                    Protection::ReadWrite => {}
                }
            }
        }
        self.read_only_range.store(read_only);
        self.no_access_range.store(no_access);
    }

    /// Destroys dirty, unlocked sections that still hold images. Returns how many were purged.
    pub fn purge_unreleased_sections(&self) -> usize {
        let mut state = self.state.write();
        let images = state.storage.purge_unreleased();
        self.release_images(&mut state, images)
    }

    /// Destroys every unlocked, unreferenced section holding an image.
    pub fn purge_unlocked_sections(&self) -> usize {
        let mut state = self.state.write();
        let images = state.storage.purge_unlocked();
        self.release_images(&mut state, images)
    }

    /// Drops everything: protection is lifted, all sections and pooled images destroyed.
    pub fn reset(&self) {
        let mut state = self.state.write();
        let protector = self.protector();
        for id in state.storage.ids() {
            if state.storage.section(id).is_locked() {
                state.storage.update(id, |s| s.unprotect(&protector));
            }
            if let Some(image) = state.storage.destroy(id) {
                self.backend.destroy_image(image);
            }
        }
        for image in state.pool.drain() {
            self.backend.destroy_image(image);
        }
        for image in core::mem::take(&mut state.temporaries) {
            self.backend.destroy_image(image);
        }
        state.predictor.clear();
        state.update_cache_tag();
        self.read_only_range.store(AddressRange::INVALID);
        self.no_access_range.store(AddressRange::INVALID);
        debug!("texture cache reset");
    }
}

impl<B: Backend> FaultHandler for TextureCache<B> {
    fn on_fault(&self, address: u32, access: AccessKind) -> bool {
        let cause = match access {
            AccessKind::Read => InvalidationCause::Read,
            AccessKind::Write => InvalidationCause::Write,
        };
        match self.invalidate_address(address, cause) {
            Ok(result) => result.violation_handled,
            Err(err) => {
                error!(address, %err, "invalidation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use surfcache_mem::{ProtectionMap, SparseGuestMemory};

    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::SurfaceStoreConfig;

    struct Harness {
        cache: TextureCache<SoftwareBackend>,
        surfaces: SurfaceStore<SoftwareBackend>,
        map: Arc<ProtectionMap>,
        memory: Arc<SparseGuestMemory>,
    }

    fn harness(config: CacheConfig) -> Harness {
        let map = Arc::new(ProtectionMap::new());
        let backend = Arc::new(SoftwareBackend::new(map.clone()));
        let memory = Arc::new(SparseGuestMemory::new(1 << 26));
        let cache = TextureCache::new(config, backend.clone(), memory.clone()).unwrap();
        let surfaces = SurfaceStore::new(SurfaceStoreConfig::default(), backend, memory.clone());
        Harness {
            cache,
            surfaces,
            map,
            memory,
        }
    }

    fn texture(address: u32) -> TextureDescriptor {
        TextureDescriptor::new_2d(address, 32, 32, 0, TextureFormat::A8R8G8B8)
    }

    #[test]
    fn upload_protects_read_only_and_hits_afterwards() {
        let mut h = harness(CacheConfig::default());
        h.memory.write(0x1_0000, &[7; 32 * 32 * 4]).unwrap();

        let first = h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        assert_eq!(h.map.protection(0x1_0000), Protection::ReadOnly);
        assert_eq!(h.cache.backend().image_data(first.image).unwrap()[0], 7);

        let second = h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        assert_eq!(first, second);
        assert_eq!(h.cache.stats().snapshot().uploads, 1);
    }

    #[test]
    fn cpu_write_forces_reupload() {
        let mut h = harness(CacheConfig::default());
        let first = h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();

        assert!(h.cache.on_fault(0x1_0010, AccessKind::Write));
        h.memory.write(0x1_0010, &[9; 4]).unwrap();

        let second = h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        let data = h.cache.backend().image_data(second.image).unwrap();
        assert_eq!(&data[0x10..0x14], &[9; 4]);
        let SampledSource::Cached(first) = first.source else {
            panic!("expected a cached section");
        };
        // The slot was reused for the same range.
        let SampledSource::Cached(second) = second.source else {
            panic!("expected a cached section");
        };
        assert_eq!(first.id, second.id);
        assert_eq!(h.cache.stats().snapshot().uploads, 2);
    }

    #[test]
    fn faults_outside_cached_memory_are_not_handled() {
        let h = harness(CacheConfig::default());
        assert!(!h.cache.on_fault(0x5000, AccessKind::Write));
        let stats = h.cache.stats().snapshot();
        assert_eq!(stats.invalidations_unhandled, 1);
    }

    #[test]
    fn allocation_failure_purges_and_retries() {
        let mut h = harness(CacheConfig::default());
        h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        assert!(h.cache.on_fault(0x1_0000, AccessKind::Write));
        assert_eq!(h.cache.unreleased_count(), 1);

        // A different shape in another block: nothing in the pool fits.
        h.cache.backend().fail_next_allocation();
        let large = TextureDescriptor::new_2d(0x200_0000, 64, 64, 0, TextureFormat::A8R8G8B8);
        h.cache.upload_texture(&large, &mut h.surfaces).unwrap();
        assert_eq!(h.cache.unreleased_count(), 0);
        assert_eq!(h.cache.backend().live_images(), 1);
    }

    #[test]
    fn frame_end_purges_zombies_into_the_pool() {
        let mut h = harness(CacheConfig {
            max_zombie_sections: 0,
            ..Default::default()
        });
        h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        assert!(h.cache.on_fault(0x1_0000, AccessKind::Write));

        h.cache.on_frame_end();
        assert_eq!(h.cache.unreleased_count(), 0);
        assert_eq!(h.cache.pooled_images(), 1);
        assert!(!h.cache.region_intersects_cache(AddressRange::start_length(0x1_0000, 4), true));

        // Same shape elsewhere reuses the pooled image.
        let live = h.cache.backend().live_images();
        h.cache.upload_texture(&texture(0x9_0000), &mut h.surfaces).unwrap();
        assert_eq!(h.cache.backend().live_images(), live);
        assert_eq!(h.cache.pooled_images(), 0);
    }

    #[test]
    fn referenced_sections_are_not_purged() {
        let mut h = harness(CacheConfig::default());
        let sampled = h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        let SampledSource::Cached(handle) = sampled.source else {
            panic!("expected a cached section");
        };
        assert!(h.cache.add_ref(handle));
        assert!(h.cache.on_fault(0x1_0000, AccessKind::Write));

        assert_eq!(h.cache.purge_unlocked_sections(), 0);
        assert!(h.cache.release(handle));
        assert!(!h.cache.release(handle));
        assert_eq!(h.cache.purge_unlocked_sections(), 1);
    }

    #[test]
    fn blit_creates_a_no_access_destination() {
        let mut h = harness(CacheConfig::default());
        h.memory.write(0x1_0000, &[3; 16 * 16 * 4]).unwrap();
        let src = BlitSurface {
            address: 0x1_0000,
            format: TextureFormat::A8R8G8B8,
            width: 16,
            height: 16,
            pitch: 64,
            rect: Rect::sized(16, 16),
        };
        let dst = BlitSurface {
            address: 0x4_0000,
            width: 32,
            height: 32,
            pitch: 128,
            rect: Rect::sized(32, 32),
            ..src
        };

        let outcome = h.cache.upload_scaled_image(&src, &dst, &mut h.surfaces).unwrap();
        assert!(outcome.succeeded);
        let info = h.cache.section_info(outcome.dst_section.unwrap()).unwrap();
        assert_eq!(info.context, UploadContext::BlitDst);
        assert_eq!(info.protection, Protection::NoAccess);
        assert_eq!(h.map.protection(0x4_0000), Protection::NoAccess);
        assert_eq!(h.map.protection(0x1_0000), Protection::ReadOnly);

        // Sampling part of the destination resolves to a view of it.
        let sub = TextureDescriptor::new_2d(0x4_0000 + 128 * 4, 8, 4, 128, TextureFormat::A8R8G8B8);
        let sampled = h.cache.upload_texture(&sub, &mut h.surfaces).unwrap();
        assert_eq!(sampled.image, info.image.unwrap());
        assert_eq!(sampled.region, Rect::new(0, 4, 8, 4));

        // Reading the destination from the CPU flushes the scaled data.
        assert!(h.cache.on_fault(0x4_0000, AccessKind::Read));
        let mut out = [0u8; 4];
        h.memory.read(0x4_0000, &mut out).unwrap();
        assert_eq!(out, [3; 4]);
    }

    #[test]
    fn incompatible_blits_fall_back() {
        let mut h = harness(CacheConfig::default());
        let src = BlitSurface {
            address: 0x1_0000,
            format: TextureFormat::DEPTH16,
            width: 16,
            height: 16,
            pitch: 32,
            rect: Rect::sized(16, 16),
        };
        let dst = BlitSurface {
            address: 0x4_0000,
            format: TextureFormat::R5G6B5,
            ..src
        };
        let outcome = h.cache.upload_scaled_image(&src, &dst, &mut h.surfaces).unwrap();
        assert!(!outcome.succeeded);
        assert_eq!(h.cache.stats().snapshot().blits, 0);
    }

    #[test]
    fn reset_lifts_all_protection() {
        let mut h = harness(CacheConfig::default());
        h.cache.upload_texture(&texture(0x1_0000), &mut h.surfaces).unwrap();
        let image = h.cache.backend().create_image(&ImageDesc::new_2d(16, 16, TextureFormat::A8R8G8B8)).unwrap();
        h.cache
            .lock_memory_region(image, AddressRange::start_length(0x2_0000, 1024), 16, 16, 64, TextureFormat::A8R8G8B8, true)
            .unwrap();

        h.cache.reset();
        assert_eq!(h.map.protection(0x1_0000), Protection::ReadWrite);
        assert_eq!(h.map.protection(0x2_0000), Protection::ReadWrite);
        // Only the caller-owned framebuffer image survives.
        assert_eq!(h.cache.backend().live_images(), 1);
        assert!(h.cache.backend().image_data(image).is_some());
    }
}
