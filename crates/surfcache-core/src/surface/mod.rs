//! Render-target and depth-stencil surfaces.
//!
//! The store tracks every surface the GPU pipeline binds, keyed by guest address in one map per
//! [`SurfaceKind`]. Rebinding memory with a smaller surface splits the orphaned tail of the old
//! one into independent surfaces; binding over memory another surface used records a deferred
//! copy instead of copying eagerly. Deferred copies are resolved by [`SurfaceStore::read_barrier`].
//!
//! Evicted surfaces go to a reuse pool and are destroyed after aging out, unless a deferred copy
//! still reads from them.

mod overlap;
mod target;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use hashbrown::HashMap;
use surfcache_mem::{AddressRange, GuestMemory};
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::cache::TextureCache;
use crate::config::SurfaceStoreConfig;
use crate::error::{CacheError, Result};
use crate::types::{ImageDesc, InvalidationCause, Rect, TextureFormat};

pub use overlap::{covers, SurfaceOverlap};
pub use target::{DeferredCopy, Surface, SurfaceDesc, SurfaceId, SurfaceKind};

use overlap::{intersect, to_texels};

/// One attachment of a render target setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetBinding {
    pub address: u32,
    pub pitch: u32,
    pub format: TextureFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderTargetSetup {
    pub width: u32,
    pub height: u32,
    pub color: [Option<TargetBinding>; 4],
    pub depth: Option<TargetBinding>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BoundSurfaces {
    pub color: [Option<SurfaceId>; 4],
    pub depth: Option<SurfaceId>,
}

pub struct SurfaceStore<B: Backend> {
    config: SurfaceStoreConfig,
    backend: Arc<B>,
    memory: Arc<dyn GuestMemory>,
    surfaces: HashMap<SurfaceId, Surface<B::Image>>,
    color: BTreeMap<u32, SurfaceId>,
    depth: BTreeMap<u32, SurfaceId>,
    /// Union of live surface ranges per namespace. Only grows between recomputes.
    color_bounds: AddressRange,
    depth_bounds: AddressRange,
    /// Evicted surfaces, oldest first.
    pool: VecDeque<SurfaceId>,
    next_id: u32,
    tag: u64,
    frame: u64,
}

impl<B: Backend> core::fmt::Debug for SurfaceStore<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SurfaceStore")
            .field("color", &self.color.len())
            .field("depth", &self.depth.len())
            .field("pooled", &self.pool.len())
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> SurfaceStore<B> {
    pub fn new(config: SurfaceStoreConfig, backend: Arc<B>, memory: Arc<dyn GuestMemory>) -> Self {
        Self {
            config,
            backend,
            memory,
            surfaces: HashMap::new(),
            color: BTreeMap::new(),
            depth: BTreeMap::new(),
            color_bounds: AddressRange::INVALID,
            depth_bounds: AddressRange::INVALID,
            pool: VecDeque::new(),
            next_id: 1,
            tag: 0,
            frame: 0,
        }
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&Surface<B::Image>> {
        self.surfaces.get(&id)
    }

    pub fn image(&self, id: SurfaceId) -> Option<B::Image> {
        self.surfaces.get(&id).map(|s| s.image)
    }

    pub fn live_count(&self) -> usize {
        self.color.len() + self.depth.len()
    }

    pub fn pooled_count(&self) -> usize {
        self.pool.len()
    }

    fn namespace(&self, kind: SurfaceKind) -> &BTreeMap<u32, SurfaceId> {
        match kind {
            SurfaceKind::Color => &self.color,
            SurfaceKind::DepthStencil => &self.depth,
        }
    }

    fn namespace_mut(&mut self, kind: SurfaceKind) -> &mut BTreeMap<u32, SurfaceId> {
        match kind {
            SurfaceKind::Color => &mut self.color,
            SurfaceKind::DepthStencil => &mut self.depth,
        }
    }

    fn bounds_mut(&mut self, kind: SurfaceKind) -> &mut AddressRange {
        match kind {
            SurfaceKind::Color => &mut self.color_bounds,
            SurfaceKind::DepthStencil => &mut self.depth_bounds,
        }
    }

    fn next_tag(&mut self) -> u64 {
        self.tag += 1;
        self.tag
    }

    /// Live surface at `address` with row pitch `pitch`, color first.
    pub fn surface_at(&self, address: u32, pitch: u32) -> Option<SurfaceId> {
        [SurfaceKind::Color, SurfaceKind::DepthStencil]
            .into_iter()
            .filter_map(|kind| self.namespace(kind).get(&address).copied())
            .find(|id| self.surfaces[id].desc.pitch == pitch)
    }

    /// Whether `rect` of the surface can be read or written as `format`.
    pub fn fits(&self, id: SurfaceId, format: TextureFormat, rect: Rect) -> bool {
        self.surfaces.get(&id).is_some_and(|s| {
            s.desc.format.is_compatible(&format) && rect.fits_within(s.desc.width, s.desc.height)
        })
    }

    /// Live surfaces of both namespaces whose memory overlaps `range`.
    fn overlapping(&self, range: AddressRange) -> Vec<SurfaceId> {
        let mut out = Vec::new();
        for (map, bounds) in [(&self.color, self.color_bounds), (&self.depth, self.depth_bounds)] {
            if !bounds.valid() || !bounds.overlaps(&range) {
                continue;
            }
            out.extend(
                map.range(..=range.end)
                    .map(|(_, id)| *id)
                    .filter(|id| self.surfaces[id].memory_range().overlaps(&range)),
            );
        }
        out
    }

    // ---------------------------------------------------------------------
    // Binding
    // ---------------------------------------------------------------------

    /// Binds a surface at `desc.address`, reusing, splitting or replacing what was there.
    pub fn bind_surface_address(
        &mut self,
        cache: &TextureCache<B>,
        desc: SurfaceDesc,
    ) -> Result<SurfaceId> {
        if !desc.is_valid() {
            return Err(CacheError::InvalidDescriptor(format!(
                "surface {}x{} at {:#010x}, pitch {}",
                desc.width, desc.height, desc.address, desc.pitch
            )));
        }
        let tag = self.next_tag();

        let mut replaced = None;
        if let Some(&old) = self.namespace(desc.kind).get(&desc.address) {
            let existing = self.surfaces[&old].desc;
            if existing.same_shape(&desc) && existing.pitch == desc.pitch {
                self.surfaces
                    .get_mut(&old)
                    .ok_or(CacheError::UnknownSurface)?
                    .last_use_tag = tag;
                return Ok(old);
            }
            if existing.pitch == desc.pitch {
                self.split_surface_region(cache, old, &desc)?;
            }
            self.evict(old);
            replaced = Some(old);
        }

        // Same-namespace surfaces the new one buries completely are gone for good.
        let range = desc.memory_range();
        let buried: Vec<SurfaceId> = self
            .overlapping(range)
            .into_iter()
            .filter(|id| {
                let s = &self.surfaces[id];
                s.desc.kind == desc.kind && s.memory_range().inside(&range)
            })
            .collect();
        for id in &buried {
            self.evict(*id);
        }

        let image = self.allocate(cache, &desc)?;
        let id = self.insert(Surface::new(desc, image));
        self.surfaces
            .get_mut(&id)
            .ok_or(CacheError::UnknownSurface)?
            .last_use_tag = tag;

        let candidates: Vec<SurfaceId> = self
            .overlapping(range)
            .into_iter()
            .chain(replaced)
            .chain(buried)
            .filter(|other| *other != id)
            .collect();
        self.intersect_surface_region(id, &candidates);

        debug!(
            address = desc.address,
            width = desc.width,
            height = desc.height,
            pitch = desc.pitch,
            kind = ?desc.kind,
            inherited = self.surfaces[&id].old_contents.len(),
            "bound surface"
        );
        Ok(id)
    }

    /// Carves the parts of `old` that `desc` no longer covers into their own surfaces: first the
    /// strip right of the new width, then the rows below the new height. GPU data over each tail
    /// is written back to guest memory.
    fn split_surface_region(
        &mut self,
        cache: &TextureCache<B>,
        old: SurfaceId,
        desc: &SurfaceDesc,
    ) -> Result<Vec<SurfaceId>> {
        let old_desc = self.surfaces[&old].desc;
        let bpp = u32::from(old_desc.format.bpp);
        let mut tails = Vec::new();

        let new_row_bytes = desc.row_bytes();
        if old_desc.row_bytes() > new_row_bytes && new_row_bytes % bpp == 0 {
            let x = new_row_bytes / bpp;
            tails.push((
                SurfaceDesc {
                    address: old_desc.address + new_row_bytes,
                    width: old_desc.width - x,
                    height: old_desc.height.min(desc.height),
                    ..old_desc
                },
                Rect::new(x, 0, old_desc.width - x, old_desc.height.min(desc.height)),
            ));
        }
        if old_desc.height > desc.height {
            tails.push((
                SurfaceDesc {
                    address: old_desc.address + desc.height * old_desc.pitch,
                    height: old_desc.height - desc.height,
                    ..old_desc
                },
                Rect::new(0, desc.height, old_desc.width, old_desc.height - desc.height),
            ));
        }

        let mut ids = Vec::with_capacity(tails.len());
        for (tail, src_rect) in tails {
            if self.namespace(tail.kind).contains_key(&tail.address) {
                continue;
            }
            // The new surface only locks its own rows; anything the GPU left in the tail has to
            // reach guest memory before the old section is dropped.
            cache.invalidate_range(tail.memory_range(), InvalidationCause::Read)?;
            let image = self.allocate(cache, &tail)?;
            let id = self.insert(Surface::new(tail, image));
            let write_tag = self.surfaces[&old].write_tag;
            if let Some(surface) = self.surfaces.get_mut(&id) {
                surface.write_tag = write_tag;
            }
            self.add_deferred_copy(
                id,
                DeferredCopy {
                    src: old,
                    src_rect,
                    dst_rect: Rect::sized(src_rect.width, src_rect.height),
                },
            );
            trace!(address = tail.address, width = tail.width, height = tail.height, "split surface");
            ids.push(id);
        }
        Ok(ids)
    }

    /// Records a deferred copy into `id` from the newest of `candidates` that shares its memory.
    fn intersect_surface_region(&mut self, id: SurfaceId, candidates: &[SurfaceId]) {
        let desc = self.surfaces[&id].desc;
        let newest = candidates
            .iter()
            .filter_map(|other| {
                // Pool reuse may have taken a candidate's image already.
                let s = self.surfaces.get(other)?;
                if s.desc.pitch != desc.pitch {
                    return None;
                }
                let (in_new, in_old) = intersect(desc.footprint(), s.desc.footprint(), desc.pitch)?;
                Some((s.write_tag, *other, in_new, in_old))
            })
            .max_by_key(|(write_tag, ..)| *write_tag);

        let Some((_, src, in_new, in_old)) = newest else {
            return;
        };
        let src_format = self.surfaces[&src].desc.format;
        if !src_format.is_compatible(&desc.format) {
            debug!(
                src = src_format.code,
                dst = desc.format.code,
                "overlapping surface has an incompatible format; loading from memory instead"
            );
            return;
        }
        let (Some(dst_rect), Some(src_rect)) = (
            to_texels(in_new, desc.format.bpp),
            to_texels(in_old, src_format.bpp),
        ) else {
            return;
        };
        self.add_deferred_copy(
            id,
            DeferredCopy {
                src,
                src_rect,
                dst_rect,
            },
        );
    }

    fn add_deferred_copy(&mut self, id: SurfaceId, copy: DeferredCopy) {
        if let Some(src) = self.surfaces.get_mut(&copy.src) {
            src.pending_refs += 1;
        }
        if let Some(dst) = self.surfaces.get_mut(&id) {
            let full = copy.dst_rect == Rect::sized(dst.desc.width, dst.desc.height);
            dst.old_contents.push(copy);
            // A partial copy still needs the rest loaded from memory.
            dst.needs_load &= !full;
        }
    }

    fn drop_deferred_copies(&mut self, id: SurfaceId) {
        let copies = match self.surfaces.get_mut(&id) {
            Some(surface) => core::mem::take(&mut surface.old_contents),
            None => return,
        };
        for copy in copies {
            if let Some(src) = self.surfaces.get_mut(&copy.src) {
                src.pending_refs = src.pending_refs.saturating_sub(1);
            }
        }
    }

    fn insert(&mut self, surface: Surface<B::Image>) -> SurfaceId {
        let id = SurfaceId(self.next_id);
        self.next_id += 1;
        let kind = surface.desc.kind;
        let range = surface.memory_range();
        self.namespace_mut(kind).insert(surface.desc.address, id);
        let bounds = self.bounds_mut(kind);
        *bounds = bounds.get_min_max(&range);
        self.surfaces.insert(id, surface);
        id
    }

    /// Moves a live surface to the reuse pool.
    fn evict(&mut self, id: SurfaceId) {
        let Some(surface) = self.surfaces.get(&id) else {
            return;
        };
        let (kind, address) = (surface.desc.kind, surface.desc.address);
        if self.namespace(kind).get(&address) == Some(&id) {
            self.namespace_mut(kind).remove(&address);
        }
        self.drop_deferred_copies(id);
        let frame = self.frame;
        if let Some(surface) = self.surfaces.get_mut(&id) {
            surface.invalidated_frame = Some(frame);
        }
        self.pool.push_back(id);
    }

    /// An image for `desc`, taken from an unreferenced pooled surface of the same shape if one
    /// exists.
    fn allocate(&mut self, cache: &TextureCache<B>, desc: &SurfaceDesc) -> Result<B::Image> {
        let reusable = self.pool.iter().position(|id| {
            let s = &self.surfaces[id];
            !s.is_referenced() && s.desc.same_shape(desc)
        });
        if let Some(pos) = reusable {
            if let Some(id) = self.pool.remove(pos) {
                if let Some(surface) = self.surfaces.remove(&id) {
                    cache.release_framebuffer_image(surface.memory_range(), surface.image)?;
                    trace!(surface = id.0, "reusing pooled surface image");
                    return Ok(surface.image);
                }
            }
        }
        let image_desc = ImageDesc::new_2d(desc.width, desc.height, desc.format);
        Ok(self.backend.create_image(&image_desc)?)
    }

    // ---------------------------------------------------------------------
    // Reading
    // ---------------------------------------------------------------------

    /// Makes the surface's image hold its logical contents: guest memory first if it was never
    /// loaded, then the deferred copies, oldest source first.
    pub fn read_barrier(&mut self, id: SurfaceId) -> Result<()> {
        let surface = self.surfaces.get(&id).ok_or(CacheError::UnknownSurface)?;
        if surface.needs_load {
            let desc = surface.desc;
            let mut data = vec![0u8; desc.memory_range().length() as usize];
            self.memory.read(desc.address, &mut data)?;
            self.backend.upload_image(surface.image, &data, desc.pitch)?;
            if let Some(surface) = self.surfaces.get_mut(&id) {
                surface.needs_load = false;
            }
        }

        let mut copies = core::mem::take(
            &mut self
                .surfaces
                .get_mut(&id)
                .ok_or(CacheError::UnknownSurface)?
                .old_contents,
        );
        copies.sort_by_key(|copy| self.surfaces.get(&copy.src).map_or(0, |s| s.write_tag));

        let dst = self.surfaces[&id].image;
        let mut result = Ok(());
        for copy in copies {
            if let Some(src) = self.surfaces.get_mut(&copy.src) {
                src.pending_refs = src.pending_refs.saturating_sub(1);
                let src_image = src.image;
                if result.is_ok() {
                    result = self
                        .backend
                        .blit(src_image, copy.src_rect, dst, copy.dst_rect)
                        .map_err(CacheError::from);
                }
            }
        }
        result
    }

    /// Surfaces overlapping a texture at `range` with row pitch `pitch`, oldest write first.
    /// Surfaces whose memory the CPU changed since they were tagged are skipped.
    pub fn get_merged_texture_memory_region(
        &self,
        range: AddressRange,
        pitch: u32,
        bpp: u8,
    ) -> Vec<SurfaceOverlap<B::Image>> {
        if !range.valid() || bpp == 0 || pitch == 0 {
            return Vec::new();
        }
        let row_bytes = pitch.min(range.length());
        let rows = range.length().div_ceil(pitch);
        let texture = overlap::Footprint {
            address: range.start,
            row_bytes,
            rows,
        };

        let mut out: Vec<SurfaceOverlap<B::Image>> = self
            .overlapping(range)
            .into_iter()
            .filter_map(|id| {
                let s = &self.surfaces[&id];
                if s.desc.pitch != pitch || !s.test(self.memory.as_ref()) {
                    return None;
                }
                let (in_texture, in_surface) = intersect(texture, s.desc.footprint(), pitch)?;
                Some(SurfaceOverlap {
                    surface: id,
                    image: s.image,
                    format: s.desc.format,
                    src_rect: to_texels(in_surface, s.desc.format.bpp)?,
                    dst_rect: to_texels(in_texture, bpp)?,
                    write_tag: s.write_tag,
                })
            })
            .collect();
        out.sort_by_key(|o| o.write_tag);
        out
    }

    // ---------------------------------------------------------------------
    // Writing
    // ---------------------------------------------------------------------

    pub fn on_write(&mut self, id: SurfaceId) {
        let tag = self.next_tag();
        if let Some(surface) = self.surfaces.get_mut(&id) {
            surface.write_tag = tag;
            surface.last_use_tag = tag;
        }
    }

    pub fn sync_tag(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.get_mut(&id) {
            surface.sync_tag(self.memory.as_ref());
        }
    }

    /// False if the CPU changed the surface's memory since [`SurfaceStore::sync_tag`].
    pub fn test(&self, id: SurfaceId) -> bool {
        self.surfaces
            .get(&id)
            .is_some_and(|surface| surface.test(self.memory.as_ref()))
    }

    /// Binds up to four color targets and a depth-stencil target for drawing. Each surface's
    /// contents are resolved and its memory locked in the cache.
    pub fn prepare_render_target(
        &mut self,
        cache: &TextureCache<B>,
        setup: &RenderTargetSetup,
    ) -> Result<BoundSurfaces> {
        let mut bound = BoundSurfaces::default();
        for (slot, binding) in setup.color.iter().enumerate() {
            if let Some(binding) = binding {
                bound.color[slot] = Some(self.prepare_target(cache, setup, binding, SurfaceKind::Color)?);
            }
        }
        if let Some(binding) = &setup.depth {
            bound.depth = Some(self.prepare_target(cache, setup, binding, SurfaceKind::DepthStencil)?);
        }
        Ok(bound)
    }

    fn prepare_target(
        &mut self,
        cache: &TextureCache<B>,
        setup: &RenderTargetSetup,
        binding: &TargetBinding,
        kind: SurfaceKind,
    ) -> Result<SurfaceId> {
        let desc = SurfaceDesc {
            kind,
            address: binding.address,
            format: binding.format,
            width: setup.width,
            height: setup.height,
            pitch: binding.pitch,
        };
        let id = self.bind_surface_address(cache, desc)?;
        let range = desc.memory_range();

        if self.surfaces[&id].needs_load {
            // GPU data elsewhere in the cache lands in memory before the load reads it.
            cache.invalidate_range(range, InvalidationCause::Read)?;
        }
        self.read_barrier(id)?;

        let image = self.surfaces[&id].image;
        cache.lock_memory_region(image, range, desc.width, desc.height, desc.pitch, desc.format, false)?;
        self.on_write(id);
        self.sync_tag(id);
        Ok(id)
    }

    // ---------------------------------------------------------------------
    // Lifetime
    // ---------------------------------------------------------------------

    /// Drops surfaces over memory that is going away.
    pub fn invalidate_range(&mut self, range: AddressRange) {
        let doomed = self.overlapping(range);
        for id in &doomed {
            self.evict(*id);
        }
        if !doomed.is_empty() {
            self.recompute_bounds();
        }
    }

    pub fn on_frame_end(&mut self, cache: &TextureCache<B>) -> Result<usize> {
        self.frame += 1;
        self.free_invalidated(cache)
    }

    /// Destroys pooled surfaces that aged out or exceed the pool size. Surfaces still read by a
    /// deferred copy are kept. Returns how many were destroyed.
    pub fn free_invalidated(&mut self, cache: &TextureCache<B>) -> Result<usize> {
        let max_age = self.config.pool_max_age_frames;
        let mut excess = self.pool.len().saturating_sub(self.config.max_pooled_surfaces);
        let frame = self.frame;
        let mut kept = VecDeque::with_capacity(self.pool.len());
        let mut freed = 0;

        while let Some(id) = self.pool.pop_front() {
            let Some(surface) = self.surfaces.get(&id) else {
                continue;
            };
            let aged = surface
                .invalidated_frame
                .is_some_and(|evicted| frame.saturating_sub(evicted) > max_age);
            if surface.is_referenced() || !(aged || excess > 0) {
                kept.push_back(id);
                continue;
            }
            excess = excess.saturating_sub(1);
            let (range, image) = (surface.memory_range(), surface.image);
            self.surfaces.remove(&id);
            cache.release_framebuffer_image(range, image)?;
            self.backend.destroy_image(image);
            freed += 1;
        }
        self.pool = kept;
        self.recompute_bounds();
        if freed > 0 {
            debug!(freed, pooled = self.pool.len(), "freed invalidated surfaces");
        }
        Ok(freed)
    }

    fn recompute_bounds(&mut self) {
        for kind in [SurfaceKind::Color, SurfaceKind::DepthStencil] {
            let bounds = self
                .namespace(kind)
                .values()
                .map(|id| self.surfaces[id].memory_range())
                .fold(AddressRange::INVALID, |acc, r| acc.get_min_max(&r));
            *self.bounds_mut(kind) = bounds;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use surfcache_mem::{Protection, ProtectionMap, SparseGuestMemory};

    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::config::CacheConfig;

    struct Harness {
        cache: TextureCache<SoftwareBackend>,
        store: SurfaceStore<SoftwareBackend>,
        map: Arc<ProtectionMap>,
        memory: Arc<SparseGuestMemory>,
    }

    fn harness(config: SurfaceStoreConfig) -> Harness {
        let map = Arc::new(ProtectionMap::new());
        let backend = Arc::new(SoftwareBackend::new(map.clone()));
        let memory = Arc::new(SparseGuestMemory::new(1 << 24));
        let cache = TextureCache::new(CacheConfig::default(), backend.clone(), memory.clone()).unwrap();
        let store = SurfaceStore::new(config, backend, memory.clone());
        Harness {
            cache,
            store,
            map,
            memory,
        }
    }

    fn color(address: u32, width: u32, height: u32, pitch: u32) -> SurfaceDesc {
        SurfaceDesc {
            kind: SurfaceKind::Color,
            address,
            format: TextureFormat::A8R8G8B8,
            width,
            height,
            pitch,
        }
    }

    #[test]
    fn rebinding_the_same_shape_returns_the_same_surface() {
        let mut h = harness(SurfaceStoreConfig::default());
        let a = h.store.bind_surface_address(&h.cache, color(0x1_0000, 64, 64, 256)).unwrap();
        let b = h.store.bind_surface_address(&h.cache, color(0x1_0000, 64, 64, 256)).unwrap();
        assert_eq!(a, b);
        assert_eq!(h.store.live_count(), 1);
    }

    #[test]
    fn narrower_rebind_splits_in_x_then_y() {
        let mut h = harness(SurfaceStoreConfig::default());
        let old = h.store.bind_surface_address(&h.cache, color(0x1_0000, 64, 64, 256)).unwrap();
        let new = h.store.bind_surface_address(&h.cache, color(0x1_0000, 32, 16, 256)).unwrap();

        let right = h.store.surface_at(0x1_0000 + 32 * 4, 256).unwrap();
        let below = h.store.surface_at(0x1_0000 + 16 * 256, 256).unwrap();
        let right = h.store.surface(right).unwrap();
        let below = h.store.surface(below).unwrap();
        assert_eq!((right.desc().width, right.desc().height), (32, 16));
        assert_eq!((below.desc().width, below.desc().height), (64, 48));
        assert_eq!(
            below.old_contents(),
            &[DeferredCopy {
                src: old,
                src_rect: Rect::new(0, 16, 64, 48),
                dst_rect: Rect::sized(64, 48),
            }]
        );

        // The new surface inherits the top-left corner of the old one.
        let new = h.store.surface(new).unwrap();
        assert_eq!(new.old_contents()[0].src_rect, Rect::sized(32, 16));
        assert!(!new.needs_load());
        assert!(h.store.surface(old).unwrap().is_invalidated());
        assert_eq!(h.store.live_count(), 3);
    }

    #[test]
    fn deferred_copies_resolve_on_read_barrier() {
        let mut h = harness(SurfaceStoreConfig::default());
        let old = h.store.bind_surface_address(&h.cache, color(0x1_0000, 4, 4, 16)).unwrap();
        h.store.read_barrier(old).unwrap();
        let image = h.store.image(old).unwrap();
        let pattern: Vec<u8> = (0..64u8).collect();
        h.cache.backend().fill_image(image, &pattern).unwrap();

        h.store.bind_surface_address(&h.cache, color(0x1_0000, 4, 2, 16)).unwrap();
        let tail = h.store.surface_at(0x1_0000 + 2 * 16, 16).unwrap();
        assert!(h.store.surface(old).unwrap().is_referenced());

        h.store.read_barrier(tail).unwrap();
        let data = h.cache.backend().image_data(h.store.image(tail).unwrap()).unwrap();
        assert_eq!(data, pattern[32..].to_vec());
        assert!(h.store.surface(tail).unwrap().old_contents().is_empty());
    }

    #[test]
    fn referenced_pool_entries_survive_until_resolved() {
        let mut h = harness(SurfaceStoreConfig {
            pool_max_age_frames: 0,
            ..Default::default()
        });
        let old = h.store.bind_surface_address(&h.cache, color(0x1_0000, 4, 4, 16)).unwrap();
        h.store.bind_surface_address(&h.cache, color(0x1_0000, 4, 2, 16)).unwrap();
        let tail = h.store.surface_at(0x1_0000 + 2 * 16, 16).unwrap();

        assert_eq!(h.store.on_frame_end(&h.cache).unwrap(), 0);
        assert!(h.store.surface(old).is_some());

        h.store.read_barrier(tail).unwrap();
        // Resolving the tail released the last reference; the new surface's own copy was
        // resolved too.
        let new = h.store.surface_at(0x1_0000, 16).unwrap();
        h.store.read_barrier(new).unwrap();
        assert_eq!(h.store.on_frame_end(&h.cache).unwrap(), 1);
        assert!(h.store.surface(old).is_none());
    }

    #[test]
    fn merged_region_orders_by_write() {
        let mut h = harness(SurfaceStoreConfig::default());
        let top = h.store.bind_surface_address(&h.cache, color(0x1_0000, 64, 8, 256)).unwrap();
        let bottom = h.store.bind_surface_address(&h.cache, color(0x1_0000 + 8 * 256, 64, 8, 256)).unwrap();
        h.store.on_write(bottom);
        h.store.on_write(top);

        let merged = h.store.get_merged_texture_memory_region(
            AddressRange::start_length(0x1_0000, 16 * 256),
            256,
            4,
        );
        let order: Vec<SurfaceId> = merged.iter().map(|o| o.surface).collect();
        assert_eq!(order, vec![bottom, top]);
        assert_eq!(merged[0].dst_rect, Rect::new(0, 8, 64, 8));
        assert!(covers(&merged.iter().map(|o| o.dst_rect).collect::<Vec<_>>(), 64, 16));
    }

    #[test]
    fn prepare_render_target_locks_memory() {
        let mut h = harness(SurfaceStoreConfig::default());
        let setup = RenderTargetSetup {
            width: 64,
            height: 64,
            color: [
                Some(TargetBinding {
                    address: 0x10_0000,
                    pitch: 256,
                    format: TextureFormat::A8R8G8B8,
                }),
                None,
                None,
                None,
            ],
            depth: Some(TargetBinding {
                address: 0x20_0000,
                pitch: 256,
                format: TextureFormat::DEPTH24_D8,
            }),
        };
        let bound = h.store.prepare_render_target(&h.cache, &setup).unwrap();
        assert!(bound.color[0].is_some());
        assert!(bound.depth.is_some());
        assert_eq!(h.map.protection(0x10_0000), Protection::NoAccess);
        assert_eq!(h.map.protection(0x20_0000), Protection::NoAccess);
        assert!(h.store.test(bound.color[0].unwrap()));
    }

    #[test]
    fn shrinking_a_render_target_writes_the_tail_back() {
        let mut h = harness(SurfaceStoreConfig::default());
        let setup = |height| RenderTargetSetup {
            width: 64,
            height,
            color: [
                Some(TargetBinding {
                    address: 0x10_0000,
                    pitch: 256,
                    format: TextureFormat::A8R8G8B8,
                }),
                None,
                None,
                None,
            ],
            depth: None,
        };
        let full = h.store.prepare_render_target(&h.cache, &setup(64)).unwrap();
        let image = h.store.image(full.color[0].unwrap()).unwrap();
        h.cache.backend().fill_image(image, &[0x77; 64 * 64 * 4]).unwrap();

        h.store.prepare_render_target(&h.cache, &setup(32)).unwrap();

        // Rows 32.. belong to the tail surface now and are plain guest memory again.
        assert_eq!(h.map.protection(0x10_0000), Protection::NoAccess);
        assert_eq!(h.map.protection(0x10_2000), Protection::ReadWrite);
        let mut tail = vec![0u8; 32 * 256];
        h.memory.read(0x10_2000, &mut tail).unwrap();
        assert!(tail.iter().all(|b| *b == 0x77));
    }

    #[test]
    fn unmapped_surfaces_are_evicted() {
        let mut h = harness(SurfaceStoreConfig::default());
        h.store.bind_surface_address(&h.cache, color(0x1_0000, 64, 64, 256)).unwrap();
        h.store.invalidate_range(AddressRange::start_length(0x1_0000, 0x100));
        assert_eq!(h.store.live_count(), 0);
        assert_eq!(h.store.pooled_count(), 1);
        assert_eq!(h.store.surface_at(0x1_0000, 256), None);
    }
}
