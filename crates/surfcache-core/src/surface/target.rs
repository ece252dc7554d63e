use surfcache_mem::{AddressRange, GuestMemory};

use crate::types::{Rect, TextureFormat};

use super::overlap::Footprint;

/// Samples taken by [`Surface::sync_tag`].
const TAG_SAMPLES: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

/// Render targets and depth-stencil buffers live in separate namespaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Color,
    DepthStencil,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub kind: SurfaceKind,
    pub address: u32,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Guest row pitch in bytes.
    pub pitch: u32,
}

impl SurfaceDesc {
    pub fn row_bytes(&self) -> u32 {
        self.width * u32::from(self.format.bpp)
    }

    pub fn is_valid(&self) -> bool {
        self.width != 0
            && self.height != 0
            && self.format.bpp != 0
            && self.pitch >= self.row_bytes()
            && self.memory_range().valid()
    }

    /// Guest bytes from the first texel to the last; rows are `pitch` apart.
    pub fn memory_range(&self) -> AddressRange {
        let length = u64::from(self.height.saturating_sub(1)) * u64::from(self.pitch)
            + u64::from(self.row_bytes());
        match u32::try_from(length) {
            Ok(length) if length != 0 => AddressRange::start_length(self.address, length),
            _ => AddressRange::INVALID,
        }
    }

    pub(crate) fn footprint(&self) -> Footprint {
        Footprint {
            address: self.address,
            row_bytes: self.row_bytes(),
            rows: self.height,
        }
    }

    /// Same storage shape: interchangeable images.
    pub(crate) fn same_shape(&self, other: &SurfaceDesc) -> bool {
        self.kind == other.kind
            && self.format == other.format
            && self.width == other.width
            && self.height == other.height
    }
}

/// A region to copy in from an older surface the first time this one is read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredCopy {
    pub src: SurfaceId,
    pub src_rect: Rect,
    pub dst_rect: Rect,
}

#[derive(Debug)]
pub struct Surface<I> {
    pub(crate) desc: SurfaceDesc,
    pub(crate) image: I,
    pub(crate) old_contents: Vec<DeferredCopy>,
    /// Contents must be loaded from guest memory before first use.
    pub(crate) needs_load: bool,
    pub(crate) last_use_tag: u64,
    pub(crate) write_tag: u64,
    memory_tags: Vec<(u32, u64)>,
    /// Deferred copies in other surfaces that read from this one.
    pub(crate) pending_refs: u32,
    /// Frame the surface was evicted into the reuse pool.
    pub(crate) invalidated_frame: Option<u64>,
}

impl<I: Copy> Surface<I> {
    pub(crate) fn new(desc: SurfaceDesc, image: I) -> Self {
        Self {
            desc,
            image,
            old_contents: Vec::new(),
            needs_load: true,
            last_use_tag: 0,
            write_tag: 0,
            memory_tags: Vec::new(),
            pending_refs: 0,
            invalidated_frame: None,
        }
    }

    pub fn desc(&self) -> &SurfaceDesc {
        &self.desc
    }

    pub fn image(&self) -> I {
        self.image
    }

    pub fn memory_range(&self) -> AddressRange {
        self.desc.memory_range()
    }

    pub fn old_contents(&self) -> &[DeferredCopy] {
        &self.old_contents
    }

    pub fn needs_load(&self) -> bool {
        self.needs_load
    }

    pub fn write_tag(&self) -> u64 {
        self.write_tag
    }

    pub fn last_use_tag(&self) -> u64 {
        self.last_use_tag
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated_frame.is_some()
    }

    pub fn is_referenced(&self) -> bool {
        self.pending_refs > 0
    }

    fn sample_offsets(&self) -> impl Iterator<Item = u32> {
        let length = self.memory_range().length();
        let last = length.saturating_sub(8);
        let step = length / TAG_SAMPLES;
        (0..TAG_SAMPLES)
            .map(move |i| ((i * step) & !7).min(last))
            .take(if length >= 8 { TAG_SAMPLES as usize } else { 0 })
    }

    /// Samples guest memory so [`Surface::test`] can tell whether it changed since.
    pub(crate) fn sync_tag(&mut self, memory: &dyn GuestMemory) {
        let base = self.desc.address;
        let tags = self
            .sample_offsets()
            .filter_map(|offset| read_u64(memory, base + offset).map(|value| (offset, value)))
            .collect();
        self.memory_tags = tags;
    }

    /// False if guest memory under the surface changed since the last [`Surface::sync_tag`].
    pub(crate) fn test(&self, memory: &dyn GuestMemory) -> bool {
        let base = self.desc.address;
        self.memory_tags
            .iter()
            .all(|&(offset, value)| read_u64(memory, base + offset) == Some(value))
    }
}

fn read_u64(memory: &dyn GuestMemory, addr: u32) -> Option<u64> {
    let mut bytes = [0u8; 8];
    memory.read(addr, &mut bytes).ok()?;
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use surfcache_mem::SparseGuestMemory;

    use super::*;

    fn desc() -> SurfaceDesc {
        SurfaceDesc {
            kind: SurfaceKind::Color,
            address: 0x1000,
            format: TextureFormat::A8R8G8B8,
            width: 16,
            height: 4,
            pitch: 128,
        }
    }

    #[test]
    fn memory_range_ends_at_last_texel() {
        assert_eq!(
            desc().memory_range(),
            AddressRange::start_length(0x1000, 3 * 128 + 64)
        );
        assert!(desc().is_valid());
        assert!(!SurfaceDesc { pitch: 32, ..desc() }.is_valid());
    }

    #[test]
    fn memory_tags_detect_cpu_writes() {
        let memory = SparseGuestMemory::new(1 << 20);
        let mut surface = Surface::new(desc(), 0u32);
        surface.sync_tag(&memory);
        assert!(surface.test(&memory));

        memory.write(0x1000, &[1; 8]).unwrap();
        assert!(!surface.test(&memory));
        surface.sync_tag(&memory);
        assert!(surface.test(&memory));
    }
}
