use surfcache_mem::AddressRange;

/// Why a section exists. Decides predictor tracking and dirty-flag side effects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UploadContext {
    /// CPU-uploaded texture sampled by shaders.
    #[default]
    ShaderRead,
    /// Source of a GPU blit.
    BlitSrc,
    /// Destination of a GPU blit; holds GPU-authoritative data.
    BlitDst,
    /// Memory backing a render target.
    Framebuffer,
    /// Image-less section tracking a DMA transfer.
    Dma,
}

impl UploadContext {
    pub const fn is_gpu_written(self) -> bool {
        matches!(
            self,
            UploadContext::BlitDst | UploadContext::Framebuffer | UploadContext::Dma
        )
    }
}

/// Which view of a section's memory an overlap test uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SectionBounds {
    /// The exact CPU range of the section.
    Full,
    /// The page-aligned range the section protects.
    #[default]
    Locked,
    /// The sub-range the GPU is known to have written, falling back to the full range.
    Confirmed,
}

/// How a section's data is read back on flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReadbackBehaviour {
    #[default]
    FlushOnce,
    /// Written back on every flush request; never fed to the predictor.
    FlushAlways,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvalidationCause {
    Read,
    DeferredRead,
    Write,
    DeferredWrite,
    /// Memory is being unmapped; contents are not needed.
    Unmap,
    /// Protection is being changed by the guest; contents are not needed.
    Reprotect,
    /// A framebuffer is about to overwrite the memory.
    SupersededByFbo,
    /// A framebuffer now owns the memory.
    CommittedAsFbo,
}

impl InvalidationCause {
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::DeferredRead)
    }

    pub const fn deferred_flush(self) -> bool {
        matches!(self, Self::DeferredRead | Self::DeferredWrite)
    }

    /// Causes whose fault range keeps its current protection after invalidation.
    pub const fn keep_fault_range_protection(self) -> bool {
        matches!(self, Self::Unmap | Self::Reprotect | Self::SupersededByFbo)
    }

    pub const fn skip_fbos(self) -> bool {
        matches!(self, Self::SupersededByFbo | Self::CommittedAsFbo)
    }

    pub const fn skip_flush(self, strict_texture_flushing: bool) -> bool {
        matches!(self, Self::Unmap)
            || (!strict_texture_flushing && matches!(self, Self::SupersededByFbo))
    }

    pub const fn undefer(self) -> Self {
        match self {
            Self::DeferredRead => Self::Read,
            Self::DeferredWrite => Self::Write,
            other => other,
        }
    }

    pub const fn defer(self) -> Self {
        match self {
            Self::Read => Self::DeferredRead,
            Self::Write => Self::DeferredWrite,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FormatClass {
    Color,
    Depth16,
    Depth24Stencil8,
}

impl FormatClass {
    pub const fn is_depth(self) -> bool {
        !matches!(self, FormatClass::Color)
    }
}

/// A guest texture format, reduced to what the cache needs: identity, texel size and aspect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TextureFormat {
    pub code: u32,
    pub bpp: u8,
    pub class: FormatClass,
}

impl TextureFormat {
    pub const B8: Self = Self::color(0x81, 1);
    pub const R5G6B5: Self = Self::color(0x84, 2);
    pub const A8R8G8B8: Self = Self::color(0x85, 4);
    pub const DEPTH24_D8: Self = Self {
        code: 0x90,
        bpp: 4,
        class: FormatClass::Depth24Stencil8,
    };
    pub const DEPTH16: Self = Self {
        code: 0x92,
        bpp: 2,
        class: FormatClass::Depth16,
    };

    pub const fn color(code: u32, bpp: u8) -> Self {
        Self {
            code,
            bpp,
            class: FormatClass::Color,
        }
    }

    pub const fn is_depth(&self) -> bool {
        self.class.is_depth()
    }

    /// Whether data in `self` can be copied into `other` without an aspect conversion.
    pub fn is_compatible(&self, other: &TextureFormat) -> bool {
        self.bpp == other.bpp && self.class.is_depth() == other.class.is_depth()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ImageDimension {
    D1,
    #[default]
    D2,
    D3,
    Cubemap,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.right() <= width && self.bottom() <= height
    }
}

/// Everything needed to allocate a host image. Also the key of the image reuse pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mipmaps: u32,
    pub format: TextureFormat,
    pub dimension: ImageDimension,
}

impl ImageDesc {
    pub const fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mipmaps: 1,
            format,
            dimension: ImageDimension::D2,
        }
    }

    /// Tightly packed size of the base level, all layers.
    pub fn base_level_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.depth.max(1))
            * u64::from(self.format.bpp)
    }
}

/// Guest-side layout of a section's memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SectionAttributes {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mipmaps: u32,
    /// Guest row pitch in bytes.
    pub pitch: u32,
}

/// A texture as the command processor describes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub address: u32,
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Slices for 3D textures, faces for cubemaps.
    pub depth: u32,
    pub mipmaps: u32,
    /// Guest row pitch in bytes; zero means tightly packed.
    pub pitch: u32,
    pub dimension: ImageDimension,
}

impl TextureDescriptor {
    pub const fn new_2d(address: u32, width: u32, height: u32, pitch: u32, format: TextureFormat) -> Self {
        Self {
            address,
            format,
            width,
            height,
            depth: 1,
            mipmaps: 1,
            pitch,
            dimension: ImageDimension::D2,
        }
    }

    pub fn row_pitch(&self) -> u32 {
        if self.pitch != 0 {
            self.pitch
        } else {
            self.width * u32::from(self.format.bpp)
        }
    }

    /// Bytes of guest memory backing the base level (all layers).
    pub fn base_level_length(&self) -> u64 {
        u64::from(self.row_pitch()) * u64::from(self.height) * u64::from(self.depth.max(1))
    }

    /// Guest memory covered by the texture. Mip levels after the base are tightly packed.
    pub fn memory_range(&self) -> AddressRange {
        let bpp = u64::from(self.format.bpp);
        let layers = u64::from(self.depth.max(1));
        let mut length = self.base_level_length();
        for level in 1..self.mipmaps.max(1) {
            let w = u64::from((self.width >> level).max(1));
            let h = u64::from((self.height >> level).max(1));
            length += w * h * bpp * layers;
        }
        match u32::try_from(length) {
            Ok(length) => AddressRange::start_length(self.address, length),
            Err(_) => AddressRange::INVALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width != 0
            && self.height != 0
            && self.format.bpp != 0
            && (self.pitch == 0 || self.pitch >= self.width * u32::from(self.format.bpp))
            && self.memory_range().valid()
    }

    pub fn image_desc(&self) -> ImageDesc {
        ImageDesc {
            width: self.width,
            height: self.height,
            depth: self.depth.max(1),
            mipmaps: self.mipmaps.max(1),
            format: self.format,
            dimension: self.dimension,
        }
    }

    pub fn attributes(&self) -> SectionAttributes {
        SectionAttributes {
            width: self.width,
            height: self.height,
            depth: self.depth.max(1),
            mipmaps: self.mipmaps.max(1),
            pitch: self.row_pitch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_predicates() {
        use InvalidationCause::*;
        assert!(Read.is_read() && DeferredRead.is_read() && !Write.is_read());
        assert_eq!(Read.defer(), DeferredRead);
        assert_eq!(DeferredWrite.undefer(), Write);
        assert_eq!(Unmap.defer(), Unmap);
        assert!(Unmap.skip_flush(true));
        assert!(SupersededByFbo.skip_flush(false));
        assert!(!SupersededByFbo.skip_flush(true));
        assert!(CommittedAsFbo.skip_fbos() && !CommittedAsFbo.keep_fault_range_protection());
    }

    #[test]
    fn descriptor_memory_range_includes_mips() {
        let mut desc = TextureDescriptor::new_2d(0x1000, 16, 16, 0, TextureFormat::A8R8G8B8);
        assert_eq!(desc.memory_range(), AddressRange::start_length(0x1000, 16 * 16 * 4));

        desc.mipmaps = 3;
        // 16x16 + 8x8 + 4x4 texels.
        assert_eq!(desc.memory_range().length(), (256 + 64 + 16) * 4);
    }

    #[test]
    fn descriptor_honours_guest_pitch() {
        let desc = TextureDescriptor::new_2d(0x100000, 256, 256, 1024, TextureFormat::A8R8G8B8);
        assert!(desc.is_valid());
        assert_eq!(desc.memory_range().end, 0x100000 + 256 * 1024 - 1);

        let narrow = TextureDescriptor::new_2d(0, 256, 1, 16, TextureFormat::A8R8G8B8);
        assert!(!narrow.is_valid());
    }
}
