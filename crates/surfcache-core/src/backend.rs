//! Host GPU interface consumed by the cache, plus a software implementation.

use core::fmt::Debug;
use core::hash::Hash;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;
use surfcache_mem::{AddressRange, PageProtector, Protection, ProtectionMap};

use crate::error::BackendError;
use crate::types::{ImageDesc, Rect};

/// Alignment of readback rows, matching what GPU copy engines typically require.
pub const READBACK_ROW_ALIGNMENT: u32 = 256;

/// Host-side resource operations.
///
/// Everything takes `&self`: the fault path calls `protect` and `readback_image` while the
/// command path may be mid-upload, so implementations synchronize internally.
pub trait Backend: PageProtector {
    /// Opaque host image handle.
    type Image: Copy + Eq + Hash + Debug + Send + Sync;

    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image, BackendError>;
    fn destroy_image(&self, image: Self::Image);

    /// Writes the base level. `row_pitch` is the byte stride between rows of `data`.
    fn upload_image(
        &self,
        image: Self::Image,
        data: &[u8],
        row_pitch: u32,
    ) -> Result<(), BackendError>;

    /// Copies `region` of the base level into `dst`. Returns the host row pitch of `dst`.
    fn readback_image(
        &self,
        image: Self::Image,
        region: Rect,
        dst: &mut Vec<u8>,
    ) -> Result<u32, BackendError>;

    /// Scaled copy between images of compatible formats.
    fn blit(
        &self,
        src: Self::Image,
        src_rect: Rect,
        dst: Self::Image,
        dst_rect: Rect,
    ) -> Result<(), BackendError>;

    fn image_desc(&self, image: Self::Image) -> Option<ImageDesc>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub u32);

struct SoftImage {
    desc: ImageDesc,
    /// Base level, tightly packed.
    data: Vec<u8>,
}

impl SoftImage {
    fn row_bytes(&self) -> usize {
        self.desc.width as usize * usize::from(self.desc.format.bpp)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareBackendCounters {
    pub images_created: u64,
    pub images_destroyed: u64,
    pub uploads: u64,
    pub readbacks: u64,
    pub blits: u64,
}

/// In-process backend whose images are plain byte arrays.
pub struct SoftwareBackend {
    images: Mutex<HashMap<u32, SoftImage>>,
    next_id: AtomicU32,
    protection: Arc<ProtectionMap>,
    fail_next_allocation: AtomicBool,
    images_created: AtomicU64,
    images_destroyed: AtomicU64,
    uploads: AtomicU64,
    readbacks: AtomicU64,
    blits: AtomicU64,
}

impl SoftwareBackend {
    pub fn new(protection: Arc<ProtectionMap>) -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            protection,
            fail_next_allocation: AtomicBool::new(false),
            images_created: AtomicU64::new(0),
            images_destroyed: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            readbacks: AtomicU64::new(0),
            blits: AtomicU64::new(0),
        }
    }

    pub fn protection(&self) -> &Arc<ProtectionMap> {
        &self.protection
    }

    /// Makes the next `create_image` fail with `OutOfMemory`.
    pub fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::Relaxed);
    }

    pub fn live_images(&self) -> usize {
        self.images.lock().len()
    }

    pub fn counters(&self) -> SoftwareBackendCounters {
        SoftwareBackendCounters {
            images_created: self.images_created.load(Ordering::Relaxed),
            images_destroyed: self.images_destroyed.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            readbacks: self.readbacks.load(Ordering::Relaxed),
            blits: self.blits.load(Ordering::Relaxed),
        }
    }

    /// Tightly packed copy of an image's base level.
    pub fn image_data(&self, image: ImageHandle) -> Option<Vec<u8>> {
        self.images.lock().get(&image.0).map(|img| img.data.clone())
    }

    /// Overwrites an image's base level, simulating a GPU render into it.
    pub fn fill_image(&self, image: ImageHandle, data: &[u8]) -> Result<(), BackendError> {
        let mut images = self.images.lock();
        let img = images.get_mut(&image.0).ok_or(BackendError::UnknownImage)?;
        if data.len() != img.data.len() {
            return Err(BackendError::InvalidRegion(format!(
                "fill of {} bytes into a {} byte image",
                data.len(),
                img.data.len()
            )));
        }
        img.data.copy_from_slice(data);
        Ok(())
    }
}

impl Debug for SoftwareBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("live_images", &self.live_images())
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

impl PageProtector for SoftwareBackend {
    fn protect(&self, range: AddressRange, protection: Protection) {
        self.protection.protect(range, protection);
    }
}

fn check_rect(rect: &Rect, desc: &ImageDesc) -> Result<(), BackendError> {
    if rect.is_empty() || !rect.fits_within(desc.width, desc.height) {
        return Err(BackendError::InvalidRegion(format!(
            "{rect:?} outside {}x{}",
            desc.width, desc.height
        )));
    }
    Ok(())
}

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    value.div_ceil(alignment) * alignment
}

impl Backend for SoftwareBackend {
    type Image = ImageHandle;

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageHandle, BackendError> {
        let bytes = desc.base_level_size();
        if self.fail_next_allocation.swap(false, Ordering::Relaxed) {
            return Err(BackendError::OutOfMemory { bytes });
        }
        let len = usize::try_from(bytes).map_err(|_| BackendError::OutOfMemory { bytes })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.images.lock().insert(
            id,
            SoftImage {
                desc: *desc,
                data: vec![0u8; len],
            },
        );
        self.images_created.fetch_add(1, Ordering::Relaxed);
        Ok(ImageHandle(id))
    }

    fn destroy_image(&self, image: ImageHandle) {
        if self.images.lock().remove(&image.0).is_some() {
            self.images_destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn upload_image(
        &self,
        image: ImageHandle,
        data: &[u8],
        row_pitch: u32,
    ) -> Result<(), BackendError> {
        let mut images = self.images.lock();
        let img = images.get_mut(&image.0).ok_or(BackendError::UnknownImage)?;
        let row_bytes = img.row_bytes();
        let row_pitch = row_pitch as usize;
        if row_pitch < row_bytes {
            return Err(BackendError::InvalidRegion(format!(
                "row pitch {row_pitch} smaller than row size {row_bytes}"
            )));
        }

        let rows = img.data.len() / row_bytes.max(1);
        for row in 0..rows {
            let src_off = row * row_pitch;
            if src_off >= data.len() {
                break;
            }
            let len = row_bytes.min(data.len() - src_off);
            let dst_off = row * row_bytes;
            img.data[dst_off..dst_off + len].copy_from_slice(&data[src_off..src_off + len]);
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn readback_image(
        &self,
        image: ImageHandle,
        region: Rect,
        dst: &mut Vec<u8>,
    ) -> Result<u32, BackendError> {
        let images = self.images.lock();
        let img = images.get(&image.0).ok_or(BackendError::UnknownImage)?;
        check_rect(&region, &img.desc)?;

        let bpp = usize::from(img.desc.format.bpp);
        let row_bytes = region.width as usize * bpp;
        let host_pitch = align_up(row_bytes as u32, READBACK_ROW_ALIGNMENT);
        dst.clear();
        dst.resize(host_pitch as usize * region.height as usize, 0);

        let src_pitch = img.row_bytes();
        for row in 0..region.height as usize {
            let src_off = (region.y as usize + row) * src_pitch + region.x as usize * bpp;
            let dst_off = row * host_pitch as usize;
            dst[dst_off..dst_off + row_bytes]
                .copy_from_slice(&img.data[src_off..src_off + row_bytes]);
        }
        self.readbacks.fetch_add(1, Ordering::Relaxed);
        Ok(host_pitch)
    }

    fn blit(
        &self,
        src: ImageHandle,
        src_rect: Rect,
        dst: ImageHandle,
        dst_rect: Rect,
    ) -> Result<(), BackendError> {
        let mut images = self.images.lock();
        let (src_desc, src_data) = {
            let img = images.get(&src.0).ok_or(BackendError::UnknownImage)?;
            check_rect(&src_rect, &img.desc)?;
            // Copy out first; `src` and `dst` may be the same image.
            (img.desc, img.data.clone())
        };
        let dst_img = images.get_mut(&dst.0).ok_or(BackendError::UnknownImage)?;
        check_rect(&dst_rect, &dst_img.desc)?;
        if !src_desc.format.is_compatible(&dst_img.desc.format) {
            return Err(BackendError::FormatMismatch {
                src: src_desc.format,
                dst: dst_img.desc.format,
            });
        }

        let bpp = usize::from(dst_img.desc.format.bpp);
        let src_pitch = src_desc.width as usize * bpp;
        let dst_pitch = dst_img.row_bytes();
        for y in 0..dst_rect.height {
            let sy = src_rect.y + y * src_rect.height / dst_rect.height;
            for x in 0..dst_rect.width {
                let sx = src_rect.x + x * src_rect.width / dst_rect.width;
                let s = sy as usize * src_pitch + sx as usize * bpp;
                let d = (dst_rect.y + y) as usize * dst_pitch + (dst_rect.x + x) as usize * bpp;
                dst_img.data[d..d + bpp].copy_from_slice(&src_data[s..s + bpp]);
            }
        }
        self.blits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn image_desc(&self, image: ImageHandle) -> Option<ImageDesc> {
        self.images.lock().get(&image.0).map(|img| img.desc)
    }
}
