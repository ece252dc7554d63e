//! 2D overlap arithmetic for pitched regions of guest memory.

use crate::types::{Rect, TextureFormat};

use super::target::SurfaceId;

/// Where a pitched 2D region sits in guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Footprint {
    pub address: u32,
    pub row_bytes: u32,
    pub rows: u32,
}

/// Overlap of two footprints sharing `pitch`, as byte rects relative to `a` and to `b`.
pub(crate) fn intersect(a: Footprint, b: Footprint, pitch: u32) -> Option<(Rect, Rect)> {
    if pitch == 0 {
        return None;
    }
    let base = a.address.min(b.address);
    let place = |f: Footprint| {
        let offset = f.address - base;
        Rect::new(offset % pitch, offset / pitch, f.row_bytes, f.rows)
    };
    let ra = place(a);
    let rb = place(b);

    let x0 = ra.x.max(rb.x);
    let y0 = ra.y.max(rb.y);
    let x1 = ra.right().min(rb.right());
    let y1 = ra.bottom().min(rb.bottom());
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    let size = (x1 - x0, y1 - y0);
    Some((
        Rect::new(x0 - ra.x, y0 - ra.y, size.0, size.1),
        Rect::new(x0 - rb.x, y0 - rb.y, size.0, size.1),
    ))
}

/// Converts a byte rect to texels, or `None` if it splits a texel.
pub(crate) fn to_texels(bytes: Rect, bpp: u8) -> Option<Rect> {
    let bpp = u32::from(bpp);
    if bpp == 0 || bytes.x % bpp != 0 || bytes.width % bpp != 0 {
        return None;
    }
    Some(Rect::new(bytes.x / bpp, bytes.y, bytes.width / bpp, bytes.height))
}

/// One surface contributing to a sampled region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceOverlap<I> {
    pub surface: SurfaceId,
    pub image: I,
    pub format: TextureFormat,
    /// Texels of the surface to read.
    pub src_rect: Rect,
    /// Where they land in the sampled region.
    pub dst_rect: Rect,
    pub write_tag: u64,
}

/// Whether `rects` together cover every texel of a `width` x `height` region.
pub fn covers(rects: &[Rect], width: u32, height: u32) -> bool {
    let mut edges: Vec<u32> = rects
        .iter()
        .flat_map(|r| [r.y.min(height), r.bottom().min(height)])
        .chain([0, height])
        .collect();
    edges.sort_unstable();
    edges.dedup();

    edges.windows(2).all(|band| {
        let (top, bottom) = (band[0], band[1]);
        let mut spans: Vec<(u32, u32)> = rects
            .iter()
            .filter(|r| r.y <= top && r.bottom() >= bottom && !r.is_empty())
            .map(|r| (r.x, r.right()))
            .collect();
        spans.sort_unstable();

        let mut reached = 0;
        for (start, end) in spans {
            if start > reached {
                break;
            }
            reached = reached.max(end);
        }
        reached >= width
    })
}
