//! Texture and render-target cache kept coherent with guest memory through page protection.
//!
//! [`TextureCache`] tracks every host image backed by guest memory as a [`CachedSection`] in a
//! block-partitioned [`RangedStorage`]. Sections protect their memory read-only (CPU-uploaded
//! data) or no-access (GPU-written data); a guest access that trips the protection reaches the
//! cache through [`surfcache_mem::FaultHandler`] and is resolved by the invalidation engine.
//! [`SurfaceStore`] owns render targets and feeds their memory to the cache.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod invalidate;
pub mod pool;
pub mod predictor;
pub mod section;
pub mod stats;
pub mod storage;
pub mod surface;
pub mod types;

pub use backend::{Backend, ImageHandle, SoftwareBackend, SoftwareBackendCounters};
pub use cache::{BlitOutcome, BlitSurface, SampledImage, SampledSource, SectionInfo, TextureCache};
pub use config::{CacheConfig, PredictorConfig, SurfaceStoreConfig};
pub use error::{BackendError, CacheError, Result};
pub use invalidate::ThrashedSet;
pub use predictor::{Predictor, PredictorEntry, PredictorKey};
pub use section::CachedSection;
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use storage::{BlockCounters, RangedStorage, SectionHandle, SectionId};
pub use surface::{
    BoundSurfaces, RenderTargetSetup, Surface, SurfaceDesc, SurfaceId, SurfaceKind, SurfaceOverlap,
    SurfaceStore, TargetBinding,
};
pub use types::{
    FormatClass, ImageDesc, ImageDimension, InvalidationCause, ReadbackBehaviour, Rect,
    SectionAttributes, SectionBounds, TextureDescriptor, TextureFormat, UploadContext,
};
