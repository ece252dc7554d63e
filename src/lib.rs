//! Guest-memory-coherent texture and surface cache.
//!
//! Re-exports the two workspace crates: [`mem`] (address ranges, page protection, guest memory
//! and the fault contract) and [`core`] (the cache itself).

pub use surfcache_core as core;
pub use surfcache_mem as mem;

pub use surfcache_core::{
    Backend, BackendError, CacheConfig, CacheError, CacheStats, InvalidationCause, SampledImage,
    SoftwareBackend, SurfaceStore, TextureCache, TextureDescriptor, TextureFormat, ThrashedSet,
};
pub use surfcache_mem::{
    AccessKind, AddressRange, FaultHandler, GuestMemory, Protection, ProtectionMap,
    SparseGuestMemory, TrappedGuestMemory,
};
