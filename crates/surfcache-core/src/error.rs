use surfcache_mem::GuestMemoryError;
use thiserror::Error;

use crate::types::TextureFormat;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("host image allocation failed ({bytes} bytes)")]
    OutOfMemory { bytes: u64 },

    #[error("unknown host image")]
    UnknownImage,

    #[error("format mismatch: {src:?} -> {dst:?}")]
    FormatMismatch { src: TextureFormat, dst: TextureFormat },

    #[error("invalid image region: {0}")]
    InvalidRegion(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    GuestMemory(#[from] GuestMemoryError),

    #[error("invalid texture descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unknown surface")]
    UnknownSurface,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T, E = CacheError> = core::result::Result<T, E>;
