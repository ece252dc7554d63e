//! Guest memory abstraction consumed by the cache.
//!
//! Accesses through [`GuestMemory`] are privileged: they bypass page protection. The cache uses
//! them to upload textures and to write flushed GPU data back. Guest-visible accesses that must
//! respect protection go through [`crate::fault::TrappedGuestMemory`].

use spin::RwLock;
use thiserror::Error;

use crate::fault::AccessKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of bounds: addr=0x{addr:08x}, len=0x{len:x}")]
    OutOfBounds { addr: u32, len: usize },

    #[error("unhandled guest {access:?} fault at 0x{addr:08x}")]
    GuestFault { addr: u32, access: AccessKind },
}

/// Minimal guest memory interface.
pub trait GuestMemory: Send + Sync {
    fn read(&self, addr: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
    fn write(&self, addr: u32, src: &[u8]) -> Result<(), GuestMemoryError>;

    fn read_u64(&self, addr: u32) -> Result<u64, GuestMemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for std::sync::Arc<T> {
    fn read(&self, addr: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        (**self).read(addr, dst)
    }

    fn write(&self, addr: u32, src: &[u8]) -> Result<(), GuestMemoryError> {
        (**self).write(addr, src)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseGuestMemoryOptions {
    /// Backing allocation granularity. Must be a non-zero power of two.
    pub chunk_size: usize,
}

impl Default for SparseGuestMemoryOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
        }
    }
}

/// Sparse guest RAM. Chunks are allocated on first write; unallocated chunks read as zero.
pub struct SparseGuestMemory {
    size: u64,
    chunk_shift: u32,
    chunks: RwLock<Vec<Option<Box<[u8]>>>>,
}

impl SparseGuestMemory {
    pub fn new(size: u64) -> Self {
        Self::with_options(size, SparseGuestMemoryOptions::default())
    }

    pub fn with_options(size: u64, options: SparseGuestMemoryOptions) -> Self {
        assert!(
            options.chunk_size.is_power_of_two(),
            "chunk_size must be a power of two"
        );
        assert!(size <= 1 << 32, "guest memory is limited to 4 GiB");
        let chunk_size = options.chunk_size as u64;
        let chunk_count = size.div_ceil(chunk_size) as usize;
        Self {
            size,
            chunk_shift: options.chunk_size.trailing_zeros(),
            chunks: RwLock::new(vec![None; chunk_count]),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn chunk_size(&self) -> usize {
        1 << self.chunk_shift
    }

    /// Number of chunks with backing storage.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.read().iter().filter(|c| c.is_some()).count()
    }

    fn check(&self, addr: u32, len: usize) -> Result<(), GuestMemoryError> {
        let end = u64::from(addr) + len as u64;
        if end > self.size {
            return Err(GuestMemoryError::OutOfBounds { addr, len });
        }
        Ok(())
    }

    /// Splits `[addr, addr+len)` into `(chunk index, offset in chunk, offset in buffer, len)`.
    fn spans(&self, addr: u32, len: usize) -> impl Iterator<Item = (usize, usize, usize, usize)> {
        let chunk_size = self.chunk_size();
        let shift = self.chunk_shift;
        let mut cursor = addr as u64;
        let end = addr as u64 + len as u64;
        core::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let chunk = (cursor >> shift) as usize;
            let offset = (cursor as usize) & (chunk_size - 1);
            let take = (chunk_size - offset).min((end - cursor) as usize);
            let buf_off = (cursor - addr as u64) as usize;
            cursor += take as u64;
            Some((chunk, offset, buf_off, take))
        })
    }
}

impl core::fmt::Debug for SparseGuestMemory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SparseGuestMemory")
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size())
            .field("allocated_chunks", &self.allocated_chunks())
            .finish()
    }
}

impl GuestMemory for SparseGuestMemory {
    fn read(&self, addr: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        self.check(addr, dst.len())?;
        let chunks = self.chunks.read();
        for (chunk, offset, buf_off, len) in self.spans(addr, dst.len()) {
            let out = &mut dst[buf_off..buf_off + len];
            match &chunks[chunk] {
                Some(data) => out.copy_from_slice(&data[offset..offset + len]),
                None => out.fill(0),
            }
        }
        Ok(())
    }

    fn write(&self, addr: u32, src: &[u8]) -> Result<(), GuestMemoryError> {
        self.check(addr, src.len())?;
        let chunk_size = self.chunk_size();
        let mut chunks = self.chunks.write();
        for (chunk, offset, buf_off, len) in self.spans(addr, src.len()) {
            let data = chunks[chunk].get_or_insert_with(|| vec![0u8; chunk_size].into_boxed_slice());
            data[offset..offset + len].copy_from_slice(&src[buf_off..buf_off + len]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unallocated_reads_are_zero() {
        let mem = SparseGuestMemory::new(1 << 20);
        let mut buf = [0xffu8; 16];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(mem.allocated_chunks(), 0);
    }

    #[test]
    fn writes_span_chunks() {
        let mem = SparseGuestMemory::with_options(1 << 20, SparseGuestMemoryOptions { chunk_size: 256 });
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        mem.write(200, &data).unwrap();
        assert_eq!(mem.allocated_chunks(), 4);

        let mut back = vec![0u8; 600];
        mem.read(200, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mem = SparseGuestMemory::new(0x1000);
        let err = mem.write(0xffc, &[0u8; 8]).unwrap_err();
        assert_eq!(err, GuestMemoryError::OutOfBounds { addr: 0xffc, len: 8 });
    }
}
