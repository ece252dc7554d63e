//! The fault contract between guest memory and the cache.
//!
//! A guest store to a page that is not writable (or a load from a no-access page) raises a
//! fault. The handler gets a chance to resolve it, typically by flushing and unprotecting the
//! cached sections covering the page. The access is retried iff the handler reports it handled
//! the violation; otherwise it surfaces as a genuine guest fault.

use std::sync::Arc;

use tracing::trace;

use crate::guest::{GuestMemory, GuestMemoryError};
use crate::protect::ProtectionMap;
use crate::range::AddressRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

pub trait FaultHandler {
    /// Returns true when the violation was resolved and the access should be retried.
    fn on_fault(&self, addr: u32, access: AccessKind) -> bool;
}

impl<T: FaultHandler + ?Sized> FaultHandler for Arc<T> {
    fn on_fault(&self, addr: u32, access: AccessKind) -> bool {
        (**self).on_fault(addr, access)
    }
}

/// A handler that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaultHandler;

impl FaultHandler for NoFaultHandler {
    fn on_fault(&self, _addr: u32, _access: AccessKind) -> bool {
        false
    }
}

/// Guest-visible view of memory: every access checks the [`ProtectionMap`].
pub struct TrappedGuestMemory<M: GuestMemory> {
    protection: Arc<ProtectionMap>,
    memory: Arc<M>,
    max_retries: u32,
}

impl<M: GuestMemory> TrappedGuestMemory<M> {
    pub fn new(protection: Arc<ProtectionMap>, memory: Arc<M>) -> Self {
        Self {
            protection,
            memory,
            max_retries: 4,
        }
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.memory
    }

    pub fn protection(&self) -> &Arc<ProtectionMap> {
        &self.protection
    }

    pub fn read(
        &self,
        addr: u32,
        dst: &mut [u8],
        handler: &dyn FaultHandler,
    ) -> Result<(), GuestMemoryError> {
        self.resolve(addr, dst.len(), AccessKind::Read, handler)?;
        self.memory.read(addr, dst)
    }

    pub fn write(
        &self,
        addr: u32,
        src: &[u8],
        handler: &dyn FaultHandler,
    ) -> Result<(), GuestMemoryError> {
        self.resolve(addr, src.len(), AccessKind::Write, handler)?;
        self.memory.write(addr, src)
    }

    fn resolve(
        &self,
        addr: u32,
        len: usize,
        access: AccessKind,
        handler: &dyn FaultHandler,
    ) -> Result<(), GuestMemoryError> {
        let Ok(len32) = u32::try_from(len) else {
            return Err(GuestMemoryError::OutOfBounds { addr, len });
        };
        let range = AddressRange::start_length(addr, len32);
        if !range.valid() {
            // Zero-length accesses never fault.
            return if len == 0 {
                Ok(())
            } else {
                Err(GuestMemoryError::OutOfBounds { addr, len })
            };
        }

        let write = access == AccessKind::Write;
        // Retries are counted per fault address; the count resets once the first violation moves
        // past the last one, so an access spanning many sections is bounded by its own length.
        let mut last_fault = None;
        let mut retries = 0;
        while let Some(fault_addr) = self.protection.first_violation(range, write) {
            trace!(fault_addr, ?access, "guest access violation");
            match last_fault {
                Some(last) if fault_addr <= last => {}
                _ => retries = 0,
            }
            // A handler that claims success without lifting the trap would loop forever.
            if retries == self.max_retries || !handler.on_fault(fault_addr, access) {
                return Err(GuestMemoryError::GuestFault {
                    addr: fault_addr,
                    access,
                });
            }
            last_fault = Some(fault_addr);
            retries += 1;
        }
        Ok(())
    }
}
