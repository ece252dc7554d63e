//! Guest memory plumbing for the surface cache: address ranges, page protection, sparse guest
//! RAM and the write-fault contract.

pub mod fault;
pub mod guest;
pub mod protect;
pub mod range;

pub use fault::{AccessKind, FaultHandler, NoFaultHandler, TrappedGuestMemory};
pub use guest::{GuestMemory, GuestMemoryError, SparseGuestMemory, SparseGuestMemoryOptions};
pub use protect::{PageProtector, Protection, ProtectionMap};
pub use range::{
    is_page_aligned, page_end, page_start, AddressRange, AddressRangeVector, PAGE_SIZE,
};
