//! Host page protection as seen by the cache.
//!
//! The cache never talks to `mprotect`/`VirtualProtect` directly; it asks a [`PageProtector`]
//! to change the protection of page-aligned ranges. [`ProtectionMap`] is a software page table
//! implementing that contract, used both by the software backend and by the fault harness in
//! [`crate::fault`].

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::range::{AddressRange, PAGE_SIZE};

/// Page protection used as a write/read trap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protection {
    /// No trap.
    #[default]
    ReadWrite,
    /// Writes trap.
    ReadOnly,
    /// Reads and writes trap.
    NoAccess,
}

impl Protection {
    pub const fn allows_read(self) -> bool {
        !matches!(self, Protection::NoAccess)
    }

    pub const fn allows_write(self) -> bool {
        matches!(self, Protection::ReadWrite)
    }

    pub const fn short_name(self) -> &'static str {
        match self {
            Protection::ReadWrite => "rw",
            Protection::ReadOnly => "ro",
            Protection::NoAccess => "na",
        }
    }
}

/// Something that can change host page protection for a page-aligned range.
pub trait PageProtector: Send + Sync {
    fn protect(&self, range: AddressRange, protection: Protection);
}

impl<T: PageProtector + ?Sized> PageProtector for std::sync::Arc<T> {
    fn protect(&self, range: AddressRange, protection: Protection) {
        (**self).protect(range, protection)
    }
}

const PAGE_COUNT: usize = 1 << 20;

/// Software page table covering the full 32-bit space.
///
/// One byte per page (1 MiB total). Every `protect` call is counted so tests can assert on
/// batching.
pub struct ProtectionMap {
    pages: Mutex<Vec<Protection>>,
    calls: AtomicU64,
}

impl ProtectionMap {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(vec![Protection::ReadWrite; PAGE_COUNT]),
            calls: AtomicU64::new(0),
        }
    }

    pub fn protection(&self, addr: u32) -> Protection {
        self.pages.lock()[(addr / PAGE_SIZE) as usize]
    }

    /// Returns the first page in `range` that does not permit `write`/read access, if any.
    pub fn first_violation(&self, range: AddressRange, write: bool) -> Option<u32> {
        if !range.valid() {
            return None;
        }
        let pages = self.pages.lock();
        (range.first_page()..=range.last_page()).find_map(|page| {
            let prot = pages[page as usize];
            let ok = if write {
                prot.allows_write()
            } else {
                prot.allows_read()
            };
            // Report the faulting byte, not the page base, for the first page.
            (!ok).then(|| (page * PAGE_SIZE).max(range.start))
        })
    }

    /// Number of `protect` calls made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Protection of every page in `range`, in address order.
    pub fn pages(&self, range: AddressRange) -> Vec<Protection> {
        if !range.valid() {
            return Vec::new();
        }
        let pages = self.pages.lock();
        pages[range.first_page() as usize..=range.last_page() as usize].to_vec()
    }

    /// Non-RW pages as `(page index, protection)`, sorted.
    pub fn snapshot(&self) -> Vec<(u32, Protection)> {
        let pages = self.pages.lock();
        pages
            .iter()
            .enumerate()
            .filter(|(_, p)| **p != Protection::ReadWrite)
            .map(|(i, p)| (i as u32, *p))
            .collect()
    }

    /// Drops all traps without counting a call.
    pub fn clear(&self) {
        self.pages.lock().fill(Protection::ReadWrite);
    }
}

impl Default for ProtectionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ProtectionMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProtectionMap")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl PageProtector for ProtectionMap {
    fn protect(&self, range: AddressRange, protection: Protection) {
        debug_assert!(range.is_page_range(), "unaligned protect {range}");
        if !range.valid() {
            return;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.pages.lock();
        pages[range.first_page() as usize..=range.last_page() as usize].fill(protection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_and_query_pages() {
        let map = ProtectionMap::new();
        map.protect(AddressRange::start_end(0x2000, 0x3fff), Protection::ReadOnly);
        assert_eq!(map.protection(0x1fff), Protection::ReadWrite);
        assert_eq!(map.protection(0x2000), Protection::ReadOnly);
        assert_eq!(map.protection(0x3fff), Protection::ReadOnly);
        assert_eq!(map.calls(), 1);
        assert_eq!(
            map.snapshot(),
            vec![(2, Protection::ReadOnly), (3, Protection::ReadOnly)]
        );
    }

    #[test]
    fn violations_respect_access_kind() {
        let map = ProtectionMap::new();
        map.protect(AddressRange::start_end(0x1000, 0x1fff), Protection::ReadOnly);
        let r = AddressRange::start_length(0x1500, 4);
        assert_eq!(map.first_violation(r, false), None);
        assert_eq!(map.first_violation(r, true), Some(0x1500));

        map.protect(AddressRange::start_end(0x2000, 0x2fff), Protection::NoAccess);
        let spanning = AddressRange::start_length(0x1ffe, 4);
        assert_eq!(map.first_violation(spanning, false), Some(0x2000));
    }
}
