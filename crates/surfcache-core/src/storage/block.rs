use std::collections::BTreeSet;

use bitflags::bitflags;
use surfcache_mem::AddressRange;

use crate::section::{CachedSection, Observed};

/// Stable identity of a section slot: block index plus slot index in that block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId {
    pub block: u32,
    pub slot: u32,
}

/// Generation-checked reference to a section. Stale once the slot is reset or destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectionHandle {
    pub id: SectionId,
    pub generation: u32,
}

bitflags! {
    /// State transitions of a section, computed from its state before and after a mutation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct Edges: u8 {
        const CREATED = 1 << 0;
        const DESTROYED = 1 << 1;
        const PROTECTED = 1 << 2;
        const UNPROTECTED = 1 << 3;
        const UNRELEASED = 1 << 4;
        const RELEASED = 1 << 5;
        const RANGE_VALID = 1 << 6;
        const RANGE_INVALID = 1 << 7;
    }
}

impl Edges {
    pub(crate) fn between(before: &Observed, after: &Observed) -> Self {
        let mut edges = Edges::empty();
        let mut edge = |was: bool, is: bool, on: Edges, off: Edges| {
            if !was && is {
                edges |= on;
            } else if was && !is {
                edges |= off;
            }
        };
        edge(before.exists, after.exists, Edges::CREATED, Edges::DESTROYED);
        edge(before.locked, after.locked, Edges::PROTECTED, Edges::UNPROTECTED);
        edge(
            before.unreleased,
            after.unreleased,
            Edges::UNRELEASED,
            Edges::RELEASED,
        );
        edge(before.valid, after.valid, Edges::RANGE_VALID, Edges::RANGE_INVALID);
        edges
    }
}

/// Per-block section counts. Kept in sync with the sections by the storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockCounters {
    pub valid: u32,
    pub exists: u32,
    pub locked: u32,
    pub unreleased: u32,
}

impl BlockCounters {
    pub(crate) fn apply(&mut self, edges: Edges) {
        fn step(counter: &mut u32, up: bool, down: bool) {
            if up {
                *counter += 1;
            }
            if down {
                debug_assert!(*counter > 0, "block counter underflow");
                *counter -= 1;
            }
        }
        step(
            &mut self.valid,
            edges.contains(Edges::RANGE_VALID),
            edges.contains(Edges::RANGE_INVALID),
        );
        step(
            &mut self.exists,
            edges.contains(Edges::CREATED),
            edges.contains(Edges::DESTROYED),
        );
        step(
            &mut self.locked,
            edges.contains(Edges::PROTECTED),
            edges.contains(Edges::UNPROTECTED),
        );
        step(
            &mut self.unreleased,
            edges.contains(Edges::UNRELEASED),
            edges.contains(Edges::RELEASED),
        );
    }
}

/// A fixed-size partition of the address space.
///
/// Owns the sections whose base address falls inside it. Slots are never removed, so a
/// [`SectionId`] stays valid for the lifetime of the storage.
#[derive(Debug)]
pub struct Block<I> {
    index: u32,
    range: AddressRange,
    pub(crate) sections: Vec<CachedSection<I>>,
    /// Sections based in earlier blocks whose range reaches into this one.
    pub(crate) unowned: BTreeSet<SectionId>,
    pub(crate) counters: BlockCounters,
}

impl<I: Copy> Block<I> {
    pub(crate) fn new(index: u32, range: AddressRange) -> Self {
        Self {
            index,
            range,
            sections: Vec::new(),
            unowned: BTreeSet::new(),
            counters: BlockCounters::default(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn start(&self) -> u32 {
        self.range.start
    }

    pub fn counters(&self) -> BlockCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn unowned(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.unowned.iter().copied()
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionId, &CachedSection<I>)> + '_ {
        let block = self.index;
        self.sections
            .iter()
            .enumerate()
            .map(move |(slot, s)| (SectionId { block, slot: slot as u32 }, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_follow_state_changes() {
        let before = Observed {
            valid: true,
            exists: true,
            locked: false,
            unreleased: true,
            memory: 64,
        };
        let after = Observed {
            locked: true,
            unreleased: false,
            ..before
        };
        assert_eq!(
            Edges::between(&before, &after),
            Edges::PROTECTED | Edges::RELEASED
        );
        assert_eq!(Edges::between(&after, &after), Edges::empty());

        let mut counters = BlockCounters {
            valid: 1,
            exists: 1,
            locked: 0,
            unreleased: 1,
        };
        counters.apply(Edges::between(&before, &after));
        assert_eq!(counters.locked, 1);
        assert_eq!(counters.unreleased, 0);
    }
}
