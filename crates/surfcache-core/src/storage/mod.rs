//! Spatial index over the 32-bit guest address space.
//!
//! The space is cut into fixed-size blocks. A section lives in the block holding its base
//! address; every later block its range reaches into keeps an "unowned" back-reference to it, so
//! a range query starting in block `N` finds sections based in blocks `< N` without scanning
//! them. Back-references are maintained exactly when a section's range becomes valid or invalid.

mod block;

use std::collections::BTreeSet;
use std::ops::Bound;

use surfcache_mem::AddressRange;

pub use block::{Block, BlockCounters, Edges, SectionHandle, SectionId};

use crate::section::CachedSection;
use crate::types::SectionBounds;

#[derive(Debug)]
pub struct RangedStorage<I> {
    block_shift: u32,
    blocks: Vec<Block<I>>,
    unreleased: u32,
    memory_in_use: u64,
    /// Blocks with at least one existing section.
    in_use: BTreeSet<u32>,
}

impl<I: Copy> RangedStorage<I> {
    /// `block_size` must be a power of two.
    pub fn new(block_size: u32) -> Self {
        assert!(block_size.is_power_of_two(), "block size must be a power of two");
        let block_shift = block_size.trailing_zeros();
        let count = 1u64 << (32 - block_shift);
        let blocks = (0..count)
            .map(|i| {
                let start = (i << block_shift) as u32;
                Block::new(i as u32, AddressRange::start_length(start, block_size))
            })
            .collect();
        Self {
            block_shift,
            blocks,
            unreleased: 0,
            memory_in_use: 0,
            in_use: BTreeSet::new(),
        }
    }

    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    pub fn block_for(&self, addr: u32) -> u32 {
        addr >> self.block_shift
    }

    pub fn block(&self, index: u32) -> &Block<I> {
        &self.blocks[index as usize]
    }

    pub fn section(&self, id: SectionId) -> &CachedSection<I> {
        &self.blocks[id.block as usize].sections[id.slot as usize]
    }

    pub fn handle(&self, id: SectionId) -> SectionHandle {
        SectionHandle {
            id,
            generation: self.section(id).generation(),
        }
    }

    /// The section behind `handle`, unless it was reset or destroyed since.
    pub fn get(&self, handle: SectionHandle) -> Option<&CachedSection<I>> {
        let section = self
            .blocks
            .get(handle.id.block as usize)?
            .sections
            .get(handle.id.slot as usize)?;
        (section.generation() == handle.generation).then_some(section)
    }

    pub fn is_live(&self, handle: SectionHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn unreleased_count(&self) -> u32 {
        self.unreleased
    }

    /// Bytes of managed host images held by existing sections.
    pub fn memory_in_use(&self) -> u64 {
        self.memory_in_use
    }

    pub fn in_use_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.in_use.iter().copied()
    }

    /// Every allocated slot, in address-block order.
    pub fn ids(&self) -> Vec<SectionId> {
        self.blocks
            .iter()
            .filter(|b| !b.is_empty())
            .flat_map(|b| b.sections().map(|(id, _)| id))
            .collect()
    }

    /// Lazily walks sections overlapping `range` under `bounds`.
    pub fn range_begin(
        &self,
        range: AddressRange,
        bounds: SectionBounds,
        locked_only: bool,
    ) -> RangeCursor {
        RangeCursor::new(self.block_shift, range, bounds, locked_only)
    }

    /// Collects the cursor's results; for callers that do not mutate while walking.
    pub fn find_overlapping(
        &self,
        range: AddressRange,
        bounds: SectionBounds,
        locked_only: bool,
    ) -> Vec<SectionId> {
        let mut cursor = self.range_begin(range, bounds, locked_only);
        let mut out = Vec::new();
        while let Some(id) = cursor.next(self) {
            out.push(id);
        }
        out
    }

    // ---------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------

    /// Allocates a fresh slot in the block owning `range.start`.
    pub fn create_section(&mut self, range: AddressRange) -> SectionId {
        debug_assert!(range.valid());
        let block = self.block_for(range.start);
        let sections = &mut self.blocks[block as usize].sections;
        let id = SectionId {
            block,
            slot: sections.len() as u32,
        };
        sections.push(CachedSection::new());
        self.update(id, |s| s.reset(range));
        id
    }

    /// Repurposes an unlocked section for `range`, which must start in the same block. Returns the
    /// managed image it released.
    pub fn reset(&mut self, id: SectionId, range: AddressRange) -> Option<I> {
        debug_assert_eq!(self.block_for(range.start), id.block);
        self.update(id, |s| s.reset(range))
    }

    pub fn destroy(&mut self, id: SectionId) -> Option<I> {
        if !self.section(id).valid_range() && !self.section(id).exists() {
            return None;
        }
        self.update(id, |s| s.destroy())
    }

    /// Runs `f` against a section and applies the resulting state edges to the counters and
    /// back-references.
    pub fn update<R>(&mut self, id: SectionId, f: impl FnOnce(&mut CachedSection<I>) -> R) -> R {
        let section = &mut self.blocks[id.block as usize].sections[id.slot as usize];
        let before = section.observe();
        let old_range = section.section_range();

        let out = f(section);

        let after = section.observe();
        let new_range = section.section_range();

        self.apply_edges(id.block, Edges::between(&before, &after));
        self.memory_in_use = self.memory_in_use - before.memory + after.memory;

        if old_range != new_range {
            if old_range.valid() {
                self.unlink(id, old_range);
            }
            if new_range.valid() {
                self.link(id, new_range);
            }
        }
        out
    }

    fn apply_edges(&mut self, block: u32, edges: Edges) {
        if edges.is_empty() {
            return;
        }
        let counters = &mut self.blocks[block as usize].counters;
        counters.apply(edges);
        let in_use = counters.exists > 0;

        if edges.contains(Edges::UNRELEASED) {
            self.unreleased += 1;
        }
        if edges.contains(Edges::RELEASED) {
            debug_assert!(self.unreleased > 0);
            self.unreleased -= 1;
        }
        if in_use {
            self.in_use.insert(block);
        } else {
            self.in_use.remove(&block);
        }
    }

    fn link(&mut self, id: SectionId, range: AddressRange) {
        for block in self.block_for(range.start) + 1..=self.block_for(range.end) {
            self.blocks[block as usize].unowned.insert(id);
        }
    }

    fn unlink(&mut self, id: SectionId, range: AddressRange) {
        for block in self.block_for(range.start) + 1..=self.block_for(range.end) {
            let removed = self.blocks[block as usize].unowned.remove(&id);
            debug_assert!(removed, "missing back-reference for {id:?}");
        }
    }

    /// Destroys unlocked, unreferenced sections matching `filter`. Returns released images.
    fn purge(&mut self, filter: impl Fn(&CachedSection<I>) -> bool) -> Vec<I> {
        let blocks: Vec<u32> = self.in_use.iter().copied().collect();
        let mut images = Vec::new();
        for block in blocks {
            for slot in 0..self.blocks[block as usize].sections.len() as u32 {
                let id = SectionId { block, slot };
                let section = self.section(id);
                if section.is_locked() || section.has_refs() || !filter(section) {
                    continue;
                }
                images.extend(self.destroy(id));
            }
        }
        images
    }

    /// Destroys sections that are allocated but dirty and unlocked.
    pub fn purge_unreleased(&mut self) -> Vec<I> {
        self.purge(|s| s.is_unreleased())
    }

    /// Destroys every allocated unlocked section.
    pub fn purge_unlocked(&mut self) -> Vec<I> {
        self.purge(|s| s.exists())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// Walking the start block's back-references, resuming after the given id.
    Unowned(Option<SectionId>),
    Owned { block: u32, slot: u32 },
    Done,
}

/// Resumable range query over a [`RangedStorage`].
///
/// The cursor holds no borrow, so the caller may mutate sections between steps. Back-references
/// are resumed by key and owned slots by index; neither is invalidated by section mutations.
#[derive(Debug, Clone)]
pub struct RangeCursor {
    block_shift: u32,
    range: AddressRange,
    bounds: SectionBounds,
    locked_only: bool,
    start_block: u32,
    end_block: u32,
    state: CursorState,
}

impl RangeCursor {
    fn new(block_shift: u32, range: AddressRange, bounds: SectionBounds, locked_only: bool) -> Self {
        let (start_block, end_block, state) = if range.valid() {
            (
                range.start >> block_shift,
                range.end >> block_shift,
                CursorState::Unowned(None),
            )
        } else {
            (0, 0, CursorState::Done)
        };
        Self {
            block_shift,
            range,
            bounds,
            locked_only,
            start_block,
            end_block,
            state,
        }
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Block the last returned section was found in.
    pub fn current_block(&self) -> u32 {
        match self.state {
            CursorState::Unowned(_) => self.start_block,
            CursorState::Owned { block, .. } => block,
            CursorState::Done => self.end_block,
        }
    }

    /// Extends the query to `end`. Only ever grows the range.
    pub fn set_end(&mut self, end: u32) {
        if end > self.range.end {
            self.range.end = end;
            self.end_block = end >> self.block_shift;
        }
    }

    fn accepts<I: Copy>(&self, section: &CachedSection<I>) -> bool {
        section.valid_range()
            && (!self.locked_only || section.is_locked())
            && section.overlaps(&self.range, self.bounds)
    }

    pub fn next<I: Copy>(&mut self, storage: &RangedStorage<I>) -> Option<SectionId> {
        loop {
            match self.state {
                CursorState::Unowned(after) => {
                    let set = &storage.blocks[self.start_block as usize].unowned;
                    let next = match after {
                        None => set.iter().next(),
                        Some(after) => set.range((Bound::Excluded(after), Bound::Unbounded)).next(),
                    }
                    .copied();
                    match next {
                        Some(id) => {
                            self.state = CursorState::Unowned(Some(id));
                            if self.accepts(storage.section(id)) {
                                return Some(id);
                            }
                        }
                        None => {
                            self.state = CursorState::Owned {
                                block: self.start_block,
                                slot: 0,
                            };
                        }
                    }
                }
                CursorState::Owned { block, slot } => {
                    if block > self.end_block || block as usize >= storage.blocks.len() {
                        self.state = CursorState::Done;
                        return None;
                    }
                    let b = &storage.blocks[block as usize];
                    if (self.locked_only && b.counters.locked == 0) || slot as usize >= b.sections.len() {
                        self.state = CursorState::Owned {
                            block: block + 1,
                            slot: 0,
                        };
                        continue;
                    }
                    self.state = CursorState::Owned {
                        block,
                        slot: slot + 1,
                    };
                    if self.accepts(&b.sections[slot as usize]) {
                        return Some(SectionId { block, slot });
                    }
                }
                CursorState::Done => return None,
            }
        }
    }
}
