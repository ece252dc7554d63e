use core::fmt;

/// Size of a host protection page.
pub const PAGE_SIZE: u32 = 4096;
const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Round `value` down to the start of its page.
pub const fn page_start(value: u32) -> u32 {
    value & !PAGE_MASK
}

/// Round `value` up to the last byte of its page.
pub const fn page_end(value: u32) -> u32 {
    value | PAGE_MASK
}

pub const fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}

/// Inclusive byte range `[start, end]` over the 32-bit guest address space.
///
/// A range with `start > end` is invalid; [`AddressRange::INVALID`] is the canonical one.
/// Ranges never cover the whole 4 GiB space, so [`AddressRange::length`] fits a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub const INVALID: Self = Self {
        start: u32::MAX,
        end: 0,
    };

    pub const fn start_end(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// `[start, start + length)`. A zero length, or one that would wrap past 4 GiB, yields an
    /// invalid range.
    pub const fn start_length(start: u32, length: u32) -> Self {
        if length == 0 {
            return Self::INVALID;
        }
        match start.checked_add(length - 1) {
            Some(end) => Self { start, end },
            None => Self::INVALID,
        }
    }

    pub const fn valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn invalidate(&mut self) {
        *self = Self::INVALID;
    }

    pub const fn length(&self) -> u32 {
        if !self.valid() {
            return 0;
        }
        (self.end - self.start).saturating_add(1)
    }

    pub const fn overlaps(&self, other: &AddressRange) -> bool {
        self.valid() && other.valid() && self.start <= other.end && other.start <= self.end
    }

    pub const fn contains(&self, address: u32) -> bool {
        self.valid() && self.start <= address && address <= self.end
    }

    /// True when `self` lies entirely within `other`.
    pub const fn inside(&self, other: &AddressRange) -> bool {
        self.valid() && other.valid() && other.start <= self.start && self.end <= other.end
    }

    /// True when the two ranges overlap or are directly adjacent.
    pub fn touches(&self, other: &AddressRange) -> bool {
        if !self.valid() || !other.valid() {
            return false;
        }
        let (lo, hi) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        lo.end == u32::MAX || hi.start <= lo.end + 1
    }

    pub fn get_intersect(&self, other: &AddressRange) -> AddressRange {
        if !self.overlaps(other) {
            return Self::INVALID;
        }
        Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        }
    }

    pub fn intersect(&mut self, other: &AddressRange) {
        *self = self.get_intersect(other);
    }

    /// Smallest range covering both `self` and `other`. Invalid inputs are ignored.
    pub fn get_min_max(&self, other: &AddressRange) -> AddressRange {
        match (self.valid(), other.valid()) {
            (false, false) => Self::INVALID,
            (true, false) => *self,
            (false, true) => *other,
            (true, true) => Self {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            },
        }
    }

    pub const fn is_page_range(&self) -> bool {
        self.valid() && is_page_aligned(self.start) && is_page_aligned(self.end.wrapping_add(1))
    }

    /// Expands the range outwards to whole pages.
    pub const fn to_page_range(&self) -> AddressRange {
        if !self.valid() {
            return Self::INVALID;
        }
        Self {
            start: page_start(self.start),
            end: page_end(self.end),
        }
    }

    pub const fn first_page(&self) -> u32 {
        self.start / PAGE_SIZE
    }

    pub const fn last_page(&self) -> u32 {
        self.end / PAGE_SIZE
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "[0x{:08x}-0x{:08x}]", self.start, self.end)
        } else {
            f.write_str("[invalid]")
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A normalized set of address ranges: sorted, disjoint and coalesced.
///
/// Adjacent ranges are merged on insertion, so iterating the set yields the minimal number of
/// contiguous runs. Protection batching relies on that.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AddressRangeVector {
    ranges: Vec<AddressRange>,
}

impl AddressRangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ranges: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddressRange> + '_ {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[AddressRange] {
        &self.ranges
    }

    /// Total number of bytes covered.
    pub fn total_length(&self) -> u64 {
        self.ranges.iter().map(|r| u64::from(r.length())).sum()
    }

    pub fn merge(&mut self, range: AddressRange) {
        if !range.valid() {
            return;
        }

        // First range that could touch `range` (ranges ending at least one byte before it
        // cannot).
        let first = self
            .ranges
            .partition_point(|r| r.end != u32::MAX && r.end + 1 < range.start);

        let mut merged = range;
        let mut last = first;
        while last < self.ranges.len() && self.ranges[last].touches(&merged) {
            merged = merged.get_min_max(&self.ranges[last]);
            last += 1;
        }

        self.ranges.splice(first..last, core::iter::once(merged));
    }

    pub fn merge_all(&mut self, other: &AddressRangeVector) {
        for range in other.iter() {
            self.merge(*range);
        }
    }

    pub fn exclude(&mut self, range: AddressRange) {
        if !range.valid() || self.ranges.is_empty() {
            return;
        }

        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.overlaps(&range) {
                out.push(existing);
                continue;
            }
            if existing.start < range.start {
                out.push(AddressRange::start_end(existing.start, range.start - 1));
            }
            if existing.end > range.end {
                out.push(AddressRange::start_end(range.end + 1, existing.end));
            }
        }
        self.ranges = out;
    }

    pub fn exclude_all(&mut self, other: &AddressRangeVector) {
        for range in other.iter() {
            self.exclude(*range);
        }
    }

    pub fn overlaps(&self, range: &AddressRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    /// True when every byte of `range` is covered by the set.
    pub fn covers(&self, range: &AddressRange) -> bool {
        // Normalized: a covered range must sit inside a single run.
        range.valid() && self.ranges.iter().any(|r| range.inside(r))
    }
}

impl fmt::Debug for AddressRangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a AddressRangeVector {
    type Item = &'a AddressRange;
    type IntoIter = core::slice::Iter<'a, AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl FromIterator<AddressRange> for AddressRangeVector {
    fn from_iter<T: IntoIterator<Item = AddressRange>>(iter: T) -> Self {
        let mut out = Self::new();
        for range in iter {
            out.merge(range);
        }
        out
    }
}
