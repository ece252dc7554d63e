#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use surfcache_core::{
    Backend, CacheConfig, InvalidationCause, SampledSource, SectionHandle, SoftwareBackend,
    SurfaceStore, SurfaceStoreConfig, TextureCache, TextureDescriptor, TextureFormat,
};
use surfcache_mem::{AddressRange, GuestMemory, Protection, ProtectionMap, SparseGuestMemory, PAGE_SIZE};

const BASE: u32 = 0x40_0000;

struct World {
    cache: TextureCache<SoftwareBackend>,
    surfaces: SurfaceStore<SoftwareBackend>,
    backend: Arc<SoftwareBackend>,
    map: Arc<ProtectionMap>,
    memory: Arc<SparseGuestMemory>,
}

fn world() -> World {
    let map = Arc::new(ProtectionMap::new());
    let backend = Arc::new(SoftwareBackend::new(map.clone()));
    let memory = Arc::new(SparseGuestMemory::new(1 << 24));
    let cache = TextureCache::new(CacheConfig::default(), backend.clone(), memory.clone()).unwrap();
    let surfaces = SurfaceStore::new(SurfaceStoreConfig::default(), backend.clone(), memory.clone());
    World {
        cache,
        surfaces,
        backend,
        map,
        memory,
    }
}

/// A texture exactly one 4 KiB row wide, `rows` rows tall, starting `quarter` rows-of-1K into
/// the page at `page`.
fn texture(page: u32, quarter: u32, rows: u32) -> TextureDescriptor {
    TextureDescriptor::new_2d(
        BASE + page * PAGE_SIZE + quarter * 1024,
        1024,
        rows,
        0,
        TextureFormat::A8R8G8B8,
    )
}

impl World {
    fn upload(&mut self, desc: &TextureDescriptor) -> SectionHandle {
        match self.cache.upload_texture(desc, &mut self.surfaces).unwrap().source {
            SampledSource::Cached(handle) => handle,
            other => panic!("expected a cached texture, got {other:?}"),
        }
    }

    /// `(range, protection)` of every section still locked among `handles`.
    fn locked(&self, handles: &[SectionHandle]) -> BTreeSet<(AddressRange, Protection)> {
        handles
            .iter()
            .filter_map(|h| self.cache.section_info(*h))
            .filter(|info| info.protection != Protection::ReadWrite)
            .map(|info| (info.locked_range, info.protection))
            .collect()
    }
}

fn pages(range: AddressRange) -> impl Iterator<Item = u32> {
    (range.start / PAGE_SIZE)..=(range.end / PAGE_SIZE)
}

/// Page-disjoint layout: `(gap, rows)` pairs laid out one after another.
fn disjoint_layout() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0u32..3, 1u32..4), 1..8)
}

fn place(layout: &[(u32, u32)]) -> Vec<TextureDescriptor> {
    let mut page = 0;
    layout
        .iter()
        .map(|&(gap, rows)| {
            page += gap;
            let desc = texture(page, 0, rows);
            page += rows;
            desc
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn no_access_round_trip_restores_locked_count(
        page in 8u32..16,
        rows in 1u32..4,
        fill in any::<u8>(),
        background in prop::collection::vec(0u32..6, 0..4),
    ) {
        let mut w = world();
        for slot in background.into_iter().collect::<BTreeSet<_>>() {
            w.upload(&texture(slot, 0, 1));
        }

        let desc = texture(page, 0, rows);
        let range = desc.memory_range();
        let contents = vec![fill; range.length() as usize];
        w.memory.write(range.start, &contents).unwrap();
        let before = w.cache.block_counters(range.start);

        let image = w.backend.create_image(&desc.image_desc()).unwrap();
        w.backend.upload_image(image, &contents, desc.row_pitch()).unwrap();
        w.cache
            .lock_memory_region(image, range, desc.width, desc.height, desc.row_pitch(), desc.format, false)
            .unwrap();
        prop_assert_eq!(w.cache.block_counters(range.start).locked, before.locked + 1);
        prop_assert_eq!(w.map.protection(range.start), Protection::NoAccess);

        let result = w.cache.invalidate_range(range, InvalidationCause::Write).unwrap();
        prop_assert!(result.violation_handled);
        prop_assert_eq!(w.cache.block_counters(range.start).locked, before.locked);
        for page in pages(range) {
            prop_assert_eq!(w.map.protection(page * PAGE_SIZE), Protection::ReadWrite);
        }

        let mut after = vec![0u8; contents.len()];
        w.memory.read(range.start, &mut after).unwrap();
        prop_assert_eq!(after, contents);
    }

    #[test]
    fn disjoint_invalidations_commute(
        layout in disjoint_layout(),
        a_start in 0u32..8,
        a_len in 1u32..4,
        gap in 0u32..4,
        b_len in 1u32..4,
    ) {
        let descs = place(&layout);
        let a = AddressRange::start_length(BASE + a_start * PAGE_SIZE, a_len * PAGE_SIZE);
        let b_start = a.end + 1 + gap * PAGE_SIZE;
        let b = AddressRange::start_length(b_start, b_len * PAGE_SIZE);

        let mut outcomes = Vec::new();
        for order in [[a, b], [b, a]] {
            let mut w = world();
            let handles: Vec<_> = descs.iter().map(|d| w.upload(d)).collect();
            for range in order {
                w.cache.invalidate_range(range, InvalidationCause::Write).unwrap();
            }
            outcomes.push((w.locked(&handles), w.map.snapshot()));
        }
        prop_assert_eq!(&outcomes[0], &outcomes[1]);
    }

    #[test]
    fn batched_protection_matches_per_section_protection(
        textures in prop::collection::vec((0u32..12, 0u32..4, 1u32..4), 1..10),
        fault_page in 0u32..14,
        read in any::<bool>(),
    ) {
        let mut w = world();
        let handles: Vec<_> = textures
            .iter()
            .map(|&(page, quarter, rows)| w.upload(&texture(page, quarter, rows)))
            .collect();

        let cause = if read { InvalidationCause::Read } else { InvalidationCause::Write };
        w.cache.invalidate_address(BASE + fault_page * PAGE_SIZE, cause).unwrap();

        // Replay each surviving section's own protection, in order.
        let mut expected = BTreeSet::new();
        for (range, protection) in w.locked(&handles) {
            prop_assert_eq!(protection, Protection::ReadOnly);
            expected.extend(pages(range).map(|page| (page, Protection::ReadOnly)));
        }
        let actual: BTreeSet<_> = w.map.snapshot().into_iter().collect();
        prop_assert_eq!(actual, expected);
    }
}
