#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use surfcache_core::{
    CacheConfig, InvalidationCause, SoftwareBackend, SurfaceStore, SurfaceStoreConfig,
    TextureCache, TextureDescriptor, TextureFormat,
};
#[cfg(not(target_arch = "wasm32"))]
use surfcache_mem::{AddressRange, ProtectionMap, SparseGuestMemory, PAGE_SIZE};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("SURFCACHE_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct Populated {
    cache: TextureCache<SoftwareBackend>,
    surfaces: SurfaceStore<SoftwareBackend>,
    textures: Vec<TextureDescriptor>,
}

/// `count` one-page textures, one every other page.
#[cfg(not(target_arch = "wasm32"))]
fn populated(count: u32) -> Populated {
    let map = Arc::new(ProtectionMap::new());
    let backend = Arc::new(SoftwareBackend::new(map));
    let memory = Arc::new(SparseGuestMemory::new(1 << 28));
    let cache = TextureCache::new(CacheConfig::default(), backend.clone(), memory.clone())
        .expect("default config is valid");
    let mut surfaces = SurfaceStore::new(SurfaceStoreConfig::default(), backend, memory);

    let textures: Vec<_> = (0..count)
        .map(|i| TextureDescriptor::new_2d(0x10_0000 + i * 2 * PAGE_SIZE, 32, 32, 0, TextureFormat::A8R8G8B8))
        .collect();
    for desc in &textures {
        cache.upload_texture(desc, &mut surfaces).expect("upload");
    }
    Populated {
        cache,
        surfaces,
        textures,
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_fault_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidate");

    for &count in &[16u32, 256, 2048] {
        let mut p = populated(count);
        group.throughput(Throughput::Elements(1));

        // Write fault on a texture, then the re-upload that locks it again.
        let target = p.textures[p.textures.len() / 2];
        group.bench_function(BenchmarkId::new("write_fault_reupload", count), |b| {
            b.iter(|| {
                let result = p
                    .cache
                    .invalidate_address(black_box(target.address), InvalidationCause::Write)
                    .expect("invalidate");
                black_box(result.violation_handled);
                p.cache.upload_texture(&target, &mut p.surfaces).expect("upload");
            })
        });

        // Address between two textures: rejected after the storage walk.
        let miss = target.address + PAGE_SIZE;
        group.bench_function(BenchmarkId::new("false_positive", count), |b| {
            b.iter(|| {
                let result = p
                    .cache
                    .invalidate_address(black_box(miss), InvalidationCause::Write)
                    .expect("invalidate");
                black_box(result.violation_handled);
            })
        });

        // Far outside every section: rejected by the quick bounds alone.
        let outside = AddressRange::start_length(0x0800_0000, PAGE_SIZE);
        group.bench_function(BenchmarkId::new("quick_reject", count), |b| {
            b.iter(|| black_box(p.cache.region_intersects_cache(black_box(outside), true)))
        });
    }

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_fault_path
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
