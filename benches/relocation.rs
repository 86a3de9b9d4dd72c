//! Benchmark harness for relocation and compaction.
//!
//! Measures:
//! - Shift pass with a fraction of particles drifting out of their supercell
//! - Compaction after a shift
//! - Stride sub-pass overhead on an empty store

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use supercell_store::{AreaMask, Particle, ParticleStore, StoreConfig};

type Store = ParticleStore<Particle<3>, 3>;

/// Store with `per_supercell` particles in every local supercell.
fn seeded_store(local: u32, per_supercell: u32, seed: u64) -> Store {
    let config = StoreConfig::with_grid(&[local; 3], 1, &[4, 4, 4]).frames(64 * 1024);
    let mut store = Store::new(config).unwrap();
    store.warm_up();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let layout = *store.layout();
    let mut id = 0;
    for idx in 0..layout.supercell_count() {
        if !layout.in_area(idx, AreaMask::CORE | AreaMask::BORDER) {
            continue;
        }
        for _ in 0..per_supercell {
            let cell = [rng.gen_range(0..4), rng.gen_range(0..4), rng.gen_range(0..4)];
            store.add_particle(idx, Particle::new(id, cell)).unwrap();
            id += 1;
        }
    }
    store
}

/// Push every `1 / every`-th particle one cell along +x.
fn drift(store: &mut Store, every: u64) {
    store
        .for_each_particle_mut(AreaMask::CORE | AreaMask::BORDER, |_, p| {
            if p.id % every == 0 {
                p.cell[0] += 1;
            }
        })
        .unwrap();
}

/// Benchmark: one shift pass at different drift fractions
fn bench_shift(c: &mut Criterion) {
    let mut group = c.benchmark_group("shift_particles");
    for every in [2u64, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::new("drift_1_in", every), every, |b, &every| {
            b.iter_batched(
                || {
                    let mut store = seeded_store(8, 64, 42);
                    drift(&mut store, every);
                    store
                },
                |mut store| black_box(store.shift_particles(AreaMask::CORE | AreaMask::BORDER).unwrap()),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

/// Benchmark: compaction after a shift left holes
fn bench_fill_gaps(c: &mut Criterion) {
    c.bench_function("fill_all_gaps_after_shift", |b| {
        b.iter_batched(
            || {
                let mut store = seeded_store(8, 64, 7);
                drift(&mut store, 4);
                store.shift_particles(AreaMask::CORE | AreaMask::BORDER).unwrap();
                store
            },
            |mut store| black_box(store.fill_all_gaps().unwrap()),
            BatchSize::LargeInput,
        )
    });
}

/// Benchmark: 27 empty sub-passes (scheduling and dispatch overhead)
fn bench_empty_pass(c: &mut Criterion) {
    let mut store = seeded_store(8, 0, 1);
    c.bench_function("shift_empty_store", |b| {
        b.iter(|| black_box(store.shift_particles(AreaMask::ALL).unwrap()))
    });
}

criterion_group!(relocation_benches, bench_shift, bench_fill_gaps, bench_empty_pass);
criterion_main!(relocation_benches);
