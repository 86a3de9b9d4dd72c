//! Benchmark harness for the guard exchange.
//!
//! Measures:
//! - Guard extraction for all directions
//! - A full periodic exchange round through in-process mailboxes

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use supercell_store::{AreaMask, Direction, MailboxTransport, Particle, ParticleStore, StoreConfig};

type Store = ParticleStore<Particle<3>, 3>;

/// Store with `per_supercell` particles in every guard supercell.
fn guard_loaded_store(local: u32, per_supercell: u32) -> Store {
    let config = StoreConfig::with_grid(&[local; 3], 1, &[4, 4, 4]).frames(64 * 1024);
    let mut store = Store::new(config).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let layout = *store.layout();
    let mut id = 0;
    for idx in 0..layout.supercell_count() {
        if !layout.in_area(idx, AreaMask::GUARD) {
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

/// Benchmark: extraction of every guard region
fn bench_extract(c: &mut Criterion) {
    let directions = Direction::<3>::all();
    let mut group = c.benchmark_group("copy_guard_to_exchange");
    for per in [8u32, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(per), per, |b, &per| {
            b.iter_batched(
                || guard_loaded_store(8, per),
                |mut store| black_box(store.copy_guard_to_exchange_many(&directions).unwrap()),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

/// Benchmark: extract, send, receive, insert and compact
fn bench_round(c: &mut Criterion) {
    c.bench_function("exchange_round", |b| {
        b.iter_batched(
            || (guard_loaded_store(8, 32), MailboxTransport::new()),
            |(mut store, mut transport)| black_box(store.exchange_round(&mut transport).unwrap()),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(exchange_benches, bench_extract, bench_round);
criterion_main!(exchange_benches);
