//! Step latency report.
//!
//! Seeds a 3D store with ballistic particles, then times full steps
//! (push, shift, compaction, periodic exchange) and prints the distribution.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use hdrhistogram::Histogram;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use supercell_store::{AreaMask, MailboxTransport, Particle, ParticleStore, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "step-report", about = "Per-step latency of relocation, compaction and exchange")]
struct Args {
    /// Local supercells per axis
    #[arg(long, default_value_t = 8)]
    supercells: u32,

    /// Cells per supercell per axis
    #[arg(long, default_value_t = 4)]
    supercell_size: u32,

    /// Particles seeded per local supercell
    #[arg(long, default_value_t = 128)]
    particles: u32,

    /// Timed steps
    #[arg(long, default_value_t = 200)]
    steps: u64,

    /// Largest speed component, in cells per step (below 1)
    #[arg(long, default_value_t = 0.5)]
    max_speed: f32,

    /// Seed for the particle generator
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// JSON config; overrides the geometry flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pin the driver thread to the last core
    #[arg(long)]
    pin: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn build_config(args: &Args) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &args.config {
        return Ok(StoreConfig::from_json_file(path)?);
    }
    let local = args.supercells;
    let size = args.supercell_size;
    let tile = size.pow(3);
    let extent = (local + 2) as u64;
    // Room for the seeded load, one partial frame per supercell and exchange slack
    let frames = extent.pow(3) * (args.particles.div_ceil(tile) as u64 + 2);
    Ok(StoreConfig::with_grid(&[local; 3], 1, &[size; 3]).frames(frames.min(u32::MAX as u64 - 1) as u32))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging(args.verbose);

    if args.pin && !ParticleStore::<Particle<3>, 3>::pin_to_core() {
        info!("core pinning unavailable, continuing unpinned");
    }

    let config = build_config(&args)?;
    let mut store: ParticleStore<Particle<3>, 3> = ParticleStore::new(config)?;
    store.warm_up();

    // Seed every local supercell
    let layout = *store.layout();
    let guard = layout.guard();
    let size = layout.supercell_size();
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let speed = args.max_speed.clamp(0.0, 0.99);
    let mut id = 0u64;
    for idx in 0..layout.supercell_count() {
        if !layout.in_area(idx, AreaMask::CORE | AreaMask::BORDER) {
            continue;
        }
        for _ in 0..args.particles {
            let mut cell = [0i32; 3];
            let mut momentum = [0f32; 3];
            for axis in 0..3 {
                cell[axis] = rng.gen_range(0..size[axis] as i32);
                momentum[axis] = if speed > 0.0 { rng.gen_range(-speed..speed) } else { 0.0 };
            }
            let position = [rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()];
            let p = Particle::new(id, cell).with_position(position).with_momentum(momentum);
            store.add_particle(idx, p)?;
            id += 1;
        }
    }
    info!(particles = id, guard, "seeded store");

    let mut transport = MailboxTransport::new();
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut total = Duration::ZERO;
    let mut moved = 0u64;

    for _ in 0..args.steps {
        let start = Instant::now();

        store.for_each_particle_mut(AreaMask::CORE | AreaMask::BORDER, |_, p| {
            let v = p.momentum;
            p.advance(v);
        })?;
        let shift = store.shift_particles(AreaMask::CORE | AreaMask::BORDER)?;
        store.fill_gaps(AreaMask::CORE | AreaMask::BORDER)?;
        store.exchange_round(&mut transport)?;
        store.advance_step();

        let elapsed = start.elapsed();
        histogram.record(elapsed.as_micros() as u64).unwrap_or(());
        total += elapsed;
        moved += shift.moved;
    }

    let stats = store.stats();
    println!("\n=== Step Report (us) ===");
    println!("Steps:      {}", args.steps);
    println!("Particles:  {}", stats.live_particles);
    println!("Moved:      {}", moved);
    println!("Steps/sec:  {:.2}", args.steps as f64 / total.as_secs_f64().max(f64::EPSILON));
    println!("Frames:     {} of {}", stats.frames_in_use, stats.frame_capacity);
    println!("---------------------------");
    println!("Min:    {:8} us", histogram.min());
    println!("P50:    {:8} us", histogram.value_at_quantile(0.50));
    println!("P90:    {:8} us", histogram.value_at_quantile(0.90));
    println!("P99:    {:8} us", histogram.value_at_quantile(0.99));
    println!("Max:    {:8} us", histogram.max());
    println!("---------------------------");

    println!("\nDistribution:");
    for v in histogram.iter_log(100, 2.0) {
        let count = v.count_since_last_iteration();
        if count > 0 {
            println!("<= {:8} us: {:8} steps", v.value_iterated_to(), count);
        }
    }

    if id != stats.live_particles {
        return Err(format!("particle count drifted: seeded {}, live {}", id, stats.live_particles).into());
    }
    Ok(())
}
