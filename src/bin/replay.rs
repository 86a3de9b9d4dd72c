//! Replay a particle set from CSV through ballistic steps.
//!
//! Input rows are `id,x,y,z,vx,vy,vz` with positions in cell units relative
//! to the grid origin (guard included) and velocities in cells per step.
//! After every step the per-area particle counts are printed; the final
//! particle set can be written back out as CSV.

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use supercell_store::{AreaMask, MailboxTransport, Particle, ParticleStore, StoreConfig, StoreError};

#[derive(Parser, Debug)]
#[command(name = "replay", about = "Replay CSV particles through shift, compaction and exchange")]
struct Args {
    /// Input CSV (id,x,y,z,vx,vy,vz)
    input: PathBuf,

    /// JSON store config (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Steps to run
    #[arg(short, long, default_value_t = 10)]
    steps: u64,

    /// Write the final particles here as CSV
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ParticleRow {
    id: u64,
    x: f64,
    y: f64,
    z: f64,
    vx: f32,
    vy: f32,
    vz: f32,
}

type Store = ParticleStore<Particle<3>, 3>;

fn load(store: &mut Store, path: &Path) -> Result<(u64, u64), Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut loaded = 0;
    let mut skipped = 0;
    for row in reader.deserialize() {
        let row: ParticleRow = row?;
        let global = [row.x, row.y, row.z];
        let cell = global.map(|c| c.floor() as i64);
        let position = global.map(|c| (c - c.floor()) as f32);
        let p = Particle::new(row.id, [0; 3])
            .with_position(position)
            .with_momentum([row.vx, row.vy, row.vz]);
        match store.add_particle_at(cell, p) {
            Ok(_) => loaded += 1,
            Err(StoreError::OutOfGrid { cell }) => {
                warn!(id = row.id, ?cell, "particle outside the grid, skipped");
                skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((loaded, skipped))
}

fn write_out(store: &Store, path: &Path) -> Result<(), Box<dyn Error>> {
    let layout = store.layout();
    let size = layout.supercell_size();
    let mut writer = csv::Writer::from_path(path)?;
    for idx in 0..layout.supercell_count() {
        let coord = layout.coord(idx);
        for p in store.particles(idx) {
            let mut global = [0f64; 3];
            for axis in 0..3 {
                let cell = (coord[axis] * size[axis]) as i64 + p.cell[axis] as i64;
                global[axis] = cell as f64 + p.position[axis] as f64;
            }
            writer.serialize(ParticleRow {
                id: p.id,
                x: global[0],
                y: global[1],
                z: global[2],
                vx: p.momentum[0],
                vy: p.momentum[1],
                vz: p.momentum[2],
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn print_counts(store: &Store) {
    println!(
        "step {:4}  core {:8}  border {:8}  guard {:8}",
        store.step(),
        store.total_live(AreaMask::CORE),
        store.total_live(AreaMask::BORDER),
        store.total_live(AreaMask::GUARD),
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => StoreConfig::from_json_file(path)?,
        None => StoreConfig::default(),
    };
    let mut store = Store::new(config)?;

    let (loaded, skipped) = load(&mut store, &args.input)?;
    info!(loaded, skipped, "particles loaded");

    // Settle particles that start in the guard before the first push
    store.exchange_round(&mut MailboxTransport::new())?;
    print_counts(&store);

    let mut transport = MailboxTransport::new();
    for _ in 0..args.steps {
        store.for_each_particle_mut(AreaMask::CORE | AreaMask::BORDER, |_, p| {
            let mut v = p.momentum;
            // Relocation moves at most one supercell per step
            for c in v.iter_mut() {
                *c = c.clamp(-0.99, 0.99);
            }
            p.advance(v);
        })?;
        store.shift_particles(AreaMask::CORE | AreaMask::BORDER)?;
        store.fill_gaps(AreaMask::CORE | AreaMask::BORDER)?;
        store.exchange_round(&mut transport)?;
        store.advance_step();
        print_counts(&store);
    }

    if let Some(path) = &args.output {
        write_out(&store, path)?;
        info!(path = %path.display(), "final particles written");
    }
    Ok(())
}
