//! Configuration - grid geometry, pool sizing and relocation policy.
//!
//! Loaded from JSON or built in code. Every section has defaults, so a
//! config file only needs the fields it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::grid::GridLayout;
use crate::mapper::MIN_STRIDE;

/// Largest frame (in slots) the store accepts.
pub const MAX_TILE_SIZE: u32 = 4096;

/// Master configuration for a particle store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Grid geometry
    pub grid: GridConfig,

    /// Frame pool sizing
    pub pool: PoolConfig,

    /// Relocation behavior
    pub relocation: RelocationConfig,
}

/// Grid geometry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// CORE + BORDER supercells per axis (one entry per dimension)
    pub local_supercells: Vec<u32>,

    /// Guard (and border) width in supercells
    pub guard_supercells: u32,

    /// Cells per supercell per axis; their product is the frame size
    pub supercell_size: Vec<u32>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            local_supercells: vec![8, 8, 8],
            guard_supercells: 1,
            supercell_size: vec![4, 4, 4],
        }
    }
}

/// Frame pool sizing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of frames pre-allocated at startup
    pub frames: u32,

    /// Initial capacity reserved for each exchange batch (particles)
    pub exchange_size_hint: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            frames: 16_384,
            exchange_size_hint: 256,
        }
    }
}

/// What relocation does with a particle whose destination lies outside
/// the tracked grid (beyond the guard margin).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainExitPolicy {
    /// Fail the pass with `StoreError::DomainExit`; the particle stays put
    #[default]
    Reject,
    /// Kill the particle and count it in the pass report
    Discard,
}

/// Relocation behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Checkerboard stride per axis (at least 3)
    pub stride: u32,

    /// Handling of particles leaving the grid
    pub exit_policy: DomainExitPolicy,
}

impl Default for RelocationConfig {
    fn default() -> Self {
        Self {
            stride: MIN_STRIDE,
            exit_policy: DomainExitPolicy::Reject,
        }
    }
}

impl StoreConfig {
    /// Build a config for the given geometry with default pool and relocation settings.
    pub fn with_grid(local: &[u32], guard: u32, supercell_size: &[u32]) -> Self {
        Self {
            grid: GridConfig {
                local_supercells: local.to_vec(),
                guard_supercells: guard,
                supercell_size: supercell_size.to_vec(),
            },
            ..Self::default()
        }
    }

    /// Builder-style pool size.
    pub fn frames(mut self, frames: u32) -> Self {
        self.pool.frames = frames;
        self
    }

    /// Builder-style exit policy.
    pub fn exit_policy(mut self, policy: DomainExitPolicy) -> Self {
        self.relocation.exit_policy = policy;
        self
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> StoreResult<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::config(e.to_string()))
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> StoreResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::config(e.to_string()))
    }

    /// Validate and build the grid layout for dimension `D`.
    pub fn layout<const D: usize>(&self) -> StoreResult<GridLayout<D>> {
        let grid = &self.grid;
        if grid.local_supercells.len() != D || grid.supercell_size.len() != D {
            return Err(StoreError::config(format!(
                "grid has {} local extents and {} supercell sizes, store is {}-dimensional",
                grid.local_supercells.len(),
                grid.supercell_size.len(),
                D
            )));
        }
        if self.relocation.stride < MIN_STRIDE {
            return Err(StoreError::InvalidStride(self.relocation.stride));
        }
        if self.pool.frames == 0 {
            return Err(StoreError::config("pool must hold at least one frame"));
        }

        let tile: u64 = grid.supercell_size.iter().map(|&s| s as u64).product();
        if tile > MAX_TILE_SIZE as u64 {
            return Err(StoreError::config(format!(
                "supercell of {} cells exceeds the frame limit of {}",
                tile, MAX_TILE_SIZE
            )));
        }

        let mut local = [0u32; D];
        let mut size = [0u32; D];
        local.copy_from_slice(&grid.local_supercells);
        size.copy_from_slice(&grid.supercell_size);
        GridLayout::new(local, grid.guard_supercells, size)
    }
}
