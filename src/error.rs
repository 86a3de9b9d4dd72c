//! Error types for store operations.
//!
//! Resource exhaustion and protocol violations are returned as values.
//! Programmer errors (out-of-range handles, double release) are assertions.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced to the simulation loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No free frame is left in the pool.
    #[error("frame pool exhausted: {in_use} of {capacity} frames in use")]
    PoolExhausted {
        /// Frames currently claimed.
        in_use: u32,
        /// Total frames in the pool.
        capacity: u32,
    },

    /// A stride mapper was requested with a stride that allows adjacent workers.
    #[error("relocation stride {0} is below the minimum of 3")]
    InvalidStride(u32),

    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A particle moved further than one supercell in a single step.
    #[error("particle in supercell {supercell} displaced by {offset:?} supercells")]
    ExcessiveDisplacement {
        /// Linear index of the owning supercell.
        supercell: usize,
        /// Supercell offset the particle would need.
        offset: Vec<i32>,
    },

    /// A particle left the tracked domain and the exit policy rejects it.
    #[error("particle left the tracked domain from supercell {supercell}")]
    DomainExit {
        /// Linear index of the supercell it left.
        supercell: usize,
    },

    /// A host-side insert named a cell outside the grid.
    #[error("cell {cell:?} lies outside the supercell grid")]
    OutOfGrid {
        /// Global cell index.
        cell: Vec<i64>,
    },

    /// An exchange operation was issued in the wrong protocol state.
    #[error("exchange direction {direction} is {actual}, expected {expected}")]
    ExchangeState {
        /// Direction id.
        direction: u8,
        /// Current state name.
        actual: &'static str,
        /// Required state name.
        expected: &'static str,
    },

    /// A received particle resolves outside the border region of its direction.
    #[error("particle received on direction {direction} resolves outside the border region")]
    Misrouted {
        /// Direction id.
        direction: u8,
    },

    /// The transport lost or refused a batch.
    #[error("transport failure on direction {direction}: {reason}")]
    Transport {
        /// Direction id.
        direction: u8,
        /// Transport-specific detail.
        reason: String,
    },

    /// IO failure while loading configuration or input.
    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport(direction: u8, reason: impl Into<String>) -> Self {
        Self::Transport {
            direction,
            reason: reason.into(),
        }
    }

    /// Returns true for failures caused by running out of frames.
    ///
    /// The simulation loop may retry after compacting elsewhere.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
