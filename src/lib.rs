//! # Supercell Store
//!
//! Particle storage and domain-decomposition plumbing for grid-based
//! particle simulations.
//!
//! ## Design Principles
//!
//! - **Arena Allocation**: Every frame is pre-allocated; steps never touch the heap allocator
//! - **Handles, not pointers**: Frames are linked by 32-bit handles into per-supercell lists
//! - **Race-free relocation**: Stride-3 checkerboard sub-passes keep active supercells apart
//! - **Explicit ordering**: Operations declare their footprints; a scheduler orders them
//!
//! ## Architecture
//!
//! ```text
//!              ┌──────────────── ParticleStore ────────────────┐
//!              │                                                │
//!  physics ──▶ │ supercells: [FrameList] ──▶ FramePool (frames) │
//!              │ queues:     [ExchangeQueue; 3^D - 1]           │
//!              │ scheduler:  tasks ─▶ waves ─▶ dispatch::launch │
//!              └───────────────────────┬────────────────────────┘
//!                                      │ Transport
//!                               [neighbor subdomains]
//! ```

pub mod compact;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod frame_list;
pub mod grid;
pub mod mapper;
pub mod particle;
pub mod pool;
pub mod relocate;
pub mod schedule;
pub mod shared;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{DomainExitPolicy, GridConfig, PoolConfig, RelocationConfig, StoreConfig};
pub use dispatch::OpCounts;
pub use error::{StoreError, StoreResult};
pub use exchange::{ExchangeQueue, ExchangeState};
pub use frame::{Frame, FrameId, SlotMask, NULL_FRAME};
pub use frame_list::{FrameList, SlotRef};
pub use grid::{Area, AreaMask, Direction, GridLayout, Region};
pub use mapper::{AreaMapper, RegionMapper, StrideMapper, SupercellMapper};
pub use particle::{Particle, ParticleRecord};
pub use pool::{FrameAccess, FramePool};
pub use schedule::{Plan, Scheduler};
pub use store::{Operation, ParticleStore, PassReport, StoreStats};
pub use transport::{MailboxTransport, Transport};

#[cfg(feature = "runtime")]
pub use transport::{Packet, RingTransport};
