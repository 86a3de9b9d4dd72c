//! Scheduler - explicit dependency tracking between store operations.
//!
//! Every operation is submitted as a task that declares the resources it
//! touches. A task waits only on earlier tasks whose footprint overlaps its
//! own with a conflicting access; tasks without mutual conflicts form a
//! wave and run concurrently.
//!
//! ```text
//!  tasks:   extract(+x)  extract(-x)  insert(+x)  insert(+x+y)
//!  waves:   [ extract(+x), extract(-x), insert(+x) ]   [ insert(+x+y) ]
//! ```
//!
//! The footprints are the only thing standing between concurrent task
//! bodies and aliasing `SharedMut` views, so they must cover every
//! supercell a body may write.

use std::fmt;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::trace;

use crate::dispatch::OpCounts;
use crate::error::StoreResult;

/// Dense bitset over supercell indices.
#[derive(Clone, PartialEq, Eq)]
pub struct CellSet {
    bits: Vec<u64>,
    len: usize,
}

impl CellSet {
    /// Empty set over `len` supercells
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Set containing the given indices
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut set = Self::new(len);
        for idx in indices {
            set.insert(idx);
        }
        set
    }

    #[inline(always)]
    pub fn insert(&mut self, idx: usize) {
        let word = idx >> 6;
        if word < self.bits.len() {
            self.bits[word] |= 1u64 << (idx & 63);
        }
    }

    #[inline(always)]
    pub fn contains(&self, idx: usize) -> bool {
        let word = idx >> 6;
        word < self.bits.len() && self.bits[word] & (1u64 << (idx & 63)) != 0
    }

    /// Returns true if the sets share an index
    #[inline]
    pub fn intersects(&self, other: &CellSet) -> bool {
        self.bits.iter().zip(&other.bits).any(|(a, b)| a & b != 0)
    }

    /// Number of indices in the set
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Capacity in supercells
    pub fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for CellSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CellSet({} of {})", self.count(), self.len)
    }
}

/// A resource a task touches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Footprint {
    /// Frame lists of a set of supercells (and the frames they own)
    Supercells(CellSet),
    /// Exchange queue of one direction (and the frames it owns)
    Exchange(u8),
    /// The frame pool's free list
    Pool,
}

impl Footprint {
    /// Returns true if the footprints share a resource
    pub fn overlaps(&self, other: &Footprint) -> bool {
        match (self, other) {
            (Footprint::Supercells(a), Footprint::Supercells(b)) => a.intersects(b),
            (Footprint::Exchange(a), Footprint::Exchange(b)) => a == b,
            (Footprint::Pool, Footprint::Pool) => true,
            _ => false,
        }
    }
}

/// How a task touches a footprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    /// Concurrent-safe mutation (atomic claim and return)
    Atomic,
}

/// One declared access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Access {
    pub footprint: Footprint,
    pub mode: AccessMode,
}

impl Access {
    pub fn read(footprint: Footprint) -> Self {
        Self {
            footprint,
            mode: AccessMode::Read,
        }
    }

    pub fn write(footprint: Footprint) -> Self {
        Self {
            footprint,
            mode: AccessMode::Write,
        }
    }

    pub fn atomic(footprint: Footprint) -> Self {
        Self {
            footprint,
            mode: AccessMode::Atomic,
        }
    }

    /// Two accesses conflict when they overlap and are not both reads or
    /// both atomic.
    pub fn conflicts_with(&self, other: &Access) -> bool {
        if !self.footprint.overlaps(&other.footprint) {
            return false;
        }
        !matches!(
            (self.mode, other.mode),
            (AccessMode::Read, AccessMode::Read) | (AccessMode::Atomic, AccessMode::Atomic)
        )
    }
}

type TaskBody<'a> = Box<dyn FnOnce() -> StoreResult<OpCounts> + Send + 'a>;

/// A unit of work plus the accesses it declares.
pub struct Task<'a> {
    label: String,
    accesses: Vec<Access>,
    body: TaskBody<'a>,
}

impl<'a> Task<'a> {
    pub fn new<F>(label: impl Into<String>, accesses: Vec<Access>, body: F) -> Self
    where
        F: FnOnce() -> StoreResult<OpCounts> + Send + 'a,
    {
        Self {
            label: label.into(),
            accesses,
            body: Box::new(body),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn conflicts_with(&self, other: &Task<'_>) -> bool {
        self.accesses
            .iter()
            .any(|a| other.accesses.iter().any(|b| a.conflicts_with(b)))
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("accesses", &self.accesses)
            .finish()
    }
}

/// Executed plan of one `run` call: task labels per wave.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub waves: Vec<Vec<String>>,
}

impl Plan {
    /// Wave a task ran in
    pub fn wave_of(&self, label: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|l| l == label))
    }
}

/// Groups tasks into conflict-free waves and executes them in order.
#[derive(Debug, Default)]
pub struct Scheduler {
    last_plan: Plan,
    tasks_run: u64,
    waves_run: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign each task a wave: one past the latest earlier task it
    /// conflicts with (wave 0 if none).
    pub fn plan(tasks: &[Task<'_>]) -> Vec<usize> {
        let mut waves = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            let wave = (0..i)
                .rev()
                .filter(|&j| task.conflicts_with(&tasks[j]))
                .map(|j| waves[j] + 1)
                .max()
                .unwrap_or(0);
            waves.push(wave);
        }
        waves
    }

    /// Execute tasks respecting their declared conflicts.
    ///
    /// A wave runs only after the previous wave completed. The first error
    /// stops the run after the failing wave; later waves are not started.
    pub fn run(&mut self, tasks: Vec<Task<'_>>) -> StoreResult<OpCounts> {
        let assignment = Self::plan(&tasks);
        let wave_count = assignment.iter().max().map_or(0, |&w| w + 1);

        let mut grouped: Vec<Vec<Task<'_>>> = (0..wave_count).map(|_| Vec::new()).collect();
        for (task, wave) in tasks.into_iter().zip(assignment) {
            grouped[wave].push(task);
        }

        self.last_plan = Plan {
            waves: grouped
                .iter()
                .map(|wave| wave.iter().map(|t| t.label.clone()).collect())
                .collect(),
        };

        let mut total = OpCounts::default();
        for (n, wave) in grouped.into_iter().enumerate() {
            trace!(wave = n, tasks = ?self.last_plan.waves[n], "running wave");
            self.tasks_run += wave.len() as u64;
            self.waves_run += 1;
            total += Self::run_wave(wave)?;
        }
        Ok(total)
    }

    #[cfg(feature = "parallel")]
    fn run_wave(wave: Vec<Task<'_>>) -> StoreResult<OpCounts> {
        if wave.len() == 1 {
            return wave.into_iter().map(|t| (t.body)()).sum_counts();
        }
        wave.into_par_iter()
            .map(|t| (t.body)())
            .try_reduce(OpCounts::default, |a, b| Ok(a + b))
    }

    #[cfg(not(feature = "parallel"))]
    fn run_wave(wave: Vec<Task<'_>>) -> StoreResult<OpCounts> {
        wave.into_iter().map(|t| (t.body)()).sum_counts()
    }

    /// Plan of the most recent `run`
    pub fn last_plan(&self) -> &Plan {
        &self.last_plan
    }

    /// Lifetime task count
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run
    }

    /// Lifetime wave count
    pub fn waves_run(&self) -> u64 {
        self.waves_run
    }
}

trait SumCounts {
    fn sum_counts(self) -> StoreResult<OpCounts>;
}

impl<I: Iterator<Item = StoreResult<OpCounts>>> SumCounts for I {
    fn sum_counts(self) -> StoreResult<OpCounts> {
        let mut total = OpCounts::default();
        for counts in self {
            total += counts?;
        }
        Ok(total)
    }
}
