//! Particle Store - the surface the simulation step drives.
//!
//! Owns the frame pool, one frame list per supercell, one exchange queue
//! per direction and the scheduler that orders kernel dispatches.
//!
//! Every operation is prepared on the host, turned into scheduler tasks and
//! run as one plan. `submit` puts several operations into the same plan so
//! independent ones share waves. A call returns only after its plan
//! finished, so each call is a synchronization point: frames released by
//! workers are reclaimed before it returns.
//!
//! ```text
//!  physics ─▶ shift_particles ─▶ fill_all_gaps
//!                                    │
//!                 copy_guard_to_exchange ─▶ send ─▶ receive ─▶ insert_particles
//!                                                                  │
//!                                                          fill_border_gaps
//! ```

use std::fmt;
use std::hash::Hasher;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rustc_hash::FxHasher;
use tracing::{debug, info, warn};

use crate::compact;
use crate::config::{DomainExitPolicy, StoreConfig};
use crate::dispatch::{self, OpCounts};
use crate::error::{StoreError, StoreResult};
use crate::exchange::{self, ExchangeQueue, ExchangeState};
use crate::frame::NULL_FRAME;
use crate::frame_list::{FrameList, SlotRef};
use crate::grid::{AreaMask, Direction, GridLayout, Region};
use crate::mapper::{AreaMapper, RegionMapper, StrideMapper, SupercellMapper};
use crate::particle::ParticleRecord;
use crate::pool::{DeviceFrames, FrameAccess, FramePool};
use crate::relocate;
use crate::schedule::{Access, CellSet, Footprint, Plan, Scheduler, Task};
use crate::shared::SharedMut;
use crate::transport::Transport;

/// Outcome of one store operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Particles moved between containers
    pub moved: u64,
    /// Particles killed (domain exit, deletion)
    pub discarded: u64,
    /// Frames claimed from the pool
    pub allocated_frames: u64,
    /// Frames returned to the pool
    pub released_frames: u64,
    /// Tasks scheduled
    pub tasks: usize,
    /// Waves the tasks ran in
    pub waves: usize,
}

impl PassReport {
    fn new(counts: OpCounts, plan: &Plan) -> Self {
        Self {
            moved: counts.moved,
            discarded: counts.discarded,
            allocated_frames: counts.allocated_frames,
            released_frames: counts.released_frames,
            tasks: plan.waves.iter().map(Vec::len).sum(),
            waves: plan.waves.len(),
        }
    }
}

impl AddAssign for PassReport {
    fn add_assign(&mut self, rhs: PassReport) {
        self.moved += rhs.moved;
        self.discarded += rhs.discarded;
        self.allocated_frames += rhs.allocated_frames;
        self.released_frames += rhs.released_frames;
        self.tasks += rhs.tasks;
        self.waves += rhs.waves;
    }
}

/// Snapshot of store-wide counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub step: u64,
    pub supercells: usize,
    pub live_particles: u64,
    pub queued_particles: u64,
    pub frames_in_use: u32,
    pub frame_capacity: u32,
    pub total_allocs: u64,
    pub total_releases: u64,
}

/// A store operation that can share one dependency plan with others
/// through [`ParticleStore::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation<const D: usize> {
    ShiftParticles(AreaMask),
    FillGaps(AreaMask),
    CopyGuardToExchange(Direction<D>),
    InsertParticles(Direction<D>),
    DeleteGuardParticles(Direction<D>),
    DeleteParticlesInArea(AreaMask),
}

impl<const D: usize> Operation<D> {
    pub const fn name(&self) -> &'static str {
        match self {
            Operation::ShiftParticles(_) => "shift_particles",
            Operation::FillGaps(_) => "fill_gaps",
            Operation::CopyGuardToExchange(_) => "copy_guard_to_exchange",
            Operation::InsertParticles(_) => "insert_particles",
            Operation::DeleteGuardParticles(_) => "delete_guard_particles",
            Operation::DeleteParticlesInArea(_) => "delete_particles_in_area",
        }
    }
}

/// Exchange state of one direction as a batch will leave it.
struct Lane {
    state: ExchangeState,
    has_frames: bool,
    /// An insertion in the batch owns the queue
    claimed: bool,
}

#[derive(Clone, Copy)]
enum SupercellKernel {
    Compact,
    Delete,
}

/// Particles bound for one destination, tagged with their queue position.
struct InsertGroup<P> {
    dest: usize,
    particles: Vec<(usize, P)>,
    placed: AtomicU32,
}

/// Host-side work done before a plan runs; tasks borrow from it.
enum Prepared<P, const D: usize> {
    Shift {
        passes: Vec<([u32; D], Vec<usize>)>,
        footprint: CellSet,
        discarded: AtomicU64,
    },
    Supercells {
        label: &'static str,
        work: Vec<usize>,
        kernel: SupercellKernel,
    },
    Extract {
        direction: Direction<D>,
        region: Region<D>,
        work: Vec<usize>,
    },
    Insert {
        direction: Direction<D>,
        /// Queue contents at preparation, in queue order
        batch: Vec<P>,
        groups: Vec<InsertGroup<P>>,
    },
    Skip,
}

/// Shared views handed to every task of one plan.
#[derive(Clone, Copy)]
struct Views<'a, P> {
    supercells: SharedMut<'a, FrameList>,
    queues: SharedMut<'a, ExchangeQueue>,
    frames: DeviceFrames<'a, P>,
}

impl<'a, P: Copy + Default> Views<'a, P> {
    fn new(
        supercells: &'a mut [FrameList],
        queues: &'a mut [ExchangeQueue],
        pool: &'a mut FramePool<P>,
    ) -> Self {
        Self {
            supercells: SharedMut::new(supercells),
            queues: SharedMut::new(queues),
            // Safety: every task built from these views declares the
            // supercells and queues it writes, the scheduler never runs two
            // conflicting tasks at once, and the kernels inside a task
            // partition their work by supercell.
            frames: unsafe { pool.device() },
        }
    }
}

/// Particle storage for one subdomain.
///
/// Generic over the particle record `P` and the dimension `D` (2 or 3).
pub struct ParticleStore<P, const D: usize> {
    config: StoreConfig,
    layout: GridLayout<D>,
    pool: FramePool<P>,
    /// One frame list per supercell, indexed by linear supercell index
    supercells: Vec<FrameList>,
    /// One queue per direction, indexed by `Direction::index`
    queues: Vec<ExchangeQueue>,
    /// Received particles not yet staged, per direction. Non-empty only
    /// while the direction is `Absorbing`.
    held: Vec<Vec<P>>,
    scheduler: Scheduler,
    step: u64,
}

impl<P: ParticleRecord<D>, const D: usize> ParticleStore<P, D> {
    /// Build a store from a validated configuration.
    ///
    /// All frames are allocated here; no operation allocates afterwards.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let layout = config.layout::<D>()?;
        let pool = FramePool::new(config.pool.frames, layout.tile_size());
        let queues: Vec<ExchangeQueue> = Direction::<D>::all()
            .iter()
            .map(|d| ExchangeQueue::new(d.id(), config.pool.exchange_size_hint))
            .collect();

        info!(
            dims = D,
            supercells = layout.supercell_count(),
            tile_size = layout.tile_size(),
            frames = config.pool.frames,
            "particle store created"
        );

        Ok(Self {
            supercells: vec![FrameList::new(); layout.supercell_count()],
            config,
            layout,
            pool,
            held: vec![Vec::new(); queues.len()],
            queues,
            scheduler: Scheduler::new(),
            step: 0,
        })
    }

    // ========================================================================
    // Relocation and compaction
    // ========================================================================

    /// Move every particle that drifted out of its supercell in `mask` into
    /// the neighbor that contains it.
    ///
    /// Runs one task per stride sub-pass. The sub-passes write overlapping
    /// footprints, so the scheduler runs them strictly in order.
    ///
    /// # Errors
    /// `ExcessiveDisplacement`, `DomainExit` (reject policy) or
    /// `PoolExhausted`. Moves completed before the failure are kept.
    pub fn shift_particles(&mut self, mask: AreaMask) -> StoreResult<PassReport> {
        self.submit(&[Operation::ShiftParticles(mask)])
    }

    /// Remove holes from every supercell in `mask`.
    ///
    /// Afterwards every frame but the last is full, the last is a prefix,
    /// empty trailing frames are back in the pool and counts are exact.
    pub fn fill_gaps(&mut self, mask: AreaMask) -> StoreResult<PassReport> {
        self.submit(&[Operation::FillGaps(mask)])
    }

    /// Compact CORE, BORDER and GUARD.
    pub fn fill_all_gaps(&mut self) -> StoreResult<PassReport> {
        self.fill_gaps(AreaMask::ALL)
    }

    /// Compact BORDER only (after insertion).
    pub fn fill_border_gaps(&mut self) -> StoreResult<PassReport> {
        self.fill_gaps(AreaMask::BORDER)
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    /// Move every particle in guard region `d` into queue `d`.
    pub fn copy_guard_to_exchange(&mut self, direction: Direction<D>) -> StoreResult<PassReport> {
        self.copy_guard_to_exchange_many(&[direction])
    }

    /// Extract several directions. Guard regions are disjoint, so the
    /// extractions run as one wave.
    ///
    /// Guard supercells are left with dead slots and a zero count until the
    /// next compaction.
    pub fn copy_guard_to_exchange_many(&mut self, directions: &[Direction<D>]) -> StoreResult<PassReport> {
        let ops: Vec<_> = directions.iter().map(|&d| Operation::CopyGuardToExchange(d)).collect();
        self.submit(&ops)
    }

    /// Drain queue `d` into the transport.
    ///
    /// # Returns
    /// Number of particles sent
    pub fn send_exchange<T>(&mut self, direction: Direction<D>, transport: &mut T) -> StoreResult<usize>
    where
        T: Transport<P, D>,
    {
        let queue = &mut self.queues[direction.index()];
        queue.expect(&[ExchangeState::Extracting])?;

        let hint = queue.size_hint() as usize;
        let (batch, released) = exchange::drain(&mut queue.list, &mut self.pool, hint);
        let len = batch.len();
        queue.enter(ExchangeState::InTransit);
        transport.send(direction, batch)?;

        debug!(direction = %direction, particles = len, frames = released, "sent exchange batch");
        Ok(len)
    }

    /// Stage the batch the neighbor in `d` sent towards this subdomain.
    ///
    /// If the pool runs out, the staged part stays in the queue and the rest
    /// is held by the store; the direction is `Absorbing` either way. Calling
    /// again stages the held particles without contacting the transport.
    ///
    /// # Returns
    /// Number of particles staged by this call
    pub fn receive_exchange<T>(&mut self, direction: Direction<D>, transport: &mut T) -> StoreResult<usize>
    where
        T: Transport<P, D>,
    {
        let idx = direction.index();
        let queue = &mut self.queues[idx];
        let held = &mut self.held[idx];
        if held.is_empty() {
            queue.expect(&[ExchangeState::Idle, ExchangeState::InTransit])?;
            *held = transport.receive(direction)?;
            queue.observe_batch(held.len());
        }

        let staged = exchange::stage(&mut queue.list, &mut self.pool, held);
        queue.enter(ExchangeState::Absorbing);
        let counts = staged?;

        debug!(
            direction = %direction,
            particles = counts.moved,
            frames = counts.allocated_frames,
            "received exchange batch"
        );
        Ok(counts.moved as usize)
    }

    /// Insert the particles of queue `d` into border region `d`.
    pub fn insert_particles(&mut self, direction: Direction<D>) -> StoreResult<PassReport> {
        self.insert_particles_many(&[direction])
    }

    /// Insert several directions.
    ///
    /// Every particle is routed before anything runs, so a misrouted
    /// particle leaves all queues intact. Border regions of different
    /// directions may overlap; the scheduler orders those insertions.
    /// Queue frames are released only once their direction is fully
    /// inserted: on pool exhaustion the particles not yet placed stay
    /// queued and the direction stays `Absorbing`, ready for a retry.
    pub fn insert_particles_many(&mut self, directions: &[Direction<D>]) -> StoreResult<PassReport> {
        let ops: Vec<_> = directions.iter().map(|&d| Operation::InsertParticles(d)).collect();
        self.submit(&ops)
    }

    /// Release every frame of guard region `d`, killing its particles.
    pub fn delete_guard_particles(&mut self, direction: Direction<D>) -> StoreResult<PassReport> {
        self.submit(&[Operation::DeleteGuardParticles(direction)])
    }

    /// Release every frame of the supercells in `mask`.
    pub fn delete_particles_in_area(&mut self, mask: AreaMask) -> StoreResult<PassReport> {
        self.submit(&[Operation::DeleteParticlesInArea(mask)])
    }

    /// One full boundary exchange over every direction.
    ///
    /// Extract and compact the guard as one plan, send, receive, then insert
    /// and compact the border as a second plan. Every batch is sent before
    /// any is received, so a bounded transport must buffer a whole round.
    pub fn exchange_round<T>(&mut self, transport: &mut T) -> StoreResult<PassReport>
    where
        T: Transport<P, D>,
    {
        let directions = Direction::<D>::all();

        let mut ops: Vec<_> = directions.iter().map(|&d| Operation::CopyGuardToExchange(d)).collect();
        ops.push(Operation::FillGaps(AreaMask::GUARD));
        let mut report = self.submit(&ops)?;

        for &d in &directions {
            self.send_exchange(d, transport)?;
        }
        // Receive in the peer's send order: its batch for d arrives on mirror(d)
        for &d in &directions {
            self.receive_exchange(d.mirror(), transport)?;
        }

        let mut ops: Vec<_> = directions.iter().map(|&d| Operation::InsertParticles(d)).collect();
        ops.push(Operation::FillGaps(AreaMask::BORDER));
        report += self.submit(&ops)?;
        Ok(report)
    }

    // ========================================================================
    // Batched submission
    // ========================================================================

    /// Run several operations as one dependency plan.
    ///
    /// Operations are checked in order against the exchange states earlier
    /// operations of the batch leave behind, so an invalid sequence fails
    /// before anything runs. Tasks of different operations whose footprints
    /// do not conflict share a wave; the call returns once every wave ran.
    ///
    /// # Errors
    /// The first task error. Later waves are not started, and insertions
    /// that did not finish keep their remaining particles queued.
    pub fn submit(&mut self, operations: &[Operation<D>]) -> StoreResult<PassReport> {
        let prepared = self.prepare(operations)?;
        let layout = self.layout;
        let policy = self.config.relocation.exit_policy;

        let views = Views::new(&mut self.supercells, &mut self.queues, &mut self.pool);
        let mut tasks = Vec::new();
        for prep in &prepared {
            push_tasks(prep, layout, policy, views, &mut tasks);
        }
        let result = self.scheduler.run(tasks);

        let drained = self.settle(&prepared);
        let op = operations
            .first()
            .map(Operation::name)
            .filter(|name| operations.iter().all(|o| o.name() == *name))
            .unwrap_or("submit");
        let mut report = self.finish(op, result)?;
        report.released_frames += drained;

        let discarded: u64 = prepared
            .iter()
            .map(|prep| match prep {
                Prepared::Shift { discarded, .. } => discarded.load(Ordering::Relaxed),
                _ => 0,
            })
            .sum();
        if discarded > 0 {
            warn!(
                step = self.step,
                discarded,
                "particles left the tracked domain and were discarded"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every particle and queued batch and restart at `step`.
    pub fn reset(&mut self, step: u64) {
        self.pool.reset();
        self.supercells.fill(FrameList::new());
        for queue in &mut self.queues {
            queue.clear();
        }
        for held in &mut self.held {
            held.clear();
        }
        self.step = step;
        info!(step, "store reset");
    }

    /// Advance the step counter.
    ///
    /// # Returns
    /// The new step
    pub fn advance_step(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    /// Touch every frame to fault in its pages before the first step.
    pub fn warm_up(&mut self) {
        self.pool.warm_up();
    }

    /// Pin the calling thread to the last available core.
    pub fn pin_to_core() -> bool {
        if let Some(core_ids) = core_affinity::get_core_ids() {
            if let Some(last) = core_ids.last() {
                return core_affinity::set_for_current(*last);
            }
        }
        false
    }

    // ========================================================================
    // Host view
    // ========================================================================

    /// Append a particle to supercell `supercell` (host side).
    ///
    /// `particle.local_cell()` must already be relative to that supercell.
    pub fn add_particle(&mut self, supercell: usize, particle: P) -> StoreResult<SlotRef> {
        assert!(supercell < self.supercells.len(), "Supercell index out of bounds");
        self.supercells[supercell].append(&mut self.pool, particle)
    }

    /// Append a particle by global cell index (relative to the grid origin,
    /// guard included). The particle's local cell is overwritten.
    ///
    /// # Returns
    /// The supercell the particle was placed in
    pub fn add_particle_at(&mut self, cell: [i64; D], mut particle: P) -> StoreResult<usize> {
        let (coord, local) = self
            .layout
            .supercell_of_cell(cell)
            .ok_or_else(|| StoreError::OutOfGrid { cell: cell.to_vec() })?;
        particle.set_local_cell(local);
        let idx = self.layout.index(coord);
        self.add_particle(idx, particle)?;
        Ok(idx)
    }

    /// Copy out the live particles of one supercell.
    pub fn particles(&self, supercell: usize) -> Vec<P> {
        self.supercells[supercell].collect(&self.pool)
    }

    /// Apply `f` to every live particle of the supercells in `mask`.
    ///
    /// Runs one worker per supercell; `f` receives the supercell index.
    pub fn for_each_particle_mut<F>(&mut self, mask: AreaMask, f: F) -> StoreResult<()>
    where
        F: Fn(usize, &mut P) + Sync + Send,
    {
        let work = AreaMapper::new(self.layout, mask).supercells();
        let footprint = CellSet::from_indices(self.layout.supercell_count(), work.iter().copied());
        let f = &f;

        let views = Views::new(&mut self.supercells, &mut self.queues, &mut self.pool);
        let task = Task::new(
            "for_each_particle_mut",
            vec![Access::write(Footprint::Supercells(footprint))],
            move || {
                dispatch::launch(&work, |idx| {
                    let mut frames = views.frames;
                    // Safety: one worker per supercell
                    let list = unsafe { views.supercells.get(idx) };
                    let mut id = list.head;
                    while id != NULL_FRAME {
                        let frame = frames.frame_mut(id);
                        frame.for_each_mut(|p| f(idx, p));
                        id = frame.next;
                    }
                    Ok(OpCounts::default())
                })
            },
        );

        let result = self.scheduler.run(vec![task]);
        self.finish("for_each_particle_mut", result).map(|_| ())
    }

    /// Cached live count of one supercell.
    #[inline]
    pub fn live_count(&self, supercell: usize) -> u32 {
        self.supercells[supercell].count
    }

    /// Sum of cached live counts over the supercells in `mask`.
    pub fn total_live(&self, mask: AreaMask) -> u64 {
        self.supercells
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.layout.in_area(*idx, mask))
            .map(|(_, list)| list.count as u64)
            .sum()
    }

    /// Live slots per frame of one supercell, head to tail.
    pub fn frame_occupancy(&self, supercell: usize) -> Vec<u32> {
        self.supercells[supercell]
            .frame_ids(&self.pool)
            .into_iter()
            .map(|id| self.pool.frame(id).mask().live_count())
            .collect()
    }

    /// Returns true if every supercell in `mask` is hole-free.
    pub fn is_compacted(&self, mask: AreaMask) -> bool {
        self.supercells
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.layout.in_area(*idx, mask))
            .all(|(_, list)| compact::is_compacted(list, &self.pool))
    }

    /// Particles waiting in direction `d`: staged in the queue or held
    /// after a partial receive.
    pub fn exchange_len(&self, direction: Direction<D>) -> u32 {
        let idx = direction.index();
        self.queues[idx].len() + self.held[idx].len() as u32
    }

    pub fn exchange_queue(&self, direction: Direction<D>) -> &ExchangeQueue {
        &self.queues[direction.index()]
    }

    /// Returns true if every in-use frame is linked into exactly one
    /// container and every linked frame is in use.
    pub fn frames_accounted(&self) -> bool {
        let free = self.pool.free_list();
        let mut seen = vec![false; free.capacity() as usize];
        let mut owned = 0u32;
        let lists = self.supercells.iter().chain(self.queues.iter().map(|q| &q.list));
        for list in lists {
            for id in list.frame_ids(&self.pool) {
                if seen[id as usize] || !free.is_in_use(id) {
                    return false;
                }
                seen[id as usize] = true;
                owned += 1;
            }
        }
        owned == free.in_use_count()
    }

    pub fn stats(&self) -> StoreStats {
        let free = self.pool.free_list();
        StoreStats {
            step: self.step,
            supercells: self.supercells.len(),
            live_particles: self.total_live(AreaMask::ALL),
            queued_particles: self
                .queues
                .iter()
                .zip(&self.held)
                .map(|(q, held)| (q.len() as usize + held.len()) as u64)
                .sum(),
            frames_in_use: free.in_use_count(),
            frame_capacity: free.capacity(),
            total_allocs: free.total_allocs(),
            total_releases: free.total_releases(),
        }
    }

    /// Hash of the particle layout for determinism checks.
    ///
    /// Covers counts, slot positions and local cells of every supercell and
    /// the queue lengths. Frame handles are excluded: which handle a
    /// parallel claim receives is not deterministic.
    pub fn state_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (idx, list) in self.supercells.iter().enumerate() {
            if !list.has_frames() {
                continue;
            }
            hasher.write_usize(idx);
            hasher.write_u32(list.count);
            hasher.write_u32(list.frames);

            let mut id = list.head;
            while id != NULL_FRAME {
                let frame = self.pool.frame(id);
                for slot in frame.mask().live_slots() {
                    hasher.write_u32(slot);
                    if let Some(p) = frame.get(slot) {
                        for c in p.local_cell() {
                            hasher.write_i32(c);
                        }
                    }
                }
                id = frame.next;
            }
        }
        for (queue, held) in self.queues.iter().zip(&self.held) {
            hasher.write_u8(queue.direction());
            hasher.write_u32(queue.len() + held.len() as u32);
        }
        hasher.finish()
    }

    #[inline]
    pub fn layout(&self) -> &GridLayout<D> {
        &self.layout
    }

    #[inline]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[inline]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[inline]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn prepare(&self, operations: &[Operation<D>]) -> StoreResult<Vec<Prepared<P, D>>> {
        let mut lanes: Vec<Lane> = self
            .queues
            .iter()
            .map(|q| Lane {
                state: q.state(),
                has_frames: q.list.has_frames(),
                claimed: false,
            })
            .collect();
        operations
            .iter()
            .map(|&op| self.prepare_one(op, &mut lanes))
            .collect()
    }

    fn prepare_one(&self, op: Operation<D>, lanes: &mut [Lane]) -> StoreResult<Prepared<P, D>> {
        let layout = self.layout;
        let prepared = match op {
            Operation::ShiftParticles(mask) => {
                let mut mapper = StrideMapper::new(layout, mask, self.config.relocation.stride)?;
                let mut passes = Vec::with_capacity(mapper.sub_pass_count());
                loop {
                    passes.push((mapper.offset(), mapper.supercells()));
                    if !mapper.next() {
                        break;
                    }
                }
                Prepared::Shift {
                    passes,
                    footprint: relocate::footprint(&layout, mask),
                    discarded: AtomicU64::new(0),
                }
            }
            Operation::FillGaps(mask) => Prepared::Supercells {
                label: "fill_gaps",
                work: AreaMapper::new(layout, mask).supercells(),
                kernel: SupercellKernel::Compact,
            },
            Operation::CopyGuardToExchange(d) => {
                let lane = &mut lanes[d.index()];
                // An insertion earlier in the batch still owns the queue
                let state = if lane.claimed { ExchangeState::Absorbing } else { lane.state };
                exchange::check_state(d.id(), state, &[ExchangeState::Idle, ExchangeState::Extracting])?;
                lane.state = ExchangeState::Extracting;
                lane.has_frames = true;

                let region = layout.guard_region(d);
                Prepared::Extract {
                    direction: d,
                    region,
                    work: RegionMapper::new(layout, region).supercells(),
                }
            }
            Operation::InsertParticles(d) => {
                let lane = &mut lanes[d.index()];
                if lane.claimed || (lane.state == ExchangeState::Idle && !lane.has_frames) {
                    return Ok(Prepared::Skip);
                }
                exchange::check_state(d.id(), lane.state, &[ExchangeState::Absorbing])?;
                lane.claimed = true;

                let batch = self.queues[d.index()].list.collect(&self.pool);
                let mut routed = Vec::with_capacity(batch.len());
                for (n, particle) in batch.iter().enumerate() {
                    let (dest, rebased) = exchange::route(&layout, d, particle)?;
                    routed.push((dest, (n, rebased)));
                }
                let groups = exchange::group_by_destination(routed)
                    .into_iter()
                    .map(|(dest, particles)| InsertGroup {
                        dest,
                        particles,
                        placed: AtomicU32::new(0),
                    })
                    .collect();
                Prepared::Insert {
                    direction: d,
                    batch,
                    groups,
                }
            }
            Operation::DeleteGuardParticles(d) => Prepared::Supercells {
                label: "delete_guard_particles",
                work: RegionMapper::new(layout, layout.guard_region(d)).supercells(),
                kernel: SupercellKernel::Delete,
            },
            Operation::DeleteParticlesInArea(mask) => Prepared::Supercells {
                label: "delete_particles_in_area",
                work: AreaMapper::new(layout, mask).supercells(),
                kernel: SupercellKernel::Delete,
            },
        };
        Ok(prepared)
    }

    /// Exchange bookkeeping once a plan ran, whether or not it failed.
    ///
    /// # Returns
    /// Frames released from drained queues
    fn settle(&mut self, prepared: &[Prepared<P, D>]) -> u64 {
        let mut drained = 0u64;
        for prep in prepared {
            match prep {
                Prepared::Extract { direction, .. } => {
                    let queue = &mut self.queues[direction.index()];
                    queue.enter(ExchangeState::Extracting);
                    let len = queue.len() as usize;
                    queue.observe_batch(len);
                }
                Prepared::Insert {
                    direction,
                    batch,
                    groups,
                } => {
                    let mut rest: Vec<usize> = groups
                        .iter()
                        .flat_map(|g| {
                            let placed = g.placed.load(Ordering::Acquire) as usize;
                            g.particles[placed..].iter().map(|(n, _)| *n)
                        })
                        .collect();

                    let idx = direction.index();
                    let queue = &mut self.queues[idx];
                    drained += queue.list.release_all(&mut self.pool) as u64;
                    if rest.is_empty() && self.held[idx].is_empty() {
                        queue.enter(ExchangeState::Idle);
                        continue;
                    }

                    // Requeue in queue order; the frames just released cover it
                    rest.sort_unstable();
                    let mut requeue: Vec<P> = rest.into_iter().map(|n| batch[n]).collect();
                    if exchange::stage(&mut queue.list, &mut self.pool, &mut requeue).is_err() {
                        requeue.append(&mut self.held[idx]);
                        self.held[idx] = requeue;
                    }
                    queue.enter(ExchangeState::Absorbing);
                }
                _ => {}
            }
        }
        drained
    }

    /// Reclaim deferred releases and turn counters into a report.
    fn finish(&mut self, op: &str, result: StoreResult<OpCounts>) -> StoreResult<PassReport> {
        let reclaimed = self.pool.reclaim();
        let counts = result?;
        let report = PassReport::new(counts, self.scheduler.last_plan());
        debug!(
            op,
            step = self.step,
            moved = report.moved,
            discarded = report.discarded,
            allocated = report.allocated_frames,
            released = report.released_frames,
            reclaimed,
            waves = report.waves,
            "pass complete"
        );
        Ok(report)
    }
}

impl<P, const D: usize> fmt::Debug for ParticleStore<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticleStore")
            .field("step", &self.step)
            .field("layout", &self.layout)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Body of one extraction task: workers stage into private lists, which
/// are then spliced into the queue in region order.
fn extract_direction<P, const D: usize>(
    layout: &GridLayout<D>,
    direction: Direction<D>,
    region: &Region<D>,
    work: &[usize],
    views: Views<'_, P>,
) -> StoreResult<OpCounts>
where
    P: ParticleRecord<D>,
{
    let mut staged = vec![FrameList::new(); work.len()];
    let positions: Vec<usize> = (0..work.len()).collect();
    let staged_view = SharedMut::new(&mut staged);

    let result = dispatch::launch(&positions, |n| {
        let mut frames = views.frames;
        let idx = work[n];
        // Safety: guard supercells and staging lists are one per worker
        let list = unsafe { views.supercells.get_mut(idx) };
        let out = unsafe { staged_view.get_mut(n) };
        exchange::extract_supercell(layout, region, idx, list, out, &mut frames)
    });

    // Splice even on failure so no staged frame is orphaned
    let mut frames = views.frames;
    // Safety: this task holds the direction's queue exclusively
    let queue = unsafe { views.queues.get_mut(direction.index()) };
    for list in staged.iter_mut() {
        queue.list.splice_back(&mut frames, list);
    }
    result
}

/// Build the tasks of one prepared operation.
fn push_tasks<'a, P, const D: usize>(
    prep: &'a Prepared<P, D>,
    layout: GridLayout<D>,
    policy: DomainExitPolicy,
    views: Views<'a, P>,
    tasks: &mut Vec<Task<'a>>,
) where
    P: ParticleRecord<D>,
{
    let count = layout.supercell_count();
    match prep {
        Prepared::Shift {
            passes,
            footprint,
            discarded,
        } => {
            for (offset, work) in passes {
                let accesses = vec![
                    Access::write(Footprint::Supercells(footprint.clone())),
                    Access::atomic(Footprint::Pool),
                ];
                tasks.push(Task::new(format!("shift {:?}", offset), accesses, move || {
                    let counts = dispatch::launch(work, |idx| {
                        let mut frames = views.frames;
                        relocate::shift_supercell(&layout, views.supercells, &mut frames, idx, policy)
                    })?;
                    discarded.fetch_add(counts.discarded, Ordering::Relaxed);
                    Ok(counts)
                }));
            }
        }
        Prepared::Supercells { label, work, kernel } => {
            let kernel = *kernel;
            let accesses = vec![
                Access::write(Footprint::Supercells(CellSet::from_indices(count, work.iter().copied()))),
                Access::atomic(Footprint::Pool),
            ];
            tasks.push(Task::new(*label, accesses, move || {
                dispatch::launch(work, |idx| {
                    let mut frames = views.frames;
                    // Safety: one worker per supercell
                    let list = unsafe { views.supercells.get_mut(idx) };
                    Ok(match kernel {
                        SupercellKernel::Compact => compact::compact_supercell(list, &mut frames),
                        SupercellKernel::Delete => OpCounts {
                            discarded: list.recount(&frames) as u64,
                            released_frames: list.release_all(&mut frames) as u64,
                            ..OpCounts::default()
                        },
                    })
                })
            }));
        }
        Prepared::Extract {
            direction,
            region,
            work,
        } => {
            let direction = *direction;
            let accesses = vec![
                Access::write(Footprint::Supercells(CellSet::from_indices(count, work.iter().copied()))),
                Access::write(Footprint::Exchange(direction.id())),
                Access::atomic(Footprint::Pool),
            ];
            tasks.push(Task::new(format!("extract {}", direction), accesses, move || {
                extract_direction(&layout, direction, region, work, views)
            }));
        }
        Prepared::Insert { direction, groups, .. } => {
            let accesses = vec![
                Access::write(Footprint::Supercells(CellSet::from_indices(
                    count,
                    groups.iter().map(|g| g.dest),
                ))),
                Access::atomic(Footprint::Pool),
            ];
            tasks.push(Task::new(format!("insert {}", direction), accesses, move || {
                insert_groups(groups, views)
            }));
        }
        Prepared::Skip => {}
    }
}

/// Body of one insertion task: one worker per destination supercell.
///
/// Each group counts the particles it placed, so a failed insertion knows
/// what is still queued.
fn insert_groups<P>(groups: &[InsertGroup<P>], views: Views<'_, P>) -> StoreResult<OpCounts>
where
    P: Copy + Default + Send + Sync,
{
    let positions: Vec<usize> = (0..groups.len()).collect();
    dispatch::launch(&positions, |n| {
        let mut frames = views.frames;
        let group = &groups[n];
        // Safety: destinations are unique within a task
        let list = unsafe { views.supercells.get_mut(group.dest) };
        let frames_before = list.frames;
        for (_, particle) in &group.particles {
            list.append(&mut frames, *particle)?;
            group.placed.fetch_add(1, Ordering::Release);
        }
        Ok(OpCounts {
            moved: group.particles.len() as u64,
            allocated_frames: (list.frames - frames_before) as u64,
            ..OpCounts::default()
        })
    })
}
