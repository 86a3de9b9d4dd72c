//! Exchange Buffers - per-direction staging queues for the boundary protocol.
//!
//! ```text
//!            copy_guard_to_exchange       send_exchange
//!   Idle ───────────────────────▶ Extracting ────────────▶ InTransit
//!    ▲  ╲                                                      │
//!    │   ╲ receive_exchange (receive-only direction)           │ receive_exchange
//!    │    ╲────────────────────────────────────────────╮       │
//!    │             insert_particles                    ▼       ▼
//!    └──────────────────────────────────────────── Absorbing ◀─┘
//! ```
//!
//! Particles in a queue carry cell indices relative to the origin of the
//! region they were extracted from (guard side) or will be inserted into
//! (border side). Guard and border of a direction have the same width, so
//! the sender's guard coordinates are the receiver's border coordinates.

use std::fmt;

use crate::dispatch::OpCounts;
use crate::error::{StoreError, StoreResult};
use crate::frame::NULL_FRAME;
use crate::frame_list::FrameList;
use crate::grid::{Direction, GridLayout, Region};
use crate::particle::ParticleRecord;
use crate::pool::FrameAccess;

/// Protocol state of one direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    Idle,
    Extracting,
    InTransit,
    Absorbing,
}

impl ExchangeState {
    pub const fn name(self) -> &'static str {
        match self {
            ExchangeState::Idle => "idle",
            ExchangeState::Extracting => "extracting",
            ExchangeState::InTransit => "in-transit",
            ExchangeState::Absorbing => "absorbing",
        }
    }
}

impl fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Frames in transit for one direction.
#[derive(Clone, Debug)]
pub struct ExchangeQueue {
    direction: u8,
    /// Frames owned by the queue
    pub list: FrameList,
    size_hint: u32,
    state: ExchangeState,
}

impl ExchangeQueue {
    pub fn new(direction: u8, size_hint: u32) -> Self {
        Self {
            direction,
            list: FrameList::new(),
            size_hint,
            state: ExchangeState::Idle,
        }
    }

    #[inline]
    pub fn direction(&self) -> u8 {
        self.direction
    }

    #[inline]
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Expected batch size (particles), tracks the largest batch seen
    #[inline]
    pub fn size_hint(&self) -> u32 {
        self.size_hint
    }

    /// Particles currently staged
    #[inline]
    pub fn len(&self) -> u32 {
        self.list.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.count == 0
    }

    /// Fail unless the queue is in one of `allowed`.
    pub fn expect(&self, allowed: &[ExchangeState]) -> StoreResult<()> {
        check_state(self.direction, self.state, allowed)
    }

    /// Move to `next` after a checked operation completed.
    #[inline]
    pub fn enter(&mut self, next: ExchangeState) {
        self.state = next;
    }

    /// Record a batch size
    #[inline]
    pub fn observe_batch(&mut self, len: usize) {
        self.size_hint = self.size_hint.max(len as u32);
    }

    /// Forget all frames and return to idle. The caller resets the pool.
    pub fn clear(&mut self) {
        self.list = FrameList::new();
        self.state = ExchangeState::Idle;
    }
}

/// Fail unless `actual` is one of `allowed`.
pub fn check_state(direction: u8, actual: ExchangeState, allowed: &[ExchangeState]) -> StoreResult<()> {
    if allowed.contains(&actual) {
        return Ok(());
    }
    Err(StoreError::ExchangeState {
        direction,
        actual: actual.name(),
        expected: allowed.first().map_or("none", |s| s.name()),
    })
}

/// Move every live particle of one guard supercell into `staged`.
///
/// Cell indices are rewritten relative to `region.lo`. The supercell's
/// count drops to zero but its frames stay linked with dead slots until
/// the next compaction. If the pool runs out, the particles not yet moved
/// stay in place and the count is recomputed from the masks.
pub fn extract_supercell<P, A, const D: usize>(
    layout: &GridLayout<D>,
    region: &Region<D>,
    idx: usize,
    list: &mut FrameList,
    staged: &mut FrameList,
    frames: &mut A,
) -> StoreResult<OpCounts>
where
    P: ParticleRecord<D>,
    A: FrameAccess<Particle = P>,
{
    let mut counts = OpCounts::default();
    let coord = layout.coord(idx);
    let size = layout.supercell_size();
    let mut base = [0i32; D];
    for i in 0..D {
        base[i] = ((coord[i] - region.lo[i]) * size[i]) as i32;
    }

    let tile = frames.tile_size();
    let mut id = list.head;
    while id != NULL_FRAME {
        let next = frames.frame(id).next;
        for slot in 0..tile {
            let Some(&particle) = frames.frame(id).get(slot) else {
                continue;
            };
            let mut moved = particle;
            let mut cell = particle.local_cell();
            for i in 0..D {
                cell[i] += base[i];
            }
            moved.set_local_cell(cell);

            let frames_before = staged.frames;
            if let Err(err) = staged.append(frames, moved) {
                list.count = list.recount(&*frames);
                return Err(err);
            }
            counts.allocated_frames += (staged.frames - frames_before) as u64;

            frames.frame_mut(id).take(slot);
            counts.moved += 1;
        }
        id = next;
    }

    list.count = 0;
    Ok(counts)
}

/// Destination supercell of a received particle, plus its rebased record.
///
/// # Errors
/// `StoreError::Misrouted` if the particle resolves outside the border
/// region of `direction`.
pub fn route<P, const D: usize>(
    layout: &GridLayout<D>,
    direction: Direction<D>,
    particle: &P,
) -> StoreResult<(usize, P)>
where
    P: ParticleRecord<D>,
{
    let region = layout.border_region(direction);
    let local = particle.local_cell();
    let offset = layout.supercell_offset(local);

    let mut coord = [0u32; D];
    for i in 0..D {
        let c = region.lo[i] as i64 + offset[i] as i64;
        if c < region.lo[i] as i64 || c >= region.hi[i] as i64 {
            return Err(StoreError::Misrouted {
                direction: direction.id(),
            });
        }
        coord[i] = c as u32;
    }

    let mut rebased = *particle;
    rebased.set_local_cell(layout.rebase(local, offset));
    Ok((layout.index(coord), rebased))
}

/// Drain a queue, releasing each frame as soon as it is emptied.
///
/// # Returns
/// The particles in list order and the number of frames released
pub fn drain<A>(list: &mut FrameList, frames: &mut A, size_hint: usize) -> (Vec<A::Particle>, u64)
where
    A: FrameAccess,
{
    let mut out = Vec::with_capacity(size_hint.max(list.count as usize));
    let mut released = 0;
    while let Some(id) = list.pop_frame_front(frames) {
        out.extend(frames.frame(id).particles().copied());
        frames.release(id);
        released += 1;
    }
    list.count = 0;
    (out, released)
}

/// Append a received batch to a queue, removing staged particles from
/// `batch`.
///
/// On pool exhaustion the unstaged tail is left in `batch`, in order.
pub fn stage<A>(list: &mut FrameList, frames: &mut A, batch: &mut Vec<A::Particle>) -> StoreResult<OpCounts>
where
    A: FrameAccess,
{
    let mut counts = OpCounts::default();
    let frames_before = list.frames;
    let mut result = Ok(());
    for particle in batch.iter() {
        if let Err(err) = list.append(frames, *particle) {
            result = Err(err);
            break;
        }
        counts.moved += 1;
    }
    counts.allocated_frames = (list.frames - frames_before) as u64;
    batch.drain(..counts.moved as usize);
    result.map(|_| counts)
}

/// Group routed particles by destination supercell, keeping arrival order
/// within each group.
pub fn group_by_destination<P>(mut routed: Vec<(usize, P)>) -> Vec<(usize, Vec<P>)> {
    routed.sort_by_key(|(dest, _)| *dest);
    let mut groups: Vec<(usize, Vec<P>)> = Vec::new();
    for (dest, particle) in routed {
        match groups.last_mut() {
            Some((last, batch)) if *last == dest => batch.push(particle),
            _ => groups.push((dest, vec![particle])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use crate::pool::FramePool;

    fn layout() -> GridLayout<2> {
        GridLayout::new([4, 4], 1, [2, 2]).unwrap()
    }

    #[test]
    fn test_state_checks() {
        let mut queue = ExchangeQueue::new(5, 16);
        assert!(queue.expect(&[ExchangeState::Idle]).is_ok());
        let err = queue.expect(&[ExchangeState::Absorbing]).unwrap_err();
        assert_eq!(
            err,
            StoreError::ExchangeState {
                direction: 5,
                actual: "idle",
                expected: "absorbing"
            }
        );
        queue.enter(ExchangeState::InTransit);
        assert_eq!(queue.state(), ExchangeState::InTransit);
        queue.clear();
        assert_eq!(queue.state(), ExchangeState::Idle);
    }

    #[test]
    fn test_extract_rebases_to_region_origin() {
        let layout = layout();
        let d = Direction::from_offset([1, 0]).unwrap();
        let region = layout.guard_region(d);
        assert_eq!(region.lo, [5, 1]);

        let mut pool: FramePool<Particle<2>> = FramePool::new(8, layout.tile_size());
        let mut list = FrameList::new();
        list.append(&mut pool, Particle::new(1, [1, 0])).unwrap();
        list.append(&mut pool, Particle::new(2, [0, 1])).unwrap();

        let idx = layout.index([5, 3]);
        let mut staged = FrameList::new();
        let counts = extract_supercell(&layout, &region, idx, &mut list, &mut staged, &mut pool).unwrap();
        assert_eq!(counts.moved, 2);
        assert_eq!(list.count, 0);
        assert!(list.has_frames(), "Frames stay linked until compaction");

        let out = staged.collect(&pool);
        assert_eq!(out[0].cell, [1, 4]);
        assert_eq!(out[1].cell, [0, 5]);
    }

    #[test]
    fn test_route_into_border() {
        let layout = layout();
        let d = Direction::from_offset([-1, 0]).unwrap();
        // border(-x) spans x in [1, 2), y in [1, 5)
        let p = Particle::new(1, [1, 5]);
        let (dest, rebased) = route(&layout, d, &p).unwrap();
        assert_eq!(dest, layout.index([1, 3]));
        assert_eq!(rebased.cell, [1, 1]);

        let far = Particle::new(2, [2, 0]);
        assert_eq!(
            route(&layout, d, &far).unwrap_err(),
            StoreError::Misrouted { direction: d.id() }
        );
    }

    #[test]
    fn test_drain_releases_frames() {
        let mut pool: FramePool<u32> = FramePool::new(4, 2);
        let mut list = FrameList::new();
        for i in 0..5 {
            list.append(&mut pool, i).unwrap();
        }
        let (out, released) = drain(&mut list, &mut pool, 0);
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert_eq!(released, 3);
        assert!(!list.has_frames());
        assert_eq!(pool.free_list().in_use_count(), 0);
    }

    #[test]
    fn test_stage_appends_batch() {
        let mut pool: FramePool<u32> = FramePool::new(4, 2);
        let mut list = FrameList::new();
        let mut batch = vec![7, 8, 9];
        let counts = stage(&mut list, &mut pool, &mut batch).unwrap();
        assert_eq!(counts.moved, 3);
        assert_eq!(counts.allocated_frames, 2);
        assert!(batch.is_empty());
        assert_eq!(list.collect(&pool), vec![7, 8, 9]);
    }

    #[test]
    fn test_stage_keeps_unstaged_tail() {
        let mut pool: FramePool<u32> = FramePool::new(2, 2);
        let mut list = FrameList::new();
        let mut batch = vec![1, 2, 3, 4, 5, 6];
        let err = stage(&mut list, &mut pool, &mut batch).unwrap_err();
        assert!(err.is_exhaustion());
        assert_eq!(list.collect(&pool), vec![1, 2, 3, 4]);
        assert_eq!(batch, vec![5, 6]);

        // Room again: the tail stages where the first attempt stopped
        let mut other = FrameList::new();
        let (_, released) = drain(&mut list, &mut pool, 0);
        assert_eq!(released, 2);
        stage(&mut other, &mut pool, &mut batch).unwrap();
        assert_eq!(other.collect(&pool), vec![5, 6]);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_extract_exhaustion_recounts_source() {
        let layout = layout();
        let d = Direction::from_offset([1, 0]).unwrap();
        let region = layout.guard_region(d);
        let mut pool: FramePool<Particle<2>> = FramePool::new(3, layout.tile_size());

        // 5 particles over 2 frames, one frame left for staging
        let mut list = FrameList::new();
        for i in 0..5 {
            list.append(&mut pool, Particle::new(i, [0, 0])).unwrap();
        }

        let idx = layout.index([5, 2]);
        let mut staged = FrameList::new();
        let err = extract_supercell(&layout, &region, idx, &mut list, &mut staged, &mut pool).unwrap_err();
        assert!(err.is_exhaustion());
        assert_eq!(staged.count, 4);
        assert_eq!(list.count, 1);
        assert_eq!(list.recount(&pool), 1);
    }

    #[test]
    fn test_group_by_destination() {
        let groups = group_by_destination(vec![(3, 'a'), (1, 'b'), (3, 'c'), (1, 'd')]);
        assert_eq!(groups, vec![(1, vec!['b', 'd']), (3, vec!['a', 'c'])]);
    }
}
