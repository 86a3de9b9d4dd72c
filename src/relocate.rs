//! Relocation kernel - move drifted particles into the neighbor that owns them.
//!
//! One call handles one active supercell of a stride sub-pass. Particles
//! only move into direct neighbors, and the stride mapper guarantees no two
//! active supercells share a neighbor, so every frame list touched here is
//! touched by this worker alone.

use crate::config::DomainExitPolicy;
use crate::dispatch::OpCounts;
use crate::error::{StoreError, StoreResult};
use crate::frame::NULL_FRAME;
use crate::frame_list::{FrameList, SlotRef};
use crate::grid::{AreaMask, GridLayout};
use crate::particle::ParticleRecord;
use crate::pool::FrameAccess;
use crate::schedule::CellSet;
use crate::shared::SharedMut;

/// Shift every out-of-bounds particle of supercell `idx` into its neighbor.
///
/// The particle is appended to the destination before its old slot is
/// killed, so exhaustion never loses it. Slots vacated here stay holes until
/// the next compaction.
///
/// # Safety contract
/// No other worker may access supercell `idx`, any of its neighbors, or
/// the frames they own while this runs.
pub fn shift_supercell<P, A, const D: usize>(
    layout: &GridLayout<D>,
    supercells: SharedMut<'_, FrameList>,
    frames: &mut A,
    idx: usize,
    policy: DomainExitPolicy,
) -> StoreResult<OpCounts>
where
    P: ParticleRecord<D>,
    A: FrameAccess<Particle = P>,
{
    let mut counts = OpCounts::default();
    let coord = layout.coord(idx);
    let tile = frames.tile_size();
    // Safety: exclusive by the stride partition (see contract above).
    let list = unsafe { supercells.get_mut(idx) };

    let mut id = list.head;
    while id != NULL_FRAME {
        // Appends only go to neighbors, so this list's links are stable.
        let next = frames.frame(id).next;

        for slot in 0..tile {
            let Some(&particle) = frames.frame(id).get(slot) else {
                continue;
            };
            let offset = layout.supercell_offset(particle.local_cell());
            if offset.iter().all(|&o| o == 0) {
                continue;
            }
            if offset.iter().any(|o| o.abs() > 1) {
                return Err(StoreError::ExcessiveDisplacement {
                    supercell: idx,
                    offset: offset.to_vec(),
                });
            }

            let at = SlotRef { frame: id, slot };
            match layout.neighbor(coord, offset) {
                Some(dest) => {
                    let mut moved = particle;
                    moved.set_local_cell(layout.rebase(particle.local_cell(), offset));

                    // Safety: dest is a neighbor of idx, exclusive to this worker.
                    let target = unsafe { supercells.get_mut(dest) };
                    let frames_before = target.frames;
                    target.append(frames, moved)?;
                    counts.allocated_frames += (target.frames - frames_before) as u64;

                    list.kill(frames, at);
                    counts.moved += 1;
                }
                None => match policy {
                    DomainExitPolicy::Reject => {
                        return Err(StoreError::DomainExit { supercell: idx });
                    }
                    DomainExitPolicy::Discard => {
                        list.kill(frames, at);
                        counts.discarded += 1;
                    }
                },
            }
        }

        id = next;
    }

    Ok(counts)
}

/// Supercells a sub-pass over `mask` may write: the area plus one ring.
pub fn footprint<const D: usize>(layout: &GridLayout<D>, mask: AreaMask) -> CellSet {
    let count = layout.supercell_count();
    let mut set = CellSet::new(count);
    let mut ring = [[0i32; D]; 27];
    let mut ring_len = 0;
    for n in 0..3usize.pow(D as u32) {
        let mut rest = n;
        for axis in 0..D {
            ring[ring_len][axis] = (rest % 3) as i32 - 1;
            rest /= 3;
        }
        ring_len += 1;
    }

    for idx in 0..count {
        if !layout.in_area(idx, mask) {
            continue;
        }
        let coord = layout.coord(idx);
        for offset in &ring[..ring_len] {
            if let Some(n) = layout.neighbor(coord, *offset) {
                set.insert(n);
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;
    use crate::pool::FramePool;

    struct Fixture {
        layout: GridLayout<2>,
        pool: FramePool<Particle<2>>,
        supercells: Vec<FrameList>,
    }

    impl Fixture {
        fn new() -> Self {
            let layout = GridLayout::new([3, 3], 1, [2, 2]).unwrap();
            Self {
                layout,
                pool: FramePool::new(32, layout.tile_size()),
                supercells: vec![FrameList::new(); layout.supercell_count()],
            }
        }

        fn add(&mut self, coord: [u32; 2], p: Particle<2>) {
            let idx = self.layout.index(coord);
            self.supercells[idx].append(&mut self.pool, p).unwrap();
        }

        fn shift(&mut self, coord: [u32; 2], policy: DomainExitPolicy) -> StoreResult<OpCounts> {
            let idx = self.layout.index(coord);
            let view = SharedMut::new(&mut self.supercells);
            shift_supercell(&self.layout, view, &mut self.pool, idx, policy)
        }

        fn live(&self, coord: [u32; 2]) -> Vec<Particle<2>> {
            let idx = self.layout.index(coord);
            let mut out = Vec::new();
            for id in self.supercells[idx].frame_ids(&self.pool) {
                out.extend(self.pool.frame(id).particles().copied());
            }
            out
        }
    }

    #[test]
    fn test_in_bounds_particles_stay() {
        let mut fx = Fixture::new();
        for i in 0..5 {
            fx.add([2, 2], Particle::new(i, [1, 0]));
        }
        let counts = fx.shift([2, 2], DomainExitPolicy::Reject).unwrap();
        assert_eq!(counts.moved, 0);
        assert_eq!(fx.live([2, 2]).len(), 5);
    }

    #[test]
    fn test_particle_moves_and_rebases() {
        let mut fx = Fixture::new();
        fx.add([2, 2], Particle::new(1, [0, 0]));
        fx.add([2, 2], Particle::new(2, [2, -1]));

        let counts = fx.shift([2, 2], DomainExitPolicy::Reject).unwrap();
        assert_eq!(counts.moved, 1);
        assert_eq!(counts.allocated_frames, 1);

        let moved = fx.live([3, 1]);
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, 2);
        assert_eq!(moved[0].cell, [0, 1]);

        let stayed = fx.live([2, 2]);
        assert_eq!(stayed.len(), 1);
        assert_eq!(fx.supercells[fx.layout.index([2, 2])].count, 1);
    }

    #[test]
    fn test_excessive_displacement_rejected() {
        let mut fx = Fixture::new();
        fx.add([2, 2], Particle::new(1, [4, 0]));
        let err = fx.shift([2, 2], DomainExitPolicy::Reject).unwrap_err();
        assert_eq!(
            err,
            StoreError::ExcessiveDisplacement {
                supercell: fx.layout.index([2, 2]),
                offset: vec![2, 0]
            }
        );
    }

    #[test]
    fn test_domain_exit_policies() {
        let mut fx = Fixture::new();
        fx.add([0, 2], Particle::new(1, [-1, 0]));

        let err = fx.shift([0, 2], DomainExitPolicy::Reject).unwrap_err();
        assert!(matches!(err, StoreError::DomainExit { .. }));
        assert_eq!(fx.live([0, 2]).len(), 1, "Rejected particle is left in place");

        let counts = fx.shift([0, 2], DomainExitPolicy::Discard).unwrap();
        assert_eq!(counts.discarded, 1);
        assert!(fx.live([0, 2]).is_empty());
    }

    #[test]
    fn test_exhaustion_keeps_particle() {
        let layout = GridLayout::new([3, 3], 1, [2, 2]).unwrap();
        let mut fx = Fixture {
            layout,
            pool: FramePool::new(1, layout.tile_size()),
            supercells: vec![FrameList::new(); layout.supercell_count()],
        };
        fx.add([2, 2], Particle::new(1, [2, 0]));
        let err = fx.shift([2, 2], DomainExitPolicy::Reject).unwrap_err();
        assert!(err.is_exhaustion());
        assert_eq!(fx.live([2, 2]).len(), 1);
    }

    #[test]
    fn test_footprint_dilates_area() {
        let layout = GridLayout::<2>::new([4, 4], 1, [1, 1]).unwrap();
        let core = footprint(&layout, AreaMask::CORE);
        // core is the 2x2 block at (2..4, 2..4); one ring grows it to 4x4
        assert_eq!(core.count(), 16);
        assert_eq!(footprint(&layout, AreaMask::ALL).count(), 36);
    }
}
