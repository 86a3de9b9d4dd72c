//! Compaction kernel - remove holes from one supercell's frame list.
//!
//! Two cursors walk the list: `dst` forward over dead slots, `src` backward
//! over live slots. While `src` lies behind `dst` the particle moves down.
//! Afterwards every frame but the last is full and the last is a prefix;
//! trailing frames left empty go back to the pool.

use crate::dispatch::OpCounts;
use crate::frame::{FrameId, NULL_FRAME};
use crate::frame_list::FrameList;
use crate::pool::FrameAccess;

#[derive(Clone, Copy)]
struct Cursor {
    frame: FrameId,
    rank: i64,
    slot: u32,
}

impl Cursor {
    #[inline]
    fn position(&self) -> (i64, u32) {
        (self.rank, self.slot)
    }
}

/// Compact `list` in place and recount it.
///
/// Idempotent: a second call moves nothing and releases nothing.
pub fn compact_supercell<A>(list: &mut FrameList, frames: &mut A) -> OpCounts
where
    A: FrameAccess,
{
    let mut counts = OpCounts::default();
    if !list.has_frames() {
        list.count = 0;
        return counts;
    }

    let tile = frames.tile_size();
    let mut dst = Cursor {
        frame: list.head,
        rank: 0,
        slot: 0,
    };
    let mut src = Cursor {
        frame: list.tail,
        rank: list.frames as i64 - 1,
        // exclusive bound for the backward search
        slot: tile,
    };

    loop {
        // Earliest dead slot at or after dst
        while dst.frame != NULL_FRAME {
            match frames.frame(dst.frame).mask().next_dead(dst.slot) {
                Some(slot) => {
                    dst.slot = slot;
                    break;
                }
                None => {
                    dst.frame = frames.frame(dst.frame).next;
                    dst.rank += 1;
                    dst.slot = 0;
                }
            }
        }
        if dst.frame == NULL_FRAME {
            break;
        }

        // Latest live slot before src
        while src.frame != NULL_FRAME {
            match frames.frame(src.frame).mask().prev_live(src.slot) {
                Some(slot) => {
                    src.slot = slot;
                    break;
                }
                None => {
                    src.frame = frames.frame(src.frame).prev;
                    src.rank -= 1;
                    src.slot = tile;
                }
            }
        }
        if src.frame == NULL_FRAME || src.position() < dst.position() {
            break;
        }

        let particle = frames.frame_mut(src.frame).take(src.slot);
        frames.frame_mut(dst.frame).put(dst.slot, particle);
        counts.moved += 1;
        dst.slot += 1;
    }

    while list.tail != NULL_FRAME && frames.frame(list.tail).mask().is_empty() {
        if let Some(id) = list.pop_frame_back(frames) {
            frames.release(id);
            counts.released_frames += 1;
        }
    }

    list.count = list.recount(frames);
    counts
}

/// Returns true if every frame but the last is full and the last is a prefix.
pub fn is_compacted<A>(list: &FrameList, frames: &A) -> bool
where
    A: FrameAccess,
{
    let mut id = list.head;
    while id != NULL_FRAME {
        let frame = frames.frame(id);
        let last = frame.next == NULL_FRAME;
        if last {
            if !frame.mask().is_prefix() || frame.mask().is_empty() {
                return false;
            }
        } else if !frame.mask().is_full() {
            return false;
        }
        id = frame.next;
    }
    true
}
