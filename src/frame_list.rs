//! Frame List - the chain of frames owned by a supercell or exchange queue.
//!
//! Implements a doubly-linked list using frame handles for O(1) frame
//! append, removal from the tail and splicing of whole lists.

use crate::error::StoreResult;
use crate::frame::{FrameId, NULL_FRAME};
use crate::pool::FrameAccess;

/// Location of a particle: frame handle plus slot number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    pub frame: FrameId,
    pub slot: u32,
}

/// A chain of frames holding particles.
///
/// `count` tracks live particles. It is the cached value that guard
/// extraction resets without compacting, so compaction recounts it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameList {
    /// First frame of the chain
    pub head: FrameId,
    /// Last frame of the chain
    pub tail: FrameId,
    /// Number of live particles
    pub count: u32,
    /// Number of linked frames
    pub frames: u32,
}

impl Default for FrameList {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameList {
    /// Create a new empty list
    #[inline]
    pub const fn new() -> Self {
        Self {
            head: NULL_FRAME,
            tail: NULL_FRAME,
            count: 0,
            frames: 0,
        }
    }

    /// Returns true if no frame is linked
    #[inline]
    pub const fn has_frames(&self) -> bool {
        self.head != NULL_FRAME
    }

    /// Returns true if there are no live particles
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append a frame to the tail of the chain.
    ///
    /// # Complexity
    /// O(1)
    #[inline]
    pub fn push_frame_back<A>(&mut self, frames: &mut A, id: FrameId)
    where
        A: FrameAccess,
    {
        let added = frames.frame(id).mask().live_count();

        if self.tail == NULL_FRAME {
            // Empty list: new frame becomes both head and tail
            debug_assert!(self.head == NULL_FRAME);
            self.head = id;
            self.tail = id;
            let frame = frames.frame_mut(id);
            frame.prev = NULL_FRAME;
            frame.next = NULL_FRAME;
        } else {
            frames.frame_mut(self.tail).next = id;
            let frame = frames.frame_mut(id);
            frame.prev = self.tail;
            frame.next = NULL_FRAME;
            self.tail = id;
        }

        self.frames += 1;
        self.count += added;
    }

    /// Unlink and return the tail frame.
    ///
    /// The frame is NOT released to the pool; caller must do that.
    ///
    /// # Complexity
    /// O(1)
    #[inline]
    pub fn pop_frame_back<A>(&mut self, frames: &mut A) -> Option<FrameId>
    where
        A: FrameAccess,
    {
        if self.tail == NULL_FRAME {
            return None;
        }

        let id = self.tail;
        let frame = frames.frame(id);
        let prev = frame.prev;
        let live = frame.mask().live_count();

        if prev == NULL_FRAME {
            // Was the only frame
            self.head = NULL_FRAME;
            self.tail = NULL_FRAME;
        } else {
            self.tail = prev;
            frames.frame_mut(prev).next = NULL_FRAME;
        }

        self.frames -= 1;
        self.count = self.count.saturating_sub(live);

        let frame = frames.frame_mut(id);
        frame.prev = NULL_FRAME;
        frame.next = NULL_FRAME;

        Some(id)
    }

    /// Unlink and return the head frame.
    ///
    /// The frame is NOT released to the pool; caller must do that.
    ///
    /// # Complexity
    /// O(1)
    #[inline]
    pub fn pop_frame_front<A>(&mut self, frames: &mut A) -> Option<FrameId>
    where
        A: FrameAccess,
    {
        if self.head == NULL_FRAME {
            return None;
        }

        let id = self.head;
        let frame = frames.frame(id);
        let next = frame.next;
        let live = frame.mask().live_count();

        if next == NULL_FRAME {
            self.head = NULL_FRAME;
            self.tail = NULL_FRAME;
        } else {
            self.head = next;
            frames.frame_mut(next).prev = NULL_FRAME;
        }

        self.frames -= 1;
        self.count = self.count.saturating_sub(live);

        let frame = frames.frame_mut(id);
        frame.prev = NULL_FRAME;
        frame.next = NULL_FRAME;

        Some(id)
    }

    /// Move every frame of `other` to the tail of this list.
    ///
    /// # Complexity
    /// O(1)
    pub fn splice_back<A>(&mut self, frames: &mut A, other: &mut FrameList)
    where
        A: FrameAccess,
    {
        if other.head == NULL_FRAME {
            return;
        }

        if self.tail == NULL_FRAME {
            *self = *other;
        } else {
            frames.frame_mut(self.tail).next = other.head;
            frames.frame_mut(other.head).prev = self.tail;
            self.tail = other.tail;
            self.count += other.count;
            self.frames += other.frames;
        }

        *other = FrameList::new();
    }

    /// Append a particle after the tail frame's last live slot.
    ///
    /// Allocates a new frame when the tail has no room. Holes in earlier
    /// slots are left for compaction.
    ///
    /// # Returns
    /// The slot the particle was written to
    #[inline]
    pub fn append<A>(&mut self, frames: &mut A, particle: A::Particle) -> StoreResult<SlotRef>
    where
        A: FrameAccess,
    {
        if self.tail != NULL_FRAME {
            if let Some(slot) = frames.frame(self.tail).append_slot() {
                frames.frame_mut(self.tail).put(slot, particle);
                self.count += 1;
                return Ok(SlotRef {
                    frame: self.tail,
                    slot,
                });
            }
        }

        let id = frames.allocate()?;
        self.push_frame_back(frames, id);
        frames.frame_mut(id).put(0, particle);
        self.count += 1;
        Ok(SlotRef { frame: id, slot: 0 })
    }

    /// Mark a live slot dead and return its particle (no compaction).
    #[inline]
    pub fn kill<A>(&mut self, frames: &mut A, at: SlotRef) -> A::Particle
    where
        A: FrameAccess,
    {
        self.count = self.count.saturating_sub(1);
        frames.frame_mut(at.frame).take(at.slot)
    }

    /// Unlink every frame and release it to the pool.
    ///
    /// # Returns
    /// Number of frames released
    pub fn release_all<A>(&mut self, frames: &mut A) -> u32
    where
        A: FrameAccess,
    {
        let mut released = 0;
        let mut id = self.head;
        while id != NULL_FRAME {
            let next = frames.frame(id).next;
            frames.release(id);
            released += 1;
            id = next;
        }
        *self = FrameList::new();
        released
    }

    /// Collect the handles of every linked frame, head to tail.
    pub fn frame_ids<A>(&self, frames: &A) -> Vec<FrameId>
    where
        A: FrameAccess,
    {
        let mut ids = Vec::with_capacity(self.frames as usize);
        let mut id = self.head;
        while id != NULL_FRAME {
            ids.push(id);
            id = frames.frame(id).next;
        }
        ids
    }

    /// Copy out every live particle in list order.
    pub fn collect<A>(&self, frames: &A) -> Vec<A::Particle>
    where
        A: FrameAccess,
    {
        let mut out = Vec::with_capacity(self.count as usize);
        let mut id = self.head;
        while id != NULL_FRAME {
            let frame = frames.frame(id);
            out.extend(frame.particles().copied());
            id = frame.next;
        }
        out
    }

    /// Count live particles by walking the masks.
    pub fn recount<A>(&self, frames: &A) -> u32
    where
        A: FrameAccess,
    {
        let mut live = 0;
        let mut id = self.head;
        while id != NULL_FRAME {
            let frame = frames.frame(id);
            live += frame.mask().live_count();
            id = frame.next;
        }
        live
    }
}
