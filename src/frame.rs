//! Frames - fixed-capacity blocks of particle slots.
//!
//! A frame holds `TileSize` slots and an occupancy mask. Frames are linked
//! into exactly one list (a supercell or an exchange queue) through their
//! `next`/`prev` handles, which index the pool's arena.

use std::fmt;

/// Sentinel value representing a null/invalid frame handle
pub const NULL_FRAME: FrameId = u32::MAX;

/// Frame handle - an index into the pool arena.
/// 32-bit handles instead of pointers keep list headers small.
pub type FrameId = u32;

/// Occupancy bitmask for the slots of one frame.
///
/// Bit `i` set means slot `i` holds a live particle.
#[derive(Clone, PartialEq, Eq)]
pub struct SlotMask {
    words: Box<[u64]>,
    slots: u32,
}

impl SlotMask {
    /// Create an all-dead mask for `slots` slots
    pub fn new(slots: u32) -> Self {
        let words = (slots as usize).div_ceil(64);
        Self {
            words: vec![0u64; words].into_boxed_slice(),
            slots,
        }
    }

    /// Number of slots covered by the mask
    #[inline]
    pub fn slots(&self) -> u32 {
        self.slots
    }

    /// Mark slot live
    #[inline]
    pub fn set(&mut self, slot: u32) {
        debug_assert!(slot < self.slots, "Slot out of bounds");
        self.words[(slot >> 6) as usize] |= 1u64 << (slot & 63);
    }

    /// Mark slot dead
    #[inline]
    pub fn clear(&mut self, slot: u32) {
        debug_assert!(slot < self.slots, "Slot out of bounds");
        self.words[(slot >> 6) as usize] &= !(1u64 << (slot & 63));
    }

    /// Returns true if slot holds a live particle
    #[inline]
    pub fn is_live(&self, slot: u32) -> bool {
        slot < self.slots && self.words[(slot >> 6) as usize] & (1u64 << (slot & 63)) != 0
    }

    /// Mark every slot dead
    #[inline]
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Number of live slots
    #[inline]
    pub fn live_count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Returns true if no slot is live
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Returns true if every slot is live
    #[inline]
    pub fn is_full(&self) -> bool {
        self.live_count() == self.slots
    }

    /// First dead slot at or after `from`
    pub fn next_dead(&self, from: u32) -> Option<u32> {
        (from..self.slots).find(|&s| !self.is_live(s))
    }

    /// Last live slot strictly before `before`
    pub fn prev_live(&self, before: u32) -> Option<u32> {
        (0..before.min(self.slots)).rev().find(|&s| self.is_live(s))
    }

    /// Highest live slot
    #[inline]
    pub fn last_live(&self) -> Option<u32> {
        for (w, &word) in self.words.iter().enumerate().rev() {
            if word != 0 {
                return Some(w as u32 * 64 + 63 - word.leading_zeros());
            }
        }
        None
    }

    /// Returns true if the live slots are exactly `0..live_count()`
    pub fn is_prefix(&self) -> bool {
        match self.last_live() {
            None => true,
            Some(last) => last + 1 == self.live_count(),
        }
    }

    /// Iterate live slot numbers in ascending order
    pub fn live_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.slots).filter(move |&s| self.is_live(s))
    }
}

impl fmt::Debug for SlotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.slots)
            .map(|s| if self.is_live(s) { '1' } else { '0' })
            .collect();
        f.debug_tuple("SlotMask").field(&bits).finish()
    }
}

/// A block of `TileSize` particle slots.
///
/// Slot contents are not cleared when a particle dies; the mask decides what
/// is live, and a slot is always overwritten before its bit is set again.
#[derive(Clone)]
pub struct Frame<P> {
    /// Next frame in the owning list
    pub next: FrameId,
    /// Previous frame in the owning list
    pub prev: FrameId,
    mask: SlotMask,
    slots: Box<[P]>,
}

impl<P: Copy + Default> Frame<P> {
    /// Create an empty frame with `tile_size` slots
    pub fn new(tile_size: u32) -> Self {
        Self {
            next: NULL_FRAME,
            prev: NULL_FRAME,
            mask: SlotMask::new(tile_size),
            slots: vec![P::default(); tile_size as usize].into_boxed_slice(),
        }
    }

    /// Reset linkage and occupancy for reuse (slot payloads are left as-is)
    #[inline]
    pub fn reset(&mut self) {
        self.next = NULL_FRAME;
        self.prev = NULL_FRAME;
        self.mask.clear_all();
    }

    /// Slot capacity (`TileSize`)
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.mask.slots()
    }

    /// Occupancy mask
    #[inline]
    pub fn mask(&self) -> &SlotMask {
        &self.mask
    }

    /// Live particle in `slot`, if any
    #[inline]
    pub fn get(&self, slot: u32) -> Option<&P> {
        if self.mask.is_live(slot) {
            Some(&self.slots[slot as usize])
        } else {
            None
        }
    }

    /// Mutable live particle in `slot`, if any
    #[inline]
    pub fn get_mut(&mut self, slot: u32) -> Option<&mut P> {
        if self.mask.is_live(slot) {
            Some(&mut self.slots[slot as usize])
        } else {
            None
        }
    }

    /// Write `particle` into a dead `slot` and mark it live
    #[inline]
    pub fn put(&mut self, slot: u32, particle: P) {
        debug_assert!(!self.mask.is_live(slot), "Slot already occupied");
        self.slots[slot as usize] = particle;
        self.mask.set(slot);
    }

    /// Mark a live `slot` dead and return its particle
    #[inline]
    pub fn take(&mut self, slot: u32) -> P {
        debug_assert!(self.mask.is_live(slot), "Slot is not live");
        self.mask.clear(slot);
        self.slots[slot as usize]
    }

    /// First slot after the highest live slot, if the frame has room there
    #[inline]
    pub fn append_slot(&self) -> Option<u32> {
        let slot = self.mask.last_live().map_or(0, |s| s + 1);
        (slot < self.capacity()).then_some(slot)
    }

    /// Overwrite every dead slot to fault in its pages.
    pub fn warm_up(&mut self) {
        for slot in 0..self.capacity() {
            if !self.mask.is_live(slot) {
                // Volatile write to prevent optimization
                unsafe {
                    std::ptr::write_volatile(&mut self.slots[slot as usize], P::default());
                }
            }
        }
    }

    /// Iterate live particles in slot order
    pub fn particles(&self) -> impl Iterator<Item = &P> + '_ {
        self.mask.live_slots().map(move |s| &self.slots[s as usize])
    }

    /// Apply `f` to every live particle
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut P)) {
        for slot in 0..self.capacity() {
            if self.mask.is_live(slot) {
                f(&mut self.slots[slot as usize]);
            }
        }
    }
}

impl<P> fmt::Debug for Frame<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("prev", &self.prev)
            .field("next", &self.next)
            .field("mask", &self.mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_set_clear() {
        let mut mask = SlotMask::new(70);
        assert!(mask.is_empty());

        mask.set(0);
        mask.set(69);
        assert!(mask.is_live(0));
        assert!(mask.is_live(69));
        assert!(!mask.is_live(1));
        assert_eq!(mask.live_count(), 2);
        assert_eq!(mask.last_live(), Some(69));

        mask.clear(69);
        assert_eq!(mask.last_live(), Some(0));
        assert!(mask.is_prefix());
    }

    #[test]
    fn test_mask_prefix_detection() {
        let mut mask = SlotMask::new(4);
        mask.set(0);
        mask.set(1);
        assert!(mask.is_prefix());

        mask.set(3);
        assert!(!mask.is_prefix());
        assert_eq!(mask.next_dead(0), Some(2));
        assert_eq!(mask.prev_live(3), Some(1));
    }

    #[test]
    fn test_mask_full() {
        let mut mask = SlotMask::new(3);
        for s in 0..3 {
            mask.set(s);
        }
        assert!(mask.is_full());
        assert_eq!(mask.next_dead(0), None);
    }

    #[test]
    fn test_frame_put_take() {
        let mut frame: Frame<u64> = Frame::new(4);
        assert_eq!(frame.append_slot(), Some(0));

        frame.put(0, 11);
        frame.put(1, 22);
        assert_eq!(frame.get(1), Some(&22));
        assert_eq!(frame.append_slot(), Some(2));

        assert_eq!(frame.take(0), 11);
        assert_eq!(frame.get(0), None);
        // Holes before the last live slot are not reused by append
        assert_eq!(frame.append_slot(), Some(2));
    }

    #[test]
    fn test_frame_full_has_no_append_slot() {
        let mut frame: Frame<u32> = Frame::new(2);
        frame.put(0, 1);
        frame.put(1, 2);
        assert_eq!(frame.append_slot(), None);
    }

    #[test]
    fn test_frame_warm_up_keeps_live_slots() {
        let mut frame: Frame<u32> = Frame::new(3);
        frame.put(1, 42);
        frame.warm_up();
        assert_eq!(frame.get(1), Some(&42));
        assert_eq!(frame.mask().live_count(), 1);
    }

    #[test]
    fn test_frame_reset() {
        let mut frame: Frame<u32> = Frame::new(2);
        frame.next = 5;
        frame.prev = 3;
        frame.put(0, 1);
        frame.reset();
        assert_eq!(frame.next, NULL_FRAME);
        assert_eq!(frame.prev, NULL_FRAME);
        assert!(frame.mask().is_empty());
    }
}
