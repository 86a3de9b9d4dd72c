//! Frame Pool - fixed-size block allocator shared by all workers.
//!
//! The pool pre-allocates every frame at startup, eliminating heap
//! allocation during a step. Claims and returns are lock-free:
//!
//! - `allocate` pops from the free stack with a CAS on its length
//! - `release` appends to a separate returned stack with `fetch_add`
//! - `reclaim` (single-threaded, at a synchronization point) moves
//!   returned frames back onto the free stack
//!
//! Keeping pops and pushes on different stacks during a dispatch means a
//! popped entry can never be overwritten underneath a concurrent claim.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::frame::{Frame, FrameId, NULL_FRAME};
use crate::shared::SharedMut;

/// Lock-free free list over frame handles.
pub struct FreeList {
    /// Stack of free handles; entries `0..free_len` are valid
    free: Box<[AtomicU32]>,
    free_len: AtomicUsize,
    /// Handles released during the current dispatch
    returned: Box<[AtomicU32]>,
    returned_len: AtomicUsize,
    /// Ownership flag per frame (true while held by a container)
    in_use: Box<[AtomicBool]>,
    in_use_count: AtomicU32,
    total_allocs: AtomicU64,
    total_releases: AtomicU64,
    capacity: u32,
}

impl FreeList {
    /// Create a free list with every handle in `0..capacity` available.
    ///
    /// # Panics
    /// Panics if capacity is not below `NULL_FRAME`
    pub fn new(capacity: u32) -> Self {
        assert!(capacity < NULL_FRAME, "Capacity must be less than NULL_FRAME");
        // Reverse order so that the first claim returns frame 0
        let free: Box<[AtomicU32]> = (0..capacity).rev().map(AtomicU32::new).collect();
        let returned: Box<[AtomicU32]> = (0..capacity).map(|_| AtomicU32::new(NULL_FRAME)).collect();
        let in_use: Box<[AtomicBool]> = (0..capacity).map(|_| AtomicBool::new(false)).collect();

        Self {
            free,
            free_len: AtomicUsize::new(capacity as usize),
            returned,
            returned_len: AtomicUsize::new(0),
            in_use,
            in_use_count: AtomicU32::new(0),
            total_allocs: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
            capacity,
        }
    }

    /// Claim a free handle.
    ///
    /// Safe to call from many workers at once. Never blocks.
    ///
    /// # Complexity
    /// O(1) amortized (CAS retry under contention)
    #[inline]
    pub fn allocate(&self) -> StoreResult<FrameId> {
        let claimed = self
            .free_len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| len.checked_sub(1));

        let slot = match claimed {
            Ok(len) => len - 1,
            Err(_) => {
                return Err(StoreError::PoolExhausted {
                    in_use: self.in_use_count(),
                    capacity: self.capacity,
                })
            }
        };

        let id = self.free[slot].load(Ordering::Acquire);
        let was_in_use = self.in_use[id as usize].swap(true, Ordering::AcqRel);
        debug_assert!(!was_in_use, "Frame {} handed out twice", id);

        self.in_use_count.fetch_add(1, Ordering::Relaxed);
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Return a handle. It becomes allocatable after the next `reclaim`.
    ///
    /// Safe to call from many workers at once.
    #[inline]
    pub fn release(&self, id: FrameId) {
        assert!(id < self.capacity, "Frame handle out of bounds");
        let was_in_use = self.in_use[id as usize].swap(false, Ordering::AcqRel);
        debug_assert!(was_in_use, "Double release of frame {}", id);

        let slot = self.returned_len.fetch_add(1, Ordering::AcqRel);
        self.returned[slot].store(id, Ordering::Release);

        self.in_use_count.fetch_sub(1, Ordering::Relaxed);
        self.total_releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a handle and make it allocatable immediately.
    ///
    /// Requires exclusive access, so it is only used by host-side paths.
    #[inline]
    pub fn release_now(&mut self, id: FrameId) {
        self.release(id);
        self.reclaim();
    }

    /// Move every returned handle back onto the free stack.
    ///
    /// # Returns
    /// Number of handles reclaimed
    pub fn reclaim(&mut self) -> usize {
        let returned = *self.returned_len.get_mut();
        let mut free_len = *self.free_len.get_mut();

        for i in 0..returned {
            let id = *self.returned[i].get_mut();
            *self.free[free_len].get_mut() = id;
            free_len += 1;
        }

        *self.free_len.get_mut() = free_len;
        *self.returned_len.get_mut() = 0;
        returned
    }

    /// Mark every handle free again.
    pub fn reset(&mut self) {
        for (i, slot) in self.free.iter_mut().rev().enumerate() {
            *slot.get_mut() = i as u32;
        }
        for flag in self.in_use.iter_mut() {
            *flag.get_mut() = false;
        }
        *self.free_len.get_mut() = self.capacity as usize;
        *self.returned_len.get_mut() = 0;
        *self.in_use_count.get_mut() = 0;
    }

    /// Frames currently held by containers
    #[inline]
    pub fn in_use_count(&self) -> u32 {
        self.in_use_count.load(Ordering::Relaxed)
    }

    /// Returns true if `id` is currently held by a container
    #[inline]
    pub fn is_in_use(&self, id: FrameId) -> bool {
        self.in_use[id as usize].load(Ordering::Acquire)
    }

    /// Handles that can be claimed right now
    #[inline]
    pub fn available(&self) -> u32 {
        self.free_len.load(Ordering::Acquire) as u32
    }

    /// Total capacity of the pool
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Lifetime allocation count
    #[inline]
    pub fn total_allocs(&self) -> u64 {
        self.total_allocs.load(Ordering::Relaxed)
    }

    /// Lifetime release count
    #[inline]
    pub fn total_releases(&self) -> u64 {
        self.total_releases.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity)
            .field("in_use", &self.in_use_count())
            .field("available", &self.available())
            .finish()
    }
}

/// Arena of frames plus the free list that hands them out.
pub struct FramePool<P> {
    /// Contiguous block of pre-allocated frames
    frames: Vec<Frame<P>>,
    free: FreeList,
    tile_size: u32,
}

impl<P: Copy + Default> FramePool<P> {
    /// Create a pool of `capacity` frames with `tile_size` slots each.
    pub fn new(capacity: u32, tile_size: u32) -> Self {
        assert!(tile_size > 0, "Tile size must be positive");
        let frames = (0..capacity).map(|_| Frame::new(tile_size)).collect();
        Self {
            frames,
            free: FreeList::new(capacity),
            tile_size,
        }
    }

    /// Claim a frame with empty occupancy and no links.
    pub fn allocate(&mut self) -> StoreResult<FrameId> {
        let id = self.free.allocate()?;
        self.frames[id as usize].reset();
        Ok(id)
    }

    /// Return a frame; it is immediately reusable.
    pub fn release(&mut self, id: FrameId) {
        self.free.release_now(id);
    }

    /// Move frames released by workers back onto the free stack.
    pub fn reclaim(&mut self) -> usize {
        self.free.reclaim()
    }

    /// Mark every frame free (contents are left to be overwritten).
    pub fn reset(&mut self) {
        self.free.reset();
    }

    /// Touch every frame to fault in its pages before the first step.
    pub fn warm_up(&mut self) {
        for frame in &mut self.frames {
            frame.warm_up();
        }
    }

    /// Get a frame
    #[inline]
    pub fn frame(&self, id: FrameId) -> &Frame<P> {
        debug_assert!(id != NULL_FRAME, "Null frame handle");
        &self.frames[id as usize]
    }

    /// Get a mutable frame
    #[inline]
    pub fn frame_mut(&mut self, id: FrameId) -> &mut Frame<P> {
        debug_assert!(id != NULL_FRAME, "Null frame handle");
        &mut self.frames[id as usize]
    }

    /// Slots per frame
    #[inline]
    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Underlying free list (counters, ownership flags)
    #[inline]
    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    /// Split into a shared frame view and the atomic free list.
    ///
    /// # Safety
    /// Every worker using the returned accessor (or a copy of it) may only
    /// touch frames owned by containers it holds exclusively.
    #[inline]
    pub unsafe fn device(&mut self) -> DeviceFrames<'_, P> {
        DeviceFrames {
            frames: SharedMut::new(&mut self.frames),
            free: &self.free,
            tile_size: self.tile_size,
        }
    }
}

impl<P> fmt::Debug for FramePool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("tile_size", &self.tile_size)
            .field("free", &self.free)
            .finish()
    }
}

/// Frame access used by list operations and kernels.
///
/// Implemented by the pool itself (host side, exclusive borrow) and by a
/// device accessor shared by parallel workers under the ownership invariant.
pub trait FrameAccess {
    /// Record type stored in the frames
    type Particle: Copy + Default;

    /// Get a frame
    fn frame(&self, id: FrameId) -> &Frame<Self::Particle>;

    /// Get a mutable frame
    fn frame_mut(&mut self, id: FrameId) -> &mut Frame<Self::Particle>;

    /// Claim a raw handle from the pool
    fn claim(&self) -> StoreResult<FrameId>;

    /// Return a handle to the pool
    fn release(&mut self, id: FrameId);

    /// Slots per frame
    fn tile_size(&self) -> u32;

    /// Claim a frame and reset its links and occupancy.
    #[inline]
    fn allocate(&mut self) -> StoreResult<FrameId> {
        let id = self.claim()?;
        self.frame_mut(id).reset();
        Ok(id)
    }
}

impl<P: Copy + Default> FrameAccess for FramePool<P> {
    type Particle = P;

    #[inline]
    fn frame(&self, id: FrameId) -> &Frame<P> {
        FramePool::frame(self, id)
    }

    #[inline]
    fn frame_mut(&mut self, id: FrameId) -> &mut Frame<P> {
        FramePool::frame_mut(self, id)
    }

    #[inline]
    fn claim(&self) -> StoreResult<FrameId> {
        self.free.allocate()
    }

    /// Host-side release: the frame is reusable immediately.
    #[inline]
    fn release(&mut self, id: FrameId) {
        self.free.release_now(id);
    }

    #[inline]
    fn tile_size(&self) -> u32 {
        self.tile_size
    }
}

/// Device-side accessor: copied into every worker of a dispatch.
pub struct DeviceFrames<'a, P> {
    frames: SharedMut<'a, Frame<P>>,
    free: &'a FreeList,
    tile_size: u32,
}

impl<P> Clone for DeviceFrames<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for DeviceFrames<'_, P> {}

impl<P: Copy + Default> FrameAccess for DeviceFrames<'_, P> {
    type Particle = P;

    #[inline]
    fn frame(&self, id: FrameId) -> &Frame<P> {
        debug_assert!(self.free.is_in_use(id), "Access to unowned frame {}", id);
        // Safety: frames are owned by exactly one container and the
        // accessor's construction contract limits each worker to frames of
        // containers it holds exclusively.
        unsafe { self.frames.get(id as usize) }
    }

    #[inline]
    fn frame_mut(&mut self, id: FrameId) -> &mut Frame<P> {
        debug_assert!(self.free.is_in_use(id), "Access to unowned frame {}", id);
        // Safety: see `frame`.
        unsafe { self.frames.get_mut(id as usize) }
    }

    #[inline]
    fn claim(&self) -> StoreResult<FrameId> {
        self.free.allocate()
    }

    #[inline]
    fn release(&mut self, id: FrameId) {
        self.free.release(id);
    }

    #[inline]
    fn tile_size(&self) -> u32 {
        self.tile_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool: FramePool<u32> = FramePool::new(100, 8);
        assert_eq!(pool.free_list().capacity(), 100);
        assert_eq!(pool.free_list().in_use_count(), 0);
        assert_eq!(pool.free_list().available(), 100);
        assert_eq!(pool.tile_size(), 8);
    }

    #[test]
    fn test_pool_alloc_release() {
        let mut pool: FramePool<u32> = FramePool::new(3, 4);

        // Allocate all frames
        let f0 = pool.allocate().expect("Should allocate");
        let f1 = pool.allocate().expect("Should allocate");
        let f2 = pool.allocate().expect("Should allocate");
        assert_eq!((f0, f1, f2), (0, 1, 2));
        assert_eq!(pool.free_list().in_use_count(), 3);

        let err = pool.allocate().unwrap_err();
        assert_eq!(err, StoreError::PoolExhausted { in_use: 3, capacity: 3 });

        // Release one and reuse it
        pool.release(f1);
        assert!(!pool.free_list().is_in_use(f1));
        let f3 = pool.allocate().expect("Should allocate");
        assert_eq!(f3, f1, "Should reuse released frame");

        pool.release(f0);
        pool.release(f2);
        pool.release(f3);
        assert_eq!(pool.free_list().in_use_count(), 0);
        assert_eq!(pool.free_list().total_allocs(), 4);
        assert_eq!(pool.free_list().total_releases(), 4);
    }

    #[test]
    fn test_deferred_release_needs_reclaim() {
        let mut free = FreeList::new(1);
        let id = free.allocate().unwrap();
        free.release(id);

        assert_eq!(free.in_use_count(), 0);
        assert!(free.allocate().is_err(), "Released frame is parked until reclaim");

        assert_eq!(free.reclaim(), 1);
        assert_eq!(free.allocate().unwrap(), id);
    }

    #[test]
    fn test_concurrent_claims_are_unique() {
        let free = FreeList::new(1024);
        let mut claimed: Vec<FrameId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut mine = Vec::new();
                        while let Ok(id) = free.allocate() {
                            mine.push(id);
                        }
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        claimed.sort_unstable();
        claimed.dedup();
        assert_eq!(claimed.len(), 1024, "Every frame claimed exactly once");
        assert_eq!(free.in_use_count(), 1024);
    }

    #[test]
    fn test_concurrent_release() {
        let mut free = FreeList::new(256);
        let ids: Vec<FrameId> = (0..256).map(|_| free.allocate().unwrap()).collect();

        std::thread::scope(|s| {
            for chunk in ids.chunks(64) {
                let free = &free;
                s.spawn(move || {
                    for &id in chunk {
                        free.release(id);
                    }
                });
            }
        });

        assert_eq!(free.in_use_count(), 0);
        assert_eq!(free.reclaim(), 256);
        assert_eq!(free.available(), 256);
    }

    #[test]
    fn test_pool_warm_up() {
        let mut pool: FramePool<u64> = FramePool::new(64, 16);
        pool.warm_up(); // Should not panic
        assert_eq!(pool.free_list().in_use_count(), 0);
    }

    #[test]
    fn test_reset_restores_everything() {
        let mut pool: FramePool<u8> = FramePool::new(4, 2);
        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        pool.reset();
        assert_eq!(pool.free_list().available(), 4);
        assert_eq!(pool.free_list().in_use_count(), 0);
        assert_eq!(pool.allocate().unwrap(), 0);
    }

    #[test]
    fn test_trait_allocate_returns_clean_frames() {
        fn claim_one<A: FrameAccess>(frames: &mut A) -> FrameId {
            frames.allocate().unwrap()
        }

        let mut pool: FramePool<u32> = FramePool::new(2, 4);
        let id = pool.allocate().unwrap();
        pool.frame_mut(id).put(0, 9);
        pool.release(id);

        let id = claim_one(&mut pool);
        assert!(pool.frame(id).mask().is_empty());
    }

    #[test]
    fn test_device_accessor_defers_release() {
        let mut pool: FramePool<u32> = FramePool::new(1, 4);
        {
            // Safety: single worker
            let mut device = unsafe { pool.device() };
            let id = device.allocate().unwrap();
            device.frame_mut(id).put(0, 5);
            assert_eq!(device.frame(id).get(0), Some(&5));
            device.release(id);
            assert!(device.claim().is_err(), "Parked until reclaim");
        }
        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.free_list().available(), 1);
    }
}
