//! Disjoint mutable access to a slice from many workers.
//!
//! Kernels mutate supercells, frames and queues from parallel workers without
//! locks. Exclusivity comes from the dispatch partitioning (stride >= 3 for
//! relocation, one worker per supercell elsewhere, one owner per frame), not
//! from the type system, so element access is `unsafe`.

use std::marker::PhantomData;

/// A mutable slice view that can be shared across worker threads.
pub struct SharedMut<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// Safety: the view only hands out `&mut T` through `get_mut`, whose contract
// requires that no two live references target the same element.
unsafe impl<T: Send> Send for SharedMut<'_, T> {}
unsafe impl<T: Send> Sync for SharedMut<'_, T> {}

impl<T> Clone for SharedMut<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedMut<'_, T> {}

impl<'a, T> SharedMut<'a, T> {
    /// Wrap an exclusively borrowed slice.
    #[inline]
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable access to element `index`.
    ///
    /// # Safety
    /// While the returned reference is alive, no other reference (shared or
    /// mutable) to the same element may exist on any thread.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: usize) -> &'a mut T {
        assert!(index < self.len, "Index out of bounds");
        &mut *self.ptr.add(index)
    }

    /// Shared access to element `index`.
    ///
    /// # Safety
    /// No mutable reference to the same element may be alive.
    #[inline]
    pub unsafe fn get(&self, index: usize) -> &'a T {
        assert!(index < self.len, "Index out of bounds");
        &*self.ptr.add(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disjoint_writes() {
        let mut data = vec![0u32; 8];
        let view = SharedMut::new(&mut data);
        assert_eq!(view.len(), 8);

        std::thread::scope(|s| {
            for worker in 0..2usize {
                s.spawn(move || {
                    // Worker 0 owns even indices, worker 1 owns odd ones
                    for i in (worker..8).step_by(2) {
                        unsafe { *view.get_mut(i) = i as u32 * 10 };
                    }
                });
            }
        });

        assert_eq!(data, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    #[should_panic(expected = "Index out of bounds")]
    fn test_out_of_bounds_panics() {
        let mut data = vec![0u8; 2];
        let view = SharedMut::new(&mut data);
        unsafe {
            view.get_mut(2);
        }
    }
}
