//! Kernel dispatch - apply a kernel to every work item of a mapper.
//!
//! With the `parallel` feature the work items are spread over the rayon
//! pool; otherwise they run in order on the calling thread. Either way the
//! call returns only after every item finished, which makes it a
//! synchronization point for the store.

use std::ops::{Add, AddAssign};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::StoreResult;

/// Counters reduced over the workers of a dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpCounts {
    /// Particles moved to another container
    pub moved: u64,
    /// Particles killed (domain exit, deletion)
    pub discarded: u64,
    /// Frames returned to the pool
    pub released_frames: u64,
    /// Frames claimed from the pool
    pub allocated_frames: u64,
}

impl Add for OpCounts {
    type Output = OpCounts;

    #[inline]
    fn add(self, rhs: OpCounts) -> OpCounts {
        OpCounts {
            moved: self.moved + rhs.moved,
            discarded: self.discarded + rhs.discarded,
            released_frames: self.released_frames + rhs.released_frames,
            allocated_frames: self.allocated_frames + rhs.allocated_frames,
        }
    }
}

impl AddAssign for OpCounts {
    #[inline]
    fn add_assign(&mut self, rhs: OpCounts) {
        *self = *self + rhs;
    }
}

/// Run `kernel` once per work item and reduce the counters.
///
/// The first error observed is returned. Other workers are not cancelled;
/// their effects remain (operations are re-runnable, not transactional).
#[cfg(feature = "parallel")]
pub fn launch<K>(work: &[usize], kernel: K) -> StoreResult<OpCounts>
where
    K: Fn(usize) -> StoreResult<OpCounts> + Sync + Send,
{
    work.par_iter()
        .map(|&item| kernel(item))
        .try_reduce(OpCounts::default, |a, b| Ok(a + b))
}

/// Run `kernel` once per work item and reduce the counters.
#[cfg(not(feature = "parallel"))]
pub fn launch<K>(work: &[usize], kernel: K) -> StoreResult<OpCounts>
where
    K: Fn(usize) -> StoreResult<OpCounts> + Sync + Send,
{
    let mut total = OpCounts::default();
    for &item in work {
        total += kernel(item)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_launch_reduces_counts() {
        let work: Vec<usize> = (0..100).collect();
        let total = launch(&work, |i| {
            Ok(OpCounts {
                moved: i as u64,
                ..OpCounts::default()
            })
        })
        .unwrap();
        assert_eq!(total.moved, 4950);
    }

    #[test]
    fn test_launch_visits_every_item() {
        let hits = AtomicUsize::new(0);
        let work: Vec<usize> = (0..64).collect();
        launch(&work, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
            Ok(OpCounts::default())
        })
        .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_launch_surfaces_error() {
        let work: Vec<usize> = (0..16).collect();
        let result = launch(&work, |i| {
            if i == 7 {
                Err(StoreError::DomainExit { supercell: i })
            } else {
                Ok(OpCounts::default())
            }
        });
        assert_eq!(result, Err(StoreError::DomainExit { supercell: 7 }));
    }

    #[test]
    fn test_launch_empty() {
        assert_eq!(launch(&[], |_| Ok(OpCounts::default())).unwrap(), OpCounts::default());
    }
}
