//! Domain Mappers - which supercells a dispatch processes.
//!
//! A mapper turns an area selector, a region or a stride offset into the
//! list of supercell indices handed to `dispatch::launch`. Order is x-fastest
//! but callers must not rely on it.

use crate::error::{StoreError, StoreResult};
use crate::grid::{AreaMask, GridLayout, Region};

/// Minimum stride that keeps simultaneously active supercells non-adjacent.
pub const MIN_STRIDE: u32 = 3;

/// Enumerates the supercells of one dispatch.
pub trait SupercellMapper {
    /// Linear indices of the supercells to process
    fn supercells(&self) -> Vec<usize>;

    /// Number of work items (sizes the dispatch)
    fn extent(&self) -> usize {
        self.supercells().len()
    }
}

/// Every supercell whose area is in the mask.
#[derive(Clone, Copy, Debug)]
pub struct AreaMapper<const D: usize> {
    layout: GridLayout<D>,
    mask: AreaMask,
}

impl<const D: usize> AreaMapper<D> {
    pub fn new(layout: GridLayout<D>, mask: AreaMask) -> Self {
        Self { layout, mask }
    }
}

impl<const D: usize> SupercellMapper for AreaMapper<D> {
    fn supercells(&self) -> Vec<usize> {
        (0..self.layout.supercell_count())
            .filter(|&i| self.layout.in_area(i, self.mask))
            .collect()
    }
}

/// Every supercell inside a box.
#[derive(Clone, Copy, Debug)]
pub struct RegionMapper<const D: usize> {
    layout: GridLayout<D>,
    region: Region<D>,
}

impl<const D: usize> RegionMapper<D> {
    pub fn new(layout: GridLayout<D>, region: Region<D>) -> Self {
        Self { layout, region }
    }
}

impl<const D: usize> SupercellMapper for RegionMapper<D> {
    fn supercells(&self) -> Vec<usize> {
        self.region.coords().map(|c| self.layout.index(c)).collect()
    }

    fn extent(&self) -> usize {
        self.region.volume()
    }
}

/// Checkerboard sub-pass mapper for relocation.
///
/// Active supercells satisfy `coord[i] % stride == offset[i]` on every axis
/// and lie in the area mask. Two active supercells are then at least
/// `stride` apart on some axis, so with `stride >= 3` no active supercell is
/// a neighbor (or a neighbor's neighbor target) of another.
///
/// ```text
/// stride 3, offset (0,0):   X . . X . . X
///                           . . . . . . .
///                           . . . . . . .
///                           X . . X . . X
/// ```
#[derive(Clone, Copy, Debug)]
pub struct StrideMapper<const D: usize> {
    layout: GridLayout<D>,
    mask: AreaMask,
    stride: u32,
    offset: [u32; D],
}

impl<const D: usize> StrideMapper<D> {
    /// Create a mapper positioned at offset zero.
    ///
    /// # Errors
    /// `StoreError::InvalidStride` if `stride < 3`
    pub fn new(layout: GridLayout<D>, mask: AreaMask, stride: u32) -> StoreResult<Self> {
        if stride < MIN_STRIDE {
            return Err(StoreError::InvalidStride(stride));
        }
        Ok(Self {
            layout,
            mask,
            stride,
            offset: [0; D],
        })
    }

    /// Current offset vector
    #[inline]
    pub fn offset(&self) -> [u32; D] {
        self.offset
    }

    /// Stride along every axis
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Number of sub-passes in a full sweep (`stride^D`)
    #[inline]
    pub fn sub_pass_count(&self) -> usize {
        (self.stride as usize).pow(D as u32)
    }

    /// Advance to the next offset (x fastest).
    ///
    /// # Returns
    /// false once every offset has been visited; the mapper then wraps to zero
    pub fn next(&mut self) -> bool {
        for axis in 0..D {
            self.offset[axis] += 1;
            if self.offset[axis] < self.stride {
                return true;
            }
            self.offset[axis] = 0;
        }
        false
    }
}

impl<const D: usize> SupercellMapper for StrideMapper<D> {
    fn supercells(&self) -> Vec<usize> {
        let extent = self.layout.extent();
        let mut lo = [0u32; D];
        let mut count = [0u32; D];
        for i in 0..D {
            lo[i] = self.offset[i];
            count[i] = if extent[i] > self.offset[i] {
                (extent[i] - self.offset[i]).div_ceil(self.stride)
            } else {
                0
            };
        }
        let total: usize = count.iter().map(|&c| c as usize).product();

        let mut out = Vec::with_capacity(total);
        for mut n in 0..total {
            let mut coord = [0u32; D];
            for i in 0..D {
                coord[i] = lo[i] + (n % count[i] as usize) as u32 * self.stride;
                n /= count[i] as usize;
            }
            if self.mask.contains(self.layout.area_of(coord)) {
                out.push(self.layout.index(coord));
            }
        }
        out
    }
}
