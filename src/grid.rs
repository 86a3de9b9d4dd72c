//! Supercell Grid - layout, area classification and exchange directions.
//!
//! The local domain is `local[i]` supercells per axis (CORE + BORDER),
//! surrounded by `guard` supercells of halo on every side. The border is as
//! wide as the guard.
//!
//! ```text
//!   axis:  | guard | border |   core   | border | guard |
//!   coord: 0       g        2g         L        g+L     2g+L
//! ```

use std::fmt;
use std::ops::BitOr;

use arrayvec::ArrayVec;

use crate::error::{StoreError, StoreResult};

/// Maximum supported dimensionality
pub const MAX_DIM: usize = 3;

/// Maximum number of exchange directions (`3^3 - 1`)
pub const MAX_DIRECTIONS: usize = 26;

/// Classification of a supercell by distance to the subdomain boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Area {
    /// Interior, no neighbor dependency
    Core = 1,
    /// Adjacent to the subdomain edge
    Border = 2,
    /// Halo mirroring a neighbor's border
    Guard = 4,
}

/// A union of areas (e.g. `AreaMask::CORE | AreaMask::BORDER`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AreaMask(u8);

impl AreaMask {
    pub const CORE: AreaMask = AreaMask(Area::Core as u8);
    pub const BORDER: AreaMask = AreaMask(Area::Border as u8);
    pub const GUARD: AreaMask = AreaMask(Area::Guard as u8);
    pub const ALL: AreaMask = AreaMask(7);

    /// Returns true if `area` is part of the mask
    #[inline]
    pub const fn contains(self, area: Area) -> bool {
        self.0 & area as u8 != 0
    }

    /// Raw bits
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl From<Area> for AreaMask {
    fn from(area: Area) -> Self {
        AreaMask(area as u8)
    }
}

impl BitOr for AreaMask {
    type Output = AreaMask;

    fn bitor(self, rhs: AreaMask) -> AreaMask {
        AreaMask(self.0 | rhs.0)
    }
}

/// Neighbor-relative exchange direction: a non-zero offset in `{-1,0,1}^D`.
///
/// Encoded as `sum((o_i + 1) * 3^i)`; the all-zero center is excluded, so
/// there are `3^D - 1` directions and `mirror(d)` is `3^D - 1 - d`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Direction<const D: usize>(u8);

impl<const D: usize> Direction<D> {
    const CELLS: u8 = {
        assert!(D >= 1 && D <= MAX_DIM, "Dimension must be 1, 2 or 3");
        let mut n = 1u8;
        let mut i = 0;
        while i < D {
            n *= 3;
            i += 1;
        }
        n
    };
    const CENTER: u8 = (Self::CELLS - 1) / 2;

    /// Number of directions (`3^D - 1`)
    pub const COUNT: usize = (Self::CELLS - 1) as usize;

    /// Build a direction from an offset vector.
    ///
    /// Returns `None` for the zero vector or components outside `{-1,0,1}`.
    pub fn from_offset(offset: [i32; D]) -> Option<Self> {
        let mut id = 0u8;
        let mut scale = 1u8;
        for o in offset {
            if !(-1..=1).contains(&o) {
                return None;
            }
            id += (o + 1) as u8 * scale;
            scale = scale.saturating_mul(3);
        }
        (id != Self::CENTER).then_some(Self(id))
    }

    /// Build a direction from its raw id.
    pub fn from_id(id: u8) -> Option<Self> {
        (id < Self::CELLS && id != Self::CENTER).then_some(Self(id))
    }

    /// Raw id
    #[inline]
    pub const fn id(self) -> u8 {
        self.0
    }

    /// Dense index in `0..COUNT`
    #[inline]
    pub const fn index(self) -> usize {
        if self.0 < Self::CENTER {
            self.0 as usize
        } else {
            self.0 as usize - 1
        }
    }

    /// Offset vector
    pub fn offset(self) -> [i32; D] {
        let mut out = [0i32; D];
        let mut rest = self.0;
        for o in out.iter_mut() {
            *o = (rest % 3) as i32 - 1;
            rest /= 3;
        }
        out
    }

    /// The opposite direction
    #[inline]
    pub const fn mirror(self) -> Self {
        Self(Self::CELLS - 1 - self.0)
    }

    /// All directions in id order
    pub fn all() -> ArrayVec<Self, MAX_DIRECTIONS> {
        (0..Self::CELLS)
            .filter(|&id| id != Self::CENTER)
            .map(Self)
            .collect()
    }
}

impl<const D: usize> fmt::Debug for Direction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Direction{:?}", self.offset())
    }
}

impl<const D: usize> fmt::Display for Direction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = ["x", "y", "z"];
        let mut first = true;
        for (axis, o) in self.offset().iter().enumerate() {
            if *o != 0 {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}{}", if *o < 0 { "-" } else { "+" }, names[axis])?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Axis-aligned box of supercell coordinates, `lo` inclusive, `hi` exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region<const D: usize> {
    pub lo: [u32; D],
    pub hi: [u32; D],
}

impl<const D: usize> Region<D> {
    /// Returns true if the box contains no supercell
    pub fn is_empty(&self) -> bool {
        (0..D).any(|i| self.lo[i] >= self.hi[i])
    }

    /// Number of supercells in the box
    pub fn volume(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (0..D).map(|i| (self.hi[i] - self.lo[i]) as usize).product()
    }

    /// Returns true if `coord` lies in the box
    pub fn contains(&self, coord: [u32; D]) -> bool {
        (0..D).all(|i| coord[i] >= self.lo[i] && coord[i] < self.hi[i])
    }

    /// Returns true if the boxes share a supercell
    pub fn intersects(&self, other: &Region<D>) -> bool {
        (0..D).all(|i| self.lo[i].max(other.lo[i]) < self.hi[i].min(other.hi[i]))
    }

    /// Iterate coordinates in x-fastest order
    pub fn coords(&self) -> impl Iterator<Item = [u32; D]> + '_ {
        let volume = self.volume();
        (0..volume).map(move |mut n| {
            let mut c = [0u32; D];
            for i in 0..D {
                let extent = (self.hi[i] - self.lo[i]) as usize;
                c[i] = self.lo[i] + (n % extent) as u32;
                n /= extent;
            }
            c
        })
    }
}

/// Geometry of the supercell grid, including guard margins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridLayout<const D: usize> {
    local: [u32; D],
    guard: u32,
    supercell_size: [u32; D],
}

impl<const D: usize> GridLayout<D> {
    /// Create a layout.
    ///
    /// # Arguments
    /// * `local` - CORE + BORDER supercells per axis
    /// * `guard` - guard (and border) width in supercells
    /// * `supercell_size` - cells per supercell per axis
    pub fn new(local: [u32; D], guard: u32, supercell_size: [u32; D]) -> StoreResult<Self> {
        if D == 0 || D > MAX_DIM {
            return Err(StoreError::config(format!("unsupported dimension {}", D)));
        }
        if guard == 0 {
            return Err(StoreError::config("guard width must be at least one supercell"));
        }
        if local.iter().any(|&l| l == 0) {
            return Err(StoreError::config("local supercell count must be positive on every axis"));
        }
        if supercell_size.iter().any(|&s| s == 0) {
            return Err(StoreError::config("supercell size must be positive on every axis"));
        }
        Ok(Self {
            local,
            guard,
            supercell_size,
        })
    }

    /// CORE + BORDER supercells per axis
    #[inline]
    pub fn local(&self) -> [u32; D] {
        self.local
    }

    /// Guard width in supercells
    #[inline]
    pub fn guard(&self) -> u32 {
        self.guard
    }

    /// Cells per supercell per axis
    #[inline]
    pub fn supercell_size(&self) -> [u32; D] {
        self.supercell_size
    }

    /// Particle slots per frame: the cell volume of one supercell
    #[inline]
    pub fn tile_size(&self) -> u32 {
        self.supercell_size.iter().product()
    }

    /// Supercells per axis including guards
    #[inline]
    pub fn extent(&self) -> [u32; D] {
        let mut e = self.local;
        for v in e.iter_mut() {
            *v += 2 * self.guard;
        }
        e
    }

    /// Total number of supercells including guards
    #[inline]
    pub fn supercell_count(&self) -> usize {
        self.extent().iter().map(|&e| e as usize).product()
    }

    /// Whole grid as a region
    pub fn full_region(&self) -> Region<D> {
        Region {
            lo: [0; D],
            hi: self.extent(),
        }
    }

    /// Linear index of a supercell coordinate (x fastest)
    #[inline]
    pub fn index(&self, coord: [u32; D]) -> usize {
        let extent = self.extent();
        let mut idx = 0usize;
        for i in (0..D).rev() {
            debug_assert!(coord[i] < extent[i], "Coordinate out of bounds");
            idx = idx * extent[i] as usize + coord[i] as usize;
        }
        idx
    }

    /// Supercell coordinate of a linear index
    #[inline]
    pub fn coord(&self, mut index: usize) -> [u32; D] {
        let extent = self.extent();
        let mut c = [0u32; D];
        for i in 0..D {
            c[i] = (index % extent[i] as usize) as u32;
            index /= extent[i] as usize;
        }
        c
    }

    /// Supercell at `coord + offset`, or `None` outside the grid
    #[inline]
    pub fn neighbor(&self, coord: [u32; D], offset: [i32; D]) -> Option<usize> {
        let extent = self.extent();
        let mut n = [0u32; D];
        for i in 0..D {
            let c = coord[i] as i64 + offset[i] as i64;
            if c < 0 || c >= extent[i] as i64 {
                return None;
            }
            n[i] = c as u32;
        }
        Some(self.index(n))
    }

    /// Area of a supercell
    pub fn area_of(&self, coord: [u32; D]) -> Area {
        let g = self.guard;
        let mut border = false;
        for i in 0..D {
            let c = coord[i];
            let l = self.local[i];
            if c < g || c >= g + l {
                return Area::Guard;
            }
            if c < 2 * g || c >= l {
                border = true;
            }
        }
        if border {
            Area::Border
        } else {
            Area::Core
        }
    }

    /// Returns true if the supercell at `index` belongs to `mask`
    #[inline]
    pub fn in_area(&self, index: usize, mask: AreaMask) -> bool {
        mask.contains(self.area_of(self.coord(index)))
    }

    /// Guard supercells mirrored to the neighbor in `direction`.
    ///
    /// Guard regions of distinct directions are disjoint.
    pub fn guard_region(&self, direction: Direction<D>) -> Region<D> {
        let g = self.guard;
        let offset = direction.offset();
        let mut region = Region {
            lo: [0; D],
            hi: [0; D],
        };
        for i in 0..D {
            let l = self.local[i];
            let (lo, hi) = match offset[i] {
                -1 => (0, g),
                1 => (g + l, 2 * g + l),
                _ => (g, g + l),
            };
            region.lo[i] = lo;
            region.hi[i] = hi;
        }
        region
    }

    /// Border supercells that receive particles from the neighbor in `direction`.
    ///
    /// Border regions of distinct directions may overlap (edges and corners).
    pub fn border_region(&self, direction: Direction<D>) -> Region<D> {
        let g = self.guard;
        let offset = direction.offset();
        let mut region = Region {
            lo: [0; D],
            hi: [0; D],
        };
        for i in 0..D {
            let l = self.local[i];
            let (lo, hi) = match offset[i] {
                -1 => (g, (2 * g).min(g + l)),
                1 => (l.max(g), g + l),
                _ => (g, g + l),
            };
            region.lo[i] = lo;
            region.hi[i] = hi;
        }
        region
    }

    /// Supercell containing `cell`, a cell index relative to the grid origin.
    pub fn supercell_of_cell(&self, cell: [i64; D]) -> Option<([u32; D], [i32; D])> {
        let extent = self.extent();
        let mut coord = [0u32; D];
        let mut local = [0i32; D];
        for i in 0..D {
            let size = self.supercell_size[i] as i64;
            let sc = cell[i].div_euclid(size);
            if sc < 0 || sc >= extent[i] as i64 {
                return None;
            }
            coord[i] = sc as u32;
            local[i] = cell[i].rem_euclid(size) as i32;
        }
        Some((coord, local))
    }

    /// Supercell offset implied by a local cell index: `floor(local / size)`.
    #[inline]
    pub fn supercell_offset(&self, local: [i32; D]) -> [i32; D] {
        let mut offset = [0i32; D];
        for i in 0..D {
            offset[i] = local[i].div_euclid(self.supercell_size[i] as i32);
        }
        offset
    }

    /// Rebase a local cell index by a supercell offset.
    #[inline]
    pub fn rebase(&self, local: [i32; D], offset: [i32; D]) -> [i32; D] {
        let mut out = local;
        for i in 0..D {
            out[i] -= offset[i] * self.supercell_size[i] as i32;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> GridLayout<3> {
        GridLayout::new([4, 4, 4], 1, [2, 2, 2]).unwrap()
    }

    #[test]
    fn test_direction_encoding() {
        assert_eq!(Direction::<3>::COUNT, 26);
        assert_eq!(Direction::<2>::COUNT, 8);
        assert_eq!(Direction::<3>::all().len(), 26);
        assert!(Direction::<3>::from_offset([0, 0, 0]).is_none());
        assert!(Direction::<3>::from_offset([2, 0, 0]).is_none());

        for d in Direction::<3>::all() {
            assert_eq!(Direction::from_offset(d.offset()), Some(d));
            let m = d.mirror();
            let neg: Vec<i32> = d.offset().iter().map(|o| -o).collect();
            assert_eq!(m.offset().to_vec(), neg);
            assert_eq!(m.mirror(), d);
        }
    }

    #[test]
    fn test_direction_dense_index() {
        let mut seen: Vec<usize> = Direction::<2>::all().iter().map(|d| d.index()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_direction_display() {
        let d = Direction::<3>::from_offset([1, 0, -1]).unwrap();
        assert_eq!(d.to_string(), "+x,-z");
    }

    #[test]
    fn test_index_coord_roundtrip() {
        let layout = layout();
        assert_eq!(layout.extent(), [6, 6, 6]);
        assert_eq!(layout.supercell_count(), 216);
        for idx in [0, 1, 37, 215] {
            assert_eq!(layout.index(layout.coord(idx)), idx);
        }
        assert_eq!(layout.index([1, 0, 0]), 1);
        assert_eq!(layout.index([0, 1, 0]), 6);
    }

    #[test]
    fn test_area_classification() {
        let layout = layout();
        assert_eq!(layout.area_of([0, 3, 3]), Area::Guard);
        assert_eq!(layout.area_of([5, 3, 3]), Area::Guard);
        assert_eq!(layout.area_of([1, 3, 3]), Area::Border);
        assert_eq!(layout.area_of([4, 3, 3]), Area::Border);
        assert_eq!(layout.area_of([2, 3, 3]), Area::Core);
        assert_eq!(layout.area_of([3, 2, 2]), Area::Core);
    }

    #[test]
    fn test_area_counts() {
        let layout = layout();
        let count = |mask: AreaMask| {
            (0..layout.supercell_count())
                .filter(|&i| layout.in_area(i, mask))
                .count()
        };
        assert_eq!(count(AreaMask::CORE), 8);
        assert_eq!(count(AreaMask::BORDER), 64 - 8);
        assert_eq!(count(AreaMask::GUARD), 216 - 64);
        assert_eq!(count(AreaMask::ALL), 216);
    }

    #[test]
    fn test_guard_regions_are_disjoint_and_cover_guard() {
        let layout = layout();
        let dirs = Direction::<3>::all();
        let mut covered = 0;
        for (i, a) in dirs.iter().enumerate() {
            let ra = layout.guard_region(*a);
            covered += ra.volume();
            for c in ra.coords() {
                assert_eq!(layout.area_of(c), Area::Guard);
            }
            for b in dirs.iter().skip(i + 1) {
                assert!(!ra.intersects(&layout.guard_region(*b)));
            }
        }
        assert_eq!(covered, 216 - 64);
    }

    #[test]
    fn test_border_regions_overlap_at_edges() {
        let layout = layout();
        let x = Direction::from_offset([1, 0, 0]).unwrap();
        let xy = Direction::from_offset([1, 1, 0]).unwrap();
        let mx = Direction::from_offset([-1, 0, 0]).unwrap();
        assert!(layout.border_region(x).intersects(&layout.border_region(xy)));
        assert!(!layout.border_region(x).intersects(&layout.border_region(mx)));
        for c in layout.border_region(xy).coords() {
            assert_eq!(layout.area_of(c), Area::Border);
        }
    }

    #[test]
    fn test_neighbor_bounds() {
        let layout = layout();
        assert_eq!(layout.neighbor([0, 0, 0], [-1, 0, 0]), None);
        assert_eq!(layout.neighbor([0, 0, 0], [1, 1, 0]), Some(layout.index([1, 1, 0])));
        assert_eq!(layout.neighbor([5, 5, 5], [0, 0, 1]), None);
    }

    #[test]
    fn test_supercell_offset_and_rebase() {
        let layout = layout();
        assert_eq!(layout.supercell_offset([0, 1, 0]), [0, 0, 0]);
        assert_eq!(layout.supercell_offset([2, -1, 1]), [1, -1, 0]);
        assert_eq!(layout.rebase([2, -1, 1], [1, -1, 0]), [0, 1, 1]);
    }

    #[test]
    fn test_supercell_of_cell() {
        let layout = layout();
        assert_eq!(layout.supercell_of_cell([3, 0, 5]), Some(([1, 0, 2], [1, 0, 1])));
        assert_eq!(layout.supercell_of_cell([-1, 0, 0]), None);
        assert_eq!(layout.supercell_of_cell([12, 0, 0]), None);
    }

    #[test]
    fn test_layout_validation() {
        assert!(GridLayout::<2>::new([4, 4], 0, [2, 2]).is_err());
        assert!(GridLayout::<2>::new([0, 4], 1, [2, 2]).is_err());
        assert!(GridLayout::<2>::new([4, 4], 1, [2, 0]).is_err());
    }
}
