//! Particle records stored in frame slots.
//!
//! The store never interprets a record beyond its cell index relative to
//! the owning supercell. Everything else is payload for physics and I/O.

/// A fixed-width particle record that can live in a frame slot.
///
/// `local_cell` is the cell index relative to the owning supercell's origin.
/// Physics may push it outside `[0, supercell_size)`; relocation then moves
/// the record to the neighbor that contains it and rebases the index.
pub trait ParticleRecord<const D: usize>: Copy + Default + Send + Sync + 'static {
    /// Cell index relative to the owning supercell.
    fn local_cell(&self) -> [i32; D];

    /// Overwrite the cell index (used when rebasing into another supercell).
    fn set_local_cell(&mut self, cell: [i32; D]);
}

/// Default particle record: cell-relative position plus a small payload.
///
/// # Memory Layout (D = 3)
///
/// | Field     | Type     | Size |
/// |-----------|----------|------|
/// | cell      | [i32; 3] | 12   |
/// | position  | [f32; 3] | 12   |
/// | momentum  | [f32; 3] | 12   |
/// | weighting | f32      | 4    |
/// | id        | u64      | 8    |
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Particle<const D: usize> {
    /// Cell index relative to the owning supercell
    pub cell: [i32; D],
    /// Position inside the cell, each component in `[0, 1)`
    pub position: [f32; D],
    /// Momentum (payload, untouched by the store)
    pub momentum: [f32; D],
    /// Macro-particle weighting (payload)
    pub weighting: f32,
    /// Stable identifier (payload)
    pub id: u64,
}

impl<const D: usize> Default for Particle<D> {
    fn default() -> Self {
        Self {
            cell: [0; D],
            position: [0.0; D],
            momentum: [0.0; D],
            weighting: 0.0,
            id: 0,
        }
    }
}

impl<const D: usize> Particle<D> {
    /// Create a particle at the center of `cell`.
    #[inline]
    pub fn new(id: u64, cell: [i32; D]) -> Self {
        Self {
            cell,
            position: [0.5; D],
            momentum: [0.0; D],
            weighting: 1.0,
            id,
        }
    }

    /// Builder-style in-cell position.
    #[inline]
    pub fn with_position(mut self, position: [f32; D]) -> Self {
        self.position = position;
        self
    }

    /// Builder-style momentum.
    #[inline]
    pub fn with_momentum(mut self, momentum: [f32; D]) -> Self {
        self.momentum = momentum;
        self
    }

    /// Move by `displacement` (in cell widths), carrying whole cells into `cell`.
    ///
    /// After the call every position component is back in `[0, 1)`.
    #[inline]
    pub fn advance(&mut self, displacement: [f32; D]) {
        for axis in 0..D {
            let p = self.position[axis] + displacement[axis];
            let whole = p.floor();
            self.cell[axis] += whole as i32;
            self.position[axis] = p - whole;
        }
    }
}

impl<const D: usize> ParticleRecord<D> for Particle<D> {
    #[inline]
    fn local_cell(&self) -> [i32; D] {
        self.cell
    }

    #[inline]
    fn set_local_cell(&mut self, cell: [i32; D]) {
        self.cell = cell;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_particle_size() {
        assert_eq!(std::mem::size_of::<Particle<3>>(), 48);
    }

    #[test]
    fn test_particle_new() {
        let p = Particle::<3>::new(7, [1, 2, 3]);
        assert_eq!(p.id, 7);
        assert_eq!(p.local_cell(), [1, 2, 3]);
        assert_eq!(p.position, [0.5; 3]);
    }

    #[test]
    fn test_advance_carries_cells() {
        let mut p = Particle::<2>::new(1, [0, 0]).with_position([0.75, 0.25]);
        p.advance([0.5, -0.5]);
        assert_eq!(p.cell, [1, -1]);
        assert!((p.position[0] - 0.25).abs() < 1e-6);
        assert!((p.position[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_advance_within_cell() {
        let mut p = Particle::<3>::new(1, [2, 2, 2]);
        p.advance([0.1, 0.2, -0.3]);
        assert_eq!(p.cell, [2, 2, 2]);
    }

    #[test]
    fn test_set_local_cell() {
        let mut p = Particle::<3>::new(1, [4, 0, 0]);
        p.set_local_cell([0, 0, 0]);
        assert_eq!(p.cell, [0, 0, 0]);
    }
}
