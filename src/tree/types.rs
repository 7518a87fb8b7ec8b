//! Bit-encoded enumeration of cell subspaces
//!
//! A cell in `N` dimensions has `3^N` subspaces: corners, edges, faces, and
//! the interior.  Each is named by a [`NeighborIndex`], a base-3 number whose
//! digit for each axis is *low*, *high*, or *floating*.  A subspace with no
//! floating axes is a corner; with all axes floating it is the cell interior.

/// `3^n`, for subspace counts
pub const fn subspace_count(n: usize) -> usize {
    3usize.pow(n as u32)
}

/// `2^n`, for corner counts
pub const fn corner_count(n: usize) -> usize {
    1 << n
}

/// Per-axis state of a subspace
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AxisState {
    Low = 0,
    High = 1,
    Floating = 2,
}

/// Index of a subspace of an `N`-dimensional cell, in `[0, 3^N)`
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NeighborIndex<const N: usize>(u8);

impl<const N: usize> NeighborIndex<N> {
    pub fn new(i: usize) -> Self {
        assert!(i < subspace_count(N));
        Self(i as u8)
    }

    /// Returns the raw index, suitable for array lookups
    pub fn i(self) -> usize {
        self.0 as usize
    }

    /// Iterates over every subspace of the cell
    pub fn iter() -> impl Iterator<Item = Self> {
        (0..subspace_count(N)).map(|i| Self(i as u8))
    }

    fn state(self, axis: usize) -> AxisState {
        match (self.0 as usize / 3usize.pow(axis as u32)) % 3 {
            0 => AxisState::Low,
            1 => AxisState::High,
            _ => AxisState::Floating,
        }
    }

    /// Bitmask of axes on which this subspace spans the cell
    pub fn floating(self) -> u8 {
        let mut out = 0;
        for d in 0..N {
            if self.state(d) == AxisState::Floating {
                out |= 1 << d;
            }
        }
        out
    }

    /// Bitmask of axes pinned to one side of the cell
    pub fn fixed(self) -> u8 {
        !self.floating() & ((1 << N) - 1)
    }

    /// Bitmask of fixed axes pinned to the upper side
    pub fn pos(self) -> u8 {
        let mut out = 0;
        for d in 0..N {
            if self.state(d) == AxisState::High {
                out |= 1 << d;
            }
        }
        out
    }

    /// Number of floating axes, i.e. the dimension of the subspace
    pub fn dimension(self) -> usize {
        self.floating().count_ones() as usize
    }

    /// Checks whether `other` lies within the closure of this subspace
    ///
    /// True iff every fixed axis of `self` is fixed to the same side in
    /// `other`; floating axes of `self` place no constraint.
    pub fn contains(self, other: Self) -> bool {
        (0..N).all(|d| {
            self.state(d) == AxisState::Floating
                || self.state(d) == other.state(d)
        })
    }

    pub fn is_corner(self) -> bool {
        self.dimension() == 0
    }

    /// Builds a subspace index from a floating mask and the positions of the
    /// remaining fixed axes
    pub fn from_pos_and_floating(pos: u8, floating: u8) -> Self {
        let mut i = 0;
        for d in (0..N).rev() {
            let digit = if floating & (1 << d) != 0 {
                2
            } else if pos & (1 << d) != 0 {
                1
            } else {
                0
            };
            i = i * 3 + digit;
        }
        Self(i as u8)
    }

    /// Converts a corner subspace to its [`CornerIndex`]
    pub fn corner(self) -> Option<CornerIndex<N>> {
        if self.is_corner() {
            Some(CornerIndex(self.pos()))
        } else {
            None
        }
    }
}

/// Index of a cell corner (or of a child cell), in `[0, 2^N)`
///
/// Bit `d` set means the corner is on the high side of axis `d`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CornerIndex<const N: usize>(pub u8);

impl<const N: usize> CornerIndex<N> {
    pub fn new(i: usize) -> Self {
        assert!(i < corner_count(N));
        Self(i as u8)
    }

    pub fn i(self) -> usize {
        self.0 as usize
    }

    pub fn iter() -> impl Iterator<Item = Self> {
        (0..corner_count(N)).map(|i| Self(i as u8))
    }

    /// The corner as a subspace with no floating axes
    pub fn neighbor(self) -> NeighborIndex<N> {
        NeighborIndex::from_pos_and_floating(self.0, 0)
    }
}
