//! Axis-aligned rectangular evaluation domains
use super::types::{CornerIndex, NeighborIndex};
use nalgebra::{SVector, Vector3};

/// An axis-aligned box in `N` dimensions, with a subdivision level
///
/// Levels count down during recursion; a region at level 0 is a leaf cell.
/// For `N == 2`, `perp` holds the out-of-plane Z coordinate at which the
/// field is sampled.
#[derive(Copy, Clone, Debug)]
pub struct Region<const N: usize> {
    pub lower: SVector<f64, N>,
    pub upper: SVector<f64, N>,
    pub level: u32,
    pub perp: f64,
}

impl<const N: usize> Region<N> {
    pub fn new(
        lower: SVector<f64, N>,
        upper: SVector<f64, N>,
        level: u32,
    ) -> Self {
        Self { lower, upper, level, perp: 0.0 }
    }

    /// Builds the child region in the given subdivision octant / quadrant
    pub fn child(&self, i: CornerIndex<N>) -> Self {
        assert!(self.level > 0);
        let mut lower = self.lower;
        let mut upper = self.upper;
        for d in 0..N {
            let mid = (self.lower[d] + self.upper[d]) / 2.0;
            if i.0 & (1 << d) != 0 {
                lower[d] = mid;
            } else {
                upper[d] = mid;
            }
        }
        Self { lower, upper, level: self.level - 1, perp: self.perp }
    }

    /// Returns the position of the given corner
    pub fn corner(&self, i: CornerIndex<N>) -> SVector<f64, N> {
        let mut out = self.lower;
        for d in 0..N {
            if i.0 & (1 << d) != 0 {
                out[d] = self.upper[d];
            }
        }
        out
    }

    /// Returns the given corner as a 3D single-precision point
    pub fn corner3f(&self, i: CornerIndex<N>) -> Vector3<f32> {
        self.to3f(&self.corner(i))
    }

    /// Extends an `N`-dimensional position to 3D, filling with `perp`
    pub fn to3f(&self, p: &SVector<f64, N>) -> Vector3<f32> {
        let mut out = Vector3::repeat(self.perp);
        for d in 0..N {
            out[d] = p[d];
        }
        out.map(|v| v as f32)
    }

    pub fn lower3f(&self) -> Vector3<f32> {
        self.to3f(&self.lower)
    }

    pub fn upper3f(&self) -> Vector3<f32> {
        self.to3f(&self.upper)
    }

    pub fn center(&self) -> SVector<f64, N> {
        (self.lower + self.upper) / 2.0
    }

    /// Returns the fixed-axis coordinates of a subspace: for every fixed axis
    /// of `sub`, the cell's lower or upper bound as selected by the
    /// subspace's position bits.  Floating axes are left at zero.
    pub fn subspace_fixed(&self, sub: NeighborIndex<N>) -> SVector<f64, N> {
        let floating = sub.floating();
        let pos = sub.pos();
        let mut out = SVector::zeros();
        for d in 0..N {
            if floating & (1 << d) != 0 {
                continue;
            }
            out[d] = if pos & (1 << d) != 0 {
                self.upper[d]
            } else {
                self.lower[d]
            };
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_region_child() {
        let r = Region::<2>::new(
            SVector::<f64, 2>::new(-1.0, -1.0),
            SVector::<f64, 2>::new(1.0, 1.0),
            2,
        );
        let c = r.child(CornerIndex::new(0b01));
        assert_eq!(c.lower, SVector::<f64, 2>::new(0.0, -1.0));
        assert_eq!(c.upper, SVector::<f64, 2>::new(1.0, 0.0));
        assert_eq!(c.level, 1);
    }

    #[test]
    fn test_region_corner() {
        let r = Region::<3>::new(
            SVector::<f64, 3>::new(0.0, 0.0, 0.0),
            SVector::<f64, 3>::new(1.0, 2.0, 3.0),
            1,
        );
        assert_eq!(
            r.corner(CornerIndex::new(0b101)),
            SVector::<f64, 3>::new(1.0, 0.0, 3.0)
        );
        assert_eq!(
            r.corner3f(CornerIndex::new(0b010)),
            Vector3::new(0.0, 2.0, 0.0)
        );
    }

    #[test]
    fn test_subspace_fixed() {
        let r = Region::<2>::new(
            SVector::<f64, 2>::new(-1.0, -2.0),
            SVector::<f64, 2>::new(1.0, 2.0),
            1,
        );
        // Right edge: x fixed high, y floating
        let edge = NeighborIndex::from_pos_and_floating(0b01, 0b10);
        let f = r.subspace_fixed(edge);
        assert_eq!(f[0], 1.0);
        assert_eq!(f[1], 0.0);
    }
}
