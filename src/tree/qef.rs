//! Per-subspace quadratic error functions and the bounded solver
//!
//! Each sample contributes the plane equation `normal·x - w = normal·pos -
//! value`, where `x` is the vertex position and `w` is the field value at the
//! vertex.  Fitting position and value jointly means that a sample away from
//! the surface is not penalized for its distance, only for disagreement with
//! the other samples' local model.
//!
//! The accumulator is stored at the maximum dimension (3 position axes plus
//! the value axis); only the first `N + 1` rows and columns are used.

use super::types::NeighborIndex;
use nalgebra::{DMatrix, DVector, Matrix4, SVector, Vector4};

/// Eigenvalues below this are treated as degenerate directions; the solution
/// stays at the region centroid along them.
pub const EIGENVALUE_CUTOFF: f64 = 0.1;

/// Accumulated normal equations for one subspace
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Qef<const N: usize> {
    ata: Matrix4<f64>,
    atb: Vector4<f64>,
    btb: f64,
    count: usize,
}

impl<const N: usize> std::ops::AddAssign for Qef<N> {
    fn add_assign(&mut self, rhs: Self) {
        self.ata += rhs.ata;
        self.atb += rhs.atb;
        self.btb += rhs.btb;
        self.count += rhs.count;
    }
}

impl<const N: usize> Qef<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Number of samples accumulated so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Adds a sample at `pos` with the given field gradient and value
    pub fn insert(
        &mut self,
        pos: SVector<f64, N>,
        norm: SVector<f64, N>,
        value: f64,
    ) {
        // Row over the unknowns [x.., w]
        let mut row = Vector4::zeros();
        for d in 0..N {
            row[d] = norm[d];
        }
        row[N] = -1.0;

        let b = norm.dot(&pos) - value;
        self.ata += row * row.transpose();
        self.atb += row * b;
        self.btb += b * b;
        self.count += 1;
    }

    /// Projects into the floating axes of a subspace, substituting the fixed
    /// axes with their known coordinates.
    ///
    /// The value axis is always retained, so the result has one more
    /// dimension than the subspace itself.
    pub fn sub(
        &self,
        sub: NeighborIndex<N>,
        fixed: &SVector<f64, N>,
    ) -> ReducedQef {
        let floating = sub.floating();
        let mut keep = vec![];
        for d in 0..N {
            if floating & (1 << d) != 0 {
                keep.push(d);
            }
        }
        keep.push(N); // the value axis

        let k = keep.len();
        let mut ata = DMatrix::zeros(k, k);
        let mut atb = DVector::zeros(k);
        let mut btb = self.btb;

        for (i, &di) in keep.iter().enumerate() {
            for (j, &dj) in keep.iter().enumerate() {
                ata[(i, j)] = self.ata[(di, dj)];
            }
            atb[i] = self.atb[di];
        }

        // Substituting x_d = v moves the fixed columns into the RHS
        for d in 0..N {
            if floating & (1 << d) != 0 {
                continue;
            }
            let v = fixed[d];
            for (i, &di) in keep.iter().enumerate() {
                atb[i] -= self.ata[(di, d)] * v;
            }
            btb -= 2.0 * self.atb[d] * v;
            for e in 0..N {
                if floating & (1 << e) == 0 {
                    btb += v * self.ata[(d, e)] * fixed[e];
                }
            }
        }

        ReducedQef { ata, atb, btb }
    }
}

/// A QEF over the floating axes of one subspace, plus the value axis
#[derive(Clone, Debug)]
pub struct ReducedQef {
    ata: DMatrix<f64>,
    atb: DVector<f64>,
    btb: f64,
}

/// Result of a bounded QEF solve
#[derive(Clone, Debug)]
pub struct Solution {
    /// Vertex position within the subspace's floating axes
    pub position: DVector<f64>,
    /// Fitted field value at the vertex
    pub value: f64,
    /// Residual `|Ax - b|^2` at the solution
    pub error: f64,
}

impl ReducedQef {
    /// Number of position dimensions (excluding the value axis)
    pub fn dimension(&self) -> usize {
        self.ata.nrows() - 1
    }

    fn error_at(&self, x: &DVector<f64>) -> f64 {
        ((x.transpose() * &self.ata * x)[(0, 0)] - 2.0 * self.atb.dot(x)
            + self.btb)
            .max(0.0)
    }

    /// Minimizes `|Ax - b|^2` subject to the position lying in the given box
    ///
    /// `lower` and `upper` bound the position axes; the value axis is
    /// unconstrained.  Eigen-directions below `cutoff` are treated as
    /// degenerate, leaving the solution at the box centroid along them.  If
    /// the unconstrained solution escapes the box, it is projected onto each
    /// violated face and re-solved in one lower dimension; the feasible
    /// candidate with the smallest error wins.
    pub fn solve_bounded(
        &self,
        lower: &[f64],
        upper: &[f64],
        cutoff: f64,
    ) -> Solution {
        let dim = self.ata.nrows();
        let k = dim - 1;
        assert_eq!(lower.len(), k);
        assert_eq!(upper.len(), k);

        // Solve about the box centroid (value axis centered at zero)
        let mut center = DVector::zeros(dim);
        for d in 0..k {
            center[d] = (lower[d] + upper[d]) / 2.0;
        }
        let atb_c = &self.atb - &self.ata * &center;

        let eig = nalgebra::linalg::SymmetricEigen::new(self.ata.clone());
        let mut sol = center.clone();
        for i in 0..dim {
            let l = eig.eigenvalues[i];
            if l.abs() < cutoff {
                continue;
            }
            let q = eig.eigenvectors.column(i).clone_owned();
            let coeff = q.dot(&atb_c) / l;
            sol += q * coeff;
        }

        if !sol.iter().all(|v| v.is_finite()) {
            return Solution {
                position: center.rows(0, k).clone_owned(),
                value: 0.0,
                error: f64::INFINITY,
            };
        }

        let tol = 1e-12
            * upper
                .iter()
                .zip(lower)
                .map(|(u, l)| u - l)
                .fold(1.0, f64::max);
        let out_of_bounds = (0..k).any(|d| {
            sol[d] < lower[d] - tol || sol[d] > upper[d] + tol
        });
        if !out_of_bounds {
            let mut clamped = sol;
            for d in 0..k {
                clamped[d] = clamped[d].clamp(lower[d], upper[d]);
            }
            let error = self.error_at(&clamped);
            return Solution {
                position: clamped.rows(0, k).clone_owned(),
                value: clamped[k],
                error,
            };
        }

        let mut best: Option<Solution> = None;
        for d in 0..k {
            for (violates, v) in [
                (sol[d] < lower[d] - tol, lower[d]),
                (sol[d] > upper[d] + tol, upper[d]),
            ] {
                if !violates {
                    continue;
                }
                let sub = self.constrain(d, v);
                let sub_lower: Vec<f64> = lower
                    .iter()
                    .enumerate()
                    .filter(|&(e, _)| e != d)
                    .map(|(_, &x)| x)
                    .collect();
                let sub_upper: Vec<f64> = upper
                    .iter()
                    .enumerate()
                    .filter(|&(e, _)| e != d)
                    .map(|(_, &x)| x)
                    .collect();
                let s = sub.solve_bounded(&sub_lower, &sub_upper, cutoff);

                // Reassemble the full-dimension position
                let mut position = DVector::zeros(k);
                let mut j = 0;
                for e in 0..k {
                    if e == d {
                        position[e] = v;
                    } else {
                        position[e] = s.position[j];
                        j += 1;
                    }
                }
                let better = match &best {
                    Some(b) => s.error < b.error,
                    None => true,
                };
                if better {
                    best = Some(Solution {
                        position,
                        value: s.value,
                        error: s.error,
                    });
                }
            }
        }
        best.unwrap()
    }

    /// Substitutes position axis `d` with the value `v`, producing a QEF of
    /// one lower dimension
    fn constrain(&self, d: usize, v: f64) -> ReducedQef {
        let dim = self.ata.nrows();
        let keep: Vec<usize> = (0..dim).filter(|&e| e != d).collect();
        let k = keep.len();

        let mut ata = DMatrix::zeros(k, k);
        let mut atb = DVector::zeros(k);
        for (i, &di) in keep.iter().enumerate() {
            for (j, &dj) in keep.iter().enumerate() {
                ata[(i, j)] = self.ata[(di, dj)];
            }
            atb[i] = self.atb[di] - self.ata[(di, d)] * v;
        }
        let btb =
            self.btb - 2.0 * self.atb[d] * v + v * self.ata[(d, d)] * v;
        ReducedQef { ata, atb, btb }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Vector3;

    fn full<const N: usize>() -> NeighborIndex<N> {
        NeighborIndex::from_pos_and_floating(0, (1 << N) - 1)
    }

    #[test]
    fn test_plane_fit() {
        // Samples of the field f = x on the corners of [-1, 1]^3: the x = 0
        // plane is exactly representable, so the cell vertex lands there
        // with zero error
        let mut q = Qef::<3>::new();
        for i in 0..8 {
            let pos = Vector3::new(
                if i & 1 != 0 { 1.0 } else { -1.0 },
                if i & 2 != 0 { 1.0 } else { -1.0 },
                if i & 4 != 0 { 1.0 } else { -1.0 },
            );
            q.insert(pos, Vector3::new(1.0, 0.0, 0.0), pos.x);
        }
        assert_eq!(q.count(), 8);

        let r = q.sub(full::<3>(), &Vector3::zeros());
        let sol = r.solve_bounded(&[-1.0; 3], &[1.0; 3], EIGENVALUE_CUTOFF);
        assert!(sol.position[0].abs() < 1e-9, "bad x: {}", sol.position[0]);
        assert!(sol.error < 1e-9, "bad error: {}", sol.error);
        assert!(sol.value.abs() < 1e-9);
    }

    #[test]
    fn test_corner_fit() {
        // Three planes whose zero sets share the corner (0.25, 0.5): the
        // system over (x, y, w) is fully determined and the solver recovers
        // the corner exactly, with w = 0
        let mut q = Qef::<2>::new();
        let planes = [
            (nalgebra::Vector2::new(1.0, 0.0), 0.25),
            (nalgebra::Vector2::new(0.0, 1.0), 0.5),
        ];
        for s in [-1.0, 1.0] {
            for (n, off) in planes {
                let p = n * s;
                q.insert(p, n, n.dot(&p) - off);
            }
            // A diagonal plane through the same corner pins the value axis
            let n = nalgebra::Vector2::new(1.0, 1.0);
            let p = nalgebra::Vector2::new(s, -s);
            q.insert(p, n, n.dot(&p) - 0.75);
        }
        let r = q.sub(full::<2>(), &nalgebra::Vector2::zeros());
        let sol = r.solve_bounded(&[-1.0; 2], &[1.0; 2], EIGENVALUE_CUTOFF);
        assert!((sol.position[0] - 0.25).abs() < 1e-9);
        assert!((sol.position[1] - 0.5).abs() < 1e-9);
        assert!(sol.value.abs() < 1e-9);
        assert!(sol.error < 1e-9);
    }

    #[test]
    fn test_bounded_clamp() {
        // A plane whose zero crossing is outside the box: the vertex stays
        // on the box face, and the fitted value reports the field there
        let mut q = Qef::<2>::new();
        let nx = nalgebra::Vector2::new(1.0, 0.0);
        for s in [-1.0, 1.0] {
            q.insert(nalgebra::Vector2::new(s, 0.0), nx, s - 2.0);
        }
        let r = q.sub(full::<2>(), &nalgebra::Vector2::zeros());
        let sol = r.solve_bounded(&[-1.0; 2], &[1.0; 2], EIGENVALUE_CUTOFF);
        assert!((sol.position[0] - 1.0).abs() < 1e-9);
        assert!(sol.position[1].abs() < 1e-9);
        // Both samples agree on a single plane, so the residual is zero
        assert!(sol.error < 1e-9);
        assert!((sol.value - -1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_centroid() {
        // A single horizontal plane: x and y are degenerate directions, so
        // the vertex stays at the box centroid in those axes
        let mut q = Qef::<3>::new();
        q.insert(
            Vector3::new(0.0, 0.0, 0.5),
            Vector3::new(0.0, 0.0, 1.0),
            0.0,
        );
        q.insert(
            Vector3::new(0.3, -0.2, 0.5),
            Vector3::new(0.0, 0.0, 1.0),
            0.0,
        );
        let r = q.sub(full::<3>(), &Vector3::zeros());
        let sol = r.solve_bounded(&[0.0, -1.0, 0.0], &[1.0, 1.0, 1.0],
            EIGENVALUE_CUTOFF);
        assert!((sol.position[0] - 0.5).abs() < 1e-9);
        assert!(sol.position[1].abs() < 1e-9);
        assert!((sol.position[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_random_planes() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..16 {
            // Samples of a random linear field are always consistent, so
            // the solution must satisfy the field's plane equation exactly
            let g = Vector3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            );
            let offset = rng.gen_range(-0.5..0.5);
            let mut q = Qef::<3>::new();
            for _ in 0..6 {
                let p = Vector3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-1.0..1.0),
                );
                q.insert(p, g, g.dot(&p) - offset);
            }
            let r = q.sub(full::<3>(), &Vector3::zeros());
            let sol =
                r.solve_bounded(&[-1.0; 3], &[1.0; 3], EIGENVALUE_CUTOFF);
            assert!(sol.error < 1e-9, "residual {} too large", sol.error);
            let pos = Vector3::new(
                sol.position[0],
                sol.position[1],
                sol.position[2],
            );
            assert!(
                (g.dot(&pos) - sol.value - offset).abs() < 1e-6,
                "solution is off the field's plane"
            );
        }
    }

    #[test]
    fn test_edge_projection() {
        // Projecting to an edge subspace substitutes the fixed axes: the
        // field f = x + y sampled on a 2D cell, projected onto the right
        // edge (x fixed at 1), has its zero crossing at y = -1
        let mut q = Qef::<2>::new();
        let n = nalgebra::Vector2::new(1.0, 1.0);
        for i in 0..4 {
            let pos = nalgebra::Vector2::new(
                if i & 1 != 0 { 1.0 } else { -1.0 },
                if i & 2 != 0 { 1.0 } else { -1.0 },
            );
            q.insert(pos, n, pos.x + pos.y);
        }
        // Right edge: x fixed high, y floating.  The projected system is
        // the single plane y - w = -1, which is satisfied exactly; the
        // degenerate direction along it is resolved towards the centroid.
        let edge = NeighborIndex::<2>::from_pos_and_floating(0b01, 0b10);
        let fixed = nalgebra::Vector2::new(1.0, 0.0);
        let r = q.sub(edge, &fixed);
        assert_eq!(r.dimension(), 1);
        let sol = r.solve_bounded(&[-1.0], &[1.0], EIGENVALUE_CUTOFF);
        assert!(sol.error < 1e-9);
        assert!(
            (sol.position[0] - sol.value + 1.0).abs() < 1e-9,
            "solution ({}, {}) is off the projected plane",
            sol.position[0],
            sol.value
        );
        assert!((sol.position[0] - -0.5).abs() < 1e-6);
    }
}
