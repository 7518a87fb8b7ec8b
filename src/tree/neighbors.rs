//! Same-level neighbor queries during construction and index assignment
//!
//! While descending the tree, each cell carries a table of the cells adjacent
//! to it at its own level (where they exist).  A child's table is derived
//! from its parent's: a neighbor of the child is either a sibling within the
//! same parent, or a child of the parent's neighbor on the far side of the
//! shared wall.  Coarser neighbors (leaves that never subdivided) are not
//! recorded; corner subspaces reach them through the upward walk in
//! [`assign_indices`](super::SimplexRoot::assign_indices).

use super::{
    pool::SubspacePool,
    tree::{SimplexLeaf, SimplexTree},
    types::{subspace_count, CornerIndex, NeighborIndex},
};

/// Upper bound on `3^N` across supported dimensions
pub const MAX_SUBSPACES: usize = 27;

/// Table of the cells adjacent to one cell, at the same subdivision level
///
/// Indexed by [`NeighborIndex`]: entry `q` is the cell sharing the face,
/// edge, or corner of this cell named by `q`'s fixed axes.  The interior
/// entry is unused.
#[derive(Copy, Clone)]
pub struct SimplexNeighbors<'a, const N: usize> {
    neighbors: [Option<&'a SimplexTree<N>>; MAX_SUBSPACES],
}

impl<'a, const N: usize> Default for SimplexNeighbors<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> SimplexNeighbors<'a, N> {
    pub fn new() -> Self {
        Self { neighbors: [None; MAX_SUBSPACES] }
    }

    /// Builds the neighbor table for the child at corner `child`, given this
    /// cell's own table and the already-built siblings (in corner order).
    pub fn push(
        &self,
        child: CornerIndex<N>,
        siblings: &'a [SimplexTree<N>],
    ) -> SimplexNeighbors<'a, N> {
        let mut out = SimplexNeighbors::new();
        for q in NeighborIndex::<N>::iter() {
            if q.dimension() == N {
                continue;
            }
            let fixed = q.fixed();
            let pos = q.pos();

            // The adjacent cell in direction q occupies the corner with
            // every fixed axis of q flipped
            let target = CornerIndex::<N>::new(child.i() ^ fixed as usize);

            // Axes on which the child sits against the parent's wall in the
            // direction of travel, i.e. where the step leaves the parent
            let crossing = fixed & !(child.0 ^ pos);

            if crossing == 0 {
                out.neighbors[q.i()] = siblings.get(target.i());
            } else {
                let parent_q = NeighborIndex::<N>::from_pos_and_floating(
                    pos & crossing,
                    !crossing & ((1 << N) - 1),
                );
                if let Some(n) = self.neighbors[parent_q.i()] {
                    if n.is_branch() {
                        out.neighbors[q.i()] = Some(n.child(target));
                    }
                }
            }
        }
        out
    }

    /// Maps our subspace `i` onto the neighbors that share it
    ///
    /// Yields `(q, j)` pairs where neighbor `q` holds the same geometric
    /// subspace under index `j` (the position bits flip along `q`'s axes).
    fn shared_with(
        i: NeighborIndex<N>,
    ) -> impl Iterator<Item = (NeighborIndex<N>, NeighborIndex<N>)> {
        NeighborIndex::<N>::iter().filter_map(move |q| {
            let fixed_q = q.fixed();
            if q.dimension() == N {
                return None;
            }
            // The subspace must be pinned to our boundary facing q
            if fixed_q & i.fixed() != fixed_q {
                return None;
            }
            if (i.pos() ^ q.pos()) & fixed_q != 0 {
                return None;
            }
            let j = NeighborIndex::from_pos_and_floating(
                i.pos() ^ fixed_q,
                i.floating(),
            );
            Some((q, j))
        })
    }

    /// Checks whether a neighboring cell has already solved subspace `i`
    ///
    /// Returns the neighbor's leaf and the subspace index within it, so the
    /// caller can adopt the shared [`SimplexLeafSubspace`] pointer.
    ///
    /// [`SimplexLeafSubspace`]: super::tree::SimplexLeafSubspace
    pub fn check(
        &self,
        i: NeighborIndex<N>,
    ) -> Option<(&'a SimplexLeaf<N>, NeighborIndex<N>)> {
        for (q, j) in Self::shared_with(i) {
            if let Some(leaf) = self.neighbors[q.i()].and_then(|n| n.leaf()) {
                return Some((leaf, j));
            }
        }
        None
    }

    /// Looks up an index already assigned to subspace `i` by a neighbor
    ///
    /// Branching neighbors are descended to find the matching subspace at
    /// the right resolution; only corner subspaces survive refinement, so
    /// anything else stops at the branch.  Returns 0 if no neighbor has
    /// assigned an index yet.
    pub fn get_index(
        &self,
        i: NeighborIndex<N>,
        subs: &SubspacePool<N>,
    ) -> u64 {
        for (q, j) in Self::shared_with(i) {
            let Some(mut n) = self.neighbors[q.i()] else {
                continue;
            };
            while n.is_branch() {
                match j.corner() {
                    Some(c) => n = n.child(c),
                    None => break,
                }
            }
            if let Some(leaf) = n.leaf() {
                debug_assert_eq!(leaf.sub.len(), subspace_count(N));
                let index = subs.get(leaf.sub[j.i()]).index;
                if index != 0 {
                    return index;
                }
            }
        }
        0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shared_with_corner() {
        // In 2D, a corner subspace is shared with three neighbors: two
        // edge-adjacent and one diagonal
        let corner = CornerIndex::<2>::new(0b11).neighbor();
        let shared: Vec<_> = SimplexNeighbors::<2>::shared_with(corner)
            .collect();
        assert_eq!(shared.len(), 3);
        for (q, j) in shared {
            assert!(j.is_corner());
            // The mapped corner flips exactly the axes of travel
            assert_eq!(j.pos(), corner.pos() ^ q.fixed());
        }
    }

    #[test]
    fn test_shared_with_edge() {
        // An edge subspace is shared with exactly one neighbor
        let edge = NeighborIndex::<2>::from_pos_and_floating(0b01, 0b10);
        let shared: Vec<_> =
            SimplexNeighbors::<2>::shared_with(edge).collect();
        assert_eq!(shared.len(), 1);
        let (q, j) = shared[0];
        assert_eq!(q.fixed(), 0b01);
        assert_eq!(q.pos(), 0b01);
        // Seen from the right-hand neighbor, it's the left edge
        assert_eq!(j.pos(), 0b00);
        assert_eq!(j.floating(), 0b10);
    }

    #[test]
    fn test_shared_with_interior() {
        // The cell interior is shared with nobody
        let center = NeighborIndex::<3>::from_pos_and_floating(0, 0b111);
        assert_eq!(SimplexNeighbors::<3>::shared_with(center).count(), 0);
    }
}
