//! Recursive spatial subdivision with per-subspace vertex placement
use super::{
    neighbors::{SimplexNeighbors, MAX_SUBSPACES},
    pool::{ObjectPool, SubspacePool, SubspaceRef},
    qef::{Qef, EIGENVALUE_CUTOFF},
    region::Region,
    types::{corner_count, subspace_count, CornerIndex, NeighborIndex},
};
use crate::{
    context::{Context, Node},
    eval::{types::IntervalClass, EvalGroup, MAX_FEATURES},
    tape::{Clause, Tape},
    Error,
};
use arrayvec::ArrayVec;
use nalgebra::{SVector, Vector3};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Hierarchical pool chain: trees, then leaves, then subspaces
pub type TreePool<const N: usize> =
    ObjectPool<SimplexTree<N>, ObjectPool<SimplexLeaf<N>, SubspacePool<N>>>;

/// Settings for simplex tree construction
#[derive(Copy, Clone, Debug)]
pub struct Settings {
    /// Threading mode: 0 or 1 builds on the calling thread, anything larger
    /// fans the root cell's children out across worker threads (one per
    /// octant / quadrant, each with its own tape and pools)
    pub threads: u8,

    /// Largest accumulated QEF residual at which a branch may collapse into
    /// a single leaf.  Negative values disable collapsing entirely.
    pub max_err: f64,
}

/// One vertex-bearing subspace of a leaf cell
///
/// Subspaces on shared faces, edges, and corners are owned jointly by every
/// adjacent leaf, hence the atomic reference count.
pub struct SimplexLeafSubspace<const N: usize> {
    /// Whether the vertex is inside the solid
    pub inside: bool,

    /// Globally unique vertex index, 0 until assigned
    pub index: u64,

    /// Vertex position, solved from the accumulated QEF
    pub vert: SVector<f64, N>,

    /// Accumulated samples for this subspace
    pub qef: Qef<N>,

    /// Number of leaves holding a reference to this subspace
    pub refcount: AtomicU32,
}

impl<const N: usize> Default for SimplexLeafSubspace<N> {
    fn default() -> Self {
        Self {
            inside: false,
            index: 0,
            vert: SVector::zeros(),
            qef: Qef::new(),
            refcount: AtomicU32::new(0),
        }
    }
}

impl<const N: usize> SimplexLeafSubspace<N> {
    pub fn reset(&mut self) {
        self.inside = false;
        self.index = 0;
        self.vert = SVector::zeros();
        self.qef.reset();
        self.refcount.store(0, Ordering::Relaxed);
    }
}

/// Leaf data for a cell: one subspace record per face / edge / corner /
/// interior
pub struct SimplexLeaf<const N: usize> {
    /// Subdivision level at which this leaf was built (0 is finest)
    pub level: u32,

    /// Snapshot of the region-specialized program, for surface extraction
    pub tape: Option<Arc<[Clause]>>,

    /// Scratch storage for the surface-extraction stage; opaque here
    pub surface: HashMap<u64, u64>,

    /// Subspace handles, indexed by [`NeighborIndex`]
    pub sub: ArrayVec<SubspaceRef, MAX_SUBSPACES>,
}

impl<const N: usize> Default for SimplexLeaf<N> {
    fn default() -> Self {
        Self {
            level: 0,
            tape: None,
            surface: HashMap::new(),
            sub: ArrayVec::new(),
        }
    }
}

impl<const N: usize> SimplexLeaf<N> {
    fn release_to(
        mut self,
        pool: &mut ObjectPool<SimplexLeaf<N>, SubspacePool<N>>,
    ) {
        for r in self.sub.drain(..) {
            pool.next().release(r);
        }
        self.level = 0;
        self.tape = None;
        self.surface.clear();
        pool.put(self);
    }
}

/// One cell of the subdivision: either a branch with `2^N` children or a
/// leaf (possibly at a coarse level, if the region was proven uniform)
pub struct SimplexTree<const N: usize> {
    /// The spatial extent of this cell
    pub region: Region<N>,

    /// Which corner of the parent this cell occupies
    pub parent_index: u8,

    /// Classification from interval evaluation or vertex signs
    pub ty: IntervalClass,

    children: Vec<SimplexTree<N>>,
    leaf: Option<SimplexLeaf<N>>,

    /// Outstanding children; the completion that brings this to zero runs
    /// `collect_children`
    pending: AtomicI32,
}

impl<const N: usize> Default for SimplexTree<N> {
    fn default() -> Self {
        Self {
            region: Region::new(SVector::zeros(), SVector::zeros(), 0),
            parent_index: 0,
            ty: IntervalClass::Unknown,
            children: vec![],
            leaf: None,
            pending: AtomicI32::new(0),
        }
    }
}

impl<const N: usize> SimplexTree<N> {
    /// Checks whether this cell has been subdivided
    ///
    /// A cell is a branch or has a leaf, never both.
    pub fn is_branch(&self) -> bool {
        !self.children.is_empty()
    }

    /// Returns the child cell at the given corner
    ///
    /// # Panics
    /// If this cell is not a branch
    pub fn child(&self, i: CornerIndex<N>) -> &SimplexTree<N> {
        &self.children[i.i()]
    }

    /// Returns all children, in corner order (empty for leaves)
    pub fn children(&self) -> &[SimplexTree<N>] {
        &self.children
    }

    pub fn leaf(&self) -> Option<&SimplexLeaf<N>> {
        self.leaf.as_ref()
    }

    fn release_to(mut self, pool: &mut TreePool<N>) {
        while let Some(c) = self.children.pop() {
            c.release_to(pool);
        }
        if let Some(leaf) = self.leaf.take() {
            leaf.release_to(pool.next());
        }
        self.ty = IntervalClass::Unknown;
        pool.put(self);
    }
}

/// A completed simplex tree plus the arena owning its subspaces
pub struct SimplexRoot<const N: usize> {
    pub root: SimplexTree<N>,
    pub subs: SubspacePool<N>,
}

impl<const N: usize> SimplexRoot<N> {
    /// Builds a simplex tree over the given region
    pub fn build(
        ctx: &Context,
        node: Node,
        region: Region<N>,
        settings: &Settings,
    ) -> Result<Self, Error> {
        let cancel = AtomicBool::new(false);
        let out =
            Self::build_with_cancel(ctx, node, region, settings, &[], &cancel)?;
        Ok(out.expect("build cancelled without a cancel flag"))
    }

    /// Builds a simplex tree, with free-variable values and a cancellation
    /// flag
    ///
    /// Returns `Ok(None)` if the abort flag was raised; partial work is
    /// discarded.
    pub fn build_with_cancel(
        ctx: &Context,
        node: Node,
        region: Region<N>,
        settings: &Settings,
        vars: &[f32],
        cancel: &AtomicBool,
    ) -> Result<Option<Self>, Error> {
        assert!(N == 2 || N == 3, "only 2D and 3D trees are supported");
        let mut tape = Tape::new(ctx, node)?;
        if vars.len() != tape.vars.len() {
            return Err(Error::BadVarSlice(vars.len(), tape.vars.len()));
        }

        let mut w = Worker::new(&tape, settings.max_err, vars, cancel);
        let root = if settings.threads > 1 && region.level > 0 {
            build_parallel(&mut w, &mut tape, region)
        } else {
            build_cell(&mut w, &mut tape, region, 0, &SimplexNeighbors::new())
        };

        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let subs = w.pool.into_next().into_next();
        Ok(Some(SimplexRoot { root, subs }))
    }

    /// Assigns a globally unique index to every subspace vertex, sharing
    /// indices across cell boundaries at any resolution difference.
    ///
    /// Returns the number of distinct indices assigned.
    pub fn assign_indices(&mut self) -> u64 {
        let mut index = 1; // 0 is reserved
        let mut stack = vec![SimplexNeighbors::new()];
        let mut path = vec![];
        assign_rec(
            &self.root,
            &mut index,
            &mut stack,
            &mut path,
            &mut self.subs,
        );
        index - 1
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Per-thread construction state: evaluators and pools are never shared
struct Worker<'w, const N: usize> {
    eval: EvalGroup,
    pool: TreePool<N>,
    max_err: f64,
    vars: &'w [f32],
    cancel: &'w AtomicBool,
}

impl<'w, const N: usize> Worker<'w, N> {
    fn new(
        tape: &Tape,
        max_err: f64,
        vars: &'w [f32],
        cancel: &'w AtomicBool,
    ) -> Self {
        Self {
            eval: EvalGroup::new(tape),
            pool: TreePool::default(),
            max_err,
            vars,
            cancel,
        }
    }

    fn subs(&mut self) -> &mut SubspacePool<N> {
        self.pool.next().next()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Recursively builds the cell covering `region`
///
/// `neighbors` are the same-level cells adjacent to this one that have
/// already been completed.
fn build_cell<const N: usize>(
    w: &mut Worker<N>,
    tape: &mut Tape,
    region: Region<N>,
    parent_index: u8,
    neighbors: &SimplexNeighbors<N>,
) -> SimplexTree<N> {
    let mut t = w.pool.get();
    t.region = region;
    t.parent_index = parent_index;
    t.pending.store(corner_count(N) as i32, Ordering::Relaxed);

    // Classify the region and specialize the tape to it; the handle pops the
    // pushed subtape when this cell completes
    let (i, mut tape) = w.eval.interval.eval_and_push(
        tape,
        region.lower3f(),
        region.upper3f(),
        w.vars,
        w.cancel,
    );
    t.ty = IntervalClass::from(i);
    if !w.eval.interval.is_safe() {
        // The interval can't be trusted, and neither could a pruned tape;
        // eval_and_push already skipped the push in this case
        t.ty = IntervalClass::Ambiguous;
    }
    if w.cancelled() {
        return t;
    }

    if matches!(t.ty, IntervalClass::Filled | IntervalClass::Empty) {
        let mut leaf = w.pool.next().get();
        leaf.level = region.level;
        t.leaf = Some(leaf);
        find_leaf_vertices(&mut t, w, &tape, &SimplexNeighbors::new());
        return t;
    }

    if region.level == 0 {
        // Leaf cell: sample corners, build QEFs, and solve every subspace
        t.ty = IntervalClass::Ambiguous;
        let mut leaf = w.pool.next().get();
        leaf.level = 0;
        leaf.tape = Some(tape.snapshot());
        t.leaf = Some(leaf);
        find_leaf_vertices(&mut t, w, &tape, neighbors);
        check_vertex_signs(&mut t, w.subs());
        return t;
    }

    let mut children = Vec::with_capacity(corner_count(N));
    for ci in CornerIndex::<N>::iter() {
        if w.cancelled() {
            break;
        }
        let child = {
            let n = neighbors.push(ci, &children);
            build_cell(w, &mut tape, region.child(ci), ci.0, &n)
        };
        t.pending.fetch_sub(1, Ordering::Release);
        children.push(child);
    }
    t.children = children;
    if !w.cancelled() {
        collect_children(&mut t, w, &tape);
    }
    t
}

/// Splits the root cell's children across worker threads
///
/// Each worker owns a clone of the (pushed) tape and its own pools; the
/// per-worker subspace arenas are merged back into the main pool afterwards,
/// offsetting the handles held by each subtree.
fn build_parallel<const N: usize>(
    w: &mut Worker<N>,
    tape: &mut Tape,
    region: Region<N>,
) -> SimplexTree<N> {
    let lower = region.lower3f();
    let upper = region.upper3f();

    // Peek at the classification: uniform regions don't benefit from fan-out
    let i = w.eval.interval.eval(tape, lower, upper, w.vars, w.cancel);
    let mut ty = IntervalClass::from(i);
    if !w.eval.interval.is_safe() {
        ty = IntervalClass::Ambiguous;
    }
    if ty != IntervalClass::Ambiguous {
        return build_cell(w, tape, region, 0, &SimplexNeighbors::new());
    }

    let mut t = w.pool.get();
    t.region = region;
    t.parent_index = 0;
    t.ty = IntervalClass::Ambiguous;
    t.pending.store(corner_count(N) as i32, Ordering::Relaxed);

    let (_, tape) = w.eval.interval.eval_and_push(
        tape, lower, upper, w.vars, w.cancel,
    );
    let tape_ref: &Tape = &tape;
    let max_err = w.max_err;
    let vars = w.vars;
    let cancel = w.cancel;

    let results: Vec<(SimplexTree<N>, SubspacePool<N>)> =
        std::thread::scope(|s| {
            let handles: Vec<_> = CornerIndex::<N>::iter()
                .map(|ci| {
                    let child_region = region.child(ci);
                    s.spawn(move || {
                        let mut tape = tape_ref.clone();
                        let mut w =
                            Worker::new(&tape, max_err, vars, cancel);
                        let child = build_cell(
                            &mut w,
                            &mut tape,
                            child_region,
                            ci.0,
                            &SimplexNeighbors::new(),
                        );
                        (child, w.pool.into_next().into_next())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

    let mut children = Vec::with_capacity(corner_count(N));
    for (mut child, pool) in results {
        let offset = w.subs().merge(pool);
        offset_subspaces(&mut child, offset);
        t.pending.fetch_sub(1, Ordering::Release);
        children.push(child);
    }
    t.children = children;
    if !w.cancelled() {
        collect_children(&mut t, w, &tape);
    }
    t
}

fn offset_subspaces<const N: usize>(t: &mut SimplexTree<N>, by: u32) {
    if let Some(leaf) = &mut t.leaf {
        for r in &mut leaf.sub {
            *r = r.offset(by);
        }
    }
    for c in &mut t.children {
        offset_subspaces(c, by);
    }
}

/// Populates a leaf's subspaces: adopt from neighbors where possible, sample
/// the remaining corners, accumulate QEFs, solve every vertex, and classify
/// it inside / outside.
fn find_leaf_vertices<const N: usize>(
    t: &mut SimplexTree<N>,
    w: &mut Worker<N>,
    tape: &Tape,
    neighbors: &SimplexNeighbors<N>,
) {
    let region = t.region;
    let leaf = t.leaf.as_mut().expect("leaf must be allocated");
    debug_assert!(leaf.sub.is_empty());

    // Borrow solved subspaces from adjacent cells wherever possible
    let mut already_solved = [false; MAX_SUBSPACES];
    for i in NeighborIndex::<N>::iter() {
        match neighbors.check(i) {
            Some((nleaf, j)) => {
                let r = nleaf.sub[j.i()];
                w.subs().retain(r);
                leaf.sub.push(r);
                already_solved[i.i()] = true;
            }
            None => {
                let r = w.subs().alloc();
                leaf.sub.push(r);
            }
        }
    }

    // Evaluate the remaining corners in a single batched call
    let mut corners: ArrayVec<CornerIndex<N>, 8> = ArrayVec::new();
    for ci in CornerIndex::<N>::iter() {
        if !already_solved[ci.neighbor().i()] {
            w.eval.array.set(region.corner3f(ci), corners.len());
            corners.push(ci);
        }
    }
    if !corners.is_empty() {
        let count = corners.len();
        let ds: ArrayVec<_, 8> = w
            .eval
            .array
            .derivs(count, tape, w.vars, w.cancel)
            .iter()
            .copied()
            .collect();
        let ambig: ArrayVec<bool, 8> = w
            .eval
            .array
            .get_ambiguous(count)
            .iter()
            .copied()
            .collect();

        for (k, ci) in corners.iter().enumerate() {
            let sub = ci.neighbor();
            let pos = region.corner(*ci);
            let value = ds[k].v as f64;

            // At a non-smooth corner, every one-sided gradient contributes
            // its own row; otherwise there's just the one
            let mut rows: ArrayVec<Vector3<f32>, MAX_FEATURES> =
                ArrayVec::new();
            if ambig[k] {
                rows = w.eval.feature.features(
                    tape,
                    region.corner3f(*ci),
                    w.vars,
                    w.cancel,
                );
            } else {
                rows.push(ds[k].d());
            }

            let subs = w.pool.next().next();
            for d in rows {
                let mut n = SVector::<f64, N>::zeros();
                for (dd, out) in n.iter_mut().enumerate() {
                    *out = d[dd] as f64;
                }
                if !n.iter().all(|v| v.is_finite()) {
                    n = SVector::zeros();
                }
                subs.get_mut(leaf.sub[sub.i()]).qef.insert(pos, n, value);
            }
        }
    }

    solve_leaf_vertices(leaf, &region, &already_solved, w.pool.next().next());

    if t.ty == IntervalClass::Ambiguous {
        save_vertex_signs(t, w, tape, &already_solved);
    } else {
        debug_assert!(matches!(
            t.ty,
            IntervalClass::Filled | IntervalClass::Empty
        ));
        let inside = t.ty == IntervalClass::Filled;
        let leaf = t.leaf.as_ref().unwrap();
        let subs = w.pool.next().next();
        for r in &leaf.sub {
            subs.get_mut(*r).inside = inside;
        }
    }
}

/// Positions the vertex of every not-yet-solved subspace, returning the
/// largest QEF residual encountered.
fn solve_leaf_vertices<const N: usize>(
    leaf: &mut SimplexLeaf<N>,
    region: &Region<N>,
    already_solved: &[bool; MAX_SUBSPACES],
    subs: &mut SubspacePool<N>,
) -> f64 {
    let mut max_err: f64 = 0.0;
    for i in NeighborIndex::<N>::iter() {
        if already_solved[i.i()] {
            continue;
        }

        // Gather every contained subspace's samples, projected into this
        // subspace's floating axes
        let mut qef = Qef::<N>::new();
        for j in NeighborIndex::<N>::iter() {
            if i.contains(j) {
                qef += subs.get(leaf.sub[j.i()]).qef;
            }
        }
        let fixed_vals = region.subspace_fixed(i);
        let reduced = qef.sub(i, &fixed_vals);

        let floating = i.floating();
        let mut lo: ArrayVec<f64, 3> = ArrayVec::new();
        let mut hi: ArrayVec<f64, 3> = ArrayVec::new();
        for d in 0..N {
            if floating & (1 << d) != 0 {
                lo.push(region.lower[d]);
                hi.push(region.upper[d]);
            }
        }
        let sol = reduced.solve_bounded(&lo, &hi, EIGENVALUE_CUTOFF);
        max_err = max_err.max(sol.error);

        // Floating components come from the reduced solution; fixed ones
        // from the region's matching wall
        let s = subs.get_mut(leaf.sub[i.i()]);
        let mut k = 0;
        for d in 0..N {
            if floating & (1 << d) != 0 {
                s.vert[d] = sol.position[k];
                k += 1;
            } else {
                s.vert[d] = fixed_vals[d];
            }
        }
        debug_assert_eq!(k, i.dimension());
    }
    max_err
}

/// Evaluates the field at each unsolved vertex to classify it inside /
/// outside; exact zeros defer to the feature evaluator.
fn save_vertex_signs<const N: usize>(
    t: &mut SimplexTree<N>,
    w: &mut Worker<N>,
    tape: &Tape,
    already_solved: &[bool; MAX_SUBSPACES],
) {
    debug_assert_eq!(t.ty, IntervalClass::Ambiguous);
    let region = t.region;
    let leaf = t.leaf.as_ref().expect("leaf must be allocated");

    let mut targets: ArrayVec<usize, MAX_SUBSPACES> = ArrayVec::new();
    for i in NeighborIndex::<N>::iter() {
        if already_solved[i.i()] {
            continue;
        }
        let p = region.to3f(&w.pool.next().next().get(leaf.sub[i.i()]).vert);
        w.eval.array.set(p, targets.len());
        targets.push(i.i());
    }
    if targets.is_empty() {
        return;
    }

    let values: ArrayVec<f32, MAX_SUBSPACES> = w
        .eval
        .array
        .values(targets.len(), tape, w.vars, w.cancel)
        .iter()
        .copied()
        .collect();
    for (k, &i) in targets.iter().enumerate() {
        let inside = if values[k] == 0.0 {
            let p =
                region.to3f(&w.pool.next().next().get(leaf.sub[i]).vert);
            w.eval.feature.is_inside(tape, p, w.vars, w.cancel)
        } else {
            values[k] < 0.0
        };
        w.pool.next().next().get_mut(leaf.sub[i]).inside = inside;
    }
}

/// Refines the classification from the subspace vertices: unanimously inside
/// is FILLED, unanimously outside is EMPTY.
fn check_vertex_signs<const N: usize>(
    t: &mut SimplexTree<N>,
    subs: &SubspacePool<N>,
) {
    let leaf = t.leaf.as_ref().expect("leaf must be allocated");
    let mut all_inside = true;
    let mut all_outside = true;
    for r in &leaf.sub {
        let inside = subs.get(*r).inside;
        all_inside &= inside;
        all_outside &= !inside;
    }
    t.ty = if all_inside {
        IntervalClass::Filled
    } else if all_outside {
        IntervalClass::Empty
    } else {
        IntervalClass::Ambiguous
    };
}

/// Runs when the last child of a branch completes
///
/// Unanimously empty / filled children are replaced by a single coarse leaf.
/// Otherwise the children's QEFs are merged into candidate parent subspaces;
/// if every merged vertex solves within `max_err`, the children collapse
/// into the parent.
fn collect_children<const N: usize>(
    t: &mut SimplexTree<N>,
    w: &mut Worker<N>,
    tape: &Tape,
) {
    debug_assert_eq!(t.pending.load(Ordering::Relaxed), 0);
    debug_assert_eq!(t.children.len(), corner_count(N));

    if t.children.iter().any(|c| c.is_branch()) {
        t.ty = IntervalClass::Ambiguous;
        return;
    }

    let all_empty =
        t.children.iter().all(|c| c.ty == IntervalClass::Empty);
    let all_full =
        t.children.iter().all(|c| c.ty == IntervalClass::Filled);
    t.ty = if all_empty {
        IntervalClass::Empty
    } else if all_full {
        IntervalClass::Filled
    } else {
        IntervalClass::Ambiguous
    };

    if all_empty || all_full {
        release_children(t, w);
        let mut leaf = w.pool.next().get();
        leaf.level = t.region.level;
        t.leaf = Some(leaf);
        find_leaf_vertices(t, w, tape, &SimplexNeighbors::new());
        return;
    }

    // Attempt a merge: map every child subspace into the parent's frame and
    // sum the QEFs
    let mut leaf = w.pool.next().get();
    leaf.level = t.region.level;
    leaf.tape = Some(tape.snapshot());
    for _ in 0..subspace_count(N) {
        let r = w.subs().alloc();
        leaf.sub.push(r);
    }

    for (ci, child) in t.children.iter().enumerate() {
        let child_leaf = child.leaf.as_ref().expect("child must be a leaf");
        for j in NeighborIndex::<N>::iter() {
            let fixed = j.fixed();
            let floating = j.floating();
            let pos = j.pos();

            // Subspaces on an internal wall are owned by the low-side child;
            // skip them on the high side to avoid double-counting
            let mut valid = true;
            for d in 0..N {
                if fixed & (1 << d) != 0 {
                    valid &= (pos & (1 << d) != 0) || (ci & (1 << d) == 0);
                }
            }
            if !valid {
                continue;
            }

            // A floating axis stays floating in the parent.  A fixed axis
            // stays fixed when it matches the child's corner parity;
            // otherwise it lies on an internal wall and floats.
            let mut floating_out = 0u8;
            let mut pos_out = 0u8;
            for d in 0..N {
                if floating & (1 << d) != 0
                    || (pos ^ ci as u8) & (1 << d) != 0
                {
                    floating_out |= 1 << d;
                } else {
                    pos_out |= pos & (1 << d);
                }
            }
            let target = NeighborIndex::<N>::from_pos_and_floating(
                pos_out,
                floating_out,
            );

            let q = w.subs().get(child_leaf.sub[j.i()]).qef;
            let dst = leaf.sub[target.i()];
            w.subs().get_mut(dst).qef += q;
        }
    }

    let not_solved = [false; MAX_SUBSPACES];
    let err =
        solve_leaf_vertices(&mut leaf, &t.region, &not_solved, w.subs());

    if err <= w.max_err {
        log::debug!(
            "collapsing branch at level {} (err {:.3e})",
            t.region.level,
            err
        );
        t.leaf = Some(leaf);
        save_vertex_signs(t, w, tape, &not_solved);
        check_vertex_signs(t, w.subs());
        release_children(t, w);
    } else {
        log::trace!(
            "keeping branch at level {} (err {:.3e})",
            t.region.level,
            err
        );
        leaf.release_to(w.pool.next());
    }
}

fn release_children<const N: usize>(t: &mut SimplexTree<N>, w: &mut Worker<N>) {
    while let Some(c) = t.children.pop() {
        c.release_to(&mut w.pool);
    }
}

////////////////////////////////////////////////////////////////////////////////

fn assign_rec<'a, const N: usize>(
    t: &'a SimplexTree<N>,
    index: &mut u64,
    stack: &mut Vec<SimplexNeighbors<'a, N>>,
    path: &mut Vec<u8>,
    subs: &mut SubspacePool<N>,
) {
    if t.is_branch() {
        debug_assert!(t.leaf.is_none());
        for ci in CornerIndex::<N>::iter() {
            let n = stack.last().unwrap().push(ci, &t.children);
            stack.push(n);
            path.push(ci.0);
            assign_rec(&t.children[ci.i()], index, stack, path, subs);
            path.pop();
            stack.pop();
        }
        return;
    }

    let Some(leaf) = &t.leaf else {
        return;
    };
    let neighbors = *stack.last().unwrap();
    for i in NeighborIndex::<N>::iter() {
        // A subspace shared by pointer may already carry an index
        if subs.get(leaf.sub[i.i()]).index != 0 {
            continue;
        }

        // A neighbor at our own level (or a finer one, for corners) may
        // have assigned this subspace already
        let found = neighbors.get_index(i, subs);
        if found != 0 {
            subs.get_mut(leaf.sub[i.i()]).index = found;
            continue;
        }

        // A corner that coincides with the matching corner of our
        // ancestors may be known to *their* neighbors
        if i.is_corner() {
            let mut adopted = 0;
            let mut depth = path.len();
            while depth > 0 && path[depth - 1] == i.pos() {
                depth -= 1;
                let found = stack[depth].get_index(i, subs);
                if found != 0 {
                    adopted = found;
                    break;
                }
            }
            if adopted != 0 {
                subs.get_mut(leaf.sub[i.i()]).index = adopted;
                continue;
            }
        }

        subs.get_mut(leaf.sub[i.i()]).index = *index;
        *index += 1;
    }
}
