//! End-to-end tests for simplex tree construction
use isotope::{
    context::{Context, Node},
    eval::types::IntervalClass,
    tree::{
        CornerIndex, NeighborIndex, Region, Settings, SimplexRoot,
        SimplexTree,
    },
};
use nalgebra::{Vector2, Vector3};
use std::sync::atomic::AtomicBool;

fn sphere(ctx: &mut Context, radius: f64) -> Node {
    let x = ctx.x();
    let y = ctx.y();
    let z = ctx.z();
    let x2 = ctx.square(x).unwrap();
    let y2 = ctx.square(y).unwrap();
    let z2 = ctx.square(z).unwrap();
    let s = ctx.add(x2, y2).unwrap();
    let s = ctx.add(s, z2).unwrap();
    let r = ctx.sqrt(s).unwrap();
    ctx.sub(r, radius).unwrap()
}

fn cube3(level: u32) -> Region<3> {
    Region::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0),
        level)
}

fn single_thread(max_err: f64) -> Settings {
    Settings { threads: 1, max_err }
}

fn walk<const N: usize>(t: &SimplexTree<N>, f: &mut impl FnMut(&SimplexTree<N>)) {
    f(t);
    for c in t.children() {
        walk(c, f);
    }
}

fn count_leaves<const N: usize>(t: &SimplexTree<N>) -> usize {
    let mut n = 0;
    walk(t, &mut |c| {
        if c.leaf().is_some() {
            n += 1;
        }
    });
    n
}

#[test]
fn test_branch_xor_leaf() {
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);
    let out =
        SimplexRoot::build(&ctx, shape, cube3(3), &single_thread(-1.0))
            .unwrap();
    walk(&out.root, &mut |c| {
        assert!(
            c.is_branch() != c.leaf().is_some(),
            "cell must be a branch XOR a leaf"
        );
    });
}

#[test]
fn test_plane_leaf() {
    // A single level-0 cell over f = x: ambiguous, with low-x corners
    // inside, high-x corners outside, and x-edge vertices at x = 0
    let mut ctx = Context::new();
    let x = ctx.x();
    let out = SimplexRoot::build(&ctx, x, cube3(0), &single_thread(-1.0))
        .unwrap();

    assert!(!out.root.is_branch());
    assert_eq!(out.root.ty, IntervalClass::Ambiguous);
    let leaf = out.root.leaf().unwrap();
    assert_eq!(leaf.level, 0);

    for ci in CornerIndex::<3>::iter() {
        let s = out.subs.get(leaf.sub[ci.neighbor().i()]);
        let expected = ci.i() & 1 == 0; // low-x corners are inside
        assert_eq!(
            s.inside,
            expected,
            "bad inside flag at corner {:?} (vert {:?})",
            ci,
            s.vert
        );
    }

    for i in NeighborIndex::<3>::iter() {
        if i.floating() != 0b001 {
            continue;
        }
        // Edges along the x axis cross the plane at x = 0
        let s = out.subs.get(leaf.sub[i.i()]);
        assert!(
            s.vert[0].abs() < 1e-6,
            "edge vertex should sit on the plane, got {:?}",
            s.vert
        );
        for d in 1..3 {
            let expected =
                if i.pos() & (1 << d) != 0 { 1.0 } else { -1.0 };
            assert_eq!(s.vert[d], expected);
        }
    }
}

#[test]
fn test_sphere_collapse() {
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);

    // A negative threshold disables merging entirely, leaving level-0
    // leaves along the surface
    let strict =
        SimplexRoot::build(&ctx, shape, cube3(3), &single_thread(-1.0))
            .unwrap();
    let mut found_level0 = false;
    walk(&strict.root, &mut |c| {
        if let Some(leaf) = c.leaf() {
            if leaf.level == 0 && c.ty == IntervalClass::Ambiguous {
                found_level0 = true;
            }
        }
    });
    assert!(found_level0, "strict tree should keep fine ambiguous leaves");

    // A huge threshold lets every merge succeed, so the whole tree folds
    // into a single leaf
    let loose =
        SimplexRoot::build(&ctx, shape, cube3(3), &single_thread(1e9))
            .unwrap();
    assert!(!loose.root.is_branch());

    assert!(
        count_leaves(&loose.root) < count_leaves(&strict.root),
        "a looser threshold must produce a coarser tree"
    );
}

#[test]
fn test_sphere_vertex_bounds() {
    // Every solved vertex stays in its cell, with fixed axes pinned to the
    // cell walls
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);
    let out =
        SimplexRoot::build(&ctx, shape, cube3(2), &single_thread(-1.0))
            .unwrap();
    walk(&out.root, &mut |c| {
        let Some(leaf) = c.leaf() else { return };
        for i in NeighborIndex::<3>::iter() {
            let s = out.subs.get(leaf.sub[i.i()]);
            let floating = i.floating();
            for d in 0..3 {
                let (lo, hi) = (c.region.lower[d], c.region.upper[d]);
                if floating & (1 << d) != 0 {
                    assert!(
                        s.vert[d] >= lo - 1e-9 && s.vert[d] <= hi + 1e-9,
                        "vertex {:?} escapes cell [{:?}, {:?}]",
                        s.vert,
                        c.region.lower,
                        c.region.upper
                    );
                } else {
                    let expected =
                        if i.pos() & (1 << d) != 0 { hi } else { lo };
                    assert_eq!(s.vert[d], expected);
                }
            }
        }
    });
}

#[test]
fn test_subspace_refcounts() {
    // Every subspace's refcount equals the number of leaves that hold it
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);
    let out =
        SimplexRoot::build(&ctx, shape, cube3(2), &single_thread(-1.0))
            .unwrap();

    let mut held = std::collections::HashMap::new();
    walk(&out.root, &mut |c| {
        if let Some(leaf) = c.leaf() {
            for r in &leaf.sub {
                *held.entry(*r).or_insert(0u32) += 1;
            }
        }
    });
    assert!(!held.is_empty());
    let mut shared = 0;
    for (r, count) in held {
        let rc = out
            .subs
            .get(r)
            .refcount
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(rc, count, "refcount mismatch for {r:?}");
        if count > 1 {
            shared += 1;
        }
    }
    assert!(shared > 0, "adjacent leaves should share subspaces");
}

#[test]
fn test_shared_face_indices() {
    // Two adjacent same-level cells share a face; after index assignment,
    // the 3^(N-1) face subspaces carry identical indices from either side
    let mut ctx = Context::new();
    let x = ctx.x();
    let region = Region::<2>::new(
        Vector2::new(-1.0, -1.0),
        Vector2::new(1.0, 1.0),
        1,
    );
    let mut out =
        SimplexRoot::build(&ctx, x, region, &single_thread(-1.0)).unwrap();
    assert!(out.root.is_branch());
    let assigned = out.assign_indices();

    // 2x2 grid of leaves: 9 grid corners + 12 edges + 4 cell interiors
    assert_eq!(assigned, 25);

    let c0 = out.root.child(CornerIndex::new(0b00));
    let c1 = out.root.child(CornerIndex::new(0b01));
    let (l0, l1) = (c0.leaf().unwrap(), c1.leaf().unwrap());

    let mut checked = 0;
    for i in NeighborIndex::<2>::iter() {
        // Subspaces on c0's high-x wall
        if i.fixed() & 0b01 == 0 || i.pos() & 0b01 == 0 {
            continue;
        }
        let j = NeighborIndex::<2>::from_pos_and_floating(
            i.pos() ^ 0b01,
            i.floating(),
        );
        // Construction already shares the pointer...
        assert_eq!(l0.sub[i.i()], l1.sub[j.i()]);
        // ... and indexing must agree regardless
        let a = out.subs.get(l0.sub[i.i()]).index;
        let b = out.subs.get(l1.sub[j.i()]).index;
        assert_ne!(a, 0);
        assert_eq!(a, b, "face subspace index mismatch");
        checked += 1;
    }
    assert_eq!(checked, 3);

    // Every leaf subspace received an index
    walk(&out.root, &mut |c| {
        if let Some(leaf) = c.leaf() {
            for r in &leaf.sub {
                assert_ne!(out.subs.get(*r).index, 0);
            }
        }
    });
}

#[test]
fn test_parallel_matches_single() {
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);

    let a = SimplexRoot::build(&ctx, shape, cube3(3), &single_thread(-1.0))
        .unwrap();
    let b = SimplexRoot::build(
        &ctx,
        shape,
        cube3(3),
        &Settings { threads: 8, max_err: -1.0 },
    )
    .unwrap();

    fn compare<const N: usize>(a: &SimplexTree<N>, b: &SimplexTree<N>) {
        assert_eq!(a.ty, b.ty);
        assert_eq!(a.children().len(), b.children().len());
        assert_eq!(a.leaf().is_some(), b.leaf().is_some());
        if let (Some(la), Some(lb)) = (a.leaf(), b.leaf()) {
            assert_eq!(la.level, lb.level);
        }
        for (ca, cb) in a.children().iter().zip(b.children()) {
            compare(ca, cb);
        }
    }
    compare(&a.root, &b.root);
}

#[test]
fn test_cancellation() {
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);
    let cancel = AtomicBool::new(true);
    let out = SimplexRoot::build_with_cancel(
        &ctx,
        shape,
        cube3(4),
        &single_thread(-1.0),
        &[],
        &cancel,
    )
    .unwrap();
    assert!(out.is_none(), "a cancelled build must discard its output");
}

#[test]
fn test_empty_region() {
    // A region nowhere near the surface collapses immediately into a
    // single empty leaf with every vertex outside
    let mut ctx = Context::new();
    let shape = sphere(&mut ctx, 0.5);
    let region = Region::new(
        Vector3::new(2.0, 2.0, 2.0),
        Vector3::new(3.0, 3.0, 3.0),
        2,
    );
    let out = SimplexRoot::build(&ctx, shape, region, &single_thread(-1.0))
        .unwrap();
    assert!(!out.root.is_branch());
    assert_eq!(out.root.ty, IntervalClass::Empty);
    let leaf = out.root.leaf().unwrap();
    assert_eq!(leaf.level, 2);
    for r in &leaf.sub {
        assert!(!out.subs.get(*r).inside);
    }
}
