//! Linearized expression storage with interval-based branch elimination
//!
//! A [`Tape`] flattens an expression into three-address [`Clause`]s, stored
//! dependencies-first so that a front-to-back walk evaluates every clause
//! after its arguments.  During recursive region subdivision, [`Tape::push`]
//! specializes the active program to a spatial region by dropping `min` /
//! `max` branches that interval arithmetic has proven inactive; the resulting
//! [`Subtape`]s form a stack whose buffers are reused rather than freed, so
//! that nested pushes are allocation-stable.

mod op;
pub use op::{Clause, ClauseId, Keep, Opcode};

use crate::{
    context::{Context, Node, Op},
    eval::{types::Interval, Oracle},
    Error,
};
use nalgebra::Vector3;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What kind of evaluation produced a pushed subtape
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TapeType {
    /// The full program
    Base,
    /// Pushed by an interval evaluation over a region
    Interval,
    /// Pushed by a feature evaluation at a point
    Feature,
}

/// An ordered sequence of clauses, specialized to a spatial region
#[derive(Clone)]
pub struct Subtape {
    t: Vec<Clause>,
    ty: TapeType,

    /// Region over which this subtape is valid
    x: Interval,
    y: Interval,
    z: Interval,

    /// Reentrancy depth for no-op pushes
    ///
    /// When a push makes no real choice, the subtape is marked as a dummy;
    /// further pushes only bump this counter and pops decrement it.
    dummy: u32,

    /// Register-slot mapping from clause id to a small slot index
    m: Vec<u32>,
}

impl Subtape {
    fn with_capacity(n: usize) -> Self {
        Subtape {
            t: Vec::with_capacity(n),
            ty: TapeType::Base,
            x: Interval::new(f32::NEG_INFINITY, f32::INFINITY),
            y: Interval::new(f32::NEG_INFINITY, f32::INFINITY),
            z: Interval::new(f32::NEG_INFINITY, f32::INFINITY),
            dummy: 0,
            m: vec![],
        }
    }

    fn contains(&self, p: Vector3<f32>) -> bool {
        self.x.contains(p.x) && self.y.contains(p.y) && self.z.contains(p.z)
    }

    /// Returns the clauses of this subtape, dependencies first
    pub fn clauses(&self) -> &[Clause] {
        &self.t
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

/// A flattened math expression plus a stack of region-specialized subtapes
///
/// The tape is not thread-safe; each worker thread clones its own copy (the
/// clone shares oracle handles but owns an independent subtape stack).
#[derive(Clone)]
pub struct Tape {
    /// Reusable subtape buffers; index 0 is the base program
    tapes: Vec<Subtape>,

    /// Index of the currently active subtape
    cursor: usize,

    /// Values read by `Constant` clauses
    pub constants: Vec<f32>,

    /// Names of free variables read by `VarFree` clauses
    pub vars: Vec<String>,

    /// Callbacks read by `Oracle` clauses
    pub oracles: Vec<Arc<dyn Oracle>>,

    /// Total number of clause ids, including the reserved sentinel 0
    num_clauses: usize,

    /// Size of the register file implied by the slot mapping
    slot_count: usize,

    // Scratch space for `push`, sized to `num_clauses`
    disabled: Vec<bool>,
    remap: Vec<ClauseId>,
}

impl Tape {
    /// Flattens the subtree rooted at `root` into a new tape
    pub fn new(ctx: &Context, root: Node) -> Result<Self, Error> {
        let flat = ctx.ordered(root)?;

        let mut ids: HashMap<Node, ClauseId> = HashMap::new();
        let mut t = Vec::with_capacity(flat.len());
        let mut constants = vec![];
        let mut vars = vec![];
        let mut oracles: Vec<Arc<dyn Oracle>> = vec![];

        for n in &flat {
            // Ids are allocated monotonically from 1; id 0 is the sentinel
            let id = (ids.len() + 1) as ClauseId;
            ids.insert(*n, id);
            let arg = |m: &Node| ids[m];
            let clause = match ctx.get_op(*n).ok_or(Error::BadNode)? {
                Op::X => Clause { op: Opcode::VarX, id, a: 0, b: 0 },
                Op::Y => Clause { op: Opcode::VarY, id, a: 0, b: 0 },
                Op::Z => Clause { op: Opcode::VarZ, id, a: 0, b: 0 },
                Op::Const(c) => {
                    let a = constants.len() as ClauseId;
                    constants.push(c.0 as f32);
                    Clause { op: Opcode::Constant, id, a, b: 0 }
                }
                Op::Var(slot) => {
                    let a = vars.len() as ClauseId;
                    vars.push(ctx.var_name(*slot)?.to_owned());
                    Clause { op: Opcode::VarFree, id, a, b: 0 }
                }
                Op::Oracle(slot) => {
                    let a = oracles.len() as ClauseId;
                    oracles
                        .push(ctx.oracle_handle(*slot).ok_or(Error::BadNode)?);
                    Clause { op: Opcode::Oracle, id, a, b: 0 }
                }
                Op::Add(a, b) => {
                    Clause { op: Opcode::Add, id, a: arg(a), b: arg(b) }
                }
                Op::Sub(a, b) => {
                    Clause { op: Opcode::Sub, id, a: arg(a), b: arg(b) }
                }
                Op::Mul(a, b) => {
                    Clause { op: Opcode::Mul, id, a: arg(a), b: arg(b) }
                }
                Op::Div(a, b) => {
                    Clause { op: Opcode::Div, id, a: arg(a), b: arg(b) }
                }
                Op::Min(a, b) => {
                    Clause { op: Opcode::Min, id, a: arg(a), b: arg(b) }
                }
                Op::Max(a, b) => {
                    Clause { op: Opcode::Max, id, a: arg(a), b: arg(b) }
                }
                Op::Neg(a) => Clause { op: Opcode::Neg, id, a: arg(a), b: 0 },
                Op::Abs(a) => Clause { op: Opcode::Abs, id, a: arg(a), b: 0 },
                Op::Recip(a) => {
                    Clause { op: Opcode::Recip, id, a: arg(a), b: 0 }
                }
                Op::Sqrt(a) => {
                    Clause { op: Opcode::Sqrt, id, a: arg(a), b: 0 }
                }
                Op::Square(a) => {
                    Clause { op: Opcode::Square, id, a: arg(a), b: 0 }
                }
                Op::Sin(a) => Clause { op: Opcode::Sin, id, a: arg(a), b: 0 },
                Op::Cos(a) => Clause { op: Opcode::Cos, id, a: arg(a), b: 0 },
                Op::Tan(a) => Clause { op: Opcode::Tan, id, a: arg(a), b: 0 },
                Op::Asin(a) => {
                    Clause { op: Opcode::Asin, id, a: arg(a), b: 0 }
                }
                Op::Acos(a) => {
                    Clause { op: Opcode::Acos, id, a: arg(a), b: 0 }
                }
                Op::Atan(a) => {
                    Clause { op: Opcode::Atan, id, a: arg(a), b: 0 }
                }
                Op::Exp(a) => Clause { op: Opcode::Exp, id, a: arg(a), b: 0 },
                Op::Ln(a) => Clause { op: Opcode::Ln, id, a: arg(a), b: 0 },
            };
            t.push(clause);
        }
        assert!(!t.is_empty());

        let num_clauses = ids.len() + 1;
        let (m, slot_count) = assign_slots(&t, num_clauses);

        let mut base = Subtape::with_capacity(t.len());
        base.t = t;
        base.m = m;

        Ok(Tape {
            tapes: vec![base],
            cursor: 0,
            constants,
            vars,
            oracles,
            num_clauses,
            slot_count,
            disabled: vec![false; num_clauses],
            remap: vec![0; num_clauses],
        })
    }

    /// Returns the currently active subtape
    pub fn active(&self) -> &Subtape {
        &self.tapes[self.cursor]
    }

    /// Returns the base (unspecialized) subtape
    pub fn base(&self) -> &Subtape {
        &self.tapes[0]
    }

    /// Total number of clause ids, including the reserved sentinel 0
    pub fn num_clauses(&self) -> usize {
        self.num_clauses
    }

    /// Size of the register file used during evaluation
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Looks up the register slot for the given clause id
    pub fn slot(&self, id: ClauseId) -> usize {
        self.tapes[self.cursor].m[id as usize] as usize
    }

    /// Active-subtape length divided by base-subtape length
    pub fn utilization(&self) -> f64 {
        self.active().len() as f64 / self.base().len() as f64
    }

    /// Returns a snapshot of the active subtape's clauses
    ///
    /// This is the long-lived form handed to leaf cells; the scoped [`Handle`]
    /// cannot outlive its stack frame.
    pub fn snapshot(&self) -> Arc<[Clause]> {
        self.active().t.as_slice().into()
    }

    /// Iterates over the active subtape in evaluation order (dependencies
    /// first), invoking the visitor on each clause; returns the root id.
    ///
    /// The abort flag is checked before each step.
    pub fn walk<F>(&self, mut f: F, abort: &AtomicBool) -> ClauseId
    where
        F: FnMut(Opcode, ClauseId, ClauseId, ClauseId),
    {
        let t = &self.tapes[self.cursor].t;
        for c in t.iter() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            f(c.op, c.id, c.a, c.b);
        }
        t.last().unwrap().id
    }

    /// Iterates over the active subtape from the root downwards
    pub fn rwalk<F>(&self, mut f: F, abort: &AtomicBool)
    where
        F: FnMut(Opcode, ClauseId, ClauseId, ClauseId),
    {
        let t = &self.tapes[self.cursor].t;
        for c in t.iter().rev() {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            f(c.op, c.id, c.a, c.b);
        }
    }

    /// Specializes the active subtape to the clauses reachable under `pred`
    ///
    /// The predicate is called once per live clause, from the root downwards,
    /// and decides which branches of `min` / `max` clauses survive.  The new
    /// subtape is written into a reusable buffer on the tape stack; dropping
    /// the returned [`Handle`] pops it again.
    ///
    /// If the predicate makes no real choice, the new subtape is marked as a
    /// dummy: further pushes only bump a counter rather than re-copying an
    /// identical program.
    pub fn push<F>(
        &mut self,
        mut pred: F,
        ty: TapeType,
        bounds: [Interval; 3],
    ) -> Handle<'_>
    where
        F: FnMut(Opcode, ClauseId, ClauseId, ClauseId) -> Keep,
    {
        if self.tapes[self.cursor].dummy > 0 {
            self.tapes[self.cursor].dummy += 1;
            return Handle { tape: self, kind: HandleKind::Push };
        }

        self.disabled.fill(true);
        self.remap.fill(0);

        let mut has_choices = false;
        {
            let st = &self.tapes[self.cursor];
            assert!(!st.t.is_empty());

            // The root is the last clause written, with the largest id
            self.disabled[st.t.last().unwrap().id as usize] = false;

            for c in st.t.iter().rev() {
                if self.disabled[c.id as usize] {
                    continue;
                }
                match pred(c.op, c.id, c.a, c.b) {
                    Keep::A => {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    }
                    Keep::B => {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    }
                    Keep::Both => has_choices = true,
                    Keep::Always => (),
                }

                if self.remap[c.id as usize] != 0 {
                    self.disabled[c.id as usize] = true;
                } else if !c.op.has_dummy_children() {
                    // For constants / vars / oracles, `a` indexes a side
                    // array and must not be interpreted as a clause.  The
                    // sentinel id 0 soaks up unary `b` arguments.
                    self.disabled[c.a as usize] = false;
                    self.disabled[c.b as usize] = false;
                }
            }
        }

        // Claim the next buffer on the stack, which is cleared rather than
        // freed so that allocations stay stable under nested recursion
        let prev = self.cursor;
        self.cursor += 1;
        if self.cursor == self.tapes.len() {
            self.tapes.push(Subtape::with_capacity(self.tapes[0].t.len()));
        } else {
            self.tapes[self.cursor].t.clear();
        }

        let (head, tail) = self.tapes.split_at_mut(self.cursor);
        let prev_tape = &head[prev];
        let next = &mut tail[0];

        for c in &prev_tape.t {
            if self.disabled[c.id as usize] {
                continue;
            }
            if c.op.has_dummy_children() {
                next.t.push(*c);
            } else {
                // Remap chains never cycle: each step maps to a strictly
                // smaller id, so iteration reaches a fixed point
                let mut ra = c.a;
                while self.remap[ra as usize] != 0 {
                    ra = self.remap[ra as usize];
                }
                let mut rb = c.b;
                while self.remap[rb as usize] != 0 {
                    rb = self.remap[rb as usize];
                }
                next.t.push(Clause { op: c.op, id: c.id, a: ra, b: rb });
            }
        }
        debug_assert!(next.t.len() <= prev_tape.t.len());

        next.ty = ty;
        next.dummy = u32::from(!has_choices);
        next.m.clone_from(&prev_tape.m);
        [next.x, next.y, next.z] = bounds;

        log::trace!(
            "pushed subtape: {} of {} clauses live",
            next.t.len(),
            prev_tape.t.len()
        );

        Handle { tape: self, kind: HandleKind::Push }
    }

    /// Returns a [`Handle`] that does nothing on drop
    ///
    /// Used when an evaluation cannot safely specialize the tape (e.g. an
    /// oracle reported an unbounded interval) but the caller still expects a
    /// handle to evaluate through.
    pub fn passthrough(&mut self) -> Handle<'_> {
        Handle { tape: self, kind: HandleKind::None }
    }

    /// Rewinds the cursor to the nearest interval-type subtape containing
    /// `p`, or to the base program.
    ///
    /// Dropping the returned handle restores the prior cursor.
    pub fn get_base(&mut self, p: Vector3<f32>) -> Handle<'_> {
        let prev = self.cursor;
        while self.cursor > 0 {
            let st = &self.tapes[self.cursor];
            if st.ty == TapeType::Interval && st.contains(p) {
                break;
            }
            self.cursor -= 1;
        }
        Handle { tape: self, kind: HandleKind::Base { prev } }
    }

    fn pop(&mut self) {
        assert!(self.cursor != 0, "tape cursor underflow");
        let st = &mut self.tapes[self.cursor];
        if st.dummy > 1 {
            st.dummy -= 1;
        } else {
            self.cursor -= 1;
        }
    }
}

/// Computes a live-range-colored slot assignment for the given clauses
///
/// Returns the clause-id-to-slot table and the total slot count.
fn assign_slots(t: &[Clause], num_clauses: usize) -> (Vec<u32>, usize) {
    // Live range of each clause: [definition, last use + 1)
    let mut ranges: Vec<Option<(usize, usize)>> = vec![None; num_clauses];
    for (i, c) in t.iter().enumerate() {
        debug_assert_ne!(c.id, 0);
        ranges[c.id as usize] = Some((i, i + 1));
        if !c.op.has_dummy_children() {
            for arg in [c.a, c.b] {
                if arg != 0 {
                    let r = ranges[arg as usize]
                        .as_mut()
                        .expect("argument before definition");
                    r.1 = i + 1;
                }
            }
        }
    }

    // Paired LOAD / DROP events, sorted by position with ties resolved
    // drop-before-load so that a freed slot is reusable at the same step
    const DROP: u8 = 0;
    const LOAD: u8 = 1;
    let mut events: Vec<(usize, u8, ClauseId)> = vec![];
    for (id, r) in ranges.iter().enumerate() {
        if let Some((start, end)) = r {
            events.push((*start, LOAD, id as ClauseId));
            events.push((*end, DROP, id as ClauseId));
        }
    }
    events.sort_unstable();

    let mut m = vec![0u32; num_clauses];
    let mut free = std::collections::BTreeSet::new();
    let mut slot_count = 0u32;
    for (_pos, ev, id) in events {
        if ev == DROP {
            let prev = free.insert(m[id as usize]);
            debug_assert!(prev);
        } else {
            let slot = match free.iter().next() {
                Some(&s) => {
                    free.remove(&s);
                    s
                }
                None => {
                    let s = slot_count;
                    slot_count += 1;
                    s
                }
            };
            m[id as usize] = slot;
        }
    }
    (m, slot_count as usize)
}

////////////////////////////////////////////////////////////////////////////////

enum HandleKind {
    None,
    Push,
    Base { prev: usize },
}

/// Move-only scoped token for a tape push or rebase
///
/// On destruction, pops the tape (if it pushed), restores a saved cursor (if
/// it rebased via [`Tape::get_base`]), or does nothing.  Handles for the same
/// tape nest strictly LIFO, which the borrow checker enforces.
pub struct Handle<'a> {
    tape: &'a mut Tape,
    kind: HandleKind,
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        match self.kind {
            HandleKind::None => (),
            HandleKind::Push => self.tape.pop(),
            HandleKind::Base { prev } => self.tape.cursor = prev,
        }
    }
}

impl std::ops::Deref for Handle<'_> {
    type Target = Tape;
    fn deref(&self) -> &Tape {
        self.tape
    }
}

impl std::ops::DerefMut for Handle<'_> {
    fn deref_mut(&mut self) -> &mut Tape {
        self.tape
    }
}

////////////////////////////////////////////////////////////////////////////////
