//! The expression front-end: a deduplicating arena of math nodes
//!
//! A [`Context`] should be used like an arena allocator: it grows over time,
//! then frees all of its contents when dropped.  Node handles are deduplicated
//! on construction, so `x + y` built twice returns the same [`Node`].

mod op;
pub use op::{Node, Op};

use crate::{eval::Oracle, Error};
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::sync::Arc;

/// A deduplicated set of constants, coordinates, variables, and operations
#[derive(Default)]
pub struct Context {
    ops: Vec<Op>,
    index: HashMap<Op, Node>,

    var_names: Vec<String>,
    var_index: HashMap<String, usize>,

    oracles: Vec<Arc<dyn Oracle>>,
}

/// Helper trait for things that can be converted into a [`Node`] given a
/// [`Context`], so that builder functions accept `f64` constants in place of
/// nodes.
pub trait IntoNode {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for f64 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self))
    }
}

impl Context {
    /// Builds a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the context
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn check_node(&self, n: Node) -> Result<(), Error> {
        if n.0 < self.ops.len() {
            Ok(())
        } else {
            Err(Error::BadNode)
        }
    }

    /// Looks up the operation for the given node
    pub fn get_op(&self, n: Node) -> Option<&Op> {
        self.ops.get(n.0)
    }

    fn get_node(&mut self, op: Op) -> Node {
        if let Some(&n) = self.index.get(&op) {
            return n;
        }
        let n = Node(self.ops.len());
        self.ops.push(op);
        self.index.insert(op, n);
        n
    }

    ////////////////////////////////////////////////////////////////////////
    // Primitives

    /// Constructs or finds the X coordinate node
    pub fn x(&mut self) -> Node {
        self.get_node(Op::X)
    }

    /// Constructs or finds the Y coordinate node
    pub fn y(&mut self) -> Node {
        self.get_node(Op::Y)
    }

    /// Constructs or finds the Z coordinate node
    pub fn z(&mut self) -> Node {
        self.get_node(Op::Z)
    }

    /// Returns a node representing the given constant value
    pub fn constant(&mut self, f: f64) -> Node {
        self.get_node(Op::Const(OrderedFloat(f)))
    }

    /// Constructs or finds a free variable node with the given name
    pub fn var(&mut self, name: &str) -> Node {
        let slot = match self.var_index.get(name) {
            Some(&i) => i,
            None => {
                let i = self.var_names.len();
                self.var_names.push(name.to_owned());
                self.var_index.insert(name.to_owned(), i);
                i
            }
        };
        self.get_node(Op::Var(slot))
    }

    /// Returns the name of the free variable in the given slot
    pub fn var_name(&self, slot: usize) -> Result<&str, Error> {
        self.var_names
            .get(slot)
            .map(|s| s.as_str())
            .ok_or(Error::BadVar)
    }

    /// Registers an oracle and returns a node evaluating it
    ///
    /// Each call creates a distinct node, even for an identical oracle.
    pub fn oracle(&mut self, o: Arc<dyn Oracle>) -> Node {
        let slot = self.oracles.len();
        self.oracles.push(o);
        let n = Node(self.ops.len());
        self.ops.push(Op::Oracle(slot));
        // deliberately not deduplicated
        n
    }

    /// Returns a handle to the oracle in the given slot
    pub fn oracle_handle(&self, slot: usize) -> Option<Arc<dyn Oracle>> {
        self.oracles.get(slot).cloned()
    }

    ////////////////////////////////////////////////////////////////////////
    // Builders, with constant folding

    fn op_unary<F>(&mut self, a: Node, op: F) -> Result<Node, Error>
    where
        F: Fn(Node) -> Op,
    {
        self.check_node(a)?;
        if let Op::Const(_) = self.ops[a.0] {
            let n = self.get_node(op(a));
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            Ok(self.constant(v))
        } else {
            Ok(self.get_node(op(a)))
        }
    }

    fn op_binary<A: IntoNode, B: IntoNode, F>(
        &mut self,
        a: A,
        b: B,
        op: F,
    ) -> Result<Node, Error>
    where
        F: Fn(Node, Node) -> Op,
    {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if let (Op::Const(_), Op::Const(_)) = (self.ops[a.0], self.ops[b.0]) {
            let n = self.get_node(op(a, b));
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            Ok(self.constant(v))
        } else {
            Ok(self.get_node(op(a, b)))
        }
    }

    /// Finds or creates a commutative binary node; deduplication is improved
    /// by sorting the operands.
    fn op_binary_commutative<A: IntoNode, B: IntoNode, F>(
        &mut self,
        a: A,
        b: B,
        op: F,
    ) -> Result<Node, Error>
    where
        F: Fn(Node, Node) -> Op,
    {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.op_binary(a.min(b), a.max(b), op)
    }

    pub fn add<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary_commutative(a, b, Op::Add)
    }

    pub fn sub<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(a, b, Op::Sub)
    }

    pub fn mul<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary_commutative(a, b, Op::Mul)
    }

    pub fn div<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        self.op_binary(a, b, Op::Div)
    }

    pub fn min<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_commutative(a, b, Op::Min)
        }
    }

    pub fn max<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_commutative(a, b, Op::Max)
        }
    }

    pub fn neg(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Neg)
    }

    pub fn abs(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Abs)
    }

    pub fn recip(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Recip)
    }

    pub fn sqrt(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Sqrt)
    }

    pub fn square(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Square)
    }

    pub fn sin(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Sin)
    }

    pub fn cos(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Cos)
    }

    pub fn tan(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Tan)
    }

    pub fn asin(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Asin)
    }

    pub fn acos(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Acos)
    }

    pub fn atan(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Atan)
    }

    pub fn exp(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Exp)
    }

    pub fn ln(&mut self, a: Node) -> Result<Node, Error> {
        self.op_unary(a, Op::Ln)
    }

    ////////////////////////////////////////////////////////////////////////

    /// Returns a bottom-up topological ordering of the subtree rooted at
    /// `root`: every node appears after all of its children.
    pub fn ordered(&self, root: Node) -> Result<Vec<Node>, Error> {
        self.check_node(root)?;
        let mut seen = vec![false; self.ops.len()];
        let mut out = vec![];
        // Iterative post-order traversal; the second visit emits the node
        let mut todo = vec![(root, false)];
        while let Some((n, visited)) = todo.pop() {
            if visited {
                out.push(n);
                continue;
            }
            if seen[n.0] {
                continue;
            }
            seen[n.0] = true;
            todo.push((n, true));
            for child in self.ops[n.0].iter_children() {
                todo.push((child, false));
            }
        }
        Ok(out)
    }

    /// Evaluates the given node directly, without building a tape
    ///
    /// Free variables are looked up by name in `vars`.
    pub fn eval(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
        vars: &HashMap<String, f64>,
    ) -> Result<f64, Error> {
        let mut cache: Vec<Option<f64>> = vec![None; self.ops.len()];
        for n in self.ordered(root)? {
            let get = |m: Node| cache[m.0].unwrap();
            let v = match self.ops[n.0] {
                Op::X => x,
                Op::Y => y,
                Op::Z => z,
                Op::Var(slot) => {
                    let name = self.var_name(slot)?;
                    *vars.get(name).ok_or(Error::BadVar)?
                }
                Op::Const(c) => c.0,
                Op::Oracle(slot) => {
                    let o = self.oracles.get(slot).ok_or(Error::BadNode)?;
                    o.value(nalgebra::Vector3::new(
                        x as f32, y as f32, z as f32,
                    )) as f64
                }
                Op::Add(a, b) => get(a) + get(b),
                Op::Sub(a, b) => get(a) - get(b),
                Op::Mul(a, b) => get(a) * get(b),
                Op::Div(a, b) => get(a) / get(b),
                Op::Min(a, b) => get(a).min(get(b)),
                Op::Max(a, b) => get(a).max(get(b)),
                Op::Neg(a) => -get(a),
                Op::Abs(a) => get(a).abs(),
                Op::Recip(a) => 1.0 / get(a),
                Op::Sqrt(a) => get(a).sqrt(),
                Op::Square(a) => {
                    let v = get(a);
                    v * v
                }
                Op::Sin(a) => get(a).sin(),
                Op::Cos(a) => get(a).cos(),
                Op::Tan(a) => get(a).tan(),
                Op::Asin(a) => get(a).asin(),
                Op::Acos(a) => get(a).acos(),
                Op::Atan(a) => get(a).atan(),
                Op::Exp(a) => get(a).exp(),
                Op::Ln(a) => get(a).ln(),
            };
            cache[n.0] = Some(v);
        }
        Ok(cache[root.0].unwrap())
    }

    /// Evaluates the given node at a position, with no free variables bound
    pub fn eval_xyz(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        self.eval(root, x, y, z, &HashMap::new())
    }
}
