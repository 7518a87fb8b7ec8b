use arrayvec::ArrayVec;
use ordered_float::OrderedFloat;

/// An index into the [`Context`](super::Context) node arena.
///
/// A `Node` is tightly coupled to the `Context` which generated it, and is not
/// valid for a different `Context`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Node(pub(super) usize);

/// Represents an operation in a math expression.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Op {
    /// The X coordinate
    X,
    /// The Y coordinate
    Y,
    /// The Z coordinate
    Z,
    /// A free variable, identified by a slot in the context's variable table
    Var(usize),
    /// A constant value
    Const(OrderedFloat<f64>),
    /// An opaque user-supplied implicit function, identified by a slot in the
    /// context's oracle table
    Oracle(usize),

    Add(Node, Node),
    Sub(Node, Node),
    Mul(Node, Node),
    Div(Node, Node),
    Min(Node, Node),
    Max(Node, Node),

    Neg(Node),
    Abs(Node),
    Recip(Node),
    Sqrt(Node),
    Square(Node),

    Sin(Node),
    Cos(Node),
    Tan(Node),
    Asin(Node),
    Acos(Node),
    Atan(Node),
    Exp(Node),
    Ln(Node),
}

impl Op {
    /// Iterates over the operation's children (0, 1, or 2 nodes)
    pub fn iter_children(&self) -> impl Iterator<Item = Node> {
        let out: ArrayVec<Node, 2> = match *self {
            Op::X
            | Op::Y
            | Op::Z
            | Op::Var(..)
            | Op::Const(..)
            | Op::Oracle(..) => ArrayVec::new(),
            Op::Add(a, b)
            | Op::Sub(a, b)
            | Op::Mul(a, b)
            | Op::Div(a, b)
            | Op::Min(a, b)
            | Op::Max(a, b) => [a, b].into_iter().collect(),
            Op::Neg(a)
            | Op::Abs(a)
            | Op::Recip(a)
            | Op::Sqrt(a)
            | Op::Square(a)
            | Op::Sin(a)
            | Op::Cos(a)
            | Op::Tan(a)
            | Op::Asin(a)
            | Op::Acos(a)
            | Op::Atan(a)
            | Op::Exp(a)
            | Op::Ln(a) => [a].into_iter().collect(),
        };
        out.into_iter()
    }
}
