/// Identifier for a single clause's result slot
///
/// Id 0 is reserved as the "no clause" sentinel; real clauses are numbered
/// from 1, in the order they were flattened out of the expression tree.
pub type ClauseId = u32;

/// Opcodes that can appear in a [`Tape`](super::Tape)
///
/// Nullary opcodes read from the tape's side arrays; everything else reads
/// one or two earlier clauses.  [`Min`](Opcode::Min) and [`Max`](Opcode::Max)
/// are the only opcodes that admit branch pruning during interval evaluation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    /// Reads the X coordinate
    VarX,
    /// Reads the Y coordinate
    VarY,
    /// Reads the Z coordinate
    VarZ,
    /// Reads a free variable; `a` indexes the tape's `vars` array
    VarFree,
    /// Reads a constant; `a` indexes the tape's `constants` array
    Constant,
    /// Evaluates an opaque callback; `a` indexes the tape's `oracles` array
    Oracle,

    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,

    Neg,
    Abs,
    Recip,
    Sqrt,
    Square,

    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    Ln,
}

impl Opcode {
    /// Returns the number of clause arguments read by this opcode
    pub fn arity(&self) -> usize {
        match self {
            Opcode::VarX
            | Opcode::VarY
            | Opcode::VarZ
            | Opcode::VarFree
            | Opcode::Constant
            | Opcode::Oracle => 0,
            Opcode::Neg
            | Opcode::Abs
            | Opcode::Recip
            | Opcode::Sqrt
            | Opcode::Square
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Tan
            | Opcode::Asin
            | Opcode::Acos
            | Opcode::Atan
            | Opcode::Exp
            | Opcode::Ln => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Min
            | Opcode::Max => 2,
        }
    }

    /// Checks whether `a` and `b` are side-array indexes rather than clauses
    ///
    /// Such clauses must never have their arguments remapped during a push.
    pub fn has_dummy_children(&self) -> bool {
        matches!(
            self,
            Opcode::Constant | Opcode::VarFree | Opcode::Oracle
        )
    }

    /// Checks whether this opcode makes a choice during interval evaluation
    pub fn is_choice(&self) -> bool {
        matches!(self, Opcode::Min | Opcode::Max)
    }
}

/// A single three-address instruction
///
/// `a` and `b` are clause ids of inputs for arithmetic opcodes; for
/// [`Constant`](Opcode::Constant) / [`VarFree`](Opcode::VarFree) /
/// [`Oracle`](Opcode::Oracle), `a` indexes the matching side array and `b` is
/// unused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clause {
    pub op: Opcode,
    pub id: ClauseId,
    pub a: ClauseId,
    pub b: ClauseId,
}

/// Result of the pruning predicate passed to [`Tape::push`](super::Tape::push)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Keep {
    /// Only the left-hand branch is reachable; remap this clause to `a`
    A,
    /// Only the right-hand branch is reachable; remap this clause to `b`
    B,
    /// Both branches remain reachable
    Both,
    /// The clause is kept unconditionally (non-choice opcodes)
    Always,
}
