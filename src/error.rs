//! Universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("free variable is not present in this `Context`")]
    BadVar,

    #[error("`Context` is empty")]
    EmptyContext,

    #[error("var slice length ({0}) does not match var count ({1})")]
    BadVarSlice(usize, usize),

    #[error("point count ({0}) exceeds evaluator array size ({1})")]
    BadArraySize(usize, usize),
}
