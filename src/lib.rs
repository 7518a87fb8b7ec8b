//! Evaluation and meshing core for closed-form implicit surfaces.
//!
//! A model is an expression tree over arithmetic, transcendental, and min/max
//! operations on the three spatial coordinates; its zero-level set defines a
//! solid.  This crate provides
//!
//! - [`context::Context`], a deduplicating arena in which expressions are
//!   built;
//! - [`tape::Tape`], a linearized three-address form of an expression, with a
//!   stack of region-specialized subtapes produced by interval-based branch
//!   elimination;
//! - [`eval`], point / interval / array / feature evaluators that walk the
//!   active subtape;
//! - [`tree::SimplexTree`], a dimension-generic (2D / 3D) recursive spatial
//!   subdivision whose leaves carry one best-fit vertex per cell subspace,
//!   ready for surface extraction.
//!
//! ```
//! use isotope::{context::Context, tape::Tape, eval::PointEvaluator};
//!
//! let mut ctx = Context::new();
//! let (x, y) = (ctx.x(), ctx.y());
//! let x2 = ctx.square(x).unwrap();
//! let y2 = ctx.square(y).unwrap();
//! let r2 = ctx.add(x2, y2).unwrap();
//! let r = ctx.sqrt(r2).unwrap();
//! let circle = ctx.sub(r, 1.0).unwrap();
//!
//! let tape = Tape::new(&ctx, circle).unwrap();
//! let mut eval = PointEvaluator::new(&tape);
//! let v = eval.eval(&tape, 2.0, 0.0, 0.0, &[]);
//! assert_eq!(v, 1.0);
//! ```

pub mod context;
pub mod eval;
pub mod tape;
pub mod tree;

mod error;
pub use error::Error;
