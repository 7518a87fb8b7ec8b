//! Batched evaluation across arrays of points
use crate::{
    eval::types::Grad,
    tape::{Opcode, Tape},
};
use nalgebra::Vector3;
use std::sync::atomic::AtomicBool;

/// Maximum number of points in a single batched evaluation
pub const ARRAY_SIZE: usize = 256;

/// Evaluates the field (and its gradient) at many points in one tape walk
///
/// Positions are loaded with [`set`](Self::set), then evaluated in a single
/// batched call to [`values`](Self::values) or [`derivs`](Self::derivs).
/// Points at which a `min` / `max` / `abs` clause was exactly tied are
/// reported by [`get_ambiguous`](Self::get_ambiguous); the field is
/// non-smooth there, and the feature evaluator should be consulted for the
/// full set of gradients.
pub struct ArrayEvaluator {
    points: Vec<Vector3<f32>>,
    val: Vec<Vec<f32>>,
    grad: Vec<Vec<Grad>>,
    ambig: Vec<bool>,
}

impl ArrayEvaluator {
    pub fn new(tape: &Tape) -> Self {
        Self {
            points: vec![Vector3::zeros(); ARRAY_SIZE],
            val: vec![vec![]; tape.slot_count()],
            grad: vec![vec![]; tape.slot_count()],
            ambig: vec![false; ARRAY_SIZE],
        }
    }

    /// Stores a position to be evaluated in the given array slot
    pub fn set(&mut self, p: Vector3<f32>, i: usize) {
        self.points[i] = p;
    }

    /// Evaluates the first `count` stored points, returning their values
    pub fn values(
        &mut self,
        count: usize,
        tape: &Tape,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> &[f32] {
        assert!(count <= ARRAY_SIZE);
        self.val.resize(tape.slot_count(), vec![]);
        for row in &mut self.val {
            row.resize(count, 0.0);
        }
        self.ambig[..count].fill(false);

        let val = &mut self.val;
        let ambig = &mut self.ambig;
        let points = &self.points;
        let root = tape.walk(
            |op, id, a, b| {
                let sa = tape.slot(a);
                let sb = tape.slot(b);
                let so = tape.slot(id);
                for k in 0..count {
                    let va = val[sa][k];
                    let vb = val[sb][k];
                    let out = match op {
                        Opcode::VarX => points[k].x,
                        Opcode::VarY => points[k].y,
                        Opcode::VarZ => points[k].z,
                        Opcode::VarFree => vars[a as usize],
                        Opcode::Constant => tape.constants[a as usize],
                        Opcode::Oracle => {
                            tape.oracles[a as usize].value(points[k])
                        }
                        Opcode::Add => va + vb,
                        Opcode::Sub => va - vb,
                        Opcode::Mul => va * vb,
                        Opcode::Div => va / vb,
                        Opcode::Min => {
                            if va == vb {
                                ambig[k] = true;
                            }
                            va.min(vb)
                        }
                        Opcode::Max => {
                            if va == vb {
                                ambig[k] = true;
                            }
                            va.max(vb)
                        }
                        Opcode::Neg => -va,
                        Opcode::Abs => {
                            if va == 0.0 {
                                ambig[k] = true;
                            }
                            va.abs()
                        }
                        Opcode::Recip => 1.0 / va,
                        Opcode::Sqrt => va.sqrt(),
                        Opcode::Square => va * va,
                        Opcode::Sin => va.sin(),
                        Opcode::Cos => va.cos(),
                        Opcode::Tan => va.tan(),
                        Opcode::Asin => va.asin(),
                        Opcode::Acos => va.acos(),
                        Opcode::Atan => va.atan(),
                        Opcode::Exp => va.exp(),
                        Opcode::Ln => va.ln(),
                    };
                    val[so][k] = out;
                }
            },
            abort,
        );
        &self.val[tape.slot(root)][..count]
    }

    /// Evaluates the first `count` stored points, returning values and
    /// forward-mode gradients
    pub fn derivs(
        &mut self,
        count: usize,
        tape: &Tape,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> &[Grad] {
        assert!(count <= ARRAY_SIZE);
        self.grad.resize(tape.slot_count(), vec![]);
        for row in &mut self.grad {
            row.resize(count, Grad::default());
        }
        self.ambig[..count].fill(false);

        let grad = &mut self.grad;
        let ambig = &mut self.ambig;
        let points = &self.points;
        let root = tape.walk(
            |op, id, a, b| {
                let sa = tape.slot(a);
                let sb = tape.slot(b);
                let so = tape.slot(id);
                for k in 0..count {
                    let va = grad[sa][k];
                    let vb = grad[sb][k];
                    let out = match op {
                        Opcode::VarX => {
                            Grad::new(points[k].x, 1.0, 0.0, 0.0)
                        }
                        Opcode::VarY => {
                            Grad::new(points[k].y, 0.0, 1.0, 0.0)
                        }
                        Opcode::VarZ => {
                            Grad::new(points[k].z, 0.0, 0.0, 1.0)
                        }
                        Opcode::VarFree => vars[a as usize].into(),
                        Opcode::Constant => {
                            tape.constants[a as usize].into()
                        }
                        Opcode::Oracle => {
                            let o = &tape.oracles[a as usize];
                            let d = o.grad(points[k]);
                            Grad::new(o.value(points[k]), d.x, d.y, d.z)
                        }
                        Opcode::Add => va + vb,
                        Opcode::Sub => va - vb,
                        Opcode::Mul => va * vb,
                        Opcode::Div => va / vb,
                        Opcode::Min => {
                            if va.v == vb.v {
                                ambig[k] = true;
                            }
                            va.min(vb)
                        }
                        Opcode::Max => {
                            if va.v == vb.v {
                                ambig[k] = true;
                            }
                            va.max(vb)
                        }
                        Opcode::Neg => -va,
                        Opcode::Abs => {
                            if va.v == 0.0 {
                                ambig[k] = true;
                            }
                            va.abs()
                        }
                        Opcode::Recip => va.recip(),
                        Opcode::Sqrt => va.sqrt(),
                        Opcode::Square => va.square(),
                        Opcode::Sin => va.sin(),
                        Opcode::Cos => va.cos(),
                        Opcode::Tan => va.tan(),
                        Opcode::Asin => va.asin(),
                        Opcode::Acos => va.acos(),
                        Opcode::Atan => va.atan(),
                        Opcode::Exp => va.exp(),
                        Opcode::Ln => va.ln(),
                    };
                    grad[so][k] = out;
                }
            },
            abort,
        );
        &self.grad[tape.slot(root)][..count]
    }

    /// Reports which of the last-evaluated points hit a non-smooth clause
    ///
    /// Valid after a call to [`values`](Self::values) or
    /// [`derivs`](Self::derivs) with the same `count`.
    pub fn get_ambiguous(&self, count: usize) -> &[bool] {
        &self.ambig[..count]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;

    const NO_ABORT: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_array_values() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let root = ctx.min(x, y).unwrap();
        let tape = Tape::new(&ctx, root).unwrap();

        let mut eval = ArrayEvaluator::new(&tape);
        eval.set(Vector3::new(1.0, 2.0, 0.0), 0);
        eval.set(Vector3::new(3.0, -1.0, 0.0), 1);
        eval.set(Vector3::new(0.5, 0.5, 0.0), 2);
        let out = eval.values(3, &tape, &[], &NO_ABORT);
        assert_eq!(out, &[1.0, -1.0, 0.5]);

        // The third point ties the min and is flagged as ambiguous
        assert_eq!(eval.get_ambiguous(3), &[false, false, true]);
    }

    #[test]
    fn test_array_derivs() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let r = ctx.add(x2, y2).unwrap();
        let tape = Tape::new(&ctx, r).unwrap();

        let mut eval = ArrayEvaluator::new(&tape);
        eval.set(Vector3::new(1.0, 2.0, 0.0), 0);
        eval.set(Vector3::new(-1.0, 0.0, 0.0), 1);
        let out = eval.derivs(2, &tape, &[], &NO_ABORT);
        assert_eq!(out[0], Grad::new(5.0, 2.0, 4.0, 0.0));
        assert_eq!(out[1], Grad::new(1.0, -2.0, 0.0, 0.0));
    }
}
