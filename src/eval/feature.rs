//! Gradient enumeration at non-smooth points
use crate::{
    eval::types::Grad,
    tape::{ClauseId, Opcode, Tape},
};
use arrayvec::ArrayVec;
use nalgebra::Vector3;
use std::sync::atomic::AtomicBool;

/// Maximum number of distinct features reported at a single point
pub const MAX_FEATURES: usize = 8;

/// Maximum number of ambiguous clauses explored per point
///
/// Branch assignments are enumerated exhaustively, so this bounds the fan-out
/// at 2^MAX_CHOICES evaluations.
const MAX_CHOICES: usize = 3;

/// Enumerates the gradients reachable at a point where the field is
/// non-smooth
///
/// At a point where one or more `min` / `max` / `abs` clauses are exactly
/// tied, the field has several one-sided gradients ("features").  This
/// evaluator finds the tied clauses, then re-evaluates the gradient under
/// every assignment of their branches.
pub struct FeatureEvaluator {
    vslots: Vec<f32>,
    gslots: Vec<Grad>,
}

impl FeatureEvaluator {
    pub fn new(tape: &Tape) -> Self {
        Self {
            vslots: vec![0.0; tape.slot_count()],
            gslots: vec![Grad::default(); tape.slot_count()],
        }
    }

    /// Returns the distinct normalized gradients at the given point
    ///
    /// Smooth points report a single feature.  Gradients that vanish or
    /// contain non-finite values are skipped.
    pub fn features(
        &mut self,
        tape: &Tape,
        p: Vector3<f32>,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> ArrayVec<Vector3<f32>, MAX_FEATURES> {
        let (_, ambig) = self.eval_ambig(tape, p, vars, abort);

        let mut out: ArrayVec<Vector3<f32>, MAX_FEATURES> = ArrayVec::new();
        for mask in 0..(1usize << ambig.len()) {
            let mut forced: ArrayVec<(ClauseId, bool), MAX_CHOICES> =
                ArrayVec::new();
            for (i, &id) in ambig.iter().enumerate() {
                forced.push((id, mask & (1 << i) != 0));
            }
            let g = self.eval_grad_forced(tape, p, vars, &forced, abort);
            let d = g.d();
            if !d.iter().all(|v| v.is_finite()) {
                continue;
            }
            let norm = d.norm();
            if norm == 0.0 {
                continue;
            }
            let d = d / norm;
            if !out.iter().any(|o| o.dot(&d) > 1.0 - 1e-6) {
                if out.is_full() {
                    break;
                }
                out.push(d);
            }
        }
        out
    }

    /// Decides whether a point with field value exactly zero should be
    /// treated as inside the solid.
    ///
    /// The field is probed a small step against each feature gradient;
    /// the point is inside if any probe reaches negative territory.  A point
    /// with no usable gradients at all is degenerate and treated as inside.
    pub fn is_inside(
        &mut self,
        tape: &Tape,
        p: Vector3<f32>,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> bool {
        let (v, _) = self.eval_ambig(tape, p, vars, abort);
        if v != 0.0 {
            return v < 0.0;
        }
        let fs = self.features(tape, p, vars, abort);
        if fs.is_empty() {
            return true;
        }
        let step = 1e-4 * p.norm().max(1.0);
        fs.iter().any(|n| {
            let q = p - n * step;
            let (vq, _) = self.eval_ambig(tape, q, vars, abort);
            vq < 0.0
        })
    }

    /// Scalar evaluation that records which choice clauses were exactly tied
    fn eval_ambig(
        &mut self,
        tape: &Tape,
        p: Vector3<f32>,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> (f32, ArrayVec<ClauseId, MAX_CHOICES>) {
        self.vslots.resize(tape.slot_count(), 0.0);
        let mut ambig: ArrayVec<ClauseId, MAX_CHOICES> = ArrayVec::new();
        let slots = &mut self.vslots;
        let root = tape.walk(
            |op, id, a, b| {
                let va = slots[tape.slot(a)];
                let vb = slots[tape.slot(b)];
                let out = match op {
                    Opcode::VarX => p.x,
                    Opcode::VarY => p.y,
                    Opcode::VarZ => p.z,
                    Opcode::VarFree => vars[a as usize],
                    Opcode::Constant => tape.constants[a as usize],
                    Opcode::Oracle => tape.oracles[a as usize].value(p),
                    Opcode::Add => va + vb,
                    Opcode::Sub => va - vb,
                    Opcode::Mul => va * vb,
                    Opcode::Div => va / vb,
                    Opcode::Min | Opcode::Max => {
                        if va == vb && !ambig.is_full() {
                            ambig.push(id);
                        }
                        if op == Opcode::Min {
                            va.min(vb)
                        } else {
                            va.max(vb)
                        }
                    }
                    Opcode::Neg => -va,
                    Opcode::Abs => {
                        if va == 0.0 && !ambig.is_full() {
                            ambig.push(id);
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
                slots[tape.slot(id)] = out;
            },
            abort,
        );
        (self.vslots[tape.slot(root)], ambig)
    }

    /// Gradient evaluation with selected choice clauses forced to one branch
    fn eval_grad_forced(
        &mut self,
        tape: &Tape,
        p: Vector3<f32>,
        vars: &[f32],
        forced: &[(ClauseId, bool)],
        abort: &AtomicBool,
    ) -> Grad {
        self.gslots.resize(tape.slot_count(), Grad::default());
        let slots = &mut self.gslots;
        let root = tape.walk(
            |op, id, a, b| {
                let va = slots[tape.slot(a)];
                let vb = slots[tape.slot(b)];
                let force =
                    forced.iter().find(|(f, _)| *f == id).map(|(_, s)| *s);
                let out = match op {
                    Opcode::VarX => Grad::new(p.x, 1.0, 0.0, 0.0),
                    Opcode::VarY => Grad::new(p.y, 0.0, 1.0, 0.0),
                    Opcode::VarZ => Grad::new(p.z, 0.0, 0.0, 1.0),
                    Opcode::VarFree => vars[a as usize].into(),
                    Opcode::Constant => tape.constants[a as usize].into(),
                    Opcode::Oracle => {
                        let o = &tape.oracles[a as usize];
                        let d = o.grad(p);
                        Grad::new(o.value(p), d.x, d.y, d.z)
                    }
                    Opcode::Add => va + vb,
                    Opcode::Sub => va - vb,
                    Opcode::Mul => va * vb,
                    Opcode::Div => va / vb,
                    Opcode::Min => match force {
                        Some(true) => vb,
                        Some(false) => va,
                        None => va.min(vb),
                    },
                    Opcode::Max => match force {
                        Some(true) => vb,
                        Some(false) => va,
                        None => va.max(vb),
                    },
                    Opcode::Neg => -va,
                    Opcode::Abs => match force {
                        Some(true) => -va,
                        Some(false) => va,
                        None => va.abs(),
                    },
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
                slots[tape.slot(id)] = out;
            },
            abort,
        );
        self.gslots[tape.slot(root)]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{context::Context, tape::Tape};

    const NO_ABORT: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_features_corner() {
        // max(x, -x) has two features at x == 0
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();
        let root = ctx.max(x, nx).unwrap();
        let tape = Tape::new(&ctx, root).unwrap();

        let mut eval = FeatureEvaluator::new(&tape);
        let fs =
            eval.features(&tape, Vector3::new(0.0, 0.0, 0.0), &[], &NO_ABORT);
        assert_eq!(fs.len(), 2);
        assert!(fs.iter().any(|f| f.x > 0.99));
        assert!(fs.iter().any(|f| f.x < -0.99));

        // Away from the corner, there's only one
        let fs =
            eval.features(&tape, Vector3::new(1.0, 0.0, 0.0), &[], &NO_ABORT);
        assert_eq!(fs.len(), 1);
        assert!(fs[0].x > 0.99);
    }

    #[test]
    fn test_is_inside() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let nx = ctx.neg(x).unwrap();

        // max(x, -x) = |x| is an empty wedge: the surface point at the
        // origin has no negative material next to it
        let outer = ctx.max(x, nx).unwrap();
        let tape = Tape::new(&ctx, outer).unwrap();
        let mut eval = FeatureEvaluator::new(&tape);
        assert!(!eval.is_inside(
            &tape,
            Vector3::new(0.0, 0.0, 0.0),
            &[],
            &NO_ABORT
        ));

        // min(x, -x) = -|x| is solid on both sides
        let inner = ctx.min(x, nx).unwrap();
        let tape = Tape::new(&ctx, inner).unwrap();
        let mut eval = FeatureEvaluator::new(&tape);
        assert!(eval.is_inside(
            &tape,
            Vector3::new(0.0, 0.0, 0.0),
            &[],
            &NO_ABORT
        ));

        // Nonzero values don't consult features at all
        assert!(eval.is_inside(
            &tape,
            Vector3::new(1.0, 0.0, 0.0),
            &[],
            &NO_ABORT
        ));
    }
}
