//! Single-point evaluation
use crate::tape::{Opcode, Tape};
use nalgebra::Vector3;
use std::sync::atomic::AtomicBool;

/// Evaluates the scalar field at single points by walking the active subtape
pub struct PointEvaluator {
    slots: Vec<f32>,
}

impl PointEvaluator {
    pub fn new(tape: &Tape) -> Self {
        Self { slots: vec![0.0; tape.slot_count()] }
    }

    /// Evaluates the active subtape at the given position
    ///
    /// `vars` holds free-variable values, in the order of the tape's `vars`
    /// table.
    pub fn eval(
        &mut self,
        tape: &Tape,
        x: f32,
        y: f32,
        z: f32,
        vars: &[f32],
    ) -> f32 {
        let abort = AtomicBool::new(false);
        self.eval_with_abort(tape, x, y, z, vars, &abort)
    }

    /// As [`eval`](Self::eval), polling the abort flag at each clause
    pub fn eval_with_abort(
        &mut self,
        tape: &Tape,
        x: f32,
        y: f32,
        z: f32,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> f32 {
        self.slots.resize(tape.slot_count(), 0.0);
        let p = Vector3::new(x, y, z);
        let slots = &mut self.slots;
        let root = tape.walk(
            |op, id, a, b| {
                let va = slots[tape.slot(a)];
                let vb = slots[tape.slot(b)];
                let out = match op {
                    Opcode::VarX => x,
                    Opcode::VarY => y,
                    Opcode::VarZ => z,
                    Opcode::VarFree => vars[a as usize],
                    Opcode::Constant => tape.constants[a as usize],
                    Opcode::Oracle => tape.oracles[a as usize].value(p),
                    Opcode::Add => va + vb,
                    Opcode::Sub => va - vb,
                    Opcode::Mul => va * vb,
                    Opcode::Div => va / vb,
                    Opcode::Min => va.min(vb),
                    Opcode::Max => va.max(vb),
                    Opcode::Neg => -va,
                    Opcode::Abs => va.abs(),
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
        self.slots[tape.slot(root)]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{context::Context, tape::Tape};

    #[test]
    fn test_point_eval() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let z2 = ctx.square(z).unwrap();
        let s = ctx.add(x2, y2).unwrap();
        let s = ctx.add(s, z2).unwrap();
        let r = ctx.sqrt(s).unwrap();
        let sphere = ctx.sub(r, 0.5).unwrap();

        let tape = Tape::new(&ctx, sphere).unwrap();
        let mut eval = PointEvaluator::new(&tape);
        assert_eq!(eval.eval(&tape, 1.0, 0.0, 0.0, &[]), 0.5);
        assert_eq!(eval.eval(&tape, 0.0, 0.5, 0.0, &[]), 0.0);
        assert_eq!(eval.eval(&tape, 0.0, 0.0, 0.0, &[]), -0.5);
    }

    #[test]
    fn test_point_matches_context() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let a = ctx.mul(x, y).unwrap();
        let b = ctx.sin(a).unwrap();
        let c = ctx.max(b, x).unwrap();
        let tape = Tape::new(&ctx, c).unwrap();
        let mut eval = PointEvaluator::new(&tape);
        for (px, py) in [(0.1, 0.2), (-1.5, 0.7), (2.0, -2.0)] {
            let direct =
                ctx.eval_xyz(c, px as f64, py as f64, 0.0).unwrap() as f32;
            let taped = eval.eval(&tape, px, py, 0.0, &[]);
            assert!(
                (direct - taped).abs() < 1e-6,
                "mismatch at ({px}, {py}): {direct} != {taped}"
            );
        }
    }
}
