//! Interval evaluation with tape specialization
use crate::{
    eval::types::Interval,
    tape::{Handle, Keep, Opcode, Tape, TapeType},
};
use nalgebra::Vector3;
use std::sync::atomic::AtomicBool;

/// Evaluates the field over axis-aligned boxes, recording branch decisions
///
/// Each `min` / `max` clause stores the [`Keep`] decision implied by its
/// operand intervals; [`eval_and_push`](Self::eval_and_push) replays those
/// decisions as the pruning predicate for [`Tape::push`].
pub struct IntervalEvaluator {
    slots: Vec<Interval>,

    /// Branch decision per clause id, valid for choice clauses after `eval`
    choices: Vec<Keep>,

    /// False if any oracle could not bound its output on the last evaluation
    safe: bool,
}

impl IntervalEvaluator {
    pub fn new(tape: &Tape) -> Self {
        Self {
            slots: vec![Interval::from(0.0); tape.slot_count()],
            choices: vec![Keep::Always; tape.num_clauses()],
            safe: true,
        }
    }

    /// Whether the last evaluation's result (and pruning) is conservative
    ///
    /// Returns `false` if an oracle reported an unbounded interval.
    pub fn is_safe(&self) -> bool {
        self.safe
    }

    /// Evaluates the active subtape over the given box
    pub fn eval(
        &mut self,
        tape: &Tape,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> Interval {
        self.slots.resize(tape.slot_count(), Interval::from(0.0));
        self.choices.resize(tape.num_clauses(), Keep::Always);
        self.safe = true;

        let x = Interval::new(lower.x, upper.x);
        let y = Interval::new(lower.y, upper.y);
        let z = Interval::new(lower.z, upper.z);

        let slots = &mut self.slots;
        let choices = &mut self.choices;
        let safe = &mut self.safe;
        let root = tape.walk(
            |op, id, a, b| {
                let va = slots[tape.slot(a)];
                let vb = slots[tape.slot(b)];
                let out = match op {
                    Opcode::VarX => x,
                    Opcode::VarY => y,
                    Opcode::VarZ => z,
                    Opcode::VarFree => vars[a as usize].into(),
                    Opcode::Constant => tape.constants[a as usize].into(),
                    Opcode::Oracle => {
                        let (i, s) =
                            tape.oracles[a as usize].interval(lower, upper);
                        *safe &= s;
                        i
                    }
                    Opcode::Add => va + vb,
                    Opcode::Sub => va - vb,
                    Opcode::Mul => va * vb,
                    Opcode::Div => va / vb,
                    Opcode::Min => {
                        let (out, c) = va.min_choice(vb);
                        choices[id as usize] = c;
                        out
                    }
                    Opcode::Max => {
                        let (out, c) = va.max_choice(vb);
                        choices[id as usize] = c;
                        out
                    }
                    Opcode::Neg => -va,
                    Opcode::Abs => va.abs(),
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
        self.slots[tape.slot(root)]
    }

    /// Evaluates over the given box, then pushes a subtape specialized to the
    /// branch decisions made during evaluation.
    ///
    /// If any oracle reported an unsafe interval, the tape is *not* pushed;
    /// the returned handle is a no-op and the caller must treat the region as
    /// ambiguous.
    pub fn eval_and_push<'t>(
        &mut self,
        tape: &'t mut Tape,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
        vars: &[f32],
        abort: &AtomicBool,
    ) -> (Interval, Handle<'t>) {
        let out = self.eval(tape, lower, upper, vars, abort);
        if !self.safe {
            return (out, tape.passthrough());
        }
        let choices = &self.choices;
        let handle = tape.push(
            |op, id, _a, _b| {
                if op.is_choice() {
                    choices[id as usize]
                } else {
                    Keep::Always
                }
            },
            TapeType::Interval,
            [
                Interval::new(lower.x, upper.x),
                Interval::new(lower.y, upper.y),
                Interval::new(lower.z, upper.z),
            ],
        );
        (out, handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;

    const NO_ABORT: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_interval_eval() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let r = ctx.add(x2, y2).unwrap();
        let c = ctx.sub(r, 1.0).unwrap();
        let tape = Tape::new(&ctx, c).unwrap();

        let mut eval = IntervalEvaluator::new(&tape);
        let out = eval.eval(
            &tape,
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.5, 0.5, 0.0),
            &[],
            &NO_ABORT,
        );
        assert_eq!(out, [-1.0, -0.5].into());

        let out = eval.eval(
            &tape,
            Vector3::new(2.0, 2.0, 0.0),
            Vector3::new(3.0, 3.0, 0.0),
            &[],
            &NO_ABORT,
        );
        assert!(out.lower() > 0.0);
    }

    #[test]
    fn test_eval_and_push_min() {
        // min(x, y) with x strictly dominated: the pushed tape drops both
        // the min and the unused branch
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let root = ctx.min(x, y).unwrap();
        let mut tape = Tape::new(&ctx, root).unwrap();

        let mut eval = IntervalEvaluator::new(&tape);
        let (out, h) = eval.eval_and_push(
            &mut tape,
            Vector3::new(0.0, 0.6, 0.0),
            Vector3::new(0.4, 1.0, 0.0),
            &[],
            &NO_ABORT,
        );
        assert_eq!(out, [0.0, 0.4].into());
        assert!(eval.is_safe());
        assert_eq!(h.active().len(), 1);
        assert_eq!(h.active().clauses()[0].op, Opcode::VarX);
        drop(h);

        // Overlapping operands keep both branches; the pushed tape matches
        // the parent
        let (_, h) = eval.eval_and_push(
            &mut tape,
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 0.0),
            &[],
            &NO_ABORT,
        );
        assert_eq!(h.active().len(), 3);
        assert_eq!(h.utilization(), 1.0);
    }
}
