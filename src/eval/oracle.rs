//! Opaque user-supplied implicit functions
use crate::eval::types::Interval;
use nalgebra::Vector3;

/// An opaque implicit function evaluated by callback
///
/// Oracles appear as leaf clauses in the tape; their results flow through the
/// surrounding arithmetic like any other value.  An oracle that cannot bound
/// its output over a region must say so through the `safe` flag of
/// [`interval`](Oracle::interval), which forces the enclosing cell to be
/// treated as ambiguous.
pub trait Oracle: Send + Sync {
    /// Evaluates the oracle at a single point
    fn value(&self, p: Vector3<f32>) -> f32;

    /// Evaluates the oracle's gradient at a single point
    fn grad(&self, p: Vector3<f32>) -> Vector3<f32>;

    /// Bounds the oracle over an axis-aligned box
    ///
    /// Returns the bounding interval and whether that bound is conservative;
    /// returning `false` disables tape pruning for the enclosing region.
    fn interval(&self, lower: Vector3<f32>, upper: Vector3<f32>)
        -> (Interval, bool);
}
