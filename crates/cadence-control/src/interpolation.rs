//! Pure trajectory interpolation.
//!
//! Every function takes the state the command started from (the desired
//! state of the previous iteration when the command was initialised, not a
//! measured one) and the target, and returns the desired state "now".
//! Fields are visited one by one; for speed commands the duration is
//! derived from the first field only and reused for every other field.

use cadence_types::{Command, Timing};

use crate::state::State;

/// `start + (target - start) * ratio`, field by field, with `ratio` clamped
/// to `[0, 1]`.
pub fn lerp<S: State>(start: &S, target: &S, ratio: f64) -> S {
    let ratio = ratio.clamp(0.0, 1.0);
    if ratio >= 1.0 {
        return target.clone();
    }
    let fields: Vec<f64> = start
        .fields()
        .iter()
        .zip(target.fields())
        .map(|(s, t)| s + (t - s) * ratio)
        .collect();
    S::from_fields(&fields)
}

/// Time-based interpolation over `duration_us`. A non-positive duration
/// jumps straight to the target.
pub fn by_duration<S: State>(start: &S, target: &S, elapsed_us: i64, duration_us: i64) -> S {
    if duration_us <= 0 || elapsed_us >= duration_us {
        return target.clone();
    }
    lerp(start, target, elapsed_us as f64 / duration_us as f64)
}

/// Microseconds needed to cover the first field's distance at
/// `units_per_us`. `None` for a zero speed.
pub fn speed_duration_us<S: State>(start: &S, target: &S, units_per_us: f64) -> Option<f64> {
    let speed = units_per_us.abs();
    if speed == 0.0 || !speed.is_finite() {
        return None;
    }
    let distance = match (start.fields().first(), target.fields().first()) {
        (Some(s), Some(t)) => (t - s).abs(),
        _ => 0.0,
    };
    Some(distance / speed)
}

/// Move from `start` toward `target` at `|units_per_us|`, clamped at the
/// target.
pub fn by_speed<S: State>(start: &S, target: &S, elapsed_us: i64, units_per_us: f64) -> S {
    match speed_duration_us(start, target, units_per_us) {
        Some(duration) if duration > 0.0 => lerp(start, target, elapsed_us as f64 / duration),
        _ => target.clone(),
    }
}

/// Iteration-based interpolation: `start` at `start_iteration`, `target`
/// from `target_iteration` on.
pub fn by_iteration<S: State>(
    start: &S,
    target: &S,
    start_iteration: i64,
    now_iteration: i64,
    target_iteration: i64,
) -> S {
    if now_iteration >= target_iteration || target_iteration <= start_iteration {
        return target.clone();
    }
    let ratio = (now_iteration - start_iteration) as f64 / (target_iteration - start_iteration) as f64;
    lerp(start, target, ratio)
}

pub fn duration_finished(elapsed_us: i64, duration_us: i64) -> bool {
    elapsed_us >= duration_us
}

pub fn speed_finished<S: State>(start: &S, target: &S, elapsed_us: i64, units_per_us: f64) -> bool {
    match speed_duration_us(start, target, units_per_us) {
        Some(duration) => elapsed_us as f64 >= duration,
        None => false,
    }
}

pub fn iteration_finished(now_iteration: i64, target_iteration: i64) -> bool {
    now_iteration > target_iteration
}

/// Number of iterations of `period_us` that best covers `duration_us`
/// (at least one).
pub fn iterations_for(duration_us: f64, period_us: i64) -> i64 {
    if period_us <= 0 {
        return 1;
    }
    ((duration_us / period_us as f64).round() as i64).max(1)
}

/// Conversion of time-based commands into iteration-based ones, for
/// deterministic replay on a loop of known period.
pub trait ToIteration<S> {
    /// Equivalent absolute `Iteration` command for a loop currently at
    /// `current_iteration` and ticking every `period_us`. `start` is the
    /// state the command would start from. `Direct` and `Iteration`
    /// commands are returned unchanged, as is a zero-speed command.
    fn to_iteration(&self, start: &S, current_iteration: i64, period_us: i64) -> Self;
}

impl<S: State> ToIteration<S> for Command<S> {
    fn to_iteration(&self, start: &S, current_iteration: i64, period_us: i64) -> Self {
        let duration_us = match *self.timing() {
            Timing::Duration { us } => us as f64,
            Timing::Speed { units_per_us } => {
                match speed_duration_us(start, self.target(), units_per_us) {
                    Some(duration) => duration,
                    None => return self.clone(),
                }
            }
            Timing::Direct | Timing::Iteration { .. } => return self.clone(),
        };
        let value = current_iteration + iterations_for(duration_us, period_us);
        self.clone().with_timing(Timing::iteration(value))
    }
}
