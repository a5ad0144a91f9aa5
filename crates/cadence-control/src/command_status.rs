//! Execution status of the command an actuator is currently running.

use cadence_types::{TimePoint, Timing};

use crate::interpolation;
use crate::state::State;

/// Start conditions and progress flags of one in-flight command.
///
/// `active` implies `initialized`. Asking a status that was never
/// initialised whether it finished is a logic error and panics.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStatus<S> {
    starting_state: S,
    start_time: TimePoint,
    start_iteration: i64,
    initialized: bool,
    active: bool,
    direct_done: bool,
}

impl<S: State> Default for CommandStatus<S> {
    fn default() -> Self {
        Self {
            starting_state: S::default(),
            start_time: TimePoint::default(),
            start_iteration: -1,
            initialized: false,
            active: false,
            direct_done: false,
        }
    }
}

impl<S: State> CommandStatus<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start conditions of a command toward `target`.
    ///
    /// Returns `false` when the command is degenerate and must be dropped:
    /// a zero speed, an iteration target not after `iteration`, or any
    /// interpolated timing on a state that only supports direct commands.
    pub fn initialize(
        &mut self,
        iteration: i64,
        starting_state: S,
        now: TimePoint,
        timing: &Timing,
    ) -> bool {
        self.starting_state = starting_state;
        self.start_time = now;
        self.start_iteration = iteration;
        self.initialized = true;
        self.active = false;
        self.direct_done = false;

        match *timing {
            Timing::Direct => true,
            _ if !S::INTERPOLABLE => false,
            Timing::Speed { units_per_us } => units_per_us != 0.0 && units_per_us.is_finite(),
            Timing::Iteration { value, .. } => value > iteration,
            Timing::Duration { .. } => true,
        }
    }

    pub fn starting_state(&self) -> &S {
        &self.starting_state
    }

    pub fn start_time(&self) -> TimePoint {
        self.start_time
    }

    pub fn start_iteration(&self) -> i64 {
        self.start_iteration
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self) {
        assert!(self.initialized, "command status activated before initialisation");
        self.active = true;
    }

    pub fn set_inactive(&mut self) {
        self.active = false;
    }

    pub fn set_direct_done(&mut self) {
        self.direct_done = true;
    }

    /// Desired state at (`iteration`, `now`) for a command toward `target`.
    pub fn desired(&self, target: &S, timing: &Timing, iteration: i64, now: TimePoint) -> S {
        let elapsed = now.micros_since(self.start_time);
        match *timing {
            Timing::Direct => target.clone(),
            Timing::Duration { us } => interpolation::by_duration(&self.starting_state, target, elapsed, us),
            Timing::Speed { units_per_us } => {
                interpolation::by_speed(&self.starting_state, target, elapsed, units_per_us)
            }
            Timing::Iteration { value, .. } => interpolation::by_iteration(
                &self.starting_state,
                target,
                self.start_iteration,
                iteration,
                value,
            ),
        }
    }

    /// Whether a command toward `target` is done at (`iteration`, `now`).
    ///
    /// # Panics
    ///
    /// If the status was never initialised.
    pub fn finished(&self, target: &S, timing: &Timing, iteration: i64, now: TimePoint) -> bool {
        assert!(self.initialized, "command status queried before initialisation");
        let elapsed = now.micros_since(self.start_time);
        match *timing {
            Timing::Direct => self.direct_done,
            Timing::Duration { us } => interpolation::duration_finished(elapsed, us),
            Timing::Speed { units_per_us } => {
                interpolation::speed_finished(&self.starting_state, target, elapsed, units_per_us)
            }
            Timing::Iteration { value, .. } => interpolation::iteration_finished(iteration, value),
        }
    }
}
