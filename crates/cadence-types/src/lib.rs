//! `cadence-types` – shared data model of a Cadence control channel.
//!
//! Every record that crosses the shared medium between a producer
//! ([`FrontEnd`](../cadence_runtime/front_end/index.html)) and the executor
//! ([`BackEnd`](../cadence_runtime/back_end/index.html)) is defined here:
//!
//! - [`Command`] – an immutable per-actuator motion request with its
//!   [`Timing`] and [`Mode`].
//! - [`Observation`] – the snapshot the executor publishes once per
//!   iteration.
//! - [`ChannelLayout`] – the fixed shape of a channel (queue capacity and
//!   actuator count).
//! - [`CadenceError`] – the error type shared by every crate of the
//!   workspace.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a command, unique and increasing across a channel.
pub type CommandId = i32;

/// Position of a record in one of the channel's append-only streams.
pub type Index = i64;

// ─────────────────────────────────────────────────────────────────────────────
// Time
// ─────────────────────────────────────────────────────────────────────────────

/// A point in time, in microseconds since the Unix epoch.
///
/// The executor may also run on a *virtual* clock (see bursting), in which
/// case a `TimePoint` is just a monotone microsecond counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimePoint(i64);

impl TimePoint {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_micros())
    }

    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Microseconds elapsed from `earlier` to `self` (negative if `earlier`
    /// is in the future).
    pub const fn micros_since(self, earlier: TimePoint) -> i64 {
        self.0 - earlier.0
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs.as_micros() as i64)
    }
}

impl AddAssign<Duration> for TimePoint {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.as_micros() as i64;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// How a new command interacts with the commands already pending for the
/// same actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Run after every previously queued command of the actuator finished.
    Queue,
    /// Cancel the running command and empty the actuator's queue first.
    Overwrite,
}

/// How the desired state travels from its starting value to the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Timing {
    /// Apply the target on the next iteration.
    Direct,
    /// Reach the target after `us` microseconds.
    Duration { us: i64 },
    /// Move toward the target at `units_per_us` state units per microsecond.
    Speed { units_per_us: f64 },
    /// Reach the target at executor iteration `value`.
    ///
    /// With `relative`, `value` is an offset from the channel's relative
    /// origin; `reset` moves that origin to the iteration at which the
    /// executor reads the command.
    Iteration { value: i64, relative: bool, reset: bool },
}

impl Timing {
    pub fn duration(duration: Duration) -> Self {
        Timing::Duration {
            us: duration.as_micros() as i64,
        }
    }

    pub fn speed_per_second(units: f64) -> Self {
        Timing::Speed {
            units_per_us: units / 1e6,
        }
    }

    pub fn speed_per_millisecond(units: f64) -> Self {
        Timing::Speed {
            units_per_us: units / 1e3,
        }
    }

    pub fn speed_per_microsecond(units: f64) -> Self {
        Timing::Speed {
            units_per_us: units,
        }
    }

    /// Absolute target iteration.
    pub fn iteration(value: i64) -> Self {
        Timing::Iteration {
            value,
            relative: false,
            reset: false,
        }
    }

    /// Target iteration relative to the channel's relative origin, optionally
    /// re-baselining the origin first.
    pub fn relative_iteration(value: i64, reset: bool) -> Self {
        Timing::Iteration {
            value,
            relative: true,
            reset,
        }
    }
}

/// A per-actuator motion request.
///
/// Created by the producer, copied verbatim into the shared command stream,
/// and read by the executor. A command is never modified after creation; the
/// executor only ever works on its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command<S> {
    id: CommandId,
    pulse_id: i64,
    dof: usize,
    target: S,
    timing: Timing,
    mode: Mode,
}

impl<S> Command<S> {
    pub fn new(id: CommandId, pulse_id: i64, dof: usize, target: S, timing: Timing, mode: Mode) -> Self {
        Self {
            id,
            pulse_id,
            dof,
            target,
            timing,
            mode,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    /// The producer batch this command belongs to.
    pub fn pulse_id(&self) -> i64 {
        self.pulse_id
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    pub fn target(&self) -> &S {
        &self.target
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Same command with a different timing. Used by the executor on its own
    /// copy when resolving relative iterations.
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Same command assigned to producer batch `pulse_id`.
    pub fn with_pulse_id(mut self, pulse_id: i64) -> Self {
        self.pulse_id = pulse_id;
        self
    }
}

impl<S> fmt::Display for Command<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {} | dof {} | ", self.id, self.dof)?;
        match self.mode {
            Mode::Queue => write!(f, "queue | ")?,
            Mode::Overwrite => write!(f, "overwrite | ")?,
        }
        match self.timing {
            Timing::Direct => write!(f, "direct"),
            Timing::Duration { us } => write!(f, "duration {us}us"),
            Timing::Speed { units_per_us } => write!(f, "speed {units_per_us}/us"),
            Timing::Iteration { value, relative, reset } => {
                write!(f, "iteration {value}")?;
                if relative {
                    write!(f, " (relative")?;
                    if reset {
                        write!(f, ", reset")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Observations
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot published by the executor once per iteration.
///
/// A default-constructed observation (iterations, stamp and frequency all
/// `-1`, no states) stands for "nothing published yet".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation<S, E> {
    measured_states: Vec<S>,
    desired_states: Vec<S>,
    extended_state: E,
    control_iteration: i64,
    sensor_iteration: i64,
    stamp_us: i64,
    measured_frequency: f64,
}

impl<S, E: Default> Default for Observation<S, E> {
    fn default() -> Self {
        Self {
            measured_states: Vec::new(),
            desired_states: Vec::new(),
            extended_state: E::default(),
            control_iteration: -1,
            sensor_iteration: -1,
            stamp_us: -1,
            measured_frequency: -1.0,
        }
    }
}

impl<S, E> Observation<S, E> {
    pub fn new(
        measured_states: Vec<S>,
        desired_states: Vec<S>,
        extended_state: E,
        control_iteration: i64,
        sensor_iteration: i64,
        stamp: TimePoint,
        measured_frequency: f64,
    ) -> Self {
        Self {
            measured_states,
            desired_states,
            extended_state,
            control_iteration,
            sensor_iteration,
            stamp_us: stamp.as_micros(),
            measured_frequency,
        }
    }

    pub fn measured_states(&self) -> &[S] {
        &self.measured_states
    }

    pub fn desired_states(&self) -> &[S] {
        &self.desired_states
    }

    pub fn extended_state(&self) -> &E {
        &self.extended_state
    }

    pub fn control_iteration(&self) -> i64 {
        self.control_iteration
    }

    pub fn sensor_iteration(&self) -> i64 {
        self.sensor_iteration
    }

    pub fn stamp(&self) -> TimePoint {
        TimePoint::from_micros(self.stamp_us)
    }

    pub fn measured_frequency(&self) -> f64 {
        self.measured_frequency
    }

    /// `false` for the placeholder returned before anything was published.
    pub fn is_published(&self) -> bool {
        self.control_iteration >= 0
    }
}

/// Extended state for channels that publish no executor-specific telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoExtendedState;

// ─────────────────────────────────────────────────────────────────────────────
// Channel shape
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed shape of a channel, chosen by the executor when it binds the
/// channel and discovered by producers when they attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// Capacity of every stream of the channel (commands, completions,
    /// observations).
    pub queue_size: usize,
    /// Number of independently controlled actuators.
    pub nb_actuators: usize,
}

impl ChannelLayout {
    pub fn new(queue_size: usize, nb_actuators: usize) -> Self {
        Self {
            queue_size,
            nb_actuators,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type shared by the channel, control and runtime layers.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CadenceError {
    #[error("{stream} overflow: {requested} new entries but only {available} free slots")]
    Overflow {
        stream: String,
        requested: usize,
        available: usize,
    },

    #[error("invalid dof {dof}: channel has {nb_actuators} actuators")]
    InvalidDof { dof: usize, nb_actuators: usize },

    #[error("channel '{0}' is not bound by any executor")]
    ChannelNotFound(String),

    #[error("channel '{0}' is already bound by a running executor")]
    ChannelBusy(String),

    #[error("{stream}: index {index} was evicted (oldest is {oldest})")]
    Evicted {
        stream: String,
        index: Index,
        oldest: Index,
    },

    #[error("protocol misuse: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("driver fault: {0}")]
    Driver(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip_keeps_timing() {
        let command = Command::new(7, 3, 1, 2.5_f64, Timing::relative_iteration(40, true), Mode::Queue);
        let json = serde_json::to_string(&command).unwrap();
        let back: Command<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, command);
        assert!(matches!(
            back.timing(),
            Timing::Iteration {
                value: 40,
                relative: true,
                reset: true
            }
        ));
    }

    #[test]
    fn with_pulse_id_only_changes_the_batch() {
        let command = Command::new(9, 1, 2, 4.0_f64, Timing::Direct, Mode::Queue);
        let moved = command.clone().with_pulse_id(5);
        assert_eq!(moved.pulse_id(), 5);
        assert_eq!(moved.with_pulse_id(1), command);
    }

    #[test]
    fn speed_constructors_convert_to_microseconds() {
        let Timing::Speed { units_per_us } = Timing::speed_per_second(2_000_000.0) else {
            panic!("expected speed");
        };
        assert!((units_per_us - 2.0).abs() < 1e-12);

        let Timing::Speed { units_per_us } = Timing::speed_per_millisecond(5.0) else {
            panic!("expected speed");
        };
        assert!((units_per_us - 0.005).abs() < 1e-12);
    }

    #[test]
    fn duration_constructor_uses_microseconds() {
        assert_eq!(
            Timing::duration(Duration::from_millis(3)),
            Timing::Duration { us: 3_000 }
        );
    }

    #[test]
    fn command_display() {
        let command = Command::new(4, 0, 1, 0.0_f64, Timing::iteration(200), Mode::Queue);
        assert_eq!(command.to_string(), "command 4 | dof 1 | queue | iteration 200");

        let direct = Command::new(5, 0, 0, 0.0_f64, Timing::Direct, Mode::Overwrite);
        assert_eq!(direct.to_string(), "command 5 | dof 0 | overwrite | direct");
    }

    #[test]
    fn default_observation_is_unpublished() {
        let obs: Observation<f64, NoExtendedState> = Observation::default();
        assert!(!obs.is_published());
        assert_eq!(obs.control_iteration(), -1);
        assert!(obs.desired_states().is_empty());
    }

    #[test]
    fn time_point_arithmetic() {
        let mut t = TimePoint::from_micros(1_000);
        t += Duration::from_millis(2);
        assert_eq!(t.as_micros(), 3_000);
        assert_eq!((t + Duration::from_micros(5)).micros_since(t), 5);
    }

    #[test]
    fn error_display() {
        let err = CadenceError::Overflow {
            stream: "commands".to_string(),
            requested: 12,
            available: 3,
        };
        assert!(err.to_string().contains("12 new entries"));

        let err = CadenceError::InvalidDof {
            dof: 4,
            nb_actuators: 2,
        };
        assert!(err.to_string().contains("invalid dof 4"));
    }
}
