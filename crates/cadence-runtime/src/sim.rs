//! Simulated driver used by the demo binary and the tests.

use cadence_control::State;
use cadence_control::interpolation::lerp;
use cadence_types::CadenceError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::Driver;

/// Telemetry published by [`SimDriver`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SimTelemetry {
    /// Number of desired states applied so far.
    pub steps: u64,
}

/// Actuators that follow their desired state with a first-order lag: every
/// applied desired state moves each measured state a fraction `gain` of the
/// remaining distance.
#[derive(Debug, Clone)]
pub struct SimDriver<S: State> {
    measured: Vec<S>,
    gain: f64,
    steps: u64,
    started: bool,
}

impl<S: State> SimDriver<S> {
    /// `nb_actuators` actuators starting at the default state. `gain` is
    /// clamped to `[0, 1]`; `1.0` makes them follow instantly.
    pub fn new(nb_actuators: usize, gain: f64) -> Self {
        Self::with_states(vec![S::default(); nb_actuators], gain)
    }

    pub fn with_states(initial: Vec<S>, gain: f64) -> Self {
        Self {
            measured: initial,
            gain: gain.clamp(0.0, 1.0),
            steps: 0,
            started: false,
        }
    }

    pub fn measured(&self) -> &[S] {
        &self.measured
    }
}

impl<S: State> Driver for SimDriver<S> {
    type State = S;
    type Extended = SimTelemetry;

    fn start(&mut self) -> Result<(), CadenceError> {
        if self.started {
            return Err(CadenceError::Driver("simulated driver started twice".to_string()));
        }
        self.started = true;
        debug!(nb_actuators = self.measured.len(), gain = self.gain, "simulated driver started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CadenceError> {
        self.started = false;
        debug!(steps = self.steps, "simulated driver stopped");
        Ok(())
    }

    fn set(&mut self, desired: &[S]) -> Result<(), CadenceError> {
        if desired.len() != self.measured.len() {
            return Err(CadenceError::Driver(format!(
                "{} desired states for {} actuators",
                desired.len(),
                self.measured.len()
            )));
        }
        for (measured, desired) in self.measured.iter_mut().zip(desired) {
            *measured = if S::INTERPOLABLE {
                lerp(measured, desired, self.gain)
            } else {
                desired.clone()
            };
        }
        self.steps += 1;
        Ok(())
    }

    fn get(&mut self) -> Result<(Vec<S>, SimTelemetry), CadenceError> {
        Ok((self.measured.clone(), SimTelemetry { steps: self.steps }))
    }
}
