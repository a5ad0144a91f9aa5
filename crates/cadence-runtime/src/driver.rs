//! Hardware-facing capability a standalone executor drives.

use cadence_control::State;
use cadence_types::CadenceError;

use crate::back_end::ExtendedState;

/// A piece of hardware (or a simulation of one) controlled through one
/// [`State`] per actuator.
///
/// Drivers are resolved at compile time: a
/// [`Standalone`](crate::standalone::Standalone) is generic over its driver.
pub trait Driver: Send + 'static {
    type State: State;
    type Extended: ExtendedState;

    /// Called once before the first iteration.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Driver`] if the hardware cannot be brought up.
    fn start(&mut self) -> Result<(), CadenceError>;

    /// Called once after the last iteration.
    fn stop(&mut self) -> Result<(), CadenceError>;

    /// Apply one desired state per actuator.
    fn set(&mut self, desired: &[Self::State]) -> Result<(), CadenceError>;

    /// Read one measured state per actuator, plus driver telemetry.
    fn get(&mut self) -> Result<(Vec<Self::State>, Self::Extended), CadenceError>;
}
