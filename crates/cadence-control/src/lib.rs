//! `cadence-control` – trajectory generation
//!
//! Turns the ordered command stream of a channel into one desired state per
//! actuator and per iteration.
//!
//! # Modules
//!
//! - [`state`] – the [`State`] capability trait and the [`Scalar`],
//!   [`Vector`] and [`Toggle`] states.
//! - [`interpolation`] – pure direct/duration/speed/iteration interpolation.
//! - [`command_status`] – start conditions and progress of a running command.
//! - [`controller`] – per-actuator command queue.
//! - [`manager`] – [`ControllersManager`], the fan-out of the command stream
//!   to every controller.

pub mod command_status;
pub mod controller;
pub mod interpolation;
pub mod manager;
pub mod state;

pub use command_status::CommandStatus;
pub use controller::Controller;
pub use interpolation::ToIteration;
pub use manager::ControllersManager;
pub use state::{Scalar, State, Toggle, Vector};
