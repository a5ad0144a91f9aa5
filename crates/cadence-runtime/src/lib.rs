//! `cadence-runtime` – executors and producers
//!
//! Both ends of a channel, and the loop that runs an executor.
//!
//! # Modules
//!
//! - [`back_end`] – [`BackEnd`], the executor side: binds the channel,
//!   dispatches committed commands, publishes observations.
//! - [`front_end`] – [`FrontEnd`], the producer side: buffers and flushes
//!   commands, waits for completions, iterations and bursts.
//! - [`burster`] – executor side of bursting.
//! - [`frequency`] – fixed-rate pacing and frequency measurement.
//! - [`driver`] – the [`Driver`] capability of the hardware layer.
//! - [`standalone`] – [`Standalone`], a driver and a back end running on a
//!   dedicated thread.
//! - [`sim`] – [`SimDriver`], a simulated driver.
//! - [`telemetry`] – [`init_tracing`] for executables.
//!
//! ```text
//!   FrontEnd ──commands──▶ ┌────────────┐ ──desired──▶ Driver
//!            ◀─completed── │  BackEnd   │
//!            ◀─observations│            │ ◀─measured── Driver
//!   burst() ══rendezvous══▶└────────────┘
//! ```

pub mod back_end;
pub mod burster;
pub mod driver;
pub mod frequency;
pub mod front_end;
pub mod sim;
pub mod standalone;
pub mod telemetry;

pub use back_end::{BackEnd, ExtendedState, ObservationPolicy};
pub use burster::{Burster, Step};
pub use driver::Driver;
pub use frequency::{FrequencyManager, FrequencyMeasure};
pub use front_end::FrontEnd;
pub use sim::{SimDriver, SimTelemetry};
pub use standalone::{Standalone, StandaloneConfig, StandaloneHandle, please_stop, start_standalone};
pub use telemetry::{TracerProviderGuard, init_tracing};
