//! `cadence-channel` – the shared medium
//!
//! Everything a producer and an executor exchange goes through the objects
//! of this crate. None of them knows what a command or an observation means.
//!
//! # Modules
//!
//! - [`memory`] – [`SharedMemory`], the named registry and channel
//!   lifecycle (`bind`, `clear_channel`).
//! - [`time_series`] – bounded, append-only, indexed streams with blocking
//!   wait.
//! - [`segment`] – small key/value store for scalar flags and counters.
//! - [`rendezvous`] – leader/follower handshake used for bursting.

pub mod memory;
pub mod rendezvous;
pub mod segment;
pub mod time_series;

pub use memory::{ChannelNames, SharedMemory};
pub use rendezvous::{Follower, Leader, Rendezvous, Signal};
pub use segment::{Segment, keys};
pub use time_series::TimeSeries;
