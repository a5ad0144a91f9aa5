//! Small shared key/value segment for scalar flags and counters.
//!
//! Every channel owns one [`Segment`] holding the single-writer scalars of
//! the protocol:
//!
//! | Key | Writer | Meaning |
//! |---|---|---|
//! | [`keys::PULSE_ID`] | producer | last committed producer batch |
//! | [`keys::COMMAND_READ`] | executor | index of the last command read (`-1` for none) |
//! | [`keys::COMMAND_ID`] | producer | last command id handed out |
//! | [`keys::ACTIVE`] | executor | executor is iterating |
//! | [`keys::PURGE`] | producer → executor | drop every pending command |
//! | [`keys::SHOULD_STOP`] | anyone | standalone runner should exit |
//! | [`keys::SHOULD_BURST`] | executor | bursting mode enabled |
//! | [`keys::BURSTING`] | executor | iterations of the burst in progress |
//! | [`keys::QUEUE_SIZE`], [`keys::NB_ACTUATORS`] | executor | channel layout |

use std::collections::HashMap;

use cadence_types::ChannelLayout;
use parking_lot::Mutex;

pub mod keys {
    pub const PULSE_ID: &str = "pulse_id";
    pub const COMMAND_READ: &str = "command_read";
    pub const COMMAND_ID: &str = "command_id";
    pub const ACTIVE: &str = "active";
    pub const PURGE: &str = "purge";
    pub const SHOULD_STOP: &str = "should_stop";
    pub const SHOULD_BURST: &str = "should_burst";
    pub const BURSTING: &str = "bursting";
    pub const QUEUE_SIZE: &str = "queue_size";
    pub const NB_ACTUATORS: &str = "nb_actuators";
}

/// Named integer scalars. Booleans are stored as `0` / `1`.
#[derive(Debug, Default)]
pub struct Segment {
    values: Mutex<HashMap<String, i64>>,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `key`, or `0` if it was never written.
    pub fn get(&self, key: &str) -> i64 {
        self.values.lock().get(key).copied().unwrap_or(0)
    }

    /// Value of `key`, or `default` if it was never written.
    pub fn get_or(&self, key: &str, default: i64) -> i64 {
        self.values.lock().get(key).copied().unwrap_or(default)
    }

    pub fn set(&self, key: &str, value: i64) {
        self.values.lock().insert(key.to_string(), value);
    }

    /// Atomically add `delta` to `key` and return the new value.
    pub fn fetch_add(&self, key: &str, delta: i64) -> i64 {
        let mut values = self.values.lock();
        let value = values.entry(key.to_string()).or_insert(0);
        *value += delta;
        *value
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key) != 0
    }

    pub fn set_flag(&self, key: &str, on: bool) {
        self.set(key, i64::from(on));
    }

    /// Read and clear a flag in one step.
    pub fn take_flag(&self, key: &str) -> bool {
        let mut values = self.values.lock();
        match values.get_mut(key) {
            Some(value) if *value != 0 => {
                *value = 0;
                true
            }
            _ => false,
        }
    }

    pub fn set_layout(&self, layout: ChannelLayout) {
        let mut values = self.values.lock();
        values.insert(keys::QUEUE_SIZE.to_string(), layout.queue_size as i64);
        values.insert(keys::NB_ACTUATORS.to_string(), layout.nb_actuators as i64);
    }

    /// Layout published by the executor, if it has bound the channel.
    pub fn layout(&self) -> Option<ChannelLayout> {
        let values = self.values.lock();
        let queue_size = *values.get(keys::QUEUE_SIZE)?;
        let nb_actuators = *values.get(keys::NB_ACTUATORS)?;
        Some(ChannelLayout::new(queue_size as usize, nb_actuators as usize))
    }
}
