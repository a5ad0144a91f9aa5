//! Named registry of shared streams, segments and rendezvous.
//!
//! [`SharedMemory`] plays the role of a shared-memory namespace: every party
//! of a channel opens the same named objects through a clone of the same
//! handle. The handle is passed explicitly; there is no process-global
//! state.
//!
//! A channel called `name` is made of:
//!
//! | Object | Name |
//! |---|---|
//! | command stream | `{name}_commands` |
//! | observation history | `{name}_observations` |
//! | completed command ids | `{name}_completed` |
//! | ids waited on by `pulse_and_wait` | `{name}_waiting` |
//! | ids confirmed to `pulse_and_wait` | `{name}_confirmed` |
//! | first measured states of the executor | `{name}_initial` |
//! | burst rendezvous | `{name}_burst` |
//! | scalar segment | `{name}` |
//!
//! The executor [`bind`](SharedMemory::bind)s the channel, creating every
//! object, and [`clear_channel`](SharedMemory::clear_channel) releases them
//! all so the name can be bound again.

use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cadence_types::CadenceError;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::rendezvous::Rendezvous;
use crate::segment::Segment;
use crate::time_series::{RawSeries, TimeSeries};

/// Names of every object belonging to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub segment: String,
    pub commands: String,
    pub observations: String,
    pub completed: String,
    pub waiting: String,
    pub confirmed: String,
    pub initial: String,
    pub burst: String,
}

impl ChannelNames {
    pub fn new(channel: &str) -> Self {
        Self {
            segment: channel.to_string(),
            commands: format!("{channel}_commands"),
            observations: format!("{channel}_observations"),
            completed: format!("{channel}_completed"),
            waiting: format!("{channel}_waiting"),
            confirmed: format!("{channel}_confirmed"),
            initial: format!("{channel}_initial"),
            burst: format!("{channel}_burst"),
        }
    }

    fn series(&self) -> [&str; 6] {
        [
            &self.commands,
            &self.observations,
            &self.completed,
            &self.waiting,
            &self.confirmed,
            &self.initial,
        ]
    }
}

struct SeriesEntry {
    raw: Arc<RawSeries>,
    record: &'static str,
}

#[derive(Default)]
struct Registry {
    series: HashMap<String, SeriesEntry>,
    segments: HashMap<String, Arc<Segment>>,
    rendezvous: HashMap<String, Arc<Rendezvous>>,
    bound: HashSet<String>,
}

/// Shared namespace handle. Clone it cheaply – all clones see the same
/// objects.
#[derive(Clone, Default)]
pub struct SharedMemory {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("SharedMemory")
            .field("series", &registry.series.len())
            .field("segments", &registry.segments.len())
            .field("bound", &registry.bound)
            .finish()
    }
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or re-create, dropping previous records) the stream `name`.
    pub fn create_series<T>(&self, name: &str, capacity: usize) -> TimeSeries<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = Arc::new(RawSeries::new(name, capacity));
        self.registry.lock().series.insert(
            name.to_string(),
            SeriesEntry {
                raw: Arc::clone(&raw),
                record: type_name::<T>(),
            },
        );
        debug!(stream = name, capacity, "time series created");
        TimeSeries::from_raw(raw)
    }

    /// Open an existing stream.
    ///
    /// # Errors
    ///
    /// - [`CadenceError::ChannelNotFound`] if nothing created `name`.
    /// - [`CadenceError::Protocol`] if it was created for another record
    ///   type.
    pub fn open_series<T>(&self, name: &str) -> Result<TimeSeries<T>, CadenceError>
    where
        T: Serialize + DeserializeOwned,
    {
        let registry = self.registry.lock();
        let entry = registry
            .series
            .get(name)
            .ok_or_else(|| CadenceError::ChannelNotFound(name.to_string()))?;
        if entry.record != type_name::<T>() {
            return Err(CadenceError::Protocol(format!(
                "stream {name} holds {} records, not {}",
                entry.record,
                type_name::<T>()
            )));
        }
        Ok(TimeSeries::from_raw(Arc::clone(&entry.raw)))
    }

    /// The segment `name`, created empty on first use.
    pub fn segment(&self, name: &str) -> Arc<Segment> {
        let mut registry = self.registry.lock();
        Arc::clone(registry.segments.entry(name.to_string()).or_default())
    }

    /// The rendezvous `name`, created on first use.
    pub fn rendezvous(&self, name: &str) -> Arc<Rendezvous> {
        let mut registry = self.registry.lock();
        Arc::clone(registry.rendezvous.entry(name.to_string()).or_insert_with(Rendezvous::new))
    }

    /// Claim ownership of `channel`.
    ///
    /// # Errors
    ///
    /// [`CadenceError::ChannelBusy`] if an owner already holds it.
    pub fn bind(&self, channel: &str) -> Result<(), CadenceError> {
        let mut registry = self.registry.lock();
        if !registry.bound.insert(channel.to_string()) {
            return Err(CadenceError::ChannelBusy(channel.to_string()));
        }
        info!(channel, "channel bound");
        Ok(())
    }

    pub fn is_bound(&self, channel: &str) -> bool {
        self.registry.lock().bound.contains(channel)
    }

    /// Release every object of `channel` and its ownership. Handles that
    /// are still alive keep working on the released objects, but no new
    /// party can open them.
    pub fn clear_channel(&self, channel: &str) {
        let names = ChannelNames::new(channel);
        let mut registry = self.registry.lock();
        for series in names.series() {
            registry.series.remove(series);
        }
        registry.segments.remove(&names.segment);
        if let Some(rendezvous) = registry.rendezvous.remove(&names.burst) {
            rendezvous.leader().release();
        }
        registry.bound.remove(channel);
        info!(channel, "channel cleared");
    }
}
