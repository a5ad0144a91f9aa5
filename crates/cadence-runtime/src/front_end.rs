//! [`FrontEnd`] – the producer side of a channel.
//!
//! Commands are first buffered locally by [`add_command`](FrontEnd::add_command)
//! and only become visible to the executor on a flush, which every `pulse*`
//! and `burst*` method performs first. A flush is all or nothing: if the
//! shared command stream cannot take the whole batch, nothing is written.
//!
//! | Method | Waits for |
//! |---|---|
//! | [`pulse`](FrontEnd::pulse) | nothing |
//! | [`pulse_at`](FrontEnd::pulse_at) | an observation of a given iteration |
//! | [`pulse_and_wait`](FrontEnd::pulse_and_wait) | completion of the flushed commands |
//! | [`burst`](FrontEnd::burst) | `n` executor iterations (bursting executors only) |
//!
//! None of the waits can be cancelled. `pulse_at` and `pulse_and_wait` may
//! block forever: the former if the executor stops, the latter if a command
//! never completes. Wrap them in a timeout where that matters.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_channel::{ChannelNames, Leader, Segment, SharedMemory, TimeSeries, keys};
use cadence_control::State;
use cadence_types::{CadenceError, ChannelLayout, Command, CommandId, Index, Mode, Observation, Timing};
use tracing::{debug, instrument, warn};

use crate::back_end::ExtendedState;

const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Producer client of one channel.
pub struct FrontEnd<S: State, E: ExtendedState> {
    name: String,
    layout: ChannelLayout,
    segment: Arc<Segment>,
    commands: TimeSeries<Command<S>>,
    observations: TimeSeries<Observation<S, E>>,
    completed: TimeSeries<CommandId>,
    waiting: TimeSeries<CommandId>,
    confirmed: TimeSeries<CommandId>,
    initial: TimeSeries<Vec<S>>,
    leader: Leader,
    buffer: Vec<Command<S>>,
    /// Next index of the completed stream to drain.
    completed_cursor: Index,
    /// Drained completions nobody waited for yet.
    done: BTreeSet<CommandId>,
    /// Next observation returned by `wait_for_next`.
    next_observation: Index,
}

impl<S: State, E: ExtendedState> FrontEnd<S, E> {
    /// Attach to the channel `name`.
    ///
    /// # Errors
    ///
    /// [`CadenceError::ChannelNotFound`] unless a back end has bound it.
    pub fn new(memory: &SharedMemory, name: &str) -> Result<Self, CadenceError> {
        if !memory.is_bound(name) {
            return Err(CadenceError::ChannelNotFound(name.to_string()));
        }
        let names = ChannelNames::new(name);
        let segment = memory.segment(&names.segment);
        let layout = segment
            .layout()
            .ok_or_else(|| CadenceError::ChannelNotFound(name.to_string()))?;
        let completed: TimeSeries<CommandId> = memory.open_series(&names.completed)?;
        let observations: TimeSeries<Observation<S, E>> = memory.open_series(&names.observations)?;
        let completed_cursor = next_index(&completed);
        let next_observation = next_index(&observations);

        debug!(channel = name, ?layout, "front end attached");
        Ok(Self {
            name: name.to_string(),
            layout,
            commands: memory.open_series(&names.commands)?,
            waiting: memory.open_series(&names.waiting)?,
            confirmed: memory.open_series(&names.confirmed)?,
            initial: memory.open_series(&names.initial)?,
            leader: memory.rendezvous(&names.burst).leader(),
            segment,
            observations,
            completed,
            buffer: Vec::new(),
            completed_cursor,
            done: BTreeSet::new(),
            next_observation,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Whether the executor has started iterating.
    pub fn is_active(&self) -> bool {
        self.segment.flag(keys::ACTIVE)
    }

    /// Number of commands buffered and not flushed yet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Measured states of the executor's first iteration, `None` until it
    /// has run.
    pub fn initial_states(&self) -> Result<Option<Vec<S>>, CadenceError> {
        self.initial.newest_element()
    }

    /// Buffer a command for actuator `dof`. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`CadenceError::InvalidDof`] if the channel has no such actuator.
    /// - [`CadenceError::Protocol`] for a target or speed that is NaN or
    ///   infinite; such a command could not cross the medium.
    pub fn add_command(&mut self, dof: usize, target: S, timing: Timing, mode: Mode) -> Result<CommandId, CadenceError> {
        if dof >= self.layout.nb_actuators {
            return Err(CadenceError::InvalidDof {
                dof,
                nb_actuators: self.layout.nb_actuators,
            });
        }
        if !target.fields().iter().all(|v| v.is_finite()) {
            return Err(CadenceError::Protocol(format!(
                "{}: dof {dof} target {target:?} is not finite",
                self.name
            )));
        }
        if let Timing::Speed { units_per_us } = timing
            && !units_per_us.is_finite()
        {
            return Err(CadenceError::Protocol(format!(
                "{}: dof {dof} speed {units_per_us} is not finite",
                self.name
            )));
        }
        let id = self.segment.fetch_add(keys::COMMAND_ID, 1) as CommandId;
        let pulse_id = self.segment.get(keys::PULSE_ID) + 1;
        self.buffer.push(Command::new(id, pulse_id, dof, target, timing, mode));
        Ok(id)
    }

    /// Copy every buffered command to the shared stream and commit them as
    /// one batch. Returns the ids flushed (empty when nothing was buffered).
    ///
    /// # Errors
    ///
    /// [`CadenceError::Overflow`] if the batch exceeds the capacity of the
    /// channel or the free slots of the command stream; nothing is written
    /// and the buffer is kept.
    #[instrument(skip(self), fields(channel = %self.name, buffered = self.buffer.len()))]
    pub fn flush(&mut self) -> Result<Vec<CommandId>, CadenceError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }
        let requested = self.buffer.len();
        let capacity = self.layout.queue_size;
        if requested > capacity {
            return Err(CadenceError::Overflow {
                stream: format!("{} local buffer", self.name),
                requested,
                available: capacity,
            });
        }
        let newest = self.commands.newest().unwrap_or(-1);
        let read = self.segment.get_or(keys::COMMAND_READ, -1);
        let unread = (newest - read).max(0) as usize;
        let available = capacity.saturating_sub(unread);
        if requested > available {
            return Err(CadenceError::Overflow {
                stream: self.commands.name().to_string(),
                requested,
                available,
            });
        }

        let pulse_id = self.segment.get(keys::PULSE_ID) + 1;
        let mut ids = Vec::with_capacity(requested);
        for command in self.buffer.drain(..) {
            let command = command.with_pulse_id(pulse_id);
            self.commands.append(&command)?;
            ids.push(command.id());
        }
        self.segment.set(keys::PULSE_ID, pulse_id);
        debug!(pulse_id, flushed = ids.len(), "batch committed");
        Ok(ids)
    }

    /// Flush and return the latest observation without waiting.
    pub fn pulse(&mut self) -> Result<Observation<S, E>, CadenceError> {
        self.flush()?;
        self.read()
    }

    /// Flush, then wait (polling) until the executor has published
    /// iteration `iteration`, and return that observation. If the exact
    /// iteration was not published, the first later one is returned.
    pub fn pulse_at(&mut self, iteration: i64) -> Result<Observation<S, E>, CadenceError> {
        self.flush()?;
        loop {
            if let Some(newest) = self.observations.newest() {
                let observation = self.observations.get(newest)?;
                if observation.control_iteration() >= iteration {
                    return self.find_iteration(iteration, newest, observation);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Flush and wait until every flushed command has completed.
    ///
    /// Waited ids are recorded in the channel's `waiting` stream and each
    /// confirmation in its `confirmed` stream.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Protocol`] if nothing was buffered.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub fn pulse_and_wait(&mut self) -> Result<Observation<S, E>, CadenceError> {
        if self.buffer.is_empty() {
            return Err(CadenceError::Protocol(format!(
                "{}: pulse_and_wait without any buffered command",
                self.name
            )));
        }
        let ids = self.flush()?;
        for id in &ids {
            self.waiting.append(id)?;
        }
        let mut pending: HashSet<CommandId> = ids.into_iter().collect();
        self.wait_completed(&mut pending, None)?;
        self.read()
    }

    /// Wait until command `id` has completed. Returns `false` on timeout.
    pub fn wait_for_completion(&mut self, id: CommandId, timeout: Option<Duration>) -> Result<bool, CadenceError> {
        let mut pending = HashSet::from([id]);
        self.wait_completed(&mut pending, timeout.map(|t| Instant::now() + t))
    }

    /// Flush, then ask a bursting executor for `iterations` iterations and
    /// block until it has run them.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Protocol`] for a non-positive count or if the
    /// executor exits while bursting.
    #[instrument(skip(self), fields(channel = %self.name))]
    pub fn burst(&mut self, iterations: i64) -> Result<Observation<S, E>, CadenceError> {
        if iterations < 1 {
            return Err(CadenceError::Protocol(format!(
                "{}: cannot burst {iterations} iterations",
                self.name
            )));
        }
        self.flush()?;
        self.leader.pulse(iterations)?;
        self.read()
    }

    /// Flush, let a bursting executor run one last iteration, and wait for
    /// it to exit its loop.
    pub fn final_burst(&mut self) -> Result<Observation<S, E>, CadenceError> {
        self.flush()?;
        self.leader.final_pulse()?;
        self.read()
    }

    /// Ask the executor to cancel every running and queued command. Every
    /// cancelled command is reported completed.
    pub fn purge(&self) {
        self.segment.set_flag(keys::PURGE, true);
        debug!(channel = %self.name, "purge requested");
    }

    /// Latest observation, or a default one if nothing was published.
    pub fn read(&self) -> Result<Observation<S, E>, CadenceError> {
        Ok(self.observations.newest_element()?.unwrap_or_default())
    }

    /// Every stored observation from `index` on.
    pub fn observations_since(&self, index: Index) -> Result<Vec<Observation<S, E>>, CadenceError> {
        match self.observations.newest() {
            Some(newest) => self.observations.range(index, newest),
            None => Ok(Vec::new()),
        }
    }

    /// The `count` most recent observations, oldest first.
    pub fn latest_observations(&self, count: usize) -> Result<Vec<Observation<S, E>>, CadenceError> {
        match self.observations.newest() {
            Some(newest) => self.observations.range(newest - count as Index + 1, newest),
            None => Ok(Vec::new()),
        }
    }

    /// Next observation after the one returned by the previous call (the
    /// first call returns the first observation published after attaching
    /// or after [`reset_next_index`](Self::reset_next_index)). Never skips
    /// or repeats one, unless it was evicted before being read. Returns
    /// `None` on timeout.
    pub fn wait_for_next(&mut self, timeout: Option<Duration>) -> Result<Option<Observation<S, E>>, CadenceError> {
        if let Some(oldest) = self.observations.oldest()
            && self.next_observation < oldest
        {
            warn!(
                channel = %self.name,
                missed = oldest - self.next_observation,
                "observations evicted before being read"
            );
            self.next_observation = oldest;
        }
        if !self.observations.wait_for_index(self.next_observation, timeout) {
            return Ok(None);
        }
        let observation = self.observations.get(self.next_observation)?;
        self.next_observation += 1;
        Ok(Some(observation))
    }

    /// Make the next [`wait_for_next`](Self::wait_for_next) return the next
    /// observation to be published.
    pub fn reset_next_index(&mut self) {
        self.next_observation = next_index(&self.observations);
    }

    /// Drain the completed stream until `pending` is empty or `deadline`
    /// passes.
    fn wait_completed(&mut self, pending: &mut HashSet<CommandId>, deadline: Option<Instant>) -> Result<bool, CadenceError> {
        pending.retain(|id| !self.done.remove(id));
        loop {
            self.drain_completed(pending)?;
            if pending.is_empty() {
                return Ok(true);
            }
            let timeout = match deadline {
                None => POLL_INTERVAL,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
            };
            self.completed.wait_for_index(self.completed_cursor, Some(timeout));
        }
    }

    fn drain_completed(&mut self, pending: &mut HashSet<CommandId>) -> Result<(), CadenceError> {
        let Some(newest) = self.completed.newest() else {
            return Ok(());
        };
        while self.completed_cursor <= newest {
            let id = match self.completed.get(self.completed_cursor) {
                Ok(id) => id,
                Err(CadenceError::Evicted { oldest, .. }) => {
                    warn!(channel = %self.name, skipped = oldest - self.completed_cursor, "completions evicted before being read");
                    self.completed_cursor = oldest;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.completed_cursor += 1;
            if pending.remove(&id) {
                self.confirmed.append(&id)?;
            } else {
                self.done.insert(id);
            }
        }
        while self.done.len() > self.layout.queue_size {
            self.done.pop_first();
        }
        Ok(())
    }

    fn find_iteration(
        &self,
        iteration: i64,
        newest: Index,
        newest_observation: Observation<S, E>,
    ) -> Result<Observation<S, E>, CadenceError> {
        let oldest = self.observations.oldest().unwrap_or(newest);
        let mut found = newest_observation;
        let mut index = newest - 1;
        while index >= oldest {
            let observation = self.observations.get(index)?;
            if observation.control_iteration() < iteration {
                break;
            }
            found = observation;
            index -= 1;
        }
        Ok(found)
    }
}

fn next_index<T: serde::Serialize + serde::de::DeserializeOwned>(series: &TimeSeries<T>) -> Index {
    series.newest().map_or(0, |newest| newest + 1)
}
