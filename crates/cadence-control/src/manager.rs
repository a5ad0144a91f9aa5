//! Fan-out of the shared command stream to per-actuator controllers.
//!
//! [`ControllersManager`] keeps a single read cursor into the command
//! stream. On every [`process`](ControllersManager::process) it reads the
//! commands appended since the last call, but only those belonging to a
//! producer batch that has been committed (its `pulse_id` is not above the
//! shared pulse marker), so a batch is never executed half-written.
//!
//! The cursor is mirrored to the segment key
//! [`command_read`](cadence_channel::keys::COMMAND_READ) so producers can
//! compute how many free slots the command stream has.
//!
//! ```text
//!  commands:  [ c0 c1 c2 | c3 c4 ]      pulse marker = 2
//!               pulse 1,2  pulse 3      → c0..c2 dispatched, cursor = 2
//! ```

use std::sync::Arc;

use cadence_channel::{Segment, TimeSeries, keys};
use cadence_types::{CadenceError, Command, CommandId, Index, TimePoint, Timing};
use tracing::{debug, trace, warn};

use crate::controller::Controller;
use crate::state::State;

/// Owner of every [`Controller`] of a channel.
pub struct ControllersManager<S: State> {
    controllers: Vec<Controller<S>>,
    previous_desired: Vec<Option<S>>,
    commands: TimeSeries<Command<S>>,
    completed: TimeSeries<CommandId>,
    segment: Arc<Segment>,
    /// Index of the last command read, `-1` before the first one.
    last_read: Index,
    /// Last committed pulse already processed.
    pulse_id: i64,
    relative_origin: i64,
    outbox: Vec<CommandId>,
}

impl<S: State> ControllersManager<S> {
    /// Manager for `nb_actuators` actuators reading `commands` and reporting
    /// to `completed`. Resets the read cursor and pulse marker in `segment`.
    pub fn new(
        nb_actuators: usize,
        commands: TimeSeries<Command<S>>,
        completed: TimeSeries<CommandId>,
        segment: Arc<Segment>,
    ) -> Self {
        segment.set(keys::PULSE_ID, 0);
        segment.set(keys::COMMAND_READ, -1);
        Self {
            controllers: (0..nb_actuators).map(Controller::new).collect(),
            previous_desired: vec![None; nb_actuators],
            commands,
            completed,
            segment,
            last_read: -1,
            pulse_id: 0,
            relative_origin: 0,
            outbox: Vec::new(),
        }
    }

    pub fn nb_actuators(&self) -> usize {
        self.controllers.len()
    }

    /// Index of the last command read from the stream (`-1` for none).
    pub fn last_read_index(&self) -> Index {
        self.last_read
    }

    /// Dispatch every newly committed command. Returns how many were read.
    ///
    /// Faulty commands are logged, skipped, and left pending for
    /// [`report_completed`](Self::report_completed); this never fails.
    pub fn process(&mut self, iteration: i64) -> usize {
        let committed = self.segment.get(keys::PULSE_ID);
        if committed == self.pulse_id {
            return 0;
        }
        let Some(newest) = self.commands.newest() else {
            return 0;
        };

        let mut read = 0;
        let mut index = self.last_read + 1;
        while index <= newest {
            let command = match self.commands.get(index) {
                Ok(command) => command,
                Err(CadenceError::Evicted { oldest, .. }) => {
                    warn!(index, oldest, "unread commands were evicted");
                    index = oldest;
                    continue;
                }
                Err(e) => {
                    warn!(index, error = %e, "unreadable command skipped");
                    self.last_read = index;
                    index += 1;
                    continue;
                }
            };
            if command.pulse_id() > committed {
                break;
            }
            let id = command.id();
            if let Err(e) = self.dispatch(command, iteration) {
                warn!(command_id = id, error = %e, "command rejected");
                self.outbox.push(id);
            }
            self.last_read = index;
            read += 1;
            index += 1;
        }

        self.pulse_id = committed;
        self.segment.set(keys::COMMAND_READ, self.last_read);
        if read > 0 {
            debug!(iteration, read, last_read = self.last_read, "commands dispatched");
        }
        read
    }

    /// Resolve relative iterations of `command` and queue it on its
    /// actuator.
    ///
    /// # Errors
    ///
    /// [`CadenceError::InvalidDof`] if the command targets an actuator the
    /// channel does not have.
    pub fn dispatch(&mut self, command: Command<S>, iteration: i64) -> Result<(), CadenceError> {
        let command = match *command.timing() {
            Timing::Iteration { value, relative, reset } => {
                if reset {
                    self.relative_origin = iteration;
                }
                if relative {
                    command.with_timing(Timing::iteration(value + self.relative_origin))
                } else {
                    command
                }
            }
            _ => command,
        };
        let nb_actuators = self.controllers.len();
        let controller = self
            .controllers
            .get_mut(command.dof())
            .ok_or(CadenceError::InvalidDof {
                dof: command.dof(),
                nb_actuators,
            })?;
        trace!(%command, "dispatching");
        controller.enqueue(command, &mut self.outbox);
        Ok(())
    }

    /// Desired states of every actuator, `measured` giving one state per
    /// actuator. Missing measurements fall back to the default state.
    pub fn desired_states(&mut self, iteration: i64, now: TimePoint, measured: &[S]) -> Vec<S> {
        let fallback = S::default();
        for (dof, controller) in self.controllers.iter_mut().enumerate() {
            let measured = measured.get(dof).unwrap_or(&fallback);
            let desired = controller.tick(
                iteration,
                measured,
                self.previous_desired[dof].as_ref(),
                now,
                &mut self.outbox,
            );
            self.previous_desired[dof] = Some(desired);
        }
        self.previous_desired
            .iter()
            .map(|desired| desired.clone().unwrap_or_default())
            .collect()
    }

    /// True if no actuator had a command to run on the last tick.
    pub fn reapplied(&self) -> bool {
        self.controllers.iter().all(Controller::reapplied)
    }

    /// Cancel every running and queued command of every actuator.
    pub fn purge(&mut self) {
        for controller in &mut self.controllers {
            controller.purge(&mut self.outbox);
        }
        debug!(cancelled = self.outbox.len(), "controllers purged");
    }

    pub fn current_command_id(&self, dof: usize) -> Result<Option<CommandId>, CadenceError> {
        self.controller(dof).map(Controller::current_command_id)
    }

    pub fn queue_len(&self, dof: usize) -> Result<usize, CadenceError> {
        self.controller(dof).map(Controller::queue_len)
    }

    fn controller(&self, dof: usize) -> Result<&Controller<S>, CadenceError> {
        self.controllers.get(dof).ok_or(CadenceError::InvalidDof {
            dof,
            nb_actuators: self.controllers.len(),
        })
    }

    /// Ids completed, cancelled or rejected since the last call and not
    /// reported yet.
    pub fn pending_completions(&self) -> &[CommandId] {
        &self.outbox
    }

    /// Append every pending completion to the completed stream. The
    /// executor calls this once the observation of the iteration is out,
    /// so a producer woken by a completion always finds it published.
    pub fn report_completed(&mut self) {
        for id in self.outbox.drain(..) {
            if let Err(e) = self.completed.append(&id) {
                warn!(command_id = id, error = %e, "could not report completed command");
            }
        }
    }
}
