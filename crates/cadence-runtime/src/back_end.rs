//! [`BackEnd`] – the executor side of a channel.
//!
//! The back end binds a channel, owns its streams, and turns one control
//! iteration into a single [`pulse`](BackEnd::pulse):
//!
//! 1. honour a pending purge request,
//! 2. dispatch newly committed commands to the controllers,
//! 3. compute one desired state per actuator,
//! 4. publish an [`Observation`] (unless the iteration was a no-op and the
//!    [`ObservationPolicy`] suppresses those),
//! 5. report the commands completed on this iteration,
//! 6. return the desired states for the hardware layer.
//!
//! Completions are reported after the observation, so a producer woken by
//! a completion reads an observation that already reflects it.
//!
//! Dropping the back end releases every object of the channel so another
//! executor can bind the same name.

use std::fmt::Debug;
use std::sync::Arc;

use cadence_channel::{ChannelNames, Segment, SharedMemory, TimeSeries, keys};
use cadence_control::{ControllersManager, State};
use cadence_types::{CadenceError, ChannelLayout, Command, CommandId, Observation, TimePoint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, trace, warn};

use crate::frequency::FrequencyMeasure;

/// Executor-defined telemetry published with every observation.
pub trait ExtendedState: Clone + Debug + Default + Serialize + DeserializeOwned + Send + 'static {}

impl<T> ExtendedState for T where T: Clone + Debug + Default + Serialize + DeserializeOwned + Send + 'static {}

/// What to do with iterations on which no actuator had a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationPolicy {
    /// Publish an observation for no-op iterations too.
    pub publish_reapplied: bool,
    /// Count no-op iterations in `sensor_iteration`.
    pub sensor_counts_reapplied: bool,
}

impl Default for ObservationPolicy {
    fn default() -> Self {
        Self {
            publish_reapplied: true,
            sensor_counts_reapplied: true,
        }
    }
}

/// Executor orchestrator of one channel.
pub struct BackEnd<S: State, E: ExtendedState> {
    memory: SharedMemory,
    name: String,
    layout: ChannelLayout,
    policy: ObservationPolicy,
    segment: Arc<Segment>,
    manager: ControllersManager<S>,
    observations: TimeSeries<Observation<S, E>>,
    initial_series: TimeSeries<Vec<S>>,
    initial: Option<Vec<S>>,
    frequency: FrequencyMeasure,
    iteration: i64,
    sensor_iteration: i64,
    desired: Vec<S>,
    running: bool,
}

impl<S: State, E: ExtendedState> BackEnd<S, E> {
    /// Bind `name` in `memory` and create every stream of the channel.
    ///
    /// # Errors
    ///
    /// [`CadenceError::ChannelBusy`] if another back end holds the channel,
    /// [`CadenceError::Config`] for a layout without actuators or capacity.
    #[instrument(skip_all, fields(channel = name))]
    pub fn new(
        memory: &SharedMemory,
        name: &str,
        layout: ChannelLayout,
        policy: ObservationPolicy,
    ) -> Result<Self, CadenceError> {
        if layout.queue_size == 0 || layout.nb_actuators == 0 {
            return Err(CadenceError::Config(format!(
                "channel {name} needs a positive queue size and actuator count, got {layout:?}"
            )));
        }
        memory.bind(name)?;

        let names = ChannelNames::new(name);
        let segment = memory.segment(&names.segment);
        let commands = memory.create_series::<Command<S>>(&names.commands, layout.queue_size);
        let completed = memory.create_series::<CommandId>(&names.completed, layout.queue_size);
        let observations = memory.create_series(&names.observations, layout.queue_size);
        memory.create_series::<CommandId>(&names.waiting, layout.queue_size);
        memory.create_series::<CommandId>(&names.confirmed, layout.queue_size);
        let initial_series = memory.create_series::<Vec<S>>(&names.initial, 1);
        memory.rendezvous(&names.burst);

        segment.set_layout(layout);
        segment.set_flag(keys::ACTIVE, false);
        segment.set_flag(keys::PURGE, false);
        let manager = ControllersManager::new(layout.nb_actuators, commands, completed, Arc::clone(&segment));

        info!(
            channel = name,
            queue_size = layout.queue_size,
            nb_actuators = layout.nb_actuators,
            "back end ready"
        );
        Ok(Self {
            memory: memory.clone(),
            name: name.to_string(),
            layout,
            policy,
            segment,
            manager,
            observations,
            initial_series,
            initial: None,
            frequency: FrequencyMeasure::new(),
            iteration: 0,
            sensor_iteration: 0,
            desired: Vec::new(),
            running: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Run one control iteration.
    ///
    /// `measured` holds one state per actuator. `iteration` overrides the
    /// internal counter (for replay); without it the counter is incremented,
    /// so the first iteration is `1`. Command-level faults are logged and
    /// never make this fail.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Protocol`] if `measured` does not have one state per
    /// actuator.
    pub fn pulse(
        &mut self,
        now: TimePoint,
        measured: &[S],
        extended: E,
        iteration: Option<i64>,
    ) -> Result<&[S], CadenceError> {
        if measured.len() != self.layout.nb_actuators {
            return Err(CadenceError::Protocol(format!(
                "{}: {} measured states for {} actuators",
                self.name,
                measured.len(),
                self.layout.nb_actuators
            )));
        }
        if !self.running {
            self.running = true;
            if let Err(e) = self.initial_series.append(&measured.to_vec()) {
                warn!(channel = %self.name, error = %e, "initial states not published");
            }
            self.initial = Some(measured.to_vec());
            self.segment.set_flag(keys::ACTIVE, true);
            info!(channel = %self.name, "back end running");
        }

        let iteration = iteration.unwrap_or(self.iteration + 1);

        if self.segment.take_flag(keys::PURGE) {
            info!(channel = %self.name, iteration, "purge requested");
            self.manager.purge();
        }
        self.manager.process(iteration);
        let desired = self.manager.desired_states(iteration, now, measured);
        let reapplied = self.manager.reapplied();
        let frequency = self.frequency.tick();

        if !reapplied || self.policy.sensor_counts_reapplied {
            self.sensor_iteration += 1;
        }
        if !reapplied || self.policy.publish_reapplied {
            let observation = Observation::new(
                measured.to_vec(),
                desired.clone(),
                extended,
                iteration,
                self.sensor_iteration,
                now,
                frequency,
            );
            if let Err(e) = self.observations.append(&observation) {
                warn!(channel = %self.name, iteration, error = %e, "observation not published");
            }
        }
        self.manager.report_completed();
        trace!(channel = %self.name, iteration, reapplied, "pulse");

        self.iteration = iteration;
        self.desired = desired;
        Ok(&self.desired)
    }

    /// Last iteration run, `0` before the first pulse.
    pub fn iteration(&self) -> i64 {
        self.iteration
    }

    /// Whether [`pulse`](Self::pulse) was called at least once.
    pub fn is_active(&self) -> bool {
        self.running
    }

    /// Whether a producer asked for a purge not yet honoured.
    pub fn purge_requested(&self) -> bool {
        self.segment.flag(keys::PURGE)
    }

    /// Measured states of the first pulse, `None` before it.
    pub fn initial_states(&self) -> Option<&[S]> {
        self.initial.as_deref()
    }

    /// Desired states returned by the last pulse.
    pub fn desired_states(&self) -> &[S] {
        &self.desired
    }

    pub fn current_command_id(&self, dof: usize) -> Result<Option<CommandId>, CadenceError> {
        self.manager.current_command_id(dof)
    }

    pub fn queue_len(&self, dof: usize) -> Result<usize, CadenceError> {
        self.manager.queue_len(dof)
    }

    /// The scalar segment of the channel.
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl<S: State, E: ExtendedState> Drop for BackEnd<S, E> {
    fn drop(&mut self) {
        self.segment.set_flag(keys::ACTIVE, false);
        self.memory.clear_channel(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_control::Scalar;
    use cadence_types::{Mode, NoExtendedState, Timing};

    type TestBackEnd = BackEnd<Scalar, NoExtendedState>;

    fn now(iteration: i64) -> TimePoint {
        TimePoint::from_micros(iteration * 1_000)
    }

    fn observations(memory: &SharedMemory, channel: &str) -> Vec<Observation<Scalar, NoExtendedState>> {
        memory
            .open_series(&ChannelNames::new(channel).observations)
            .and_then(|series: TimeSeries<Observation<Scalar, NoExtendedState>>| series.range(0, i64::MAX))
            .unwrap_or_default()
    }

    #[test]
    fn binding_twice_is_busy_until_drop() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let layout = ChannelLayout::new(100, 2);
        let first = TestBackEnd::new(&memory, "busy", layout, ObservationPolicy::default())?;
        assert!(matches!(
            TestBackEnd::new(&memory, "busy", layout, ObservationPolicy::default()),
            Err(CadenceError::ChannelBusy(_))
        ));
        drop(first);
        let _second = TestBackEnd::new(&memory, "busy", layout, ObservationPolicy::default())?;
        Ok(())
    }

    #[test]
    fn empty_layout_is_rejected() {
        let memory = SharedMemory::new();
        assert!(matches!(
            TestBackEnd::new(&memory, "empty", ChannelLayout::new(10, 0), ObservationPolicy::default()),
            Err(CadenceError::Config(_))
        ));
        assert!(!memory.is_bound("empty"));
    }

    #[test]
    fn iterations_start_at_one_and_are_published() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "it", ChannelLayout::new(100, 1), ObservationPolicy::default())?;
        assert_eq!(back_end.initial_states(), None);
        for i in 1..=3 {
            let desired = back_end.pulse(now(i), &[Scalar(2.0)], NoExtendedState, None)?;
            assert_eq!(desired, &[Scalar(2.0)]);
        }
        assert!(back_end.is_active());
        assert_eq!(back_end.iteration(), 3);
        let published = observations(&memory, "it");
        let iterations: Vec<i64> = published.iter().map(|o| o.control_iteration()).collect();
        assert_eq!(iterations, vec![1, 2, 3]);
        assert_eq!(published[2].sensor_iteration(), 3);
        Ok(())
    }

    #[test]
    fn initial_states_are_the_first_measured_ones() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "init", ChannelLayout::new(100, 2), ObservationPolicy::default())?;
        let published: TimeSeries<Vec<Scalar>> = memory.open_series(&ChannelNames::new("init").initial)?;
        assert!(published.newest_element()?.is_none());

        back_end.pulse(now(1), &[Scalar(1.5), Scalar(-2.0)], NoExtendedState, None)?;
        back_end.pulse(now(2), &[Scalar(7.0), Scalar(8.0)], NoExtendedState, None)?;
        assert_eq!(back_end.initial_states(), Some(&[Scalar(1.5), Scalar(-2.0)][..]));
        assert_eq!(published.newest_element()?, Some(vec![Scalar(1.5), Scalar(-2.0)]));
        assert_eq!(published.len(), 1);
        Ok(())
    }

    #[test]
    fn completions_follow_the_observation() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "order", ChannelLayout::new(100, 1), ObservationPolicy::default())?;
        let names = ChannelNames::new("order");
        let commands: TimeSeries<Command<Scalar>> = memory.open_series(&names.commands)?;
        let completed: TimeSeries<CommandId> = memory.open_series(&names.completed)?;
        commands.append(&Command::new(1, 1, 0, Scalar(7.0), Timing::Direct, Mode::Queue))?;
        back_end.segment().set(keys::PULSE_ID, 1);

        back_end.pulse(now(1), &[Scalar(0.0)], NoExtendedState, None)?;
        assert_eq!(completed.range(0, 10)?, vec![1]);
        let published = observations(&memory, "order");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].desired_states(), &[Scalar(7.0)]);
        Ok(())
    }

    #[test]
    fn reapplied_iterations_can_be_suppressed() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let policy = ObservationPolicy {
            publish_reapplied: false,
            sensor_counts_reapplied: false,
        };
        let mut back_end = TestBackEnd::new(&memory, "quiet", ChannelLayout::new(100, 1), policy)?;
        back_end.pulse(now(1), &[Scalar(0.0)], NoExtendedState, None)?;
        assert!(observations(&memory, "quiet").is_empty());

        let names = ChannelNames::new("quiet");
        let commands: TimeSeries<Command<Scalar>> = memory.open_series(&names.commands)?;
        commands.append(&Command::new(1, 1, 0, Scalar(4.0), Timing::iteration(4), Mode::Queue))?;
        back_end.segment().set(keys::PULSE_ID, 1);
        for i in 2..=8 {
            back_end.pulse(now(i), &[Scalar(0.0)], NoExtendedState, None)?;
        }
        let published = observations(&memory, "quiet");
        // iterations 2, 3, 4 and 5 (the one that completes the command)
        let iterations: Vec<i64> = published.iter().map(|o| o.control_iteration()).collect();
        assert_eq!(iterations, vec![2, 3, 4, 5]);
        let sensor: Vec<i64> = published.iter().map(|o| o.sensor_iteration()).collect();
        assert_eq!(sensor, vec![1, 2, 3, 4]);
        assert_eq!(published[3].desired_states(), &[Scalar(4.0)]);
        Ok(())
    }

    #[test]
    fn external_iteration_is_used() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "ext", ChannelLayout::new(100, 1), ObservationPolicy::default())?;
        back_end.pulse(now(0), &[Scalar(0.0)], NoExtendedState, Some(40))?;
        back_end.pulse(now(1), &[Scalar(0.0)], NoExtendedState, None)?;
        assert_eq!(back_end.iteration(), 41);
        Ok(())
    }

    #[test]
    fn purge_flag_is_honoured_once() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "purge", ChannelLayout::new(100, 1), ObservationPolicy::default())?;
        let names = ChannelNames::new("purge");
        let commands: TimeSeries<Command<Scalar>> = memory.open_series(&names.commands)?;
        commands.append(&Command::new(1, 1, 0, Scalar(9.0), Timing::iteration(1_000), Mode::Queue))?;
        back_end.segment().set(keys::PULSE_ID, 1);
        back_end.pulse(now(1), &[Scalar(0.0)], NoExtendedState, None)?;
        assert_eq!(back_end.current_command_id(0)?, Some(1));

        back_end.segment().set_flag(keys::PURGE, true);
        assert!(back_end.purge_requested());
        back_end.pulse(now(2), &[Scalar(0.0)], NoExtendedState, None)?;
        assert!(!back_end.purge_requested());
        assert_eq!(back_end.current_command_id(0)?, None);

        let completed: TimeSeries<CommandId> = memory.open_series(&names.completed)?;
        assert_eq!(completed.range(0, 10)?, vec![1]);
        Ok(())
    }

    #[test]
    fn wrong_measured_length_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut back_end = TestBackEnd::new(&memory, "len", ChannelLayout::new(100, 2), ObservationPolicy::default())?;
        assert!(matches!(
            back_end.pulse(now(1), &[Scalar(0.0)], NoExtendedState, None),
            Err(CadenceError::Protocol(_))
        ));
        Ok(())
    }
}
