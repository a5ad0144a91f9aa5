//! Per-actuator trajectory controller.
//!
//! A [`Controller`] owns the FIFO of commands sent to one actuator and the
//! status of the command it is running. Once per iteration the executor
//! calls [`Controller::tick`], which returns the desired state of the
//! actuator.
//!
//! Completed, cancelled and rejected commands are reported by pushing their
//! id into the `completed` sink handed to each call; the caller forwards
//! them to the completed-commands stream. A controller never blocks.

use std::collections::VecDeque;

use cadence_types::{Command, CommandId, Mode, TimePoint, Timing};
use tracing::{debug, trace};

use crate::command_status::CommandStatus;
use crate::state::State;

#[derive(Debug)]
struct Running<S> {
    command: Command<S>,
    status: CommandStatus<S>,
}

/// Command queue and trajectory generator of one actuator.
#[derive(Debug)]
pub struct Controller<S> {
    dof: usize,
    queue: VecDeque<Command<S>>,
    current: Option<Running<S>>,
    reapplied: bool,
}

impl<S: State> Controller<S> {
    pub fn new(dof: usize) -> Self {
        Self {
            dof,
            queue: VecDeque::new(),
            current: None,
            reapplied: true,
        }
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Queue `command`. An [`Mode::Overwrite`] command first cancels the
    /// running command and every queued one, reporting each as completed.
    pub fn enqueue(&mut self, command: Command<S>, completed: &mut Vec<CommandId>) {
        if command.mode() == Mode::Overwrite {
            self.purge(completed);
        }
        trace!(dof = self.dof, command_id = command.id(), "command queued");
        self.queue.push_back(command);
    }

    /// Drop the running command and every queued one, reporting each as
    /// completed.
    pub fn purge(&mut self, completed: &mut Vec<CommandId>) {
        if let Some(running) = self.current.take() {
            debug!(dof = self.dof, command_id = running.command.id(), "running command cancelled");
            completed.push(running.command.id());
        }
        for command in self.queue.drain(..) {
            completed.push(command.id());
        }
    }

    /// Desired state of the actuator at `iteration`.
    ///
    /// `previous_desired` is the desired state returned by the previous
    /// tick; on the very first tick it is `None` and `measured` takes its
    /// place. When no command runs, the anchor is returned unchanged and the
    /// tick counts as "reapplied".
    pub fn tick(
        &mut self,
        iteration: i64,
        measured: &S,
        previous_desired: Option<&S>,
        now: TimePoint,
        completed: &mut Vec<CommandId>,
    ) -> S {
        let anchor = previous_desired.unwrap_or(measured);

        if self.current.is_none() {
            self.activate_next(iteration, anchor, now, completed);
        }

        let Some(running) = self.current.as_mut() else {
            self.reapplied = true;
            return anchor.clone();
        };
        self.reapplied = false;

        let timing = *running.command.timing();
        if timing == Timing::Direct {
            running.status.set_direct_done();
            running.status.set_inactive();
            completed.push(running.command.id());
            let target = running.command.target().clone();
            self.current = None;
            return target;
        }

        let target = running.command.target();
        let desired = running.status.desired(target, &timing, iteration, now);
        if running.status.finished(target, &timing, iteration, now) {
            running.status.set_inactive();
            completed.push(running.command.id());
            trace!(dof = self.dof, command_id = running.command.id(), iteration, "command finished");
            self.current = None;
            // The next command starts from where this one ended, on this
            // same iteration.
            self.activate_next(iteration, &desired, now, completed);
        }
        desired
    }

    /// Whether the last tick had no command to run.
    pub fn reapplied(&self) -> bool {
        self.reapplied
    }

    /// Id of the running command.
    pub fn current_command_id(&self) -> Option<CommandId> {
        self.current.as_ref().map(|running| running.command.id())
    }

    /// Number of commands waiting behind the running one.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Pop queued commands until one initialises; degenerate ones are
    /// reported completed and skipped.
    fn activate_next(&mut self, iteration: i64, start: &S, now: TimePoint, completed: &mut Vec<CommandId>) {
        while let Some(command) = self.queue.pop_front() {
            let mut status = CommandStatus::new();
            if status.initialize(iteration, start.clone(), now, command.timing()) {
                status.set_active();
                trace!(dof = self.dof, command_id = command.id(), iteration, "command started");
                self.current = Some(Running { command, status });
                return;
            }
            debug!(dof = self.dof, %command, iteration, "degenerate command dropped");
            completed.push(command.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Scalar;

    fn command(id: CommandId, target: f64, timing: Timing, mode: Mode) -> Command<Scalar> {
        Command::new(id, 1, 0, Scalar(target), timing, mode)
    }

    /// Tick iterations `from..=to`, 1 ms apart, and return the desired value
    /// after each.
    fn run(controller: &mut Controller<Scalar>, from: i64, to: i64, last: &mut Scalar, completed: &mut Vec<CommandId>) -> Vec<f64> {
        let mut out = Vec::new();
        for iteration in from..=to {
            let now = TimePoint::from_micros(iteration * 1_000);
            *last = controller.tick(iteration, &Scalar(0.0), Some(&last.clone()), now, completed);
            out.push(last.0);
        }
        out
    }

    #[test]
    fn idle_controller_reapplies() {
        let mut controller = Controller::<Scalar>::new(0);
        let mut completed = Vec::new();
        let desired = controller.tick(1, &Scalar(3.0), None, TimePoint::from_micros(0), &mut completed);
        assert_eq!(desired, Scalar(3.0));
        assert!(controller.reapplied());
        let desired = controller.tick(2, &Scalar(9.0), Some(&Scalar(4.0)), TimePoint::from_micros(0), &mut completed);
        assert_eq!(desired, Scalar(4.0));
        assert!(completed.is_empty());
    }

    #[test]
    fn queued_commands_run_in_order() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        controller.enqueue(command(1, 100.0, Timing::iteration(100), Mode::Queue), &mut completed);
        controller.enqueue(command(2, 200.0, Timing::iteration(200), Mode::Queue), &mut completed);
        assert_eq!(controller.queue_len(), 2);

        let mut last = Scalar(0.0);
        let values = run(&mut controller, 1, 250, &mut last, &mut completed);
        assert!(values[49] > 0.0 && values[49] < 100.0);
        assert!(values[149] > 100.0 && values[149] < 200.0);
        assert_eq!(values[249], 200.0);
        assert_eq!(completed, vec![1, 2]);
        assert!(controller.reapplied());
    }

    #[test]
    fn overwrite_cancels_everything_pending() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        controller.enqueue(command(1, 100.0, Timing::iteration(100), Mode::Queue), &mut completed);
        controller.enqueue(command(2, 300.0, Timing::iteration(300), Mode::Queue), &mut completed);
        let mut last = Scalar(0.0);
        run(&mut controller, 1, 10, &mut last, &mut completed);
        assert_eq!(controller.current_command_id(), Some(1));

        controller.enqueue(command(3, 500.0, Timing::Direct, Mode::Overwrite), &mut completed);
        assert_eq!(completed, vec![1, 2]);
        let values = run(&mut controller, 11, 12, &mut last, &mut completed);
        assert_eq!(values, vec![500.0, 500.0]);
        assert_eq!(completed, vec![1, 2, 3]);
    }

    #[test]
    fn direct_command_lasts_one_tick() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        controller.enqueue(command(1, 7.0, Timing::Direct, Mode::Queue), &mut completed);
        let now = TimePoint::from_micros(0);
        assert_eq!(controller.tick(1, &Scalar(0.0), None, now, &mut completed), Scalar(7.0));
        assert!(!controller.reapplied());
        assert_eq!(completed, vec![1]);
        assert_eq!(controller.current_command_id(), None);
        assert_eq!(controller.tick(2, &Scalar(0.0), Some(&Scalar(7.0)), now, &mut completed), Scalar(7.0));
        assert!(controller.reapplied());
    }

    #[test]
    fn degenerate_command_is_skipped_for_the_next_one() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        controller.enqueue(command(1, 5.0, Timing::Speed { units_per_us: 0.0 }, Mode::Queue), &mut completed);
        controller.enqueue(command(2, 9.0, Timing::Direct, Mode::Queue), &mut completed);
        let desired = controller.tick(1, &Scalar(0.0), None, TimePoint::from_micros(0), &mut completed);
        assert_eq!(desired, Scalar(9.0));
        assert_eq!(completed, vec![1, 2]);
    }

    #[test]
    fn speed_finishes_within_one_period() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        // 10 units at 0.001 unit/µs → 10 ms; ticks are 1 ms apart.
        controller.enqueue(command(1, 10.0, Timing::Speed { units_per_us: 0.001 }, Mode::Queue), &mut completed);
        let mut last = Scalar(0.0);
        let mut finished_at = None;
        for iteration in 1..=30 {
            let now = TimePoint::from_micros(iteration * 1_000);
            last = controller.tick(iteration, &Scalar(0.0), Some(&last), now, &mut completed);
            if finished_at.is_none() && !completed.is_empty() {
                finished_at = Some(iteration);
            }
        }
        // started at iteration 1, so done 10 iterations later
        assert_eq!(finished_at, Some(11));
        assert_eq!(last, Scalar(10.0));
    }

    #[test]
    fn purge_reports_every_command() {
        let mut controller = Controller::new(0);
        let mut completed = Vec::new();
        controller.enqueue(command(1, 1.0, Timing::iteration(1_000), Mode::Queue), &mut completed);
        controller.enqueue(command(2, 2.0, Timing::iteration(2_000), Mode::Queue), &mut completed);
        controller.tick(1, &Scalar(0.0), None, TimePoint::from_micros(0), &mut completed);
        controller.purge(&mut completed);
        assert_eq!(completed, vec![1, 2]);
        assert_eq!(controller.queue_len(), 0);
        assert_eq!(controller.current_command_id(), None);
    }
}
