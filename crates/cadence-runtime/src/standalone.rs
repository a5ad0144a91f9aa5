//! Standalone executor: a [`Driver`] coupled with a [`BackEnd`], spinning on
//! its own thread.
//!
//! A standalone either runs paced at a fixed frequency or, when bursting,
//! waits for producers to request iterations. While bursting, time does not
//! come from the wall clock: a virtual clock advances by one nominal period
//! per iteration, so duration and speed commands see consistent elapsed
//! times however fast the burst actually runs. When bursting is turned off
//! the clock resumes from the virtual time at wall-clock pace; it never
//! goes back.
//!
//! [`start_standalone`] returns a [`StandaloneHandle`]; there is no global
//! registry of running standalones.
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_channel::SharedMemory;
//! use cadence_control::Scalar;
//! use cadence_runtime::{SimDriver, StandaloneConfig, start_standalone};
//!
//! let memory = SharedMemory::new();
//! let driver = SimDriver::<Scalar>::new(2, 0.5);
//! let mut handle = start_standalone(&memory, "arm", driver, StandaloneConfig::default())?;
//! // ... attach FrontEnds to "arm" ...
//! handle.stop()?;
//! # Ok::<(), cadence_types::CadenceError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence_channel::{ChannelNames, Segment, SharedMemory, keys};
use cadence_types::{CadenceError, ChannelLayout, TimePoint};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::back_end::{BackEnd, ObservationPolicy};
use crate::burster::{Burster, Step};
use crate::driver::Driver;
use crate::frequency::{FrequencyManager, period_of};

/// How a standalone runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandaloneConfig {
    pub layout: ChannelLayout,
    /// Loop frequency; while bursting, the virtual clock advances by
    /// `1 / frequency_hz` per iteration.
    pub frequency_hz: f64,
    pub bursting: bool,
    pub policy: ObservationPolicy,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            layout: ChannelLayout::new(5_000, 2),
            frequency_hz: 1_000.0,
            bursting: false,
            policy: ObservationPolicy::default(),
        }
    }
}

/// Driver plus back end of one channel.
pub struct Standalone<D: Driver> {
    driver: D,
    back_end: BackEnd<D::State, D::Extended>,
    segment: Arc<Segment>,
    burster: Option<Burster>,
    pacer: FrequencyManager,
    period: Duration,
    now: TimePoint,
    /// Virtual minus wall time, in µs, as of the last burst.
    offset_us: i64,
    started: bool,
}

impl<D: Driver> Standalone<D> {
    /// Bind `channel` for `driver`.
    ///
    /// # Errors
    ///
    /// [`CadenceError::ChannelBusy`] if the channel is bound already,
    /// [`CadenceError::Config`] for an invalid frequency or layout.
    pub fn new(memory: &SharedMemory, channel: &str, driver: D, config: StandaloneConfig) -> Result<Self, CadenceError> {
        let period = period_of(config.frequency_hz)?;
        let pacer = FrequencyManager::new(config.frequency_hz)?;
        let back_end = BackEnd::new(memory, channel, config.layout, config.policy)?;
        let segment = Arc::clone(back_end.segment());
        segment.set_flag(keys::SHOULD_STOP, false);
        let burster = config.bursting.then(|| Burster::new(memory, channel));
        Ok(Self {
            driver,
            back_end,
            segment,
            burster,
            pacer,
            period,
            now: TimePoint::now(),
            offset_us: 0,
            started: false,
        })
    }

    pub fn back_end(&self) -> &BackEnd<D::State, D::Extended> {
        &self.back_end
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Start the driver.
    pub fn start(&mut self) -> Result<(), CadenceError> {
        if self.started {
            return Err(CadenceError::Protocol(format!(
                "standalone {} started twice",
                self.back_end.name()
            )));
        }
        self.driver.start()?;
        self.pacer.reset();
        self.now = TimePoint::now();
        self.offset_us = 0;
        self.started = true;
        info!(channel = %self.back_end.name(), bursting = self.burster.is_some(), "standalone started");
        Ok(())
    }

    /// Stop the driver. Idempotent.
    pub fn stop(&mut self) -> Result<(), CadenceError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.driver.stop()?;
        info!(channel = %self.back_end.name(), iteration = self.back_end.iteration(), "standalone stopped");
        Ok(())
    }

    /// One executor iteration at `now`: read the driver, pulse the back end,
    /// apply the desired states. Returns `false` once a stop was requested.
    pub fn iterate(&mut self, now: TimePoint) -> Result<bool, CadenceError> {
        let (measured, extended) = self.driver.get()?;
        let desired = self.back_end.pulse(now, &measured, extended, None)?;
        self.driver.set(desired)?;
        Ok(!self.segment.flag(keys::SHOULD_STOP))
    }

    /// Run until there is nothing left to do for this step: one paced
    /// iteration when free-running, a whole burst when bursting. Returns
    /// `false` when the standalone should exit.
    pub fn spin(&mut self) -> Result<bool, CadenceError> {
        let step = match &self.burster {
            Some(burster) => burster.next(),
            None if self.segment.flag(keys::SHOULD_STOP) => Step::Stop,
            None => Step::FreeRun,
        };
        match step {
            Step::FreeRun => {
                let keep_going = self.iterate(self.now)?;
                self.pacer.wait();
                self.now = self.clock();
                Ok(keep_going)
            }
            Step::Burst { generation, count } => {
                let mut keep_going = true;
                for _ in 0..count {
                    keep_going = self.iterate(self.now)?;
                    self.now += self.period;
                    if !keep_going {
                        break;
                    }
                }
                self.offset_us = self.now.micros_since(TimePoint::now());
                self.complete(generation);
                self.pacer.reset();
                Ok(keep_going)
            }
            Step::Final { generation } => {
                self.iterate(self.now)?;
                self.complete(generation);
                Ok(false)
            }
            Step::Stop => Ok(false),
        }
    }

    /// Start, spin until asked to stop, then stop.
    pub fn run(&mut self) -> Result<(), CadenceError> {
        self.start()?;
        let result = loop {
            match self.spin() {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let stopped = self.stop();
        result.and(stopped)
    }

    /// Wall-clock time shifted onto the virtual timeline.
    fn clock(&self) -> TimePoint {
        TimePoint::from_micros(TimePoint::now().as_micros() + self.offset_us)
    }

    fn complete(&self, generation: u64) {
        if let Some(burster) = &self.burster {
            burster.complete(generation);
        }
    }
}

/// Ask the standalone of `channel` to exit, releasing it if it is blocked
/// waiting for a burst. No-op for an unbound channel.
pub fn please_stop(memory: &SharedMemory, channel: &str) {
    if !memory.is_bound(channel) {
        return;
    }
    let names = ChannelNames::new(channel);
    memory.segment(&names.segment).set_flag(keys::SHOULD_STOP, true);
    memory.rendezvous(&names.burst).leader().release();
}

/// Handle on a standalone running on its own thread.
pub struct StandaloneHandle {
    memory: SharedMemory,
    channel: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), CadenceError>>>,
}

impl StandaloneHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request the standalone to exit and wait for it.
    pub fn stop(&mut self) -> Result<(), CadenceError> {
        please_stop(&self.memory, &self.channel);
        self.wait()
    }

    /// Wait for the standalone to exit on its own (e.g. after a final
    /// burst).
    pub fn join(mut self) -> Result<(), CadenceError> {
        self.wait()
    }

    fn wait(&mut self) -> Result<(), CadenceError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CadenceError::Driver(format!("standalone {} panicked", self.channel)))?,
            None => Ok(()),
        }
    }
}

impl Drop for StandaloneHandle {
    fn drop(&mut self) {
        if self.thread.is_some()
            && let Err(e) = self.stop()
        {
            error!(channel = %self.channel, error = %e, "standalone exited with an error");
        }
    }
}

/// Bind `channel` for `driver` and run it on a dedicated thread.
///
/// # Errors
///
/// Binding errors are returned here; errors raised while running are
/// returned by [`StandaloneHandle::stop`] or [`StandaloneHandle::join`].
#[instrument(skip(memory, driver, config))]
pub fn start_standalone<D: Driver>(
    memory: &SharedMemory,
    channel: &str,
    driver: D,
    config: StandaloneConfig,
) -> Result<StandaloneHandle, CadenceError> {
    let mut standalone = Standalone::new(memory, channel, driver, config)?;
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let name = channel.to_string();
    let thread = thread::Builder::new()
        .name(format!("cadence-{channel}"))
        .spawn(move || {
            let result = standalone.run();
            if let Err(e) = &result {
                error!(channel = %name, error = %e, "standalone failed");
            }
            drop(standalone);
            flag.store(false, Ordering::Release);
            result
        })
        .map_err(|e| CadenceError::Driver(format!("cannot spawn standalone thread: {e}")))?;

    Ok(StandaloneHandle {
        memory: memory.clone(),
        channel: channel.to_string(),
        running,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front_end::FrontEnd;
    use crate::sim::{SimDriver, SimTelemetry};
    use cadence_control::Scalar;
    use cadence_types::{Mode, Timing};

    fn config(bursting: bool) -> StandaloneConfig {
        StandaloneConfig {
            layout: ChannelLayout::new(1_000, 2),
            frequency_hz: 1_000.0,
            bursting,
            policy: ObservationPolicy::default(),
        }
    }

    #[test]
    fn burst_scenario() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "burst", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "burst")?;

        front.add_command(0, Scalar(100.0), Timing::iteration(200), Mode::Queue)?;
        front.add_command(1, Scalar(300.0), Timing::iteration(300), Mode::Queue)?;
        let first = front.burst(200)?;
        assert_eq!(first.control_iteration(), 200);
        assert_eq!(first.desired_states()[0], Scalar(100.0));
        assert!(first.desired_states()[1].0 < 300.0);

        let second = front.burst(150)?;
        assert_eq!(second.control_iteration(), 350);
        assert_eq!(second.desired_states(), &[Scalar(100.0), Scalar(300.0)]);
        assert_eq!(second.extended_state().steps, 349);

        handle.stop()?;
        assert!(!handle.is_running());
        assert!(!memory.is_bound("burst"));
        Ok(())
    }

    #[test]
    fn virtual_clock_drives_duration_commands() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "clock", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "clock")?;

        // 1 kHz: 50 ms of virtual time is 50 iterations
        front.add_command(0, Scalar(10.0), Timing::duration(Duration::from_millis(50)), Mode::Queue)?;
        let halfway = front.burst(26)?;
        let value = halfway.desired_states()[0].0;
        assert!(value > 4.0 && value < 6.0, "got {value}");
        let done = front.burst(30)?;
        assert_eq!(done.desired_states()[0], Scalar(10.0));
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn final_burst_ends_the_loop() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let handle = start_standalone(&memory, "final", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "final")?;
        front.burst(5)?;
        let last = front.final_burst()?;
        assert_eq!(last.control_iteration(), 6);
        handle.join()?;
        assert!(!memory.is_bound("final"));
        Ok(())
    }

    #[test]
    fn free_running_standalone_completes_commands() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "free", SimDriver::<Scalar>::new(2, 1.0), config(false))?;
        assert!(handle.is_running());
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "free")?;

        front.add_command(1, Scalar(2.0), Timing::duration(Duration::from_millis(20)), Mode::Queue)?;
        let observation = front.pulse_and_wait()?;
        assert_eq!(observation.desired_states()[1], Scalar(2.0));
        assert!(observation.measured_frequency() > 0.0);

        handle.stop()?;
        assert!(!handle.is_running());
        Ok(())
    }

    #[test]
    fn bursting_can_be_turned_off() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "off", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "off")?;
        front.burst(3)?;
        Burster::turn_off(&memory, "off");
        // free-running now: iterations advance without bursts
        let observation = front.pulse_at(50)?;
        assert!(observation.control_iteration() >= 50);
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn clock_keeps_going_forward_after_bursting() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "resume", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        let mut front = FrontEnd::<Scalar, SimTelemetry>::new(&memory, "resume")?;

        // 10 s of motion, half of it run as a burst far faster than real time
        front.add_command(0, Scalar(100.0), Timing::duration(Duration::from_secs(10)), Mode::Queue)?;
        let burst = front.burst(5_000)?;
        let after_burst = burst.desired_states()[0].0;
        assert!(after_burst > 49.0 && after_burst < 51.0, "got {after_burst}");

        Burster::turn_off(&memory, "resume");
        let mut previous = burst;
        for _ in 0..5 {
            let observation = front.pulse_at(previous.control_iteration() + 1)?;
            assert!(observation.stamp() >= previous.stamp());
            assert!(observation.desired_states()[0].0 >= previous.desired_states()[0].0);
            previous = observation;
        }
        assert!(previous.desired_states()[0].0 < 60.0);
        handle.stop()?;
        Ok(())
    }

    #[test]
    fn second_standalone_on_same_channel_is_busy() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let mut handle = start_standalone(&memory, "dup", SimDriver::<Scalar>::new(2, 1.0), config(true))?;
        assert!(matches!(
            start_standalone(&memory, "dup", SimDriver::<Scalar>::new(2, 1.0), config(true)),
            Err(CadenceError::ChannelBusy(_))
        ));
        handle.stop()?;
        let mut again = start_standalone(&memory, "dup", SimDriver::<Scalar>::new(2, 1.0), config(false))?;
        again.stop()?;
        Ok(())
    }
}
