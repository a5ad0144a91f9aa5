//! Executor side of bursting.
//!
//! While the channel's `should_burst` flag is on, the executor does not run
//! at its own pace: it blocks until a producer requests a number of
//! iterations through [`FrontEnd::burst`](crate::front_end::FrontEnd::burst),
//! runs them back to back, and acknowledges. With the flag off every call
//! to [`Burster::next`] returns [`Step::FreeRun`] immediately.

use std::sync::Arc;
use std::time::Duration;

use cadence_channel::{ChannelNames, Follower, Segment, SharedMemory, Signal, keys};
use tracing::debug;

/// What the executor should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run one paced iteration.
    FreeRun,
    /// Run `count` iterations back to back, then call
    /// [`Burster::complete`] with `generation`.
    Burst { generation: u64, count: i64 },
    /// Run one last iteration, complete `generation`, and exit.
    Final { generation: u64 },
    /// Exit now.
    Stop,
}

/// Follower handle of a channel's burst rendezvous.
pub struct Burster {
    segment: Arc<Segment>,
    follower: Follower,
    poll: Duration,
}

impl Burster {
    /// Attach to `channel` and turn bursting on.
    pub fn new(memory: &SharedMemory, channel: &str) -> Self {
        let names = ChannelNames::new(channel);
        let burster = Self {
            segment: memory.segment(&names.segment),
            follower: memory.rendezvous(&names.burst).follower(),
            poll: Duration::from_millis(20),
        };
        burster.segment.set(keys::BURSTING, 0);
        Self::turn_on(memory, channel);
        burster
    }

    /// Let the executor of `channel` burst.
    pub fn turn_on(memory: &SharedMemory, channel: &str) {
        memory.segment(channel).set_flag(keys::SHOULD_BURST, true);
    }

    /// Release the executor of `channel` into free-running mode. A blocked
    /// follower notices within one poll interval.
    pub fn turn_off(memory: &SharedMemory, channel: &str) {
        memory.segment(channel).set_flag(keys::SHOULD_BURST, false);
    }

    pub fn is_on(&self) -> bool {
        self.segment.flag(keys::SHOULD_BURST)
    }

    /// Block until there is something to do.
    pub fn next(&self) -> Step {
        loop {
            if self.segment.flag(keys::SHOULD_STOP) {
                return Step::Stop;
            }
            if !self.is_on() {
                return Step::FreeRun;
            }
            match self.follower.wait_timeout(self.poll) {
                Some(Signal::Burst { generation, count }) => {
                    debug!(generation, count, "burst requested");
                    self.segment.set(keys::BURSTING, count);
                    return Step::Burst { generation, count };
                }
                Some(Signal::Final { generation }) => return Step::Final { generation },
                Some(Signal::Released) => return Step::Stop,
                None => continue,
            }
        }
    }

    /// Report the burst `generation` as done.
    pub fn complete(&self, generation: u64) {
        self.segment.set(keys::BURSTING, 0);
        self.follower.done(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn free_runs_when_off() {
        let memory = SharedMemory::new();
        let burster = Burster::new(&memory, "b");
        assert!(burster.is_on());
        Burster::turn_off(&memory, "b");
        assert_eq!(burster.next(), Step::FreeRun);
    }

    #[test]
    fn burst_count_is_mirrored() -> Result<(), Box<dyn std::error::Error>> {
        let memory = SharedMemory::new();
        let burster = Burster::new(&memory, "b");
        let leader = memory.rendezvous("b_burst").leader();
        let producer = thread::spawn(move || leader.pulse(12));

        let step = burster.next();
        assert_eq!(step, Step::Burst { generation: 1, count: 12 });
        assert_eq!(memory.segment("b").get(keys::BURSTING), 12);
        burster.complete(1);
        assert_eq!(memory.segment("b").get(keys::BURSTING), 0);
        producer.join().unwrap()?;
        Ok(())
    }

    #[test]
    fn stop_flag_wins() {
        let memory = SharedMemory::new();
        let burster = Burster::new(&memory, "b");
        memory.segment("b").set_flag(keys::SHOULD_STOP, true);
        assert_eq!(burster.next(), Step::Stop);
    }

    #[test]
    fn blocked_follower_notices_turn_off() {
        let memory = SharedMemory::new();
        let burster = Burster::new(&memory, "b");
        let other = memory.clone();
        let switch = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            Burster::turn_off(&other, "b");
        });
        assert_eq!(burster.next(), Step::FreeRun);
        switch.join().unwrap();
    }
}
