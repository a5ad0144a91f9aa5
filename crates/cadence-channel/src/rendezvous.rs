//! Two-party leader/follower handshake used for bursting.
//!
//! The leader posts a request carrying an iteration count and blocks until
//! the follower acknowledges it. The request and its count are written under
//! the same lock, and every request gets a fresh generation number, so the
//! follower can never observe a new count while it is still working through
//! an older one: a leader posting while a previous request is unacknowledged
//! first waits for that acknowledgement.
//!
//! ```text
//!  Leader                         Follower
//!  ──────                         ────────
//!  pulse(200) ──request g=1──►    wait() → Burst { g: 1, count: 200 }
//!     (blocked)                   … 200 iterations …
//!             ◄──────ack g=1───   done(1)
//!  pulse(150) ──request g=2──►    wait() → Burst { g: 2, count: 150 }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::CadenceError;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Handshake {
    /// Generation of the last posted request.
    requested: u64,
    /// Generation of the last acknowledged request.
    completed: u64,
    count: i64,
    terminal: bool,
    released: bool,
}

impl Handshake {
    fn pending(&self) -> bool {
        self.requested > self.completed
    }
}

/// What the follower was woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Run `count` iterations, then acknowledge `generation`.
    Burst { generation: u64, count: i64 },
    /// Run one last iteration, acknowledge `generation`, and exit.
    Final { generation: u64 },
    /// The rendezvous was released without a request; exit without
    /// acknowledging.
    Released,
}

/// Shared state of one handshake. Obtain the two sides with
/// [`Rendezvous::leader`] and [`Rendezvous::follower`].
#[derive(Debug, Default)]
pub struct Rendezvous {
    state: Mutex<Handshake>,
    signal: Condvar,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn leader(self: &Arc<Self>) -> Leader {
        Leader {
            inner: Arc::clone(self),
        }
    }

    pub fn follower(self: &Arc<Self>) -> Follower {
        Follower {
            inner: Arc::clone(self),
        }
    }

    /// Count carried by the most recent request.
    pub fn requested_count(&self) -> i64 {
        self.state.lock().count
    }
}

/// Producer side of the handshake.
#[derive(Debug, Clone)]
pub struct Leader {
    inner: Arc<Rendezvous>,
}

impl Leader {
    /// Request `count` iterations and block until they are acknowledged.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Protocol`] if the rendezvous was released while
    /// waiting (the follower has exited and will never acknowledge).
    pub fn pulse(&self, count: i64) -> Result<(), CadenceError> {
        self.post(count, false, None).map(|_| ())
    }

    /// Like [`pulse`](Self::pulse) but gives up after `timeout`. Returns
    /// `Ok(false)` on timeout; the request stays posted.
    pub fn pulse_timeout(&self, count: i64, timeout: Duration) -> Result<bool, CadenceError> {
        self.post(count, false, Some(Instant::now() + timeout))
    }

    /// Ask the follower to run one more iteration and exit. Blocks until the
    /// follower acknowledges.
    pub fn final_pulse(&self) -> Result<(), CadenceError> {
        self.post(1, true, None).map(|_| ())
    }

    /// Wake the follower without a request and mark the rendezvous as
    /// released. Never blocks.
    pub fn release(&self) {
        self.inner.state.lock().released = true;
        self.inner.signal.notify_all();
    }

    fn post(&self, count: i64, terminal: bool, deadline: Option<Instant>) -> Result<bool, CadenceError> {
        let mut state = self.inner.state.lock();

        while state.pending() {
            if !self.wait(&mut state, deadline)? {
                return Ok(false);
            }
        }

        state.requested += 1;
        state.count = count;
        state.terminal = terminal;
        let generation = state.requested;
        self.inner.signal.notify_all();

        while state.completed < generation {
            if !self.wait(&mut state, deadline)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn wait(
        &self,
        state: &mut parking_lot::MutexGuard<'_, Handshake>,
        deadline: Option<Instant>,
    ) -> Result<bool, CadenceError> {
        if state.released {
            return Err(CadenceError::Protocol("burst rendezvous was released".to_string()));
        }
        match deadline {
            None => {
                self.inner.signal.wait(state);
                Ok(true)
            }
            Some(deadline) => Ok(!self.inner.signal.wait_until(state, deadline).timed_out()),
        }
    }
}

/// Executor side of the handshake.
#[derive(Debug, Clone)]
pub struct Follower {
    inner: Arc<Rendezvous>,
}

impl Follower {
    /// Block until a request is posted or the rendezvous is released.
    pub fn wait(&self) -> Signal {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(signal) = Self::poll(&state) {
                return signal;
            }
            self.inner.signal.wait(&mut state);
        }
    }

    /// Like [`wait`](Self::wait) but returns `None` after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Signal> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(signal) = Self::poll(&state) {
                return Some(signal);
            }
            if self.inner.signal.wait_until(&mut state, deadline).timed_out() {
                return Self::poll(&state);
            }
        }
    }

    /// Acknowledge the request `generation`, waking its leader.
    pub fn done(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        if generation > state.completed {
            state.completed = generation;
            state.count = 0;
        }
        drop(state);
        self.inner.signal.notify_all();
    }

    fn poll(state: &Handshake) -> Option<Signal> {
        if state.pending() {
            let generation = state.requested;
            return Some(if state.terminal {
                Signal::Final { generation }
            } else {
                Signal::Burst {
                    generation,
                    count: state.count,
                }
            });
        }
        state.released.then_some(Signal::Released)
    }
}
