//! Bounded, append-only, indexed streams.
//!
//! A [`TimeSeries`] is the unit of exchange between the parties of a
//! channel. Each appended record receives the next global [`Index`]
//! (starting at 0); once more than `capacity` records have been appended the
//! oldest ones are evicted, but indices are never reused.
//!
//! Records are stored serialized (`serde_json`), so only serializable values
//! ever cross the medium, exactly as they would through a real shared-memory
//! segment.
//!
//! Readers may block on [`TimeSeries::wait_for_index`] until a given index
//! has been written; no lock is held while the caller processes a record.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_types::{CadenceError, Index};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde::de::DeserializeOwned;

struct Ring {
    slots: VecDeque<Vec<u8>>,
    /// Index of `slots[0]`.
    first: Index,
    capacity: usize,
}

impl Ring {
    fn newest(&self) -> Option<Index> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.first + self.slots.len() as Index - 1)
        }
    }

    fn oldest(&self) -> Option<Index> {
        if self.slots.is_empty() { None } else { Some(self.first) }
    }
}

/// Untyped storage shared by every handle on the same stream.
pub(crate) struct RawSeries {
    name: String,
    ring: Mutex<Ring>,
    appended: Condvar,
}

impl RawSeries {
    pub(crate) fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            ring: Mutex::new(Ring {
                slots: VecDeque::with_capacity(capacity),
                first: 0,
                capacity: capacity.max(1),
            }),
            appended: Condvar::new(),
        }
    }
}

/// Typed handle on a shared stream. Clone it cheaply – all clones share the
/// same records.
pub struct TimeSeries<T> {
    raw: Arc<RawSeries>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for TimeSeries<T> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
            _record: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TimeSeries<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.raw.ring.lock();
        f.debug_struct("TimeSeries")
            .field("name", &self.raw.name)
            .field("oldest", &ring.oldest())
            .field("newest", &ring.newest())
            .field("capacity", &ring.capacity)
            .finish()
    }
}

impl<T> TimeSeries<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn from_raw(raw: Arc<RawSeries>) -> Self {
        Self {
            raw,
            _record: PhantomData,
        }
    }

    /// Standalone stream that is not registered in any
    /// [`SharedMemory`](crate::SharedMemory). Useful as a local buffer.
    pub fn local(name: &str, capacity: usize) -> Self {
        Self::from_raw(Arc::new(RawSeries::new(name, capacity)))
    }

    pub fn name(&self) -> &str {
        &self.raw.name
    }

    pub fn capacity(&self) -> usize {
        self.raw.ring.lock().capacity
    }

    /// Append `value`, evicting the oldest record when full, and wake every
    /// waiting reader. Returns the index given to `value`.
    pub fn append(&self, value: &T) -> Result<Index, CadenceError> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            CadenceError::Serialization(format!("{}: {e}", self.raw.name))
        })?;
        let index = {
            let mut ring = self.raw.ring.lock();
            if ring.slots.len() == ring.capacity {
                ring.slots.pop_front();
                ring.first += 1;
            }
            ring.slots.push_back(bytes);
            ring.first + ring.slots.len() as Index - 1
        };
        self.raw.appended.notify_all();
        Ok(index)
    }

    /// Read the record at `index`.
    ///
    /// # Errors
    ///
    /// [`CadenceError::Evicted`] if the record has already been evicted, and
    /// [`CadenceError::Protocol`] if it has not been written yet.
    pub fn get(&self, index: Index) -> Result<T, CadenceError> {
        let bytes = {
            let ring = self.raw.ring.lock();
            if index < ring.first {
                return Err(CadenceError::Evicted {
                    stream: self.raw.name.clone(),
                    index,
                    oldest: ring.first,
                });
            }
            let offset = (index - ring.first) as usize;
            match ring.slots.get(offset) {
                Some(bytes) => bytes.clone(),
                None => {
                    return Err(CadenceError::Protocol(format!(
                        "{}: index {index} has not been written yet",
                        self.raw.name
                    )));
                }
            }
        };
        decode(&self.raw.name, &bytes)
    }

    /// Most recent record, if any.
    pub fn newest_element(&self) -> Result<Option<T>, CadenceError> {
        let bytes = {
            let ring = self.raw.ring.lock();
            match ring.slots.back() {
                Some(bytes) => bytes.clone(),
                None => return Ok(None),
            }
        };
        decode(&self.raw.name, &bytes).map(Some)
    }

    /// Records `from..=to`, clipped to what is still stored.
    pub fn range(&self, from: Index, to: Index) -> Result<Vec<T>, CadenceError> {
        let raw: Vec<Vec<u8>> = {
            let ring = self.raw.ring.lock();
            let Some(newest) = ring.newest() else {
                return Ok(Vec::new());
            };
            let from = from.max(ring.first);
            let to = to.min(newest);
            if from > to {
                return Ok(Vec::new());
            }
            (from..=to)
                .map(|i| ring.slots[(i - ring.first) as usize].clone())
                .collect()
        };
        raw.iter().map(|bytes| decode(&self.raw.name, bytes)).collect()
    }

    pub fn oldest(&self) -> Option<Index> {
        self.raw.ring.lock().oldest()
    }

    pub fn newest(&self) -> Option<Index> {
        self.raw.ring.lock().newest()
    }

    pub fn len(&self) -> usize {
        self.raw.ring.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.ring.lock().slots.is_empty()
    }

    /// Block until the record at `index` has been written.
    ///
    /// Returns `false` if `timeout` elapsed first. With `timeout = None` the
    /// call may block forever.
    pub fn wait_for_index(&self, index: Index, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.raw.ring.lock();
        loop {
            if ring.newest().is_some_and(|newest| newest >= index) {
                return true;
            }
            match deadline {
                None => self.raw.appended.wait(&mut ring),
                Some(deadline) => {
                    if self.raw.appended.wait_until(&mut ring, deadline).timed_out() {
                        return ring.newest().is_some_and(|newest| newest >= index);
                    }
                }
            }
        }
    }
}

fn decode<T: DeserializeOwned>(stream: &str, bytes: &[u8]) -> Result<T, CadenceError> {
    serde_json::from_slice(bytes).map_err(|e| CadenceError::Serialization(format!("{stream}: {e}")))
}
