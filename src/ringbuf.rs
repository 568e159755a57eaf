//! Bounded ring between decode and the audio callback.
//!
//! The worker thread pushes decoded PCM and may block when the ring is
//! full; the audio callback pops and must never block. The pop path takes
//! the lock opportunistically: on contention or underflow it reports a
//! short count and the caller substitutes silence, with a sticky
//! underflow flag raised so the condition is observable.

use std::sync::{Arc, Condvar, Mutex};

/// Shared state behind the ring lock.
#[derive(Debug)]
struct RingState {
    buf: Vec<i16>,
    head: usize,
    len: usize,
    closed: bool,
    underflow: bool,
}

/// Bounded single-producer, single-consumer ring of interleaved samples.
///
/// Cheaply cloneable; clones share the same storage.
#[derive(Clone, Debug)]
pub struct PcmRing {
    state: Arc<(Mutex<RingState>, Condvar)>,
}

impl PcmRing {
    /// Creates a ring holding up to `capacity` samples.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new((
                Mutex::new(RingState {
                    buf: vec![0; capacity.max(1)],
                    head: 0,
                    len: 0,
                    closed: false,
                    underflow: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Pushes all of `samples`, blocking while the ring is full.
    ///
    /// Returns false when the ring was closed before everything fit.
    pub fn push_slice(&self, samples: &[i16]) -> bool {
        let (lock, space) = (&self.state.0, &self.state.1);
        let mut remaining = samples;

        while !remaining.is_empty() {
            let Ok(mut state) = lock.lock() else { return false };
            while state.len == state.buf.len() && !state.closed {
                state = match space.wait(state) {
                    Ok(state) => state,
                    Err(_) => return false,
                };
            }
            if state.closed {
                return false;
            }

            let capacity = state.buf.len();
            let free = capacity - state.len;
            let take = free.min(remaining.len());
            let tail = (state.head + state.len) % capacity;
            for (i, &sample) in remaining[..take].iter().enumerate() {
                let at = (tail + i) % capacity;
                state.buf[at] = sample;
            }
            state.len += take;
            remaining = &remaining[take..];
        }
        true
    }

    /// Pops up to `out.len()` samples without blocking.
    ///
    /// On lock contention or an empty ring the count is short; a short
    /// count on a ring that is not closed raises the underflow flag. The
    /// caller zero-fills the remainder.
    pub fn pop_slice(&self, out: &mut [i16]) -> usize {
        let (lock, space) = (&self.state.0, &self.state.1);
        let Ok(mut state) = lock.try_lock() else {
            return 0;
        };

        let capacity = state.buf.len();
        let take = state.len.min(out.len());
        for slot in out.iter_mut().take(take) {
            *slot = state.buf[state.head];
            state.head = (state.head + 1) % capacity;
            state.len -= 1;
        }
        if take < out.len() && !state.closed {
            state.underflow = true;
        }
        drop(state);
        space.notify_all();
        take
    }

    /// Samples currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.0.lock().map_or(0, |state| state.len)
    }

    /// Whether the ring holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all buffered samples (seek and track-change invalidation).
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.0.lock() {
            state.head = 0;
            state.len = 0;
        }
        self.state.1.notify_all();
    }

    /// Marks the stream complete; blocked producers wake and fail.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.0.lock() {
            state.closed = true;
        }
        self.state.1.notify_all();
    }

    /// Whether the ring was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.0.lock().map_or(true, |state| state.closed)
    }

    /// Reads and clears the underflow flag.
    pub fn take_underflow(&self) -> bool {
        self.state
            .0
            .lock()
            .map_or(false, |mut state| std::mem::take(&mut state.underflow))
    }

    /// Reopens a closed, cleared ring for the next track.
    pub fn reopen(&self) {
        if let Ok(mut state) = self.state.0.lock() {
            state.closed = false;
            state.head = 0;
            state.len = 0;
            state.underflow = false;
        }
    }
}
