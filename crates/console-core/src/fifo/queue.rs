//! Bounded single-producer/single-consumer byte queue with blocking
//! backpressure.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::FifoError;

/// Default queue capacity in bytes.
pub const DEFAULT_FIFO_CAPACITY: usize = 32 * 1024;

#[derive(Debug)]
struct Shared {
    bytes: VecDeque<u8>,
    closed: bool,
    pushed: u64,
    popped: u64,
    saturations: u64,
}

/// Blocking byte queue between the CPU thread and the command consumer.
///
/// The producer blocks while the queue is full and the consumer blocks while
/// it is empty; bytes are never dropped or reordered. [`Self::close`] wakes
/// both sides so the consumer can drain what is left and exit.
#[derive(Debug)]
pub struct CommandFifo {
    capacity: usize,
    shared: Mutex<Shared>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl CommandFifo {
    /// Creates a queue holding at most `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FifoError::ZeroCapacity`] for a zero capacity.
    pub fn new(capacity: usize) -> Result<Self, FifoError> {
        if capacity == 0 {
            return Err(FifoError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            shared: Mutex::new(Shared {
                bytes: VecDeque::with_capacity(capacity),
                closed: false,
                pushed: 0,
                popped: 0,
                saturations: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Maximum number of buffered bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `data`, blocking whenever the queue is full.
    ///
    /// Large submissions are admitted in pieces as space frees up, so a
    /// submission larger than the capacity still completes.
    ///
    /// # Errors
    ///
    /// Returns [`FifoError::Closed`] if the queue is closed before every byte
    /// was accepted.
    pub fn push(&self, data: &[u8]) -> Result<(), FifoError> {
        let mut rest = data;
        let mut shared = self.lock();
        while !rest.is_empty() {
            if !shared.closed && shared.bytes.len() >= self.capacity {
                shared.saturations += 1;
            }
            shared = self
                .not_full
                .wait_while(shared, |s| !s.closed && s.bytes.len() >= self.capacity)
                .unwrap_or_else(PoisonError::into_inner);
            if shared.closed {
                return Err(FifoError::Closed);
            }
            let room = self.capacity - shared.bytes.len();
            let (now, later) = rest.split_at(room.min(rest.len()));
            shared.bytes.extend(now);
            shared.pushed += now.len() as u64;
            rest = later;
            self.not_empty.notify_one();
        }
        Ok(())
    }

    /// Moves up to `max` bytes into `out`, blocking until at least one byte is
    /// available. Returns `0` only once the queue is closed and drained.
    pub fn pop_into(&self, out: &mut Vec<u8>, max: usize) -> usize {
        let shared = self.lock();
        let mut shared = self
            .not_empty
            .wait_while(shared, |s| !s.closed && s.bytes.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let taken = Self::drain_locked(&mut shared, out, max);
        if taken > 0 {
            self.not_full.notify_one();
        }
        taken
    }

    /// Moves up to `max` buffered bytes into `out` without blocking.
    pub fn try_pop_into(&self, out: &mut Vec<u8>, max: usize) -> usize {
        let mut shared = self.lock();
        let taken = Self::drain_locked(&mut shared, out, max);
        if taken > 0 {
            self.not_full.notify_one();
        }
        taken
    }

    /// Closes the queue and wakes both sides.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Returns `true` once [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().bytes.is_empty()
    }

    /// Total bytes accepted and total bytes handed to the consumer.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        let shared = self.lock();
        (shared.pushed, shared.popped)
    }

    /// Number of times a push found the queue full and had to wait.
    #[must_use]
    pub fn saturations(&self) -> u64 {
        self.lock().saturations
    }

    fn drain_locked(shared: &mut Shared, out: &mut Vec<u8>, max: usize) -> usize {
        let taken = shared.bytes.len().min(max);
        out.extend(shared.bytes.drain(..taken));
        shared.popped += taken as u64;
        taken
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
