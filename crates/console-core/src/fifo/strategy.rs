//! Execution strategies deciding where command bytes are consumed.
//!
//! [`Interleaved`] buffers submissions and drains them on the caller's thread
//! at every checkpoint. [`Threaded`] hands them to a long-lived consumer
//! thread through a bounded [`CommandFifo`]. The strategy is chosen once per
//! session.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::queue::{CommandFifo, DEFAULT_FIFO_CAPACITY};
use crate::{ExecutionMode, FifoError, SessionError};

/// Largest chunk handed to a [`CommandSink`] in one call.
pub const CONSUMER_CHUNK_BYTES: usize = 4096;

/// Consumer stage receiving command bytes in submission order.
pub trait CommandSink: Send {
    /// Processes the next run of bytes.
    fn consume(&mut self, bytes: &[u8]);
}

/// Where and when submitted command bytes reach the [`CommandSink`].
pub trait ExecutionStrategy: Send {
    /// Mode this strategy implements.
    fn mode(&self) -> ExecutionMode;

    /// Starts consumption.
    ///
    /// # Errors
    ///
    /// Fails when the consumer thread cannot be spawned.
    fn start(&mut self) -> Result<(), SessionError>;

    /// Submits bytes produced by the CPU. May block on backpressure.
    ///
    /// # Errors
    ///
    /// Fails once the pipeline is closed or before a threaded consumer runs.
    fn submit(&mut self, bytes: &[u8]) -> Result<(), FifoError>;

    /// Called after every executed CPU slice.
    fn checkpoint(&mut self);

    /// Drains outstanding bytes and stops consumption. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when the consumer thread panicked.
    fn shutdown(&mut self) -> Result<(), SessionError>;

    /// Total bytes accepted.
    fn submitted(&self) -> u64;

    /// Returns `true` once submissions are rejected, either after
    /// [`Self::shutdown`] or because the consumer stopped on its own.
    fn is_closed(&self) -> bool;

    /// Submissions that had to wait for the consumer to make room.
    fn saturations(&self) -> u64 {
        0
    }
}

/// Builds the strategy for `mode`.
///
/// # Errors
///
/// Returns [`FifoError::ZeroCapacity`] for a zero `capacity`.
pub fn strategy_for(
    mode: ExecutionMode,
    sink: Box<dyn CommandSink>,
    capacity: usize,
) -> Result<Box<dyn ExecutionStrategy>, FifoError> {
    Ok(match mode {
        ExecutionMode::Interleaved => Box::new(Interleaved::new(sink, capacity)?),
        ExecutionMode::Threaded => Box::new(Threaded::new(sink, capacity)?),
    })
}

/// Single-thread strategy: drain synchronously at each checkpoint.
pub struct Interleaved {
    sink: Box<dyn CommandSink>,
    pending: Vec<u8>,
    capacity: usize,
    submitted: u64,
    closed: bool,
}

impl std::fmt::Debug for Interleaved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interleaved")
            .field("pending", &self.pending.len())
            .field("submitted", &self.submitted)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Interleaved {
    /// Creates the strategy. Buffered bytes are drained early once they
    /// reach `capacity`.
    ///
    /// # Errors
    ///
    /// Returns [`FifoError::ZeroCapacity`] for a zero `capacity`.
    pub fn new(sink: Box<dyn CommandSink>, capacity: usize) -> Result<Self, FifoError> {
        if capacity == 0 {
            return Err(FifoError::ZeroCapacity);
        }
        Ok(Self {
            sink,
            pending: Vec::new(),
            capacity,
            submitted: 0,
            closed: false,
        })
    }

    fn drain(&mut self) {
        for chunk in self.pending.chunks(CONSUMER_CHUNK_BYTES) {
            self.sink.consume(chunk);
        }
        self.pending.clear();
    }
}

impl ExecutionStrategy for Interleaved {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Interleaved
    }

    fn start(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    fn submit(&mut self, bytes: &[u8]) -> Result<(), FifoError> {
        if self.closed {
            return Err(FifoError::Closed);
        }
        self.pending.extend_from_slice(bytes);
        self.submitted += bytes.len() as u64;
        if self.pending.len() >= self.capacity {
            self.drain();
        }
        Ok(())
    }

    fn checkpoint(&mut self) {
        if !self.pending.is_empty() {
            self.drain();
        }
    }

    fn shutdown(&mut self) -> Result<(), SessionError> {
        self.drain();
        self.closed = true;
        Ok(())
    }

    fn submitted(&self) -> u64 {
        self.submitted
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Dual-thread strategy: a consumer thread drains a bounded queue.
pub struct Threaded {
    fifo: Arc<CommandFifo>,
    sink: Option<Box<dyn CommandSink>>,
    worker: Option<JoinHandle<Box<dyn CommandSink>>>,
    submitted: u64,
}

impl std::fmt::Debug for Threaded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threaded")
            .field("fifo", &self.fifo)
            .field("running", &self.worker.is_some())
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

impl Threaded {
    /// Creates the strategy with a queue of `capacity` bytes. The consumer
    /// thread is spawned by [`ExecutionStrategy::start`].
    ///
    /// # Errors
    ///
    /// Returns [`FifoError::ZeroCapacity`] for a zero `capacity`.
    pub fn new(sink: Box<dyn CommandSink>, capacity: usize) -> Result<Self, FifoError> {
        Ok(Self {
            fifo: Arc::new(CommandFifo::new(capacity)?),
            sink: Some(sink),
            worker: None,
            submitted: 0,
        })
    }

    /// Creates the strategy with [`DEFAULT_FIFO_CAPACITY`].
    ///
    /// # Errors
    ///
    /// Never fails in practice; the default capacity is non-zero.
    pub fn with_default_capacity(sink: Box<dyn CommandSink>) -> Result<Self, FifoError> {
        Self::new(sink, DEFAULT_FIFO_CAPACITY)
    }

    /// Queue shared with the consumer thread.
    #[must_use]
    pub fn fifo(&self) -> &CommandFifo {
        &self.fifo
    }

    fn consume_until_closed(
        fifo: &CommandFifo,
        mut sink: Box<dyn CommandSink>,
    ) -> Box<dyn CommandSink> {
        log::info!("fifo: consumer thread started");
        let _close = CloseOnExit(fifo);
        let mut chunk = Vec::with_capacity(CONSUMER_CHUNK_BYTES);
        loop {
            chunk.clear();
            if fifo.pop_into(&mut chunk, CONSUMER_CHUNK_BYTES) == 0 {
                break;
            }
            sink.consume(&chunk);
        }
        log::info!("fifo: consumer thread drained and stopped");
        sink
    }
}

/// Closes the queue when the consumer exits, including by unwinding, so a
/// blocked producer is released.
struct CloseOnExit<'a>(&'a CommandFifo);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("fifo: command sink panicked; closing the queue");
        }
        self.0.close();
    }
}

impl ExecutionStrategy for Threaded {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Threaded
    }

    fn start(&mut self) -> Result<(), SessionError> {
        let Some(sink) = self.sink.take() else {
            return Ok(());
        };
        let fifo = Arc::clone(&self.fifo);
        let worker = thread::Builder::new()
            .name("command-consumer".into())
            .spawn(move || Self::consume_until_closed(&fifo, sink))
            .map_err(SessionError::Spawn)?;
        self.worker = Some(worker);
        Ok(())
    }

    fn submit(&mut self, bytes: &[u8]) -> Result<(), FifoError> {
        if self.worker.is_none() {
            return Err(if self.fifo.is_closed() {
                FifoError::Closed
            } else {
                FifoError::NotRunning
            });
        }
        self.fifo.push(bytes)?;
        self.submitted += bytes.len() as u64;
        Ok(())
    }

    fn checkpoint(&mut self) {}

    fn shutdown(&mut self) -> Result<(), SessionError> {
        self.fifo.close();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let sink = worker.join().map_err(|_| SessionError::ConsumerPanicked)?;
        self.sink = Some(sink);
        Ok(())
    }

    fn submitted(&self) -> u64 {
        self.submitted
    }

    fn is_closed(&self) -> bool {
        self.fifo.is_closed()
    }

    fn saturations(&self) -> u64 {
        self.fifo.saturations()
    }
}

impl Drop for Threaded {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("fifo: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{strategy_for, CommandSink, ExecutionStrategy, Interleaved, Threaded};
    use crate::{ExecutionMode, FifoError};

    #[derive(Clone, Default)]
    struct Recorder {
        bytes: Arc<Mutex<Vec<u8>>>,
        calls: Arc<Mutex<usize>>,
    }

    impl CommandSink for Recorder {
        fn consume(&mut self, bytes: &[u8]) {
            self.bytes.lock().expect("recorder").extend_from_slice(bytes);
            *self.calls.lock().expect("recorder") += 1;
        }
    }

    #[test]
    fn interleaved_drains_only_at_checkpoint() {
        let recorder = Recorder::default();
        let mut strategy = Interleaved::new(Box::new(recorder.clone()), 1024).expect("capacity");
        strategy.start().expect("no thread");
        strategy.submit(&[1, 2, 3]).expect("open");
        assert!(recorder.bytes.lock().expect("recorder").is_empty());

        strategy.checkpoint();
        assert_eq!(*recorder.bytes.lock().expect("recorder"), vec![1, 2, 3]);

        strategy.checkpoint();
        assert_eq!(*recorder.calls.lock().expect("recorder"), 1);
    }

    #[test]
    fn interleaved_drains_early_at_capacity() {
        let recorder = Recorder::default();
        let mut strategy = Interleaved::new(Box::new(recorder.clone()), 4).expect("capacity");
        strategy.submit(&[0; 6]).expect("open");
        assert_eq!(recorder.bytes.lock().expect("recorder").len(), 6);
    }

    #[test]
    fn threaded_rejects_bytes_before_start_and_after_shutdown() {
        let mut strategy =
            Threaded::with_default_capacity(Box::new(Recorder::default())).expect("capacity");
        assert_eq!(strategy.submit(&[1]), Err(FifoError::NotRunning));

        strategy.start().expect("spawn");
        strategy.shutdown().expect("join");
        assert_eq!(strategy.submit(&[1]), Err(FifoError::Closed));
    }

    #[test]
    fn threaded_delivers_everything_before_shutdown_returns() {
        let recorder = Recorder::default();
        let mut strategy = strategy_for(ExecutionMode::Threaded, Box::new(recorder.clone()), 16)
            .expect("capacity");
        assert_eq!(strategy.mode(), ExecutionMode::Threaded);
        strategy.start().expect("spawn");

        let data: Vec<u8> = (0..1000u32)
            .map(|n| u8::try_from(n % 251).expect("below 251"))
            .collect();
        for piece in data.chunks(7) {
            strategy.submit(piece).expect("open");
        }
        strategy.shutdown().expect("join");
        strategy.shutdown().expect("idempotent");

        assert_eq!(*recorder.bytes.lock().expect("recorder"), data);
        assert_eq!(strategy.submitted(), 1000);
    }
}
