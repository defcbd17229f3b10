//! Command pipeline between CPU execution and the separately clocked consumer
//! stages (video).

/// CPU-side write-combining buffer.
pub mod gather;
/// Bounded blocking SPSC byte queue.
pub mod queue;
/// Interleaved and threaded execution strategies.
pub mod strategy;

pub use gather::{GatherPipe, GATHER_BURST_BYTES};
pub use queue::{CommandFifo, DEFAULT_FIFO_CAPACITY};
pub use strategy::{
    strategy_for, CommandSink, ExecutionStrategy, Interleaved, Threaded, CONSUMER_CHUNK_BYTES,
};
