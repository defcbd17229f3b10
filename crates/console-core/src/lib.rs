//! Hardware-platform core for a console emulator.
//!
//! The crate provides the composition root ([`Session`]) and the services
//! every subsystem is built on: a deterministic cycle-based event scheduler,
//! the guest address space (RAM, memory-mapped I/O, optional MMU), the CPU
//! execution manager and the command pipeline that feeds the separately
//! clocked video consumer.

/// Fault taxonomy and operation errors.
pub mod fault;
pub use fault::{
    AccessKind, FaultClass, FaultCode, FifoError, MemoryError, MmioError, PageFault,
    PageFaultReason, SessionError,
};

/// Fault counters and session diagnostics.
pub mod diag;
pub use diag::{Diagnostics, FaultCounters, FAULT_CODE_COUNT};

/// Guest register file and session lifecycle state.
pub mod state;
pub use state::{RegisterFile, SessionState, GENERAL_REGISTER_COUNT};

/// Guest address space.
pub mod memory;
pub use memory::{
    AccessWidth, MemoryConfig, MemoryManager, MmioHandler, MmioMap, MmioRange, MmioRegionId,
    Protection, Region, SharedHandler, TranslationTable, DEFAULT_OPEN_BUS, DEFAULT_RAM_SIZE,
    PAGE_SIZE,
};

/// Cycle-based event scheduler.
pub mod timing;
pub use timing::{EventArgs, EventCallback, EventHandle, EventScheduler, EventType};

/// Processor-interrupt line.
pub mod interrupts;
pub use interrupts::InterruptLine;

/// Host-facing configuration and run-loop contracts.
pub mod api;
pub use api::{
    ConfigKey, ConfigSource, ExecutionMode, HaltReason, PanicHandle, RunOutcome, SessionConfig,
    SessionFlags,
};

/// Command pipeline: gather pipe, bounded queue and execution strategies.
pub mod fifo;
pub use fifo::{
    CommandFifo, CommandSink, ExecutionStrategy, GatherPipe, Interleaved, Threaded,
    DEFAULT_FIFO_CAPACITY, GATHER_BURST_BYTES,
};

/// Session audio state.
pub mod audio;
pub use audio::{AudioState, SoundStream};

/// CPU execution manager.
pub mod cpu;
pub use cpu::{CpuManager, ExecContext, GuestExecutor};

/// Peripheral contract and reference devices.
pub mod peripherals;
pub use peripherals::{IntervalTimer, Peripheral, Scheduler, Wiring};

/// Session composition root.
pub mod session;
pub use session::Session;

#[cfg(test)]
use env_logger as _;
#[cfg(test)]
use proptest as _;
