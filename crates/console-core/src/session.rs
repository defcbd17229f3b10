//! Session composition root.
//!
//! A [`Session`] owns every manager for one emulation run and drives the
//! slice loop: size the slice to the next scheduled event, execute it on the
//! CPU, advance the scheduler to the CPU's cycle counter, deliver interrupts,
//! then checkpoint the command pipeline.

use std::sync::{Arc, Mutex};

use crate::diag::{Diagnostics, FaultCounters};
use crate::fifo::{strategy_for, CommandSink, ExecutionStrategy, DEFAULT_FIFO_CAPACITY};
use crate::peripherals::{Peripheral, Scheduler, Wiring};
use crate::{
    AudioState, ConfigSource, CpuManager, FaultCode, FifoError, GuestExecutor, HaltReason,
    InterruptLine, MemoryConfig, MemoryManager, MmioRegionId, PanicHandle, RunOutcome,
    SessionError, SessionFlags, SessionState, SharedHandler, SoundStream,
};

struct InstalledPeripheral {
    name: &'static str,
    regions: Vec<MmioRegionId>,
    // Strong reference; the MMIO table and scheduler callbacks only hold weak ones.
    _device: SharedHandler,
}

/// One emulation run.
pub struct Session {
    state: SessionState,
    flags: SessionFlags,
    memory: MemoryManager,
    scheduler: Scheduler,
    interrupts: InterruptLine,
    cpu: CpuManager,
    sink: Option<Box<dyn CommandSink>>,
    pipeline: Option<Box<dyn ExecutionStrategy>>,
    fifo_capacity: usize,
    audio: Arc<AudioState>,
    panic: PanicHandle,
    peripherals: Vec<InstalledPeripheral>,
    faults: FaultCounters,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("scheduler", &self.scheduler)
            .field("cpu", &self.cpu)
            .field(
                "peripherals",
                &self.peripherals.iter().map(|p| p.name).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Constructs every manager in dependency order. The session starts
    /// `Uninitialized`.
    #[must_use]
    pub fn new(
        memory_config: MemoryConfig,
        executor: Box<dyn GuestExecutor>,
        sink: Box<dyn CommandSink>,
    ) -> Self {
        let memory = MemoryManager::new(memory_config);
        let scheduler = Scheduler::new();
        let interrupts = InterruptLine::new();
        let cpu = CpuManager::new(executor);
        log::info!(
            "session: constructed with {:#x} bytes of ram at {:#010x}",
            memory_config.ram_size,
            memory_config.ram_base
        );
        Self {
            state: SessionState::Uninitialized,
            flags: SessionFlags::default(),
            memory,
            scheduler,
            interrupts,
            cpu,
            sink: Some(sink),
            pipeline: None,
            fifo_capacity: DEFAULT_FIFO_CAPACITY,
            audio: Arc::new(AudioState::new()),
            panic: PanicHandle::new(),
            peripherals: Vec::new(),
            faults: FaultCounters::default(),
        }
    }

    /// Overrides the command queue capacity. Only honoured before
    /// [`Self::initialize`].
    #[must_use]
    pub fn with_fifo_capacity(mut self, capacity: usize) -> Self {
        self.fifo_capacity = capacity;
        self
    }

    /// Reads and freezes the session flags, applies the MMU mode and selects
    /// the execution strategy.
    ///
    /// # Errors
    ///
    /// Fails outside `Uninitialized` or with a zero queue capacity.
    pub fn initialize(&mut self, config: &dyn ConfigSource) -> Result<(), SessionError> {
        self.expect_transition("initialize", SessionState::Initialized)?;
        let Some(sink) = self.sink.take() else {
            return Err(self.lifecycle_error("initialize"));
        };
        let flags = SessionFlags::read_from(config);
        self.pipeline = Some(strategy_for(flags.mode, sink, self.fifo_capacity)?);
        self.memory.set_mmu_enabled(flags.mmu_enabled);
        self.flags = flags;
        self.state = SessionState::Initialized;
        log::info!(
            "session: initialized ({:?}, mmu {}, pause on panic {})",
            flags.mode,
            flags.mmu_enabled,
            flags.pause_on_panic
        );
        Ok(())
    }

    /// Installs a peripheral: registers its MMIO ranges, then wires it to the
    /// address space, scheduler and interrupt line.
    ///
    /// The returned handle shares the session's device; the session keeps its
    /// own until teardown.
    ///
    /// # Errors
    ///
    /// Fails once the session is running, or when a range is rejected (every
    /// range registered so far for this device is rolled back).
    pub fn install_peripheral<P: Peripheral>(
        &mut self,
        device: P,
    ) -> Result<Arc<Mutex<P>>, SessionError> {
        if !self.state.accepts_peripherals() {
            return Err(self.lifecycle_error("install_peripheral"));
        }
        let name = device.name();
        let ranges = device.mmio_ranges();
        let device = Arc::new(Mutex::new(device));
        let handler: SharedHandler = device.clone();

        let mut regions = Vec::with_capacity(ranges.len());
        for range in ranges {
            match self.memory.register_mmio(name, range, &handler) {
                Ok(id) => regions.push(id),
                Err(source) => {
                    for id in regions {
                        self.memory.unregister_mmio(id);
                    }
                    return Err(SessionError::Mmio {
                        peripheral: name,
                        source,
                    });
                }
            }
        }

        P::attach(
            &device,
            &mut Wiring::new(
                &mut self.memory,
                &mut self.scheduler,
                self.interrupts.clone(),
            ),
        );
        log::info!("session: installed {name} ({} mmio ranges)", regions.len());
        self.peripherals.push(InstalledPeripheral {
            name,
            regions,
            _device: handler,
        });
        Ok(device)
    }

    /// Starts execution; in threaded mode this spawns the consumer thread.
    ///
    /// # Errors
    ///
    /// Fails outside `Initialized` or when the thread cannot be spawned.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.expect_transition("start", SessionState::Running)?;
        let Some(pipeline) = self.pipeline.as_deref_mut() else {
            return Err(self.lifecycle_error("start"));
        };
        pipeline.start()?;
        self.state = SessionState::Running;
        log::info!("session: running");
        Ok(())
    }

    /// Runs the slice loop for `cycles` virtual cycles.
    ///
    /// Each slice is `min(remaining, cycles until the next event)`. After a
    /// slice the scheduler fires everything due, interrupts are delivered and
    /// the pipeline is checkpointed. A panic report halts the loop at the slice
    /// boundary when pause-on-panic is set.
    ///
    /// # Errors
    ///
    /// Fails unless the session is `Running`, or with [`FifoError::Closed`]
    /// once the command consumer has stopped.
    pub fn run_for(&mut self, cycles: u64) -> Result<RunOutcome, SessionError> {
        if self.state != SessionState::Running {
            return Err(self.lifecycle_error("run_for"));
        }
        let Some(pipeline) = self.pipeline.as_deref_mut() else {
            return Err(self.lifecycle_error("run_for"));
        };

        // Deliver anything the host scheduled for the current cycle.
        self.scheduler.advance(self.cpu.cycles(), &mut self.memory);

        let mut executed = 0u64;
        while executed < cycles {
            let remaining = cycles - executed;
            let slice = self
                .scheduler
                .cycles_until_next()
                .map_or(remaining, |until| until.clamp(1, remaining));

            let charged = self.cpu.run_slice(slice, &mut self.memory, pipeline);
            executed = executed.saturating_add(charged);
            self.scheduler.advance(self.cpu.cycles(), &mut self.memory);
            self.cpu.service_interrupts(&self.interrupts);

            if let Err(err) = self.cpu.flush_gather(pipeline) {
                log::warn!("session: gather flush rejected: {err}");
            }
            pipeline.checkpoint();

            if pipeline.is_closed() {
                log::error!("session: command pipeline closed after {executed} cycles");
                return Err(SessionError::Fifo(FifoError::Closed));
            }

            if let Some(message) = self.panic.take() {
                if self.flags.pause_on_panic {
                    log::info!("session: paused on panic after {executed} cycles");
                    return Ok(RunOutcome::Halted {
                        cycles: executed,
                        reason: HaltReason::Panic { message },
                    });
                }
            }
        }
        Ok(RunOutcome::Completed { cycles: executed })
    }

    /// Ends the run: stops the pipeline at a command boundary, drops pending
    /// events without running them and releases every manager.
    ///
    /// Consumes the session so nothing can touch it afterwards; dropping a
    /// session performs the same release. Every step runs even when stopping
    /// the pipeline fails; that failure is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConsumerPanicked`] when the consumer thread
    /// panicked.
    pub fn teardown(mut self) -> Result<(), SessionError> {
        self.release()
    }

    // Reverse construction order: pipeline, audio, peripherals, cpu,
    // interrupts, scheduler, memory.
    fn release(&mut self) -> Result<(), SessionError> {
        if self.state.is_torn_down() {
            return Ok(());
        }
        let stopped = self
            .pipeline
            .as_deref_mut()
            .map_or(Ok(()), ExecutionStrategy::shutdown);
        self.pipeline = None;
        self.sink = None;

        self.audio.set_running(false);
        drop(self.audio.set_stream(None));

        for peripheral in self.peripherals.drain(..) {
            for id in peripheral.regions {
                self.memory.unregister_mmio(id);
            }
        }
        self.cpu.release();
        self.interrupts.reset();

        let dropped_events = self.scheduler.pending();
        self.scheduler.release();
        self.memory.release();

        self.state = SessionState::TornDown;
        log::info!("session: torn down ({dropped_events} pending events dropped)");
        stopped
    }

    /// Handle collaborators use to report panics.
    #[must_use]
    pub fn panic_handle(&self) -> PanicHandle {
        self.panic.clone()
    }

    /// Address space.
    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Mutable address space, e.g. for image loading.
    pub fn memory_mut(&mut self) -> &mut MemoryManager {
        &mut self.memory
    }

    /// Event scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Mutable event scheduler.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// CPU execution manager.
    #[must_use]
    pub const fn cpu(&self) -> &CpuManager {
        &self.cpu
    }

    /// Mutable CPU execution manager.
    pub fn cpu_mut(&mut self) -> &mut CpuManager {
        &mut self.cpu
    }

    /// Processor-interrupt line.
    #[must_use]
    pub const fn interrupts(&self) -> &InterruptLine {
        &self.interrupts
    }

    /// Audio state shared with the audio collaborator.
    #[must_use]
    pub const fn audio(&self) -> &Arc<AudioState> {
        &self.audio
    }

    /// Attaches or detaches the sound stream.
    pub fn set_sound_stream(&self, stream: Option<Box<dyn SoundStream>>) {
        drop(self.audio.set_stream(stream));
    }

    /// Returns `true` when a sound stream is attached.
    #[must_use]
    pub fn sound_stream_attached(&self) -> bool {
        self.audio.has_stream()
    }

    /// Returns `true` while the sound stream is marked running.
    #[must_use]
    pub fn is_sound_stream_running(&self) -> bool {
        self.audio.is_running()
    }

    /// Starts or stops the sound stream.
    pub fn set_sound_stream_running(&self, running: bool) {
        self.audio.set_running(running);
    }

    /// Returns `true` while an audio dump is in progress.
    #[must_use]
    pub fn is_audio_dump_started(&self) -> bool {
        self.audio.is_dump_started()
    }

    /// Records whether an audio dump is in progress.
    pub fn set_audio_dump_started(&self, started: bool) {
        self.audio.set_dump_started(started);
    }

    /// Flags frozen at initialization (defaults before).
    #[must_use]
    pub const fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Names of installed peripherals, in install order.
    #[must_use]
    pub fn peripheral_names(&self) -> Vec<&'static str> {
        self.peripherals.iter().map(|p| p.name).collect()
    }

    /// Snapshot of every manager's counters.
    #[must_use]
    pub fn diagnostics(&self) -> Diagnostics {
        let mut faults = self.faults;
        faults.merge(self.memory.faults());
        faults.merge(self.scheduler.faults());
        faults.record_many(
            FaultCode::QueueSaturation,
            self.pipeline
                .as_deref()
                .map_or(0, ExecutionStrategy::saturations),
        );
        Diagnostics {
            faults,
            events_fired: self.scheduler.fired(),
            events_pending: self.scheduler.pending(),
            cycles: self.cpu.cycles(),
            fifo_bytes: self
                .pipeline
                .as_deref()
                .map_or(0, ExecutionStrategy::submitted),
        }
    }

    fn expect_transition(
        &mut self,
        operation: &'static str,
        next: SessionState,
    ) -> Result<(), SessionError> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(self.lifecycle_error(operation))
        }
    }

    fn lifecycle_error(&mut self, operation: &'static str) -> SessionError {
        self.faults.record(FaultCode::LifecycleViolation);
        log::debug!("session: `{operation}` rejected in state {:?}", self.state);
        SessionError::Lifecycle {
            operation,
            state: self.state,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::error!("session: teardown on drop failed: {err}");
        }
    }
}
