//! CPU execution manager: register file ownership, virtual cycle counter,
//! slice execution and exception delivery.
//!
//! The interpreter or recompiler is a [`GuestExecutor`] collaborator. It sees
//! the machine only through an [`ExecContext`], which converts page faults
//! into guest data-storage exceptions and routes command bytes through the
//! gather pipe.

use crate::fifo::{ExecutionStrategy, GatherPipe};
use crate::state::registers::{
    DSISR_PAGE, DSISR_PROTECTION, DSISR_STORE, EXCEPTION_DSI, EXCEPTION_EXTERNAL_INT, MSR_EE,
    VECTOR_DSI, VECTOR_EXTERNAL_INT,
};
use crate::{
    AccessKind, AccessWidth, FifoError, InterruptLine, MemoryManager, PageFault,
    PageFaultReason, RegisterFile,
};

/// Interpreter/recompiler collaborator.
pub trait GuestExecutor: Send {
    /// Executes guest code for up to roughly `budget` cycles and returns the
    /// cycles actually retired.
    ///
    /// Returning `0` means the guest is idle; the manager then skips the
    /// whole budget. Implementations should return early once
    /// [`ExecContext::fault_pending`] reports a data fault.
    fn execute(&mut self, ctx: &mut ExecContext<'_>, budget: u64) -> u64;
}

/// Machine view handed to a [`GuestExecutor`] for one slice.
pub struct ExecContext<'a> {
    regs: &'a mut RegisterFile,
    memory: &'a mut MemoryManager,
    gather: &'a mut GatherPipe,
    pipeline: &'a mut dyn ExecutionStrategy,
    pipeline_error: Option<FifoError>,
}

impl std::fmt::Debug for ExecContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("regs", &self.regs)
            .field("gather", &self.gather)
            .field("pipeline_error", &self.pipeline_error)
            .finish_non_exhaustive()
    }
}

impl<'a> ExecContext<'a> {
    /// Builds a context over borrowed machine state.
    pub fn new(
        regs: &'a mut RegisterFile,
        memory: &'a mut MemoryManager,
        gather: &'a mut GatherPipe,
        pipeline: &'a mut dyn ExecutionStrategy,
    ) -> Self {
        Self {
            regs,
            memory,
            gather,
            pipeline,
            pipeline_error: None,
        }
    }

    /// Guest registers.
    #[must_use]
    pub fn regs(&self) -> &RegisterFile {
        &*self.regs
    }

    /// Mutable guest registers.
    pub fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut *self.regs
    }

    /// Raw address space, bypassing fault conversion.
    pub fn memory(&mut self) -> &mut MemoryManager {
        &mut *self.memory
    }

    /// Returns `true` once a data fault has been latched in this slice.
    #[must_use]
    pub fn fault_pending(&self) -> bool {
        self.regs.exception_pending(EXCEPTION_DSI)
    }

    /// Loads a value. A page fault is latched as a DSI and yields `None`.
    pub fn load(&mut self, addr: u32, width: AccessWidth) -> Option<u64> {
        match self.memory.read(addr, width) {
            Ok(value) => Some(value),
            Err(fault) => {
                self.latch(fault);
                None
            }
        }
    }

    /// Stores a value. A page fault is latched as a DSI and yields `false`.
    pub fn store(&mut self, addr: u32, width: AccessWidth, value: u64) -> bool {
        match self.memory.write(addr, width, value) {
            Ok(()) => true,
            Err(fault) => {
                self.latch(fault);
                false
            }
        }
    }

    /// Loads a big-endian word; see [`Self::load`].
    pub fn load_u32(&mut self, addr: u32) -> Option<u32> {
        self.load(addr, AccessWidth::Word)
            .and_then(|value| u32::try_from(value).ok())
    }

    /// Stores a big-endian word; see [`Self::store`].
    pub fn store_u32(&mut self, addr: u32, value: u32) -> bool {
        self.store(addr, AccessWidth::Word, u64::from(value))
    }

    /// Writes bytes to the gather pipe.
    ///
    /// Completed bursts go to the command pipeline; a rejected burst is
    /// remembered and reported once the slice ends.
    pub fn write_gather(&mut self, data: &[u8]) {
        let pipeline = &mut *self.pipeline;
        if let Err(err) = self.gather.write(data, |burst| pipeline.submit(burst)) {
            self.pipeline_error.get_or_insert(err);
        }
    }

    fn latch(&mut self, fault: PageFault) {
        let mut dsisr = match fault.reason {
            PageFaultReason::NotMapped => DSISR_PAGE,
            PageFaultReason::Protection => DSISR_PROTECTION,
        };
        if fault.kind == AccessKind::Write {
            dsisr |= DSISR_STORE;
        }
        self.regs.latch_data_fault(fault.vaddr, dsisr);
    }
}

/// Owner of the register file and the virtual cycle counter.
pub struct CpuManager {
    regs: RegisterFile,
    cycles: u64,
    slices: u64,
    executor: Option<Box<dyn GuestExecutor>>,
    gather: GatherPipe,
}

impl std::fmt::Debug for CpuManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuManager")
            .field("regs", &self.regs)
            .field("cycles", &self.cycles)
            .field("slices", &self.slices)
            .field("gather", &self.gather)
            .field("released", &self.executor.is_none())
            .finish_non_exhaustive()
    }
}

impl CpuManager {
    /// Creates a manager at cycle zero with reset registers.
    #[must_use]
    pub fn new(executor: Box<dyn GuestExecutor>) -> Self {
        Self {
            regs: RegisterFile::default(),
            cycles: 0,
            slices: 0,
            executor: Some(executor),
            gather: GatherPipe::new(),
        }
    }

    /// Read-only register view.
    #[must_use]
    pub const fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Sets the program counter, e.g. to an image entry point.
    pub const fn set_entry_point(&mut self, pc: u32) {
        self.regs.set_pc(pc);
    }

    /// Virtual cycles retired so far.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Slices executed so far.
    #[must_use]
    pub const fn slices(&self) -> u64 {
        self.slices
    }

    /// Gather pipe state.
    #[must_use]
    pub const fn gather(&self) -> &GatherPipe {
        &self.gather
    }

    /// Executes one slice and advances the cycle counter.
    ///
    /// Returns the cycles charged: what the executor retired, or the whole
    /// `budget` when it reported idle or has been released.
    pub fn run_slice(
        &mut self,
        budget: u64,
        memory: &mut MemoryManager,
        pipeline: &mut dyn ExecutionStrategy,
    ) -> u64 {
        let retired = match self.executor.as_deref_mut() {
            Some(executor) => {
                let mut ctx =
                    ExecContext::new(&mut self.regs, memory, &mut self.gather, pipeline);
                let retired = executor.execute(&mut ctx, budget);
                if let Some(err) = ctx.pipeline_error {
                    log::warn!("cpu: gather pipe burst rejected: {err}");
                }
                retired
            }
            None => 0,
        };
        let charged = if retired == 0 { budget } else { retired };
        self.cycles = self.cycles.saturating_add(charged);
        self.slices += 1;
        charged
    }

    /// Forwards a partial gather burst to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error when the bytes are rejected.
    pub fn flush_gather(&mut self, pipeline: &mut dyn ExecutionStrategy) -> Result<(), FifoError> {
        self.gather.flush(|tail| pipeline.submit(tail))
    }

    /// Drops the executor and any partial gather burst. Later slices idle.
    pub(crate) fn release(&mut self) {
        self.executor = None;
        self.gather = GatherPipe::new();
    }

    /// Samples the interrupt line and delivers pending exceptions.
    ///
    /// A latched data fault is taken unconditionally; an external interrupt
    /// only while `MSR[EE]` is set. Returns the vector entered, if any.
    pub fn service_interrupts(&mut self, line: &InterruptLine) -> Option<u32> {
        if line.is_asserted() {
            self.regs.raise_exception(EXCEPTION_EXTERNAL_INT);
        } else {
            self.regs.clear_exception(EXCEPTION_EXTERNAL_INT);
        }

        if self.regs.exception_pending(EXCEPTION_DSI) {
            self.regs.enter_exception(EXCEPTION_DSI, VECTOR_DSI);
            log::trace!("cpu: data fault at {:#010x}", self.regs.dar());
            return Some(VECTOR_DSI);
        }
        if self.regs.exception_pending(EXCEPTION_EXTERNAL_INT) && self.regs.msr_bit(MSR_EE) {
            self.regs.enter_exception(EXCEPTION_EXTERNAL_INT, VECTOR_EXTERNAL_INT);
            return Some(VECTOR_EXTERNAL_INT);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuManager, ExecContext, GuestExecutor};
    use crate::fifo::{CommandSink, ExecutionStrategy, Interleaved};
    use crate::state::registers::{
        DSISR_PAGE, DSISR_STORE, MSR_EE, VECTOR_DSI, VECTOR_EXTERNAL_INT,
    };
    use crate::{InterruptLine, MemoryConfig, MemoryManager};

    struct Discard;

    impl CommandSink for Discard {
        fn consume(&mut self, _bytes: &[u8]) {}
    }

    fn pipeline() -> Interleaved {
        Interleaved::new(Box::new(Discard), 64).expect("capacity")
    }

    struct FixedCost(u64);

    impl GuestExecutor for FixedCost {
        fn execute(&mut self, _ctx: &mut ExecContext<'_>, _budget: u64) -> u64 {
            self.0
        }
    }

    struct StoreThenStop {
        addr: u32,
    }

    impl GuestExecutor for StoreThenStop {
        fn execute(&mut self, ctx: &mut ExecContext<'_>, _budget: u64) -> u64 {
            if !ctx.store_u32(self.addr, 0xDEAD_BEEF) {
                assert!(ctx.fault_pending());
                return 1;
            }
            2
        }
    }

    #[test]
    fn idle_executor_is_charged_the_whole_budget() {
        let mut cpu = CpuManager::new(Box::new(FixedCost(0)));
        let mut memory = MemoryManager::default();
        let mut pipeline = pipeline();

        assert_eq!(cpu.run_slice(100, &mut memory, &mut pipeline), 100);
        assert_eq!(cpu.cycles(), 100);
        assert_eq!(cpu.slices(), 1);
    }

    #[test]
    fn page_fault_becomes_data_storage_exception() {
        let mut cpu = CpuManager::new(Box::new(StoreThenStop { addr: 0x8000_0000 }));
        let mut memory = MemoryManager::new(MemoryConfig::default());
        memory.set_mmu_enabled(true);
        let mut pipeline = pipeline();
        cpu.set_entry_point(0x8000_0100);

        assert_eq!(cpu.run_slice(10, &mut memory, &mut pipeline), 1);
        assert_eq!(cpu.regs().dar(), 0x8000_0000);
        assert_eq!(cpu.regs().dsisr(), DSISR_PAGE | DSISR_STORE);

        assert_eq!(
            cpu.service_interrupts(&InterruptLine::new()),
            Some(VECTOR_DSI)
        );
        assert_eq!(cpu.regs().pc(), VECTOR_DSI);
        assert_eq!(cpu.regs().srr0(), 0x8000_0100);
    }

    #[test]
    fn external_interrupt_waits_for_msr_ee() {
        let mut cpu = CpuManager::new(Box::new(FixedCost(1)));
        let line = InterruptLine::new();
        line.raise(1);

        assert_eq!(cpu.service_interrupts(&line), None);
        cpu.regs.set_msr(MSR_EE);
        assert_eq!(cpu.service_interrupts(&line), Some(VECTOR_EXTERNAL_INT));
        assert!(!cpu.regs().msr_bit(MSR_EE));
    }

    #[test]
    fn deasserted_line_withdraws_pending_interrupt() {
        let mut cpu = CpuManager::new(Box::new(FixedCost(1)));
        let line = InterruptLine::new();
        line.raise(1);
        assert_eq!(cpu.service_interrupts(&line), None);

        line.clear(1);
        cpu.regs.set_msr(MSR_EE);
        assert_eq!(cpu.service_interrupts(&line), None);
    }

    #[test]
    fn gather_writes_reach_pipeline_in_bursts() {
        struct Emit;
        impl GuestExecutor for Emit {
            fn execute(&mut self, ctx: &mut ExecContext<'_>, _budget: u64) -> u64 {
                ctx.write_gather(&[0x61; 40]);
                40
            }
        }
        let mut cpu = CpuManager::new(Box::new(Emit));
        let mut memory = MemoryManager::default();
        let mut pipeline = pipeline();

        cpu.run_slice(64, &mut memory, &mut pipeline);
        assert_eq!(pipeline.submitted(), 32);
        assert_eq!(cpu.gather().len(), 8);

        cpu.flush_gather(&mut pipeline).expect("open pipeline");
        assert_eq!(pipeline.submitted(), 40);
    }

    #[test]
    fn released_manager_idles_without_the_executor() {
        let mut cpu = CpuManager::new(Box::new(FixedCost(3)));
        let mut memory = MemoryManager::default();
        let mut pipeline = pipeline();
        assert_eq!(cpu.run_slice(10, &mut memory, &mut pipeline), 3);

        cpu.release();
        assert_eq!(cpu.run_slice(10, &mut memory, &mut pipeline), 10);
        assert_eq!(cpu.cycles(), 13);
        assert!(cpu.gather().is_empty());
    }
}
