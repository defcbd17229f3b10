/// Number of architecturally visible general-purpose registers (`r0..r31`).
pub const GENERAL_REGISTER_COUNT: usize = 32;
/// `MSR` bit enabling external interrupts.
pub const MSR_EE: u32 = 1 << 15;
/// `MSR` bit enabling instruction address translation.
pub const MSR_IR: u32 = 1 << 5;
/// `MSR` bit enabling data address translation.
pub const MSR_DR: u32 = 1 << 4;
/// `MSR` bits preserved into `SRR1` on exception entry.
pub const MSR_SAVED_MASK: u32 = 0x87C0_FFFF;
/// Pending-exception bit for a data storage interrupt (page fault).
pub const EXCEPTION_DSI: u32 = 1 << 0;
/// Pending-exception bit for an external interrupt.
pub const EXCEPTION_EXTERNAL_INT: u32 = 1 << 1;
/// Exception vector offset for data storage interrupts.
pub const VECTOR_DSI: u32 = 0x0000_0300;
/// Exception vector offset for external interrupts.
pub const VECTOR_EXTERNAL_INT: u32 = 0x0000_0500;
/// `DSISR` bit set when no translation was found.
pub const DSISR_PAGE: u32 = 1 << 30;
/// `DSISR` bit set on a protection violation.
pub const DSISR_PROTECTION: u32 = 1 << 27;
/// `DSISR` bit set when the faulting access was a store.
pub const DSISR_STORE: u32 = 1 << 25;

/// Guest CPU architectural register file.
///
/// Owned by [`crate::CpuManager`]; other managers only ever see `&RegisterFile`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    gpr: [u32; GENERAL_REGISTER_COUNT],
    pc: u32,
    msr: u32,
    srr0: u32,
    srr1: u32,
    dar: u32,
    dsisr: u32,
    exceptions: u32,
}

impl RegisterFile {
    /// Reads general-purpose register `index`; out-of-range indices read zero.
    #[must_use]
    pub fn gpr(&self, index: usize) -> u32 {
        self.gpr.get(index).copied().unwrap_or(0)
    }

    /// Writes general-purpose register `index`; out-of-range indices are ignored.
    pub fn set_gpr(&mut self, index: usize, value: u32) {
        if let Some(slot) = self.gpr.get_mut(index) {
            *slot = value;
        }
    }

    /// Reads the program counter.
    #[must_use]
    pub const fn pc(&self) -> u32 {
        self.pc
    }

    /// Writes the program counter.
    pub const fn set_pc(&mut self, value: u32) {
        self.pc = value;
    }

    /// Reads the machine state register.
    #[must_use]
    pub const fn msr(&self) -> u32 {
        self.msr
    }

    /// Writes the machine state register.
    pub const fn set_msr(&mut self, value: u32) {
        self.msr = value;
    }

    /// Returns `true` when a specific `MSR` bit is set.
    #[must_use]
    pub const fn msr_bit(&self, bit: u32) -> bool {
        self.msr & bit != 0
    }

    /// Reads `SRR0` (return address saved on exception entry).
    #[must_use]
    pub const fn srr0(&self) -> u32 {
        self.srr0
    }

    /// Reads `SRR1` (machine state saved on exception entry).
    #[must_use]
    pub const fn srr1(&self) -> u32 {
        self.srr1
    }

    /// Reads `DAR` (faulting data address).
    #[must_use]
    pub const fn dar(&self) -> u32 {
        self.dar
    }

    /// Reads `DSISR` (data storage fault cause bits).
    #[must_use]
    pub const fn dsisr(&self) -> u32 {
        self.dsisr
    }

    /// Reads the pending-exception mask.
    #[must_use]
    pub const fn exceptions(&self) -> u32 {
        self.exceptions
    }

    /// Returns `true` when an exception bit is pending.
    #[must_use]
    pub const fn exception_pending(&self, bit: u32) -> bool {
        self.exceptions & bit != 0
    }

    pub(crate) const fn raise_exception(&mut self, bit: u32) {
        self.exceptions |= bit;
    }

    pub(crate) const fn clear_exception(&mut self, bit: u32) {
        self.exceptions &= !bit;
    }

    pub(crate) const fn latch_data_fault(&mut self, dar: u32, dsisr: u32) {
        self.dar = dar;
        self.dsisr = dsisr;
        self.exceptions |= EXCEPTION_DSI;
    }

    /// Saves `PC`/`MSR`, clears `bit` and redirects to `vector`.
    pub(crate) const fn enter_exception(&mut self, bit: u32, vector: u32) {
        self.srr0 = self.pc;
        self.srr1 = self.msr & MSR_SAVED_MASK;
        self.msr &= !(MSR_EE | MSR_IR | MSR_DR);
        self.exceptions &= !bit;
        self.pc = vector;
    }
}
