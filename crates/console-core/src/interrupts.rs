//! Lock-free processor-interrupt line.
//!
//! Peripherals raise and clear source bits from scheduler callbacks or MMIO
//! handlers; the CPU execution manager samples the line at checkpoints and is
//! the only party that touches the register file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared mask of asserted interrupt sources. Clones observe the same line.
#[derive(Debug, Clone, Default)]
pub struct InterruptLine {
    pending: Arc<AtomicU32>,
}

impl InterruptLine {
    /// Creates a line with no source asserted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts every source bit in `mask`.
    pub fn raise(&self, mask: u32) {
        self.pending.fetch_or(mask, Ordering::AcqRel);
    }

    /// Deasserts every source bit in `mask`.
    pub fn clear(&self, mask: u32) {
        self.pending.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Currently asserted sources.
    #[must_use]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns `true` when any source is asserted.
    #[must_use]
    pub fn is_asserted(&self) -> bool {
        self.pending() != 0
    }

    /// Deasserts everything.
    pub fn reset(&self) {
        self.pending.store(0, Ordering::Release);
    }
}
