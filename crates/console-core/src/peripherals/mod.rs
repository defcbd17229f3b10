//! Hardware peripheral contract and the wiring handed to devices at install
//! time.
//!
//! A peripheral owns its register state. The session wraps it in an
//! `Arc<Mutex<_>>`, registers its MMIO ranges (the region table keeps only a
//! weak reference) and then calls [`Peripheral::attach`] with direct access
//! to the address space, the scheduler and the interrupt line.

/// Reference countdown timer.
pub mod interval_timer;

pub use interval_timer::{
    IntervalTimer, TIMER_CONTROL_ENABLE, TIMER_CONTROL_IRQ, TIMER_CONTROL_PERIODIC,
    TIMER_REG_CONTROL, TIMER_REG_COUNT, TIMER_REG_PERIOD, TIMER_REG_STATUS, TIMER_SPAN,
    TIMER_STATUS_EXPIRED,
};

use std::sync::{Arc, Mutex};

use crate::{EventScheduler, InterruptLine, MemoryManager, MmioHandler, MmioRange};

/// Scheduler type every peripheral callback runs against.
pub type Scheduler = EventScheduler<MemoryManager>;

/// Device installed into a session.
pub trait Peripheral: MmioHandler + Sized + 'static {
    /// Short device name used for diagnostics.
    fn name(&self) -> &'static str;

    /// Physical ranges routed to this device's [`MmioHandler`].
    fn mmio_ranges(&self) -> Vec<MmioRange>;

    /// Wires the device to the machine after its MMIO ranges are registered.
    ///
    /// `this` is the session-owned handle; scheduler callbacks should capture
    /// a [`std::sync::Weak`] to it so a torn-down device is never revived.
    fn attach(this: &Arc<Mutex<Self>>, wiring: &mut Wiring<'_>);
}

/// Collaborators injected into a peripheral during [`Peripheral::attach`].
#[derive(Debug)]
pub struct Wiring<'a> {
    memory: &'a mut MemoryManager,
    scheduler: &'a mut Scheduler,
    interrupts: InterruptLine,
}

impl<'a> Wiring<'a> {
    /// Bundles the collaborators.
    pub fn new(
        memory: &'a mut MemoryManager,
        scheduler: &'a mut Scheduler,
        interrupts: InterruptLine,
    ) -> Self {
        Self {
            memory,
            scheduler,
            interrupts,
        }
    }

    /// Address space.
    pub fn memory(&mut self) -> &mut MemoryManager {
        &mut *self.memory
    }

    /// Event scheduler.
    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut *self.scheduler
    }

    /// Processor-interrupt line; clone it to keep it.
    #[must_use]
    pub const fn interrupts(&self) -> &InterruptLine {
        &self.interrupts
    }
}
