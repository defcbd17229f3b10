//! MMIO-mapped interval timer.
//!
//! The timer owns one event type. Its event re-arms itself every `PERIOD`
//! cycles; while `CONTROL.ENABLE` is set each expiry bumps `COUNT`, latches
//! `STATUS.EXPIRED` and, with `CONTROL.IRQ`, raises the timer's interrupt
//! source. A one-shot timer clears `ENABLE` after its first expiry.

use std::sync::{Arc, Mutex, PoisonError};

use super::{Peripheral, Wiring};
use crate::{AccessWidth, EventType, InterruptLine, MmioHandler, MmioRange};

/// Bytes of register space decoded by the timer.
pub const TIMER_SPAN: u32 = 0x10;

/// Control register offset.
pub const TIMER_REG_CONTROL: u32 = 0x0;
/// Period register offset (cycles between expiries).
pub const TIMER_REG_PERIOD: u32 = 0x4;
/// Status register offset (write 1 to clear).
pub const TIMER_REG_STATUS: u32 = 0x8;
/// Expiry counter offset (read-only).
pub const TIMER_REG_COUNT: u32 = 0xC;

/// `CONTROL`: count expiries.
pub const TIMER_CONTROL_ENABLE: u32 = 1 << 0;
/// `CONTROL`: keep running after an expiry.
pub const TIMER_CONTROL_PERIODIC: u32 = 1 << 1;
/// `CONTROL`: raise the interrupt source on expiry.
pub const TIMER_CONTROL_IRQ: u32 = 1 << 2;
/// `STATUS`: an expiry has not been acknowledged yet.
pub const TIMER_STATUS_EXPIRED: u32 = 1 << 0;

const CONTROL_MASK: u32 = TIMER_CONTROL_ENABLE | TIMER_CONTROL_PERIODIC | TIMER_CONTROL_IRQ;

/// Countdown timer peripheral.
#[derive(Debug, Clone)]
pub struct IntervalTimer {
    base: u32,
    irq_mask: u32,
    control: u32,
    period: u32,
    status: u32,
    count: u32,
    event: Option<EventType>,
    line: Option<InterruptLine>,
}

impl IntervalTimer {
    /// Creates a stopped timer decoding `base..base + TIMER_SPAN` that raises
    /// `irq_mask` on the interrupt line.
    #[must_use]
    pub const fn new(base: u32, period: u32, irq_mask: u32) -> Self {
        Self {
            base,
            irq_mask,
            control: 0,
            period,
            status: 0,
            count: 0,
            event: None,
            line: None,
        }
    }

    /// Current `CONTROL` value.
    #[must_use]
    pub const fn control(&self) -> u32 {
        self.control
    }

    /// Current `PERIOD` value.
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }

    /// Current `STATUS` value.
    #[must_use]
    pub const fn status(&self) -> u32 {
        self.status
    }

    /// Expiries counted while enabled.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    const fn register(&self, offset: u32) -> u32 {
        match offset {
            TIMER_REG_CONTROL => self.control,
            TIMER_REG_PERIOD => self.period,
            TIMER_REG_STATUS => self.status,
            TIMER_REG_COUNT => self.count,
            _ => 0,
        }
    }

    fn next_delay(&self) -> u64 {
        u64::from(self.period.max(1))
    }

    fn expire(&mut self) {
        if self.control & TIMER_CONTROL_ENABLE == 0 {
            return;
        }
        self.count = self.count.wrapping_add(1);
        self.status |= TIMER_STATUS_EXPIRED;
        if self.control & TIMER_CONTROL_IRQ != 0 {
            if let Some(line) = &self.line {
                line.raise(self.irq_mask);
            }
        }
        if self.control & TIMER_CONTROL_PERIODIC == 0 {
            self.control &= !TIMER_CONTROL_ENABLE;
        }
    }

    fn acknowledge(&mut self, value: u32) {
        if value & TIMER_STATUS_EXPIRED == 0 {
            return;
        }
        self.status &= !TIMER_STATUS_EXPIRED;
        if let Some(line) = &self.line {
            line.clear(self.irq_mask);
        }
    }
}

impl MmioHandler for IntervalTimer {
    fn read(&mut self, addr: u32, width: AccessWidth) -> u64 {
        let offset = addr.wrapping_sub(self.base);
        let value = self.register(offset & !3);
        // Registers are big-endian words; narrower reads select their byte lane.
        match 4u32.checked_sub((offset & 3) + width.bytes()) {
            Some(pad) => u64::from(value >> (pad * 8)),
            None => u64::from(value),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, addr: u32, width: AccessWidth, value: u64) {
        if width != AccessWidth::Word {
            log::debug!("interval-timer: {width:?} write at {addr:#010x} treated as word write");
        }
        let value = value as u32;
        match addr.wrapping_sub(self.base) & !3 {
            TIMER_REG_CONTROL => self.control = value & CONTROL_MASK,
            // The expiry already scheduled keeps its cycle; the new period
            // applies from the next re-arm.
            TIMER_REG_PERIOD => self.period = value,
            TIMER_REG_STATUS => self.acknowledge(value),
            _ => {}
        }
    }
}

impl Peripheral for IntervalTimer {
    fn name(&self) -> &'static str {
        "interval-timer"
    }

    fn mmio_ranges(&self) -> Vec<MmioRange> {
        vec![MmioRange::new(self.base, TIMER_SPAN)]
    }

    fn attach(this: &Arc<Mutex<Self>>, wiring: &mut Wiring<'_>) {
        let weak = Arc::downgrade(this);
        let event = wiring
            .scheduler()
            .register_event_type("interval-timer", move |_, scheduler, _| {
                let Some(timer) = weak.upgrade() else {
                    return;
                };
                let mut timer = timer.lock().unwrap_or_else(PoisonError::into_inner);
                timer.expire();
                if let Some(event) = timer.event {
                    scheduler.schedule(timer.next_delay(), event, 0);
                }
            });

        let mut timer = this.lock().unwrap_or_else(PoisonError::into_inner);
        timer.line = Some(wiring.interrupts().clone());
        timer.event = Some(event);
        wiring.scheduler().schedule(timer.next_delay(), event, 0);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{
        IntervalTimer, TIMER_CONTROL_ENABLE, TIMER_CONTROL_IRQ, TIMER_CONTROL_PERIODIC,
        TIMER_REG_CONTROL, TIMER_REG_COUNT, TIMER_REG_STATUS, TIMER_STATUS_EXPIRED,
    };
    use crate::peripherals::{Peripheral, Scheduler, Wiring};
    use crate::{InterruptLine, MemoryConfig, MemoryManager, SharedHandler};

    const BASE: u32 = 0x0C00_8000;

    struct Rig {
        memory: MemoryManager,
        scheduler: Scheduler,
        line: InterruptLine,
        timer: Arc<Mutex<IntervalTimer>>,
    }

    fn rig(period: u32) -> Rig {
        let mut memory = MemoryManager::new(MemoryConfig {
            ram_base: 0,
            ram_size: 0x1000,
            open_bus: 0,
        });
        let mut scheduler = Scheduler::new();
        let line = InterruptLine::new();
        let timer = Arc::new(Mutex::new(IntervalTimer::new(BASE, period, 1 << 3)));
        let handler: SharedHandler = timer.clone();
        for range in timer.lock().expect("timer").mmio_ranges() {
            memory
                .register_mmio("interval-timer", range, &handler)
                .expect("free range");
        }
        IntervalTimer::attach(
            &timer,
            &mut Wiring::new(&mut memory, &mut scheduler, line.clone()),
        );
        Rig {
            memory,
            scheduler,
            line,
            timer,
        }
    }

    #[test]
    fn disabled_timer_keeps_ticking_without_effects() {
        let mut rig = rig(100);
        assert_eq!(rig.scheduler.pending(), 1);
        rig.scheduler.advance(1_000, &mut rig.memory);

        assert_eq!(rig.timer.lock().expect("timer").count(), 0);
        assert!(!rig.line.is_asserted());
        assert_eq!(rig.scheduler.next_fire_cycle(), Some(1_100));
    }

    #[test]
    fn periodic_timer_raises_interrupt_until_acknowledged() {
        let mut rig = rig(100);
        rig.memory
            .write_u32(
                BASE + TIMER_REG_CONTROL,
                TIMER_CONTROL_ENABLE | TIMER_CONTROL_PERIODIC | TIMER_CONTROL_IRQ,
            )
            .expect("mmu off");

        rig.scheduler.advance(350, &mut rig.memory);
        assert_eq!(rig.memory.read_u32(BASE + TIMER_REG_COUNT), Ok(3));
        assert_eq!(
            rig.memory.read_u32(BASE + TIMER_REG_STATUS),
            Ok(TIMER_STATUS_EXPIRED)
        );
        assert_eq!(rig.line.pending(), 1 << 3);

        rig.memory
            .write_u32(BASE + TIMER_REG_STATUS, TIMER_STATUS_EXPIRED)
            .expect("mmu off");
        assert!(!rig.line.is_asserted());
        assert_eq!(rig.memory.read_u32(BASE + TIMER_REG_STATUS), Ok(0));
    }

    #[test]
    fn one_shot_timer_disables_itself() {
        let mut rig = rig(10);
        rig.memory
            .write_u32(BASE + TIMER_REG_CONTROL, TIMER_CONTROL_ENABLE)
            .expect("mmu off");

        rig.scheduler.advance(100, &mut rig.memory);
        let timer = rig.timer.lock().expect("timer");
        assert_eq!(timer.count(), 1);
        assert_eq!(timer.control() & TIMER_CONTROL_ENABLE, 0);
        assert!(!rig.line.is_asserted());
    }

    #[test]
    fn byte_reads_select_big_endian_lanes() {
        let mut rig = rig(0x1234_5678);
        let period = BASE + super::TIMER_REG_PERIOD;
        assert_eq!(rig.memory.read_u8(period), Ok(0x12));
        assert_eq!(rig.memory.read_u8(period + 3), Ok(0x78));
        assert_eq!(rig.memory.read_u16(period + 2), Ok(0x5678));
    }

    #[test]
    fn dropped_timer_stops_rearming() {
        let mut rig = rig(10);
        rig.timer = Arc::new(Mutex::new(IntervalTimer::new(0, 1, 0)));

        rig.scheduler.advance(10, &mut rig.memory);
        assert_eq!(rig.scheduler.pending(), 0);
        assert_eq!(rig.memory.read_u32(BASE), Ok(0));
    }
}
