//! Deterministic session fingerprint used by CI cross-host comparison.
//!
//! Runs the same scripted guest in both execution modes and prints one hash
//! per mode. The hashes must match each other and across hosts.

use std::sync::{Arc, Mutex};

use console_core::peripherals::{
    TIMER_CONTROL_ENABLE, TIMER_CONTROL_IRQ, TIMER_CONTROL_PERIODIC, TIMER_REG_CONTROL,
    TIMER_REG_COUNT, TIMER_REG_STATUS, TIMER_STATUS_EXPIRED,
};
use console_core::{
    CommandSink, ExecContext, GuestExecutor, IntervalTimer, MemoryConfig, Session, SessionConfig,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

const TIMER_BASE: u32 = 0x0C00_3000;
const SCRATCH: u32 = 0x0000_8000;

/// Walks a scratch buffer, polls the timer and emits one command per slice.
#[derive(Default)]
struct Script {
    step: u32,
}

impl GuestExecutor for Script {
    fn execute(&mut self, ctx: &mut ExecContext<'_>, budget: u64) -> u64 {
        self.step = self.step.wrapping_add(1);
        let slot = SCRATCH + (self.step % 64) * 4;
        let previous = ctx.load_u32(slot).unwrap_or(0);
        ctx.store_u32(slot, previous.rotate_left(5) ^ self.step);

        let ticks = ctx.load_u32(TIMER_BASE + TIMER_REG_COUNT).unwrap_or(0);
        if ctx.load_u32(TIMER_BASE + TIMER_REG_STATUS).unwrap_or(0) & TIMER_STATUS_EXPIRED != 0 {
            ctx.store_u32(TIMER_BASE + TIMER_REG_STATUS, TIMER_STATUS_EXPIRED);
        }

        let mut command = [0u8; 12];
        command[..4].copy_from_slice(&self.step.to_be_bytes());
        command[4..8].copy_from_slice(&ticks.to_be_bytes());
        command[8..].copy_from_slice(&previous.to_be_bytes());
        ctx.write_gather(&command);
        budget.min(u64::from(self.step % 97 + 13))
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl CommandSink for Capture {
    fn consume(&mut self, bytes: &[u8]) {
        self.0.lock().expect("capture").extend_from_slice(bytes);
    }
}

fn hash_bytes(hash: &mut u64, bytes: &[u8]) {
    for byte in bytes {
        *hash ^= u64::from(*byte);
        *hash = hash.wrapping_mul(0x1000_0000_01B3);
    }
}

fn fingerprint(cpu_thread: bool) -> String {
    let capture = Capture::default();
    let mut session = Session::new(
        MemoryConfig {
            ram_base: 0,
            ram_size: 0x0001_0000,
            open_bus: 0,
        },
        Box::new(Script::default()),
        Box::new(capture.clone()),
    );
    session
        .install_peripheral(IntervalTimer::new(TIMER_BASE, 250, 1 << 4))
        .expect("timer range is free");
    session
        .initialize(&SessionConfig {
            cpu_thread,
            ..SessionConfig::default()
        })
        .expect("fresh session");
    session.start().expect("initialized");
    session
        .memory_mut()
        .write_u32(
            TIMER_BASE + TIMER_REG_CONTROL,
            TIMER_CONTROL_ENABLE | TIMER_CONTROL_PERIODIC | TIMER_CONTROL_IRQ,
        )
        .expect("mmu off");

    for _ in 0..16 {
        session.run_for(1_000).expect("running");
    }

    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    let diagnostics = session.diagnostics();
    hash_bytes(&mut hash, &diagnostics.cycles.to_le_bytes());
    hash_bytes(&mut hash, &diagnostics.events_fired.to_le_bytes());
    hash_bytes(&mut hash, &diagnostics.faults.total().to_le_bytes());
    hash_bytes(&mut hash, &session.cpu().slices().to_le_bytes());
    hash_bytes(&mut hash, &session.cpu().regs().pc().to_le_bytes());
    hash_bytes(&mut hash, &session.memory().ram()[SCRATCH as usize..][..256]);

    session.teardown().expect("clean teardown");
    hash_bytes(&mut hash, &capture.0.lock().expect("capture"));
    log::info!(
        "fingerprint ({}): {} cycles, {} events",
        if cpu_thread { "threaded" } else { "interleaved" },
        diagnostics.cycles,
        diagnostics.events_fired
    );

    format!("{hash:016x}")
}

fn main() {
    env_logger::init();
    let interleaved = fingerprint(false);
    let threaded = fingerprint(true);
    println!("interleaved {interleaved}");
    println!("threaded    {threaded}");
    if interleaved != threaded {
        log::error!("execution modes diverged");
        std::process::exit(1);
    }
}
