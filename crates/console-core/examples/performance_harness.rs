//! Performance harness for console-core benchmarking.
//!
//! Measures scheduler dispatch rate, RAM fast-path throughput and slice-loop
//! throughput in both execution modes.
//!
//! ## Usage
//!
//! ```sh
//! RUST_LOG=info cargo run -p console-core --release --example performance_harness
//! ```
//!
//! ## Metrics
//!
//! - Events per second through schedule + advance
//! - Word accesses per second on the RAM fast path
//! - Emulated cycles per second and command bytes per second for a session

#![allow(clippy::pedantic)]

use console_core::{
    CommandSink, EventScheduler, ExecContext, GuestExecutor, MemoryConfig, MemoryManager, Session,
    SessionConfig,
};
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;

use std::time::{Duration, Instant};

const RAM_SIZE: u32 = 0x0100_0000;
const SLICE_CYCLES: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
struct BenchmarkResult {
    name: &'static str,
    operations_per_second: f64,
    unit: &'static str,
}

fn benchmark_scheduler(duration: Duration) -> BenchmarkResult {
    let mut scheduler = EventScheduler::<u64>::new();
    let ty = scheduler.register_event_type("bench", |count: &mut u64, sched, args| {
        *count += 1;
        if args.user_data > 0 {
            sched.schedule(args.user_data, args.event_type, args.user_data);
        }
    });
    // Eight self-rescheduling chains with co-prime periods.
    for period in [3, 5, 7, 11, 13, 17, 19, 23] {
        scheduler.schedule(period, ty, period);
    }

    let mut fired = 0u64;
    let mut now = 0u64;
    let start = Instant::now();
    while start.elapsed() < duration {
        now += 1_000;
        scheduler.advance(now, &mut fired);
    }

    BenchmarkResult {
        name: "scheduler",
        operations_per_second: fired as f64 / start.elapsed().as_secs_f64(),
        unit: "events/s",
    }
}

fn benchmark_ram(duration: Duration) -> BenchmarkResult {
    let mut memory = MemoryManager::new(MemoryConfig {
        ram_base: 0,
        ram_size: RAM_SIZE,
        open_bus: 0,
    });

    let mut accesses = 0u64;
    let mut addr = 0u32;
    let start = Instant::now();
    while start.elapsed() < duration {
        for _ in 0..4_096 {
            let value = memory.read_u32(addr).unwrap_or(0);
            memory.write_u32(addr, value.wrapping_add(1)).ok();
            addr = (addr + 4) % RAM_SIZE;
            accesses += 2;
        }
    }

    BenchmarkResult {
        name: "ram_fast_path",
        operations_per_second: accesses as f64 / start.elapsed().as_secs_f64(),
        unit: "accesses/s",
    }
}

/// Touches RAM and streams a 32-byte command every slice.
struct Streamer {
    cursor: u32,
}

impl GuestExecutor for Streamer {
    fn execute(&mut self, ctx: &mut ExecContext<'_>, budget: u64) -> u64 {
        for _ in 0..64 {
            let value = ctx.load_u32(self.cursor).unwrap_or(0);
            ctx.store_u32(self.cursor, value ^ 0x5A5A_5A5A);
            self.cursor = (self.cursor + 4) % RAM_SIZE;
        }
        ctx.write_gather(&[0x61; 32]);
        budget
    }
}

struct Discard;

impl CommandSink for Discard {
    fn consume(&mut self, bytes: &[u8]) {
        let _ = std::hint::black_box(bytes.len());
    }
}

fn benchmark_session(duration: Duration, cpu_thread: bool) -> [BenchmarkResult; 2] {
    let mut session = Session::new(
        MemoryConfig {
            ram_base: 0,
            ram_size: RAM_SIZE,
            open_bus: 0,
        },
        Box::new(Streamer { cursor: 0 }),
        Box::new(Discard),
    );
    session
        .initialize(&SessionConfig {
            cpu_thread,
            ..SessionConfig::default()
        })
        .expect("fresh session");
    session.start().expect("initialized");

    let ty = session
        .scheduler_mut()
        .register_event_type("vblank", |_, sched, args| {
            sched.schedule(SLICE_CYCLES, args.event_type, 0);
        });
    session.scheduler_mut().schedule(SLICE_CYCLES, ty, 0);

    let start = Instant::now();
    while start.elapsed() < duration {
        session.run_for(SLICE_CYCLES * 100).expect("running");
    }
    let elapsed = start.elapsed().as_secs_f64();
    let diagnostics = session.diagnostics();
    session.teardown().expect("clean teardown");

    let (cycles_name, bytes_name) = if cpu_thread {
        ("threaded_cycles", "threaded_fifo")
    } else {
        ("interleaved_cycles", "interleaved_fifo")
    };
    [
        BenchmarkResult {
            name: cycles_name,
            operations_per_second: diagnostics.cycles as f64 / elapsed,
            unit: "cycles/s",
        },
        BenchmarkResult {
            name: bytes_name,
            operations_per_second: diagnostics.fifo_bytes as f64 / elapsed,
            unit: "bytes/s",
        },
    ]
}

fn format_number(n: f64) -> String {
    if n >= 1_000_000_000.0 {
        format!("{:.2}G", n / 1_000_000_000.0)
    } else if n >= 1_000_000.0 {
        format!("{:.2}M", n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.2}K", n / 1_000.0)
    } else {
        format!("{:.2}", n)
    }
}

fn print_results(results: &[BenchmarkResult]) {
    println!("\n{:20} {:>12}  unit", "benchmark", "rate");
    println!("{}", "-".repeat(44));
    for result in results {
        println!(
            "{:20} {:>12}  {}",
            result.name,
            format_number(result.operations_per_second),
            result.unit
        );
    }
}

fn main() {
    env_logger::init();
    let warmup = Duration::from_millis(300);
    let benchmark_duration = Duration::from_secs(2);

    log::info!("warming up for {warmup:?}");
    let _ = benchmark_scheduler(warmup);

    log::info!("running benchmarks for {benchmark_duration:?} each");
    let mut results = vec![
        benchmark_scheduler(benchmark_duration),
        benchmark_ram(benchmark_duration),
    ];
    results.extend(benchmark_session(benchmark_duration, false));
    results.extend(benchmark_session(benchmark_duration, true));

    print_results(&results);
}
