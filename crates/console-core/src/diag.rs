//! Fault counters aggregated across the address space, scheduler and pipeline.

use crate::{FaultClass, FaultCode};

/// Number of distinct fault codes tracked.
pub const FAULT_CODE_COUNT: usize = 5;

/// Saturating per-code fault counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct FaultCounters {
    counts: [u64; FAULT_CODE_COUNT],
    last: Option<FaultCode>,
}

impl FaultCounters {
    /// Records one occurrence of `code`.
    pub fn record(&mut self, code: FaultCode) {
        let slot = &mut self.counts[Self::index(code)];
        *slot = slot.saturating_add(1);
        self.last = Some(code);
    }

    /// Records `n` occurrences of `code`. `last` is untouched when `n` is zero.
    pub fn record_many(&mut self, code: FaultCode, n: u64) {
        if n == 0 {
            return;
        }
        let slot = &mut self.counts[Self::index(code)];
        *slot = slot.saturating_add(n);
        self.last = Some(code);
    }

    /// Occurrences of `code` so far.
    #[must_use]
    pub const fn count(&self, code: FaultCode) -> u64 {
        self.counts[Self::index(code)]
    }

    /// Occurrences of every code belonging to `class`.
    #[must_use]
    pub fn class_count(&self, class: FaultClass) -> u64 {
        (1..=FAULT_CODE_COUNT)
            .filter_map(|code| u8::try_from(code).ok().and_then(FaultCode::from_u8))
            .filter(|code| code.class() == class)
            .map(|code| self.count(code))
            .sum()
    }

    /// Most recently recorded code.
    #[must_use]
    pub const fn last(&self) -> Option<FaultCode> {
        self.last
    }

    /// Total of all counters.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.iter().fold(0, |acc, n| acc.saturating_add(*n))
    }

    /// Adds `other` into `self`. `last` keeps `other`'s value when it has one.
    pub fn merge(&mut self, other: &Self) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts) {
            *mine = mine.saturating_add(theirs);
        }
        if other.last.is_some() {
            self.last = other.last;
        }
    }

    const fn index(code: FaultCode) -> usize {
        code.as_u8() as usize - 1
    }
}

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Diagnostics {
    /// Faults recorded across every manager.
    pub faults: FaultCounters,
    /// Scheduler events delivered so far.
    pub events_fired: u64,
    /// Scheduler events still pending.
    pub events_pending: usize,
    /// Virtual cycles retired by the CPU.
    pub cycles: u64,
    /// Bytes accepted by the command pipeline.
    pub fifo_bytes: u64,
}
