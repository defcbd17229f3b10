//! Public host-facing configuration and run-loop contracts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Where command-pipeline consumption happens, fixed for a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExecutionMode {
    /// CPU execution and command consumption share the caller's thread.
    #[default]
    Interleaved,
    /// Command consumption runs on its own long-lived thread.
    Threaded,
}

/// Boolean settings read once by `Session::initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ConfigKey {
    /// Run command consumption on a dedicated thread.
    CpuThread,
    /// Translate guest addresses through the MMU.
    Mmu,
    /// Halt the run loop when a collaborator reports a panic.
    PauseOnPanic,
}

impl ConfigKey {
    /// Every key, in the order they are read.
    pub const ALL: [Self; 3] = [Self::CpuThread, Self::Mmu, Self::PauseOnPanic];

    /// Stable dotted name, for collaborators backed by string-keyed stores.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CpuThread => "core.cpu_thread",
            Self::Mmu => "core.mmu",
            Self::PauseOnPanic => "core.pause_on_panic",
        }
    }
}

/// Configuration collaborator queried during initialization.
pub trait ConfigSource {
    /// Returns the value of `key`.
    fn get_bool(&self, key: ConfigKey) -> bool;
}

/// In-memory configuration source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SessionConfig {
    /// Run command consumption on a dedicated thread.
    pub cpu_thread: bool,
    /// Enable MMU translation.
    pub mmu: bool,
    /// Halt when a collaborator reports a panic.
    pub pause_on_panic: bool,
}

impl ConfigSource for SessionConfig {
    fn get_bool(&self, key: ConfigKey) -> bool {
        match key {
            ConfigKey::CpuThread => self.cpu_thread,
            ConfigKey::Mmu => self.mmu,
            ConfigKey::PauseOnPanic => self.pause_on_panic,
        }
    }
}

/// Flags frozen at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SessionFlags {
    /// Selected execution mode.
    pub mode: ExecutionMode,
    /// MMU translation enabled.
    pub mmu_enabled: bool,
    /// Halt on reported panics.
    pub pause_on_panic: bool,
}

impl SessionFlags {
    /// Reads every flag from `source`.
    #[must_use]
    pub fn read_from(source: &dyn ConfigSource) -> Self {
        Self {
            mode: if source.get_bool(ConfigKey::CpuThread) {
                ExecutionMode::Threaded
            } else {
                ExecutionMode::Interleaved
            },
            mmu_enabled: source.get_bool(ConfigKey::Mmu),
            pause_on_panic: source.get_bool(ConfigKey::PauseOnPanic),
        }
    }
}

/// Why a run stopped before its cycle budget was spent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HaltReason {
    /// A collaborator reported a panic while pause-on-panic was set.
    Panic {
        /// Reported message.
        message: String,
    },
}

/// Result of one `Session::run_for` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    /// The whole budget was executed.
    Completed {
        /// Cycles retired.
        cycles: u64,
    },
    /// The loop stopped early at a slice boundary.
    Halted {
        /// Cycles retired before halting.
        cycles: u64,
        /// Cause of the halt.
        reason: HaltReason,
    },
}

impl RunOutcome {
    /// Cycles retired during the call.
    #[must_use]
    pub const fn cycles(&self) -> u64 {
        match self {
            Self::Completed { cycles } | Self::Halted { cycles, .. } => *cycles,
        }
    }

    /// Returns `true` for [`RunOutcome::Halted`].
    #[must_use]
    pub const fn is_halted(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}

#[derive(Debug, Default)]
struct PanicState {
    pending: AtomicBool,
    reports: AtomicU64,
    message: Mutex<Option<String>>,
}

/// Channel through which collaborators report unrecoverable conditions.
///
/// Clones share state and may be used from any thread. The run loop checks
/// for a report after every slice.
#[derive(Debug, Clone, Default)]
pub struct PanicHandle {
    state: Arc<PanicState>,
}

impl PanicHandle {
    /// Creates a handle with no report pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a panic report. Only the latest unhandled message is kept.
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("panic reported: {message}");
        *self
            .state
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.state.reports.fetch_add(1, Ordering::Relaxed);
        self.state.pending.store(true, Ordering::Release);
    }

    /// Takes the pending report, if any.
    #[must_use]
    pub fn take(&self) -> Option<String> {
        if !self.state.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.state
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Total reports received.
    #[must_use]
    pub fn reports(&self) -> u64 {
        self.state.reports.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConfigKey, ConfigSource, ExecutionMode, HaltReason, PanicHandle, RunOutcome,
        SessionConfig, SessionFlags,
    };

    #[test]
    fn default_config_is_single_threaded_without_mmu() {
        let flags = SessionFlags::read_from(&SessionConfig::default());
        assert_eq!(flags.mode, ExecutionMode::Interleaved);
        assert!(!flags.mmu_enabled);
        assert!(!flags.pause_on_panic);
    }

    #[test]
    fn every_key_is_read_from_its_own_field() {
        let config = SessionConfig {
            cpu_thread: true,
            mmu: false,
            pause_on_panic: true,
        };
        let values: Vec<bool> = ConfigKey::ALL
            .iter()
            .map(|key| config.get_bool(*key))
            .collect();
        assert_eq!(values, vec![true, false, true]);
        assert_eq!(
            SessionFlags::read_from(&config).mode,
            ExecutionMode::Threaded
        );
    }

    #[test]
    fn key_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            ConfigKey::ALL.iter().map(|key| key.name()).collect();
        assert_eq!(names.len(), ConfigKey::ALL.len());
    }

    #[test]
    fn panic_handle_reports_once() {
        let handle = PanicHandle::new();
        let remote = handle.clone();
        assert_eq!(handle.take(), None);

        remote.report("dsp hung");
        assert_eq!(handle.take().as_deref(), Some("dsp hung"));
        assert_eq!(handle.take(), None);
        assert_eq!(handle.reports(), 1);
    }

    #[test]
    fn run_outcome_exposes_cycles() {
        let halted = RunOutcome::Halted {
            cycles: 12,
            reason: HaltReason::Panic {
                message: String::from("x"),
            },
        };
        assert_eq!(halted.cycles(), 12);
        assert!(halted.is_halted());
        assert!(!RunOutcome::Completed { cycles: 3 }.is_halted());
    }
}
