use thiserror::Error;

use crate::state::SessionState;

/// Fault classes used for diagnostics aggregation and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Address-space access outside RAM and every MMIO region.
    Memory,
    /// MMU translation miss or protection violation.
    Translation,
    /// Event scheduler used with a stale or unknown handle.
    Scheduler,
    /// Command pipeline flow control.
    Pipeline,
    /// Session used outside its lifecycle.
    Lifecycle,
}

/// Stable fault taxonomy for the scheduling and memory substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultCode {
    /// Access hit neither RAM nor a registered MMIO region with the MMU off.
    #[error("access to unmapped physical address")]
    UnmappedAccess = 0x01,
    /// Virtual address had no translation or lacked the needed permission.
    #[error("mmu translation fault")]
    PageFault = 0x02,
    /// Cancel of an unknown or already-fired event handle.
    #[error("scheduler handle is unknown or expired")]
    SchedulerMisuse = 0x03,
    /// Producer would have exceeded the command queue capacity.
    #[error("command queue saturated")]
    QueueSaturation = 0x04,
    /// Manager used before initialization or after teardown.
    #[error("session used outside its lifecycle")]
    LifecycleViolation = 0x05,
}

impl FaultCode {
    /// Converts a fault code to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable byte value back into a fault code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::UnmappedAccess),
            0x02 => Some(Self::PageFault),
            0x03 => Some(Self::SchedulerMisuse),
            0x04 => Some(Self::QueueSaturation),
            0x05 => Some(Self::LifecycleViolation),
            _ => None,
        }
    }

    /// Returns the diagnostics class for this fault code.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::UnmappedAccess => FaultClass::Memory,
            Self::PageFault => FaultClass::Translation,
            Self::SchedulerMisuse => FaultClass::Scheduler,
            Self::QueueSaturation => FaultClass::Pipeline,
            Self::LifecycleViolation => FaultClass::Lifecycle,
        }
    }

    /// Faults the guest can observe (open-bus value or an exception).
    #[must_use]
    pub const fn is_guest_visible(self) -> bool {
        matches!(self, Self::UnmappedAccess | Self::PageFault)
    }

    /// Faults that indicate a host programming error rather than guest behavior.
    #[must_use]
    pub const fn is_host_error(self) -> bool {
        matches!(self, Self::LifecycleViolation)
    }
}

/// Kind of memory access that triggered a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessKind {
    /// Data load.
    Read,
    /// Data store.
    Write,
}

/// Reason a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum PageFaultReason {
    /// No translation exists for the virtual page.
    NotMapped,
    /// The page is mapped but does not allow this access kind.
    Protection,
}

/// MMU fault returned to the CPU execution manager for guest exception delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[error("page fault at {vaddr:#010x} ({kind:?}, {reason:?})")]
pub struct PageFault {
    /// Faulting virtual address.
    pub vaddr: u32,
    /// Access that was attempted.
    pub kind: AccessKind,
    /// Why translation failed.
    pub reason: PageFaultReason,
}

impl PageFault {
    /// Canonical fault code for every page fault.
    #[must_use]
    pub const fn code(self) -> FaultCode {
        FaultCode::PageFault
    }
}

/// MMIO registration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MmioError {
    /// Range has zero length or wraps past the top of the address space.
    #[error("mmio range {start:#010x}+{len:#x} is empty or wraps")]
    InvalidRange {
        /// Requested start address.
        start: u32,
        /// Requested length in bytes.
        len: u32,
    },
    /// Range intersects RAM or an already registered region.
    #[error("mmio range {start:#010x}..={end:#010x} overlaps {existing}")]
    Overlap {
        /// Inclusive start of the rejected range.
        start: u32,
        /// Inclusive end of the rejected range.
        end: u32,
        /// Name of the region (or `ram`) it collides with.
        existing: &'static str,
    },
}

/// Bulk guest-memory copy failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MemoryError {
    /// Copy window does not lie entirely inside RAM.
    #[error("guest range {addr:#010x}+{len:#x} is not backed by ram")]
    OutOfRange {
        /// Requested guest start address.
        addr: u32,
        /// Requested length in bytes.
        len: usize,
    },
}

/// Command pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FifoError {
    /// Pipeline was closed by teardown or by its consumer stopping; the bytes
    /// were not accepted.
    #[error("command fifo is closed")]
    Closed,
    /// Zero-capacity queues cannot make progress.
    #[error("command fifo capacity must be non-zero")]
    ZeroCapacity,
    /// Threaded pipeline received bytes before its consumer was started.
    #[error("command consumer is not running")]
    NotRunning,
}

/// Session lifecycle and composition failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation requested in a state that does not allow it.
    #[error("operation `{operation}` is not valid in state {state:?}")]
    Lifecycle {
        /// Operation that was rejected.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },
    /// Peripheral MMIO registration failed.
    #[error("peripheral `{peripheral}` failed to register mmio")]
    Mmio {
        /// Peripheral name.
        peripheral: &'static str,
        /// Underlying registration error.
        #[source]
        source: MmioError,
    },
    /// Pipeline could not be started or stopped.
    #[error(transparent)]
    Fifo(#[from] FifoError),
    /// Consumer thread could not be spawned.
    #[error("failed to spawn command consumer thread")]
    Spawn(#[source] std::io::Error),
    /// Consumer thread panicked while draining.
    #[error("command consumer thread panicked")]
    ConsumerPanicked,
}

impl SessionError {
    /// Maps the error onto the stable fault taxonomy.
    #[must_use]
    pub const fn fault_code(&self) -> FaultCode {
        match self {
            Self::Fifo(FifoError::ZeroCapacity) => FaultCode::QueueSaturation,
            Self::Lifecycle { .. }
            | Self::Mmio { .. }
            | Self::Fifo(FifoError::Closed | FifoError::NotRunning)
            | Self::Spawn(_)
            | Self::ConsumerPanicked => FaultCode::LifecycleViolation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessKind, FaultClass, FaultCode, PageFault, PageFaultReason, SessionError};
    use crate::state::SessionState;

    #[test]
    fn stable_code_roundtrip_is_bijective_for_defined_values() {
        for code in 0x01u8..=0x05 {
            let fault = FaultCode::from_u8(code).expect("defined taxonomy code");
            assert_eq!(fault.as_u8(), code);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(FaultCode::from_u8(0x00).is_none());
        assert!(FaultCode::from_u8(0xFF).is_none());
    }

    #[test]
    fn only_memory_faults_are_guest_visible() {
        assert!(FaultCode::UnmappedAccess.is_guest_visible());
        assert!(FaultCode::PageFault.is_guest_visible());
        assert!(!FaultCode::SchedulerMisuse.is_guest_visible());
        assert!(!FaultCode::QueueSaturation.is_guest_visible());
        assert!(FaultCode::LifecycleViolation.is_host_error());
        assert!(!FaultCode::PageFault.is_host_error());
    }

    #[test]
    fn class_mapping_matches_fault_taxonomy() {
        assert_eq!(FaultCode::UnmappedAccess.class(), FaultClass::Memory);
        assert_eq!(FaultCode::PageFault.class(), FaultClass::Translation);
        assert_eq!(FaultCode::SchedulerMisuse.class(), FaultClass::Scheduler);
        assert_eq!(FaultCode::QueueSaturation.class(), FaultClass::Pipeline);
        assert_eq!(
            FaultCode::LifecycleViolation.class(),
            FaultClass::Lifecycle
        );
    }

    #[test]
    fn page_fault_message_names_address() {
        let fault = PageFault {
            vaddr: 0x8000_1234,
            kind: AccessKind::Write,
            reason: PageFaultReason::Protection,
        };
        assert_eq!(fault.code(), FaultCode::PageFault);
        assert!(fault.to_string().contains("0x80001234"));
    }

    #[test]
    fn lifecycle_error_maps_to_lifecycle_violation() {
        let err = SessionError::Lifecycle {
            operation: "start",
            state: SessionState::TornDown,
        };
        assert_eq!(err.fault_code(), FaultCode::LifecycleViolation);
    }
}
