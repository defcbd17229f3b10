/// Session lifecycle state machine.
///
/// Transitions only move forward: `Uninitialized -> Initialized -> Running ->
/// TornDown`. Teardown is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SessionState {
    /// Managers constructed; flags not yet captured.
    #[default]
    Uninitialized,
    /// Flags frozen and execution strategy selected.
    Initialized,
    /// Emulation loop may run.
    Running,
    /// Managers released; the session cannot be reused.
    TornDown,
}

impl SessionState {
    /// Returns `true` when `next` is the single legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Initialized)
                | (Self::Initialized, Self::Running)
                | (Self::Uninitialized | Self::Initialized | Self::Running, Self::TornDown)
        )
    }

    /// Returns `true` while peripherals may still be installed.
    #[must_use]
    pub const fn accepts_peripherals(self) -> bool {
        matches!(self, Self::Uninitialized | Self::Initialized)
    }

    /// Returns `true` once the session has been released.
    #[must_use]
    pub const fn is_torn_down(self) -> bool {
        matches!(self, Self::TornDown)
    }
}
