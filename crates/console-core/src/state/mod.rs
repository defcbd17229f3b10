//! Guest register file and session lifecycle state.

/// Guest CPU architectural register file.
pub mod registers;
/// Session lifecycle state machine.
pub mod run_state;

pub use registers::{RegisterFile, GENERAL_REGISTER_COUNT};
pub use run_state::SessionState;
