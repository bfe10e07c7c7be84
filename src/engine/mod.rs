//! Execution engine for stratum
//!
//! The planning and scheduling live in the `declarative` crate; this module
//! connects them to the terminal:
//! 1. Rendering - Show the plan grouped by kind, with document diffs
//! 2. Executing - Progress bars, confirmation and Ctrl-C handling

pub mod differ;
pub mod executor;

pub use differ::display_plan;
pub use executor::{DialoguerConfirm, UiProgress, install_abort_handler, print_partial, print_summary};
