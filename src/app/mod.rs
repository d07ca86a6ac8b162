//! Binary-side wiring: progress UI and run orchestration.

pub(crate) mod progress_manager;
pub(crate) mod runtime;
