//! Agent subprocess launching.
//!
//! [`launcher::ProcessLauncher`] is the seam between the orchestrator and the
//! operating system: production code uses [`launcher::TokioProcessLauncher`],
//! tests substitute a mock that drives [`launcher::ProcessControl`] directly.

pub mod launcher;
