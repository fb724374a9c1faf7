//! Logging setup shared by the auto-tundra agent services.
//!
//! Everything logs through `tracing`; this crate only decides how the
//! global subscriber renders events (human-readable or JSON) and which
//! level applies when `RUST_LOG` is unset.

pub mod logging;
