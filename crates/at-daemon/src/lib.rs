//! Background daemon for the auto-tundra agent system.
//!
//! Wires the agent orchestrator, the QA runner and the IPC command handlers
//! together, forwards their events onto one bridge bus, and reports the
//! orchestrator's liveness to the health registry.

pub mod daemon;
pub mod tasks;
