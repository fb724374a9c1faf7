//! Runtime harness utilities shared by long-running auto-tundra services.
//!
//! - [`health`]: named-service heartbeat registry with a periodic liveness
//!   sweep and an edge-triggered unhealthy callback.

pub mod health;
