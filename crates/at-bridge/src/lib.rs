//! Bridge layer between the agent core and its outward interfaces.
//!
//! - [`event_bus`]: generic flume-backed pub/sub
//! - [`protocol`]: orchestrator and QA lifecycle events and their channels
//! - [`ipc`]: schema validation for agent IPC commands
//! - [`notifications`]: bounded notification store and sink trait

pub mod event_bus;
pub mod ipc;
pub mod notifications;
pub mod protocol;
