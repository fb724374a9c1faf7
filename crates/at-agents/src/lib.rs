//! Agent supervision: the session orchestrator, the two-tier QA runner and
//! the IPC command handlers built on them.

pub mod commands;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod qa_report;
pub mod qa_runner;
pub mod settings;
