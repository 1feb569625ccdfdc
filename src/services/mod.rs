//! Operations exposed to the CLI, built on the store and the orchestrator.

pub mod sync;
