//! Dialogue orchestration.
//!
//! `runtime` drives one user turn end to end, `trigger` hands a complete task
//! to the downstream [`executor::ActionExecutor`] exactly once, and `locks`
//! serializes turns per user.

pub mod executor;
pub mod locks;
pub mod runtime;
pub mod trigger;

pub use executor::{AcknowledgingExecutor, ActionExecutor};
pub use runtime::{DialogueRuntime, RuntimeError, RuntimeStores, SweepReport, TurnOutcome};
pub use trigger::{TaskTrigger, TriggerError, TriggerOutcome};
