//! NERD Core - execution core of a neuro-symbolic coding agent
//!
//! This crate provides the deductive kernel, the constitutional safety
//! pipeline with speculative simulation, validated action execution with
//! self-healing, and an LLM worker fleet scheduled under a shared
//! concurrency budget.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod action;
pub mod constitution;
pub mod dreamer;
pub mod error;
pub mod healer;
pub mod kernel;
pub mod knowledge;
pub mod limits;
pub mod llm;
pub mod monitoring;
pub mod scheduler;
pub mod shard;
pub mod spawn_queue;
pub mod tdd;
pub mod tools;
pub mod validators;
pub mod vstore;
pub mod watcher;

pub use action::{ActionRequest, ActionResult, ActionType};
pub use constitution::Constitution;
pub use dreamer::{DreamResult, Dreamer};
pub use error::{NerdError, Result};
pub use healer::{HealOutcome, Healer};
pub use kernel::types::{Fact, Rule, Term, Value};
pub use kernel::{Kernel, KernelState};
pub use limits::{LimitsConfig, LimitsEnforcer};
pub use llm::LlmClient;
pub use scheduler::{ApiScheduler, ScheduledLlmClient, SchedulerConfig, ShardExecutionState};
pub use shard::{Shard, ShardConfig, ShardManager, ShardOutcome, ShardProfile};
pub use spawn_queue::{SpawnPriority, SpawnQueue, SpawnQueueConfig, SpawnRequest};
pub use tdd::{TddConfig, TddLoop, TddState};
pub use tools::{StaticToolDef, Tool, ToolRegistry};
pub use validators::{ValidationResult, Validator, ValidatorSet};
pub use vstore::VirtualStore;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
