//! Error types for the NERD core

use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum NerdError {
    /// Fact or rule text failed to parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Asserted fact's predicate is not declared in the schema
    #[error("Undeclared predicate: {0}")]
    UndeclaredPredicate(String),

    /// Asserted fact does not match its schema declaration
    #[error("Schema mismatch for {predicate}: {reason}")]
    SchemaMismatch {
        /// Predicate whose declaration was violated
        predicate: String,
        /// Arity or argument type detail
        reason: String,
    },

    /// Program failed to compile (stratification, range restriction)
    #[error("Compile error: {0}")]
    Compile(String),

    /// Negated atom contains an anonymous hole
    #[error("Unsafe negation: {0}")]
    UnsafeNegation(String),

    /// Rule matches an infinite-loop hazard pattern
    #[error("infinite loop risk: {0}")]
    InfiniteLoopRisk(String),

    /// A constitution rule rejected the action before execution
    #[error("constitutional violation ({rule}): {reason}")]
    Constitutional {
        /// Name of the constitution rule that matched
        rule: String,
        /// What the rule flagged
        reason: String,
    },

    /// The dreamer projected the action into a panic state
    #[error("Unsafe action {action_id}: {reason}")]
    UnsafeAction {
        /// Id of the simulated action
        action_id: String,
        /// First derivable panic reason
        reason: String,
    },

    /// A post-action validator rejected the result
    #[error("Validation failed ({validator}): {reason}")]
    ValidationFailed {
        /// Validator that rejected
        validator: String,
        /// Rejection detail
        reason: String,
    },

    /// The action type has no permission fact or no handler
    #[error("Action rejected: {0}")]
    ActionRejected(String),

    /// Spawn queue is at capacity for the request's priority
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Spawn request timed out before dispatch or completion
    #[error("Queue timeout after {0:?}")]
    QueueTimeout(std::time::Duration),

    /// Spawn queue stopped while the request was pending
    #[error("Queue stopped")]
    QueueStopped,

    /// API slot acquisition timed out
    #[error("Slot acquire timeout after {0:?}")]
    SlotTimeout(std::time::Duration),

    /// Scheduler was stopped while a worker waited
    #[error("Scheduler stopped")]
    SchedulerStopped,

    /// Worker is not registered with the scheduler
    #[error("Worker not registered: {0}")]
    WorkerNotRegistered(String),

    /// Named tool is not in the registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool subprocess failed; partial output is carried alongside
    #[error("Tool execution failed: {tool}: {reason}")]
    ToolExecutionFailed {
        /// Tool name
        tool: String,
        /// Failure detail
        reason: String,
        /// Combined stdout/stderr captured before the failure
        output: String,
    },

    /// Resource limit violated
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// LLM client failure
    #[error("LLM error: {0}")]
    Llm(String),

    /// Shard lifecycle failure
    #[error("Shard error: {0}")]
    Shard(String),

    /// Operation cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, NerdError>;
