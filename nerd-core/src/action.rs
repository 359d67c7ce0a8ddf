//! Action vocabulary
//!
//! `ActionType` is a closed enum; each member is also a kernel atom of
//! the same symbol (`/read_file`, `/exec_cmd`, …). Extending the
//! vocabulary requires both an enum variant and a schema declaration.

use crate::error::{NerdError, Result};
use crate::kernel::types::{Fact, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// The closed set of action kinds the virtual store can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Read a file into the result output
    ReadFile,
    /// Write payload content to a file
    WriteFile,
    /// Replace a payload-described span in a file
    EditFile,
    /// Delete a file
    DeleteFile,
    /// List a directory
    ListDir,
    /// Execute a shell command
    ExecCmd,
    /// Run the build
    Build,
    /// Run the test suite
    RunTests,
    /// Spawn a worker shard
    SpawnShard,
    /// Assert a fact into the kernel
    AssertFact,
    /// Query the kernel
    Query,
    /// Execute a registered tool binary
    ToolExec,
}

impl ActionType {
    /// Every member of the vocabulary
    pub const ALL: &'static [ActionType] = &[
        ActionType::ReadFile,
        ActionType::WriteFile,
        ActionType::EditFile,
        ActionType::DeleteFile,
        ActionType::ListDir,
        ActionType::ExecCmd,
        ActionType::Build,
        ActionType::RunTests,
        ActionType::SpawnShard,
        ActionType::AssertFact,
        ActionType::Query,
        ActionType::ToolExec,
    ];

    /// The atom symbol, including the leading slash
    pub fn atom_name(&self) -> &'static str {
        match self {
            ActionType::ReadFile => "/read_file",
            ActionType::WriteFile => "/write_file",
            ActionType::EditFile => "/edit_file",
            ActionType::DeleteFile => "/delete_file",
            ActionType::ListDir => "/list_dir",
            ActionType::ExecCmd => "/exec_cmd",
            ActionType::Build => "/build",
            ActionType::RunTests => "/run_tests",
            ActionType::SpawnShard => "/spawn_shard",
            ActionType::AssertFact => "/assert_fact",
            ActionType::Query => "/query",
            ActionType::ToolExec => "/tool_exec",
        }
    }

    /// The atom value for kernel facts
    pub fn as_atom(&self) -> Value {
        Value::name(self.atom_name())
    }

    /// Resolve an atom symbol (with or without the slash) to a member.
    /// Unknown symbols are rejected, not silently dropped.
    pub fn from_atom(symbol: &str) -> Result<ActionType> {
        let normalized = if symbol.starts_with('/') {
            symbol.to_string()
        } else {
            format!("/{symbol}")
        };
        ActionType::ALL
            .iter()
            .copied()
            .find(|t| t.atom_name() == normalized)
            .ok_or_else(|| NerdError::ActionRejected(format!("unknown action type {symbol}")))
    }

    /// Whether this action mutates the filesystem
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            ActionType::WriteFile | ActionType::EditFile | ActionType::DeleteFile
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.atom_name())
    }
}

/// A proposed action, routed through the virtual store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Unique request id
    pub id: String,
    /// Action kind
    pub action: ActionType,
    /// Primary target (path, command text, tool name, …)
    pub target: String,
    /// Action-specific parameters
    pub payload: HashMap<String, serde_json::Value>,
    /// Session the action belongs to
    pub session_id: String,
    /// How many times this request has been retried
    pub retry_count: u32,
}

impl ActionRequest {
    /// Create a request with an empty payload
    pub fn new(
        id: impl Into<String>,
        action: ActionType,
        target: impl Into<String>,
    ) -> Self {
        ActionRequest {
            id: id.into(),
            action,
            target: target.into(),
            payload: HashMap::new(),
            session_id: String::new(),
            retry_count: 0,
        }
    }

    /// Attach a payload entry
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Attach the session id
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_id = session.into();
        self
    }

    /// Build a request from a `next_action(/type, "target")` fact.
    pub fn from_next_action(fact: &Fact, id: impl Into<String>) -> Result<ActionRequest> {
        if fact.predicate.as_ref() != "next_action" || fact.args.len() != 2 {
            return Err(NerdError::ActionRejected(format!(
                "not a next_action fact: {fact}"
            )));
        }
        let symbol = fact.args[0]
            .as_name()
            .ok_or_else(|| NerdError::ActionRejected("action type must be an atom".into()))?;
        let action = ActionType::from_atom(symbol)?;
        let target = match &fact.args[1] {
            Value::Str(s) => s.to_string(),
            other => other.to_string(),
        };
        Ok(ActionRequest::new(id, action, target))
    }
}

/// The outcome of one executed action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the handler succeeded
    pub success: bool,
    /// Primary output (file content, command output, …)
    pub output: String,
    /// Handler error text, if any
    pub error: Option<String>,
    /// Handler-specific metadata
    pub metadata: HashMap<String, serde_json::Value>,
    /// Facts the caller folds back into the kernel on success
    #[serde(skip)]
    pub facts_to_add: Vec<Fact>,
}

impl ActionResult {
    /// A successful result with output
    pub fn ok(output: impl Into<String>) -> Self {
        ActionResult {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    /// A failed result with an error message
    pub fn failed(error: impl Into<String>) -> Self {
        ActionResult {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Attach a fact for the caller to assert
    pub fn with_fact(mut self, fact: Fact) -> Self {
        self.facts_to_add.push(fact);
        self
    }
}
