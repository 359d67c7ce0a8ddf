//! The virtual store: action dispatch with a safety prelude and postlude
//!
//! Routing one action runs, in order: the `permitted(/<type>)` gate
//! against the kernel, the constitution, the handler from the dispatch
//! table, the validator set, and on validation failure the healer.
//! Handlers are plain async functions keyed by `ActionType`; side
//! effects that modify facts are returned in `facts_to_add` for the
//! caller to assert.

use crate::action::{ActionRequest, ActionResult, ActionType};
use crate::constitution::Constitution;
use crate::error::{NerdError, Result};
use crate::healer::{HealOutcome, Healer};
use crate::kernel::types::{Fact, Value};
use crate::kernel::Kernel;
use crate::validators::ValidatorSet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Environment variables forwarded to subprocess execution
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "TMPDIR", "GOPATH", "GOROOT", "CARGO_HOME",
    "RUSTUP_HOME",
];

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<ActionResult>> + Send>>;

/// An action handler: a plain function from request to result
pub type ActionHandler = Arc<dyn Fn(ActionRequest) -> HandlerFuture + Send + Sync>;

/// Action dispatcher with constitutional prelude and validation postlude
pub struct VirtualStore {
    kernel: Arc<Kernel>,
    constitution: Constitution,
    validators: ValidatorSet,
    healer: Healer,
    handlers: RwLock<HashMap<ActionType, ActionHandler>>,
}

impl VirtualStore {
    /// Create a store with the standard constitution, validators and
    /// healer, and the built-in filesystem/subprocess handlers.
    pub fn new(kernel: Arc<Kernel>) -> Arc<Self> {
        Self::with_components(
            kernel,
            Constitution::new(),
            ValidatorSet::standard(),
            Healer::new(),
        )
    }

    /// Create a store from explicit components
    pub fn with_components(
        kernel: Arc<Kernel>,
        constitution: Constitution,
        validators: ValidatorSet,
        healer: Healer,
    ) -> Arc<Self> {
        let store = Arc::new(VirtualStore {
            kernel,
            constitution,
            validators,
            healer,
            handlers: RwLock::new(HashMap::new()),
        });
        store.register_builtin_handlers();
        store
    }

    /// Register (or replace) the handler for an action type
    pub fn register_handler(&self, action: ActionType, handler: ActionHandler) {
        self.handlers.write().insert(action, handler);
    }

    /// The kernel this store routes against
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Route one action through gate, constitution, handler and
    /// validators. Validation failures go through the healer; an
    /// unhealed failure surfaces as `ValidationFailed`.
    #[instrument(skip(self, request), fields(id = %request.id, action = %request.action))]
    pub async fn route_action(&self, request: &ActionRequest) -> Result<ActionResult> {
        // permission gate: fail closed when the fact is missing
        let gate = format!("permitted({})", request.action.atom_name());
        if !self.kernel.holds(&gate) {
            return Err(NerdError::ActionRejected(format!(
                "no permitted({}) fact derivable",
                request.action.atom_name()
            )));
        }

        self.constitution.check(request)?;

        // fetch the handler under the read lock, never hold it across await
        let handler = self
            .handlers
            .read()
            .get(&request.action)
            .cloned()
            .ok_or_else(|| {
                NerdError::ActionRejected(format!(
                    "no handler for action type {}",
                    request.action
                ))
            })?;

        let result = handler(request.clone()).await?;

        if !result.success {
            debug!(error = ?result.error, "handler reported failure");
            return Ok(result);
        }

        match self.validators.validate_all(request, &result) {
            Ok(_) => Ok(result),
            Err(rejection) => {
                let reason = rejection
                    .error
                    .clone()
                    .unwrap_or_else(|| "validator rejected".to_string());
                warn!(method = %rejection.method, %reason, "validation failed, healing");

                let handler_for_retry = handler.clone();
                let (outcome, facts) = self
                    .healer
                    .heal(request, &reason, move |req| {
                        let handler = handler_for_retry.clone();
                        async move { handler(req).await }
                    })
                    .await;

                match outcome {
                    HealOutcome::Recovered(mut recovered) => {
                        recovered.facts_to_add.extend(facts);
                        Ok(recovered)
                    }
                    HealOutcome::Escalated { reason } => {
                        // healing facts have nowhere else to go on the
                        // error path; fold them in directly
                        for fact in facts {
                            if let Err(e) = self.kernel.assert_without_eval(fact) {
                                warn!(error = %e, "could not record healing fact");
                            }
                        }
                        let _ = self.kernel.evaluate();
                        Err(NerdError::ValidationFailed {
                            validator: rejection.method,
                            reason,
                        })
                    }
                }
            }
        }
    }

    /// Route an action built from a `next_action(/type, "target")` fact
    pub async fn route_next_action(
        &self,
        fact: &Fact,
        id: impl Into<String>,
    ) -> Result<ActionResult> {
        let request = ActionRequest::from_next_action(fact, id)?;
        self.route_action(&request).await
    }

    /// Hydrate the kernel from a knowledge store: every fact persisted
    /// with the `kernel` fact type is re-asserted. Facts the schema
    /// rejects are skipped with a warning; the count of asserted facts
    /// is returned.
    pub async fn hydrate_from_knowledge(
        &self,
        store: &dyn crate::knowledge::KnowledgeStore,
    ) -> Result<usize> {
        let stored = store
            .load_all_facts("kernel")
            .await
            .map_err(|e| NerdError::Config(format!("knowledge store: {e}")))?;

        let mut asserted = 0;
        for entry in stored {
            let fact = Fact::new(entry.predicate.clone(), entry.args.clone());
            match self.kernel.assert_without_eval(fact) {
                Ok(()) => asserted += 1,
                Err(e) => warn!(predicate = %entry.predicate, error = %e, "hydration skipped a fact"),
            }
        }
        self.kernel.evaluate()?;
        Ok(asserted)
    }

    fn register_builtin_handlers(self: &Arc<Self>) {
        self.register_handler(ActionType::ReadFile, handler(read_file));
        self.register_handler(ActionType::WriteFile, handler(write_file));
        self.register_handler(ActionType::EditFile, handler(edit_file));
        self.register_handler(ActionType::DeleteFile, handler(delete_file));
        self.register_handler(ActionType::ListDir, handler(list_dir));
        self.register_handler(ActionType::ExecCmd, handler(exec_cmd));
        self.register_handler(ActionType::Build, handler(exec_cmd));
        self.register_handler(ActionType::RunTests, handler(exec_cmd));
        self.register_handler(ActionType::AssertFact, handler(assert_fact));

        let kernel = self.kernel.clone();
        self.register_handler(
            ActionType::Query,
            Arc::new(move |request| {
                let kernel = kernel.clone();
                Box::pin(async move {
                    let facts = kernel.query(&request.target)?;
                    let output = facts
                        .iter()
                        .map(|f| f.canonical())
                        .collect::<Vec<_>>()
                        .join("\n");
                    Ok(ActionResult::ok(output))
                })
            }),
        );
    }
}

/// Lift a plain async fn into a boxed handler
pub fn handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionResult>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

async fn read_file(request: ActionRequest) -> Result<ActionResult> {
    match tokio::fs::read_to_string(&request.target).await {
        Ok(content) => Ok(ActionResult::ok(content)),
        Err(e) => Ok(ActionResult::failed(format!(
            "read {}: {e}",
            request.target
        ))),
    }
}

async fn write_file(request: ActionRequest) -> Result<ActionResult> {
    let content = request
        .payload
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    match tokio::fs::write(&request.target, content).await {
        Ok(()) => Ok(ActionResult::ok("")
            .with_fact(Fact::unary("modified", Value::string(&request.target)))
            .with_fact(Fact::unary("file_exists", Value::string(&request.target)))),
        Err(e) => Ok(ActionResult::failed(format!(
            "write {}: {e}",
            request.target
        ))),
    }
}

async fn edit_file(request: ActionRequest) -> Result<ActionResult> {
    let old = request.payload.get("old").and_then(|v| v.as_str());
    let new = request.payload.get("new").and_then(|v| v.as_str());
    let (Some(old), Some(new)) = (old, new) else {
        return Ok(ActionResult::failed("edit requires old and new payload"));
    };

    let content = match tokio::fs::read_to_string(&request.target).await {
        Ok(c) => c,
        Err(e) => {
            return Ok(ActionResult::failed(format!(
                "read {}: {e}",
                request.target
            )))
        }
    };
    if !content.contains(old) {
        return Ok(ActionResult::failed(format!(
            "span not found in {}",
            request.target
        )));
    }
    let updated = content.replacen(old, new, 1);
    match tokio::fs::write(&request.target, updated).await {
        Ok(()) => Ok(ActionResult::ok("")
            .with_fact(Fact::unary("modified", Value::string(&request.target)))
            .with_fact(Fact::new(
                "element_modified",
                vec![
                    Value::string(&request.target),
                    Value::string(&request.session_id),
                    Value::Int(chrono::Utc::now().timestamp()),
                ],
            ))),
        Err(e) => Ok(ActionResult::failed(format!(
            "write {}: {e}",
            request.target
        ))),
    }
}

async fn delete_file(request: ActionRequest) -> Result<ActionResult> {
    match tokio::fs::remove_file(&request.target).await {
        Ok(()) => Ok(ActionResult::ok("")
            .with_fact(Fact::unary("file_missing", Value::string(&request.target)))),
        Err(e) => Ok(ActionResult::failed(format!(
            "delete {}: {e}",
            request.target
        ))),
    }
}

async fn list_dir(request: ActionRequest) -> Result<ActionResult> {
    let mut entries = match tokio::fs::read_dir(&request.target).await {
        Ok(e) => e,
        Err(e) => {
            return Ok(ActionResult::failed(format!(
                "list {}: {e}",
                request.target
            )))
        }
    };
    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            Ok(None) => break,
            Err(e) => {
                return Ok(ActionResult::failed(format!(
                    "list {}: {e}",
                    request.target
                )))
            }
        }
    }
    names.sort();
    Ok(ActionResult::ok(names.join("\n")))
}

/// Run a command under `sh -c` with only the allow-listed environment
async fn exec_cmd(request: ActionRequest) -> Result<ActionResult> {
    let mut command = tokio::process::Command::new("sh");
    command
        .arg("-c")
        .arg(&request.target)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for var in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(var) {
            command.env(var, value);
        }
    }

    let output = match command.output().await {
        Ok(o) => o,
        Err(e) => {
            return Ok(ActionResult::failed(format!(
                "spawn {}: {e}",
                request.target
            )))
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(ActionResult::ok(combined))
    } else {
        let mut result = ActionResult::failed(format!(
            "exit status {}",
            output.status.code().unwrap_or(-1)
        ));
        result.output = combined;
        Ok(result)
    }
}

async fn assert_fact(request: ActionRequest) -> Result<ActionResult> {
    let fact = crate::kernel::parser::parse_fact_text(&request.target)?;
    Ok(ActionResult::ok("").with_fact(fact))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn permissive_store() -> (Arc<VirtualStore>, Arc<Kernel>, TempDir) {
        let kernel = Arc::new(Kernel::new());
        for action in ActionType::ALL {
            kernel
                .assert_without_eval(Fact::unary("permitted", action.as_atom()))
                .unwrap();
        }
        kernel.evaluate().unwrap();
        let store = VirtualStore::new(kernel.clone());
        (store, kernel, TempDir::new().unwrap())
    }

    #[tokio::test]
    async fn test_permission_gate_fails_closed() {
        let kernel = Arc::new(Kernel::new());
        let store = VirtualStore::new(kernel);
        let request = ActionRequest::new("r-1", ActionType::ReadFile, "x.txt");
        let err = store.route_action(&request).await.unwrap_err();
        assert!(matches!(err, NerdError::ActionRejected(_)));
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let (store, _kernel, dir) = permissive_store().await;
        let path = dir.path().join("note.txt");

        let write = ActionRequest::new(
            "r-2",
            ActionType::WriteFile,
            path.to_string_lossy(),
        )
        .with_payload("content", serde_json::json!("hello world"));
        let result = store.route_action(&write).await.unwrap();
        assert!(result.success);
        assert!(result
            .facts_to_add
            .iter()
            .any(|f| f.predicate.as_ref() == "modified"));

        let read =
            ActionRequest::new("r-3", ActionType::ReadFile, path.to_string_lossy());
        let result = store.route_action(&read).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, "hello world");
    }

    #[tokio::test]
    async fn test_constitution_blocks_before_execution() {
        let (store, _kernel, _dir) = permissive_store().await;
        let request = ActionRequest::new("r-4", ActionType::ExecCmd, "rm -rf /");
        let err = store.route_action(&request).await.unwrap_err();
        assert!(err.to_string().contains("constitutional violation"));
    }

    #[tokio::test]
    async fn test_exec_captures_combined_output() {
        let (store, _kernel, _dir) = permissive_store().await;
        let request =
            ActionRequest::new("r-5", ActionType::ExecCmd, "echo out && echo err 1>&2");
        let result = store.route_action(&request).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_exec_nonzero_reports_failure_with_output() {
        let (store, _kernel, _dir) = permissive_store().await;
        let request =
            ActionRequest::new("r-6", ActionType::ExecCmd, "echo partial && test -f /nonexistent");
        let result = store.route_action(&request).await.unwrap();
        assert!(!result.success);
        assert!(result.output.contains("partial"));
    }

    #[tokio::test]
    async fn test_edit_file() {
        let (store, _kernel, dir) = permissive_store().await;
        let path = dir.path().join("code.txt");
        std::fs::write(&path, "let x = 1;\nlet y = 2;\n").unwrap();

        let edit = ActionRequest::new("r-7", ActionType::EditFile, path.to_string_lossy())
            .with_payload("old", serde_json::json!("let x = 1;"))
            .with_payload("new", serde_json::json!("let x = 42;"));
        let result = store.route_action(&edit).await.unwrap();
        assert!(result.success);
        assert!(std::fs::read_to_string(&path).unwrap().contains("x = 42"));

        let missing = ActionRequest::new("r-8", ActionType::EditFile, path.to_string_lossy())
            .with_payload("old", serde_json::json!("not present"))
            .with_payload("new", serde_json::json!("whatever"));
        let result = store.route_action(&missing).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_delete_emits_file_missing() {
        let (store, _kernel, dir) = permissive_store().await;
        let path = dir.path().join("doomed.txt");
        std::fs::write(&path, "x").unwrap();

        let request =
            ActionRequest::new("r-9", ActionType::DeleteFile, path.to_string_lossy());
        let result = store.route_action(&request).await.unwrap();
        assert!(result.success);
        assert!(result
            .facts_to_add
            .iter()
            .any(|f| f.predicate.as_ref() == "file_missing"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_query_handler() {
        let (store, kernel, _dir) = permissive_store().await;
        kernel
            .assert_fact(Fact::unary("current_phase", Value::name("/plan")))
            .unwrap();
        let request = ActionRequest::new("r-10", ActionType::Query, "current_phase");
        let result = store.route_action(&request).await.unwrap();
        assert!(result.output.contains("current_phase(/plan)."));
    }

    #[tokio::test]
    async fn test_unknown_handler_rejected() {
        let (store, _kernel, _dir) = permissive_store().await;
        // spawn_shard has no built-in handler until a manager registers one
        let request = ActionRequest::new("r-11", ActionType::SpawnShard, "researcher");
        let err = store.route_action(&request).await.unwrap_err();
        assert!(err.to_string().contains("no handler"));
    }

    struct FixedKnowledgeStore(Vec<crate::knowledge::StoredFact>);

    #[async_trait::async_trait]
    impl crate::knowledge::KnowledgeStore for FixedKnowledgeStore {
        async fn store_fact(
            &self,
            _predicate: &str,
            _args: &[Value],
            _fact_type: &str,
            _importance: f64,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_facts(
            &self,
            predicate: &str,
        ) -> anyhow::Result<Vec<crate::knowledge::StoredFact>> {
            Ok(self
                .0
                .iter()
                .filter(|f| f.predicate == predicate)
                .cloned()
                .collect())
        }
        async fn load_all_facts(
            &self,
            fact_type: &str,
        ) -> anyhow::Result<Vec<crate::knowledge::StoredFact>> {
            Ok(self
                .0
                .iter()
                .filter(|f| f.fact_type == fact_type)
                .cloned()
                .collect())
        }
        async fn store_link(&self, _link: crate::knowledge::KnowledgeLink) -> anyhow::Result<()> {
            Ok(())
        }
        async fn query_links(
            &self,
            _node: &str,
        ) -> anyhow::Result<Vec<crate::knowledge::KnowledgeLink>> {
            Ok(vec![])
        }
        async fn get_recent_activations(&self, _limit: usize) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn vector_recall(
            &self,
            _query: &str,
            _k: usize,
        ) -> anyhow::Result<Vec<crate::knowledge::StoredFact>> {
            Ok(vec![])
        }
        async fn get_session_history(&self, _session_id: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_shard_traces(&self, _shard_id: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn get_trace_stats(&self) -> anyhow::Result<crate::knowledge::TraceStats> {
            Ok(crate::knowledge::TraceStats::default())
        }
    }

    #[tokio::test]
    async fn test_hydrate_from_knowledge_store() {
        let (store, kernel, _dir) = permissive_store().await;
        let knowledge = FixedKnowledgeStore(vec![
            crate::knowledge::StoredFact {
                predicate: "current_phase".into(),
                args: vec![Value::name("/execute")],
                fact_type: "kernel".into(),
                importance: 0.9,
            },
            crate::knowledge::StoredFact {
                predicate: "not_in_schema".into(),
                args: vec![Value::Int(1)],
                fact_type: "kernel".into(),
                importance: 0.1,
            },
            crate::knowledge::StoredFact {
                predicate: "current_time".into(),
                args: vec![Value::Int(7)],
                fact_type: "episodic".into(),
                importance: 0.5,
            },
        ]);

        let asserted = store.hydrate_from_knowledge(&knowledge).await.unwrap();
        // the undeclared predicate is skipped, the episodic fact filtered
        assert_eq!(asserted, 1);
        assert!(kernel.holds("current_phase(/execute)"));
        assert!(!kernel.holds("current_time"));
    }

    #[tokio::test]
    async fn test_assert_fact_returns_fact_to_add() {
        let (store, _kernel, _dir) = permissive_store().await;
        let request = ActionRequest::new(
            "r-12",
            ActionType::AssertFact,
            "current_phase(/execute).",
        );
        let result = store.route_action(&request).await.unwrap();
        assert_eq!(result.facts_to_add.len(), 1);
        assert_eq!(result.facts_to_add[0].predicate.as_ref(), "current_phase");
    }
}
