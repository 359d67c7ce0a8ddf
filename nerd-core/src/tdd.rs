//! TDD orchestration loop
//!
//! A state machine over the kernel, virtual store and an LLM client:
//! `idle → running_tests → passing | failing → analyzing →
//! generating_patch → applying_patch → compiling → compile_error →
//! {analyzing | escalated} | idle`. Every transition re-asserts
//! `test_state(/state)` and `retry_count(n)` in one kernel transaction
//! so observers always see a consistent snapshot. Test output is parsed
//! into `diagnostic(/severity, file, line, code, msg)` facts for the Go,
//! Python and Rust formats.

use crate::action::{ActionRequest, ActionType};
use crate::error::{NerdError, Result};
use crate::kernel::types::{Fact, Value};
use crate::kernel::Kernel;
use crate::llm::LlmClient;
use crate::vstore::VirtualStore;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Loop state, mirrored into the kernel as `test_state(/...)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TddState {
    /// Waiting for work
    Idle,
    /// Test command in flight
    RunningTests,
    /// Tests green
    Passing,
    /// Tests red
    Failing,
    /// Diagnostics asserted, deciding what to patch
    Analyzing,
    /// Asking the model for a patch
    GeneratingPatch,
    /// Applying the patch through the virtual store
    ApplyingPatch,
    /// Build command in flight
    Compiling,
    /// Build failed
    CompileError,
    /// Retry budget exhausted
    Escalated,
}

impl TddState {
    /// The state's atom symbol
    pub fn atom_name(&self) -> &'static str {
        match self {
            TddState::Idle => "/idle",
            TddState::RunningTests => "/running_tests",
            TddState::Passing => "/passing",
            TddState::Failing => "/failing",
            TddState::Analyzing => "/analyzing",
            TddState::GeneratingPatch => "/generating_patch",
            TddState::ApplyingPatch => "/applying_patch",
            TddState::Compiling => "/compiling",
            TddState::CompileError => "/compile_error",
            TddState::Escalated => "/escalated",
        }
    }
}

/// One parsed compiler or test diagnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// `/error` or `/warning`
    pub severity: &'static str,
    /// Source file
    pub file: String,
    /// Line number
    pub line: i64,
    /// Tool-specific code (`E0308`, `TypeError`, …)
    pub code: String,
    /// Message text
    pub msg: String,
}

impl Diagnostic {
    /// The `diagnostic/5` fact for this entry
    pub fn to_fact(&self) -> Fact {
        Fact::new(
            "diagnostic",
            vec![
                Value::name(self.severity),
                Value::string(&self.file),
                Value::Int(self.line),
                Value::string(&self.code),
                Value::string(&self.msg),
            ],
        )
    }
}

static GO_DIAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^\s:]+\.go):(\d+):(?:\d+:)? ?(.+)$").expect("static pattern"));
static RUST_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(error|warning)(?:\[(\w+)\])?: (.+)$").expect("static pattern")
});
static RUST_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*--> ([^\s:]+):(\d+):\d+").expect("static pattern"));
static PY_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*File "([^"]+)", line (\d+)"#).expect("static pattern"));
static PY_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+(?:Error|Exception)): (.+)$").expect("static pattern"));

/// Parse Go, Rust and Python tool output into diagnostics
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut pending_rust: Option<(String, String, String)> = None;
    let mut pending_py: Option<(String, i64)> = None;

    for line in output.lines() {
        if let Some(caps) = GO_DIAG.captures(line) {
            diagnostics.push(Diagnostic {
                severity: "/error",
                file: caps[1].to_string(),
                line: caps[2].parse().unwrap_or(0),
                code: String::new(),
                msg: caps[3].trim().to_string(),
            });
            continue;
        }

        if let Some(caps) = RUST_HEADER.captures(line) {
            let severity = caps.get(1).map(|m| m.as_str()).unwrap_or("error");
            pending_rust = Some((
                severity.to_string(),
                caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string(),
                caps[3].to_string(),
            ));
            continue;
        }
        if let Some(caps) = RUST_LOCATION.captures(line) {
            if let Some((severity, code, msg)) = pending_rust.take() {
                diagnostics.push(Diagnostic {
                    severity: if severity == "warning" {
                        "/warning"
                    } else {
                        "/error"
                    },
                    file: caps[1].to_string(),
                    line: caps[2].parse().unwrap_or(0),
                    code,
                    msg,
                });
            }
            continue;
        }

        if let Some(caps) = PY_LOCATION.captures(line) {
            pending_py = Some((caps[1].to_string(), caps[2].parse().unwrap_or(0)));
            continue;
        }
        if let Some(caps) = PY_ERROR.captures(line) {
            let (file, line_no) = pending_py.take().unwrap_or_default();
            diagnostics.push(Diagnostic {
                severity: "/error",
                file,
                line: line_no,
                code: caps[1].to_string(),
                msg: caps[2].to_string(),
            });
        }
    }

    diagnostics
}

/// Loop configuration
#[derive(Debug, Clone)]
pub struct TddConfig {
    /// Compile-error retries before escalation
    pub max_retries: u32,
    /// Test command budget
    pub test_timeout: Duration,
    /// Build command budget
    pub build_timeout: Duration,
    /// Command that runs the tests
    pub test_command: String,
    /// Command that builds the tree
    pub build_command: String,
}

impl Default for TddConfig {
    fn default() -> Self {
        TddConfig {
            max_retries: 3,
            test_timeout: Duration::from_secs(300),
            build_timeout: Duration::from_secs(300),
            test_command: "go test ./...".to_string(),
            build_command: "go build ./...".to_string(),
        }
    }
}

/// The test→diagnose→patch→rebuild orchestrator
pub struct TddLoop {
    kernel: Arc<Kernel>,
    vstore: Arc<VirtualStore>,
    llm: Option<Arc<dyn LlmClient>>,
    config: TddConfig,
    state: RwLock<TddState>,
    retries: AtomicU32,
    action_counter: AtomicU64,
}

impl TddLoop {
    /// Create a loop; without an LLM client the patch phase escalates
    pub fn new(
        kernel: Arc<Kernel>,
        vstore: Arc<VirtualStore>,
        llm: Option<Arc<dyn LlmClient>>,
        config: TddConfig,
    ) -> Self {
        TddLoop {
            kernel,
            vstore,
            llm,
            config,
            state: RwLock::new(TddState::Idle),
            retries: AtomicU32::new(0),
            action_counter: AtomicU64::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> TddState {
        *self.state.read()
    }

    /// Transition, re-asserting `test_state` and `retry_count`
    /// atomically so observers see one consistent snapshot.
    pub fn transition(&self, state: TddState) -> Result<()> {
        let retries = self.retries.load(Ordering::SeqCst);
        self.kernel.transaction(|txn| {
            txn.retract("test_state");
            txn.retract("retry_count");
            txn.assert_fact(Fact::unary("test_state", Value::name(state.atom_name())))?;
            txn.assert_fact(Fact::unary("retry_count", Value::Int(i64::from(retries))))?;
            Ok(())
        })?;
        *self.state.write() = state;
        info!(state = state.atom_name(), retries, "tdd transition");
        Ok(())
    }

    fn next_action_id(&self, phase: &str) -> String {
        format!(
            "tdd-{phase}-{}",
            self.action_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn run_command(
        &self,
        command: &str,
        budget: Duration,
        action: ActionType,
    ) -> Result<(bool, String)> {
        let request = ActionRequest::new(self.next_action_id("cmd"), action, command);
        let result = tokio::time::timeout(budget, self.vstore.route_action(&request))
            .await
            .map_err(|_| NerdError::QueueTimeout(budget))??;
        Ok((result.success, result.output))
    }

    /// Run the test command and assert fresh diagnostics. Returns the
    /// resulting state (`Passing` or `Failing`).
    #[instrument(skip(self))]
    pub async fn run_tests(&self) -> Result<TddState> {
        self.transition(TddState::RunningTests)?;
        let (success, output) = self
            .run_command(
                &self.config.test_command.clone(),
                self.config.test_timeout,
                ActionType::RunTests,
            )
            .await?;

        let diagnostics = parse_diagnostics(&output);
        self.kernel.transaction(|txn| {
            txn.retract("diagnostic");
            for diagnostic in &diagnostics {
                txn.assert_fact(diagnostic.to_fact())?;
            }
            Ok(())
        })?;

        let state = if success {
            TddState::Passing
        } else {
            TddState::Failing
        };
        self.transition(state)?;
        Ok(state)
    }

    /// Ask the model for a patch over the current diagnostics. The reply
    /// must be a JSON object `{"file": …, "old": …, "new": …}`.
    async fn generate_patch(&self) -> Result<serde_json::Value> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| NerdError::Shard("no LLM client for patch generation".to_string()))?;

        let diagnostics = self.kernel.query("diagnostic")?;
        let listing = diagnostics
            .iter()
            .map(|f| f.canonical())
            .collect::<Vec<_>>()
            .join("\n");

        let reply = llm
            .complete_with_system(
                "Propose one minimal patch as JSON {\"file\", \"old\", \"new\"}.",
                &listing,
            )
            .await?;
        let patch: serde_json::Value = serde_json::from_str(reply.trim())?;
        Ok(patch)
    }

    async fn apply_patch(&self, patch: &serde_json::Value) -> Result<bool> {
        let file = patch.get("file").and_then(|v| v.as_str()).unwrap_or_default();
        if file.is_empty() {
            return Ok(false);
        }
        let request = ActionRequest::new(
            self.next_action_id("patch"),
            ActionType::EditFile,
            file,
        )
        .with_payload("old", patch.get("old").cloned().unwrap_or_default())
        .with_payload("new", patch.get("new").cloned().unwrap_or_default());
        let result = self.vstore.route_action(&request).await?;
        Ok(result.success)
    }

    /// Drive the full cycle until the tests pass, the loop escalates, or
    /// an unrecoverable routing error surfaces. Returns the final state.
    pub async fn run_cycle(&self) -> Result<TddState> {
        self.retries.store(0, Ordering::SeqCst);
        let mut failed_rounds = 0u32;

        loop {
            match self.run_tests().await? {
                TddState::Passing => {
                    self.transition(TddState::Idle)?;
                    return Ok(TddState::Passing);
                }
                _ => {
                    failed_rounds += 1;
                    if failed_rounds > self.config.max_retries {
                        self.transition(TddState::Escalated)?;
                        return Ok(TddState::Escalated);
                    }
                    self.transition(TddState::Analyzing)?;
                }
            }

            self.transition(TddState::GeneratingPatch)?;
            let patch = match self.generate_patch().await {
                Ok(patch) => patch,
                Err(e) => {
                    warn!(error = %e, "patch generation failed");
                    self.transition(TddState::Escalated)?;
                    return Ok(TddState::Escalated);
                }
            };

            self.transition(TddState::ApplyingPatch)?;
            if !self.apply_patch(&patch).await? {
                warn!("patch did not apply");
                if self.bump_retry()? {
                    return Ok(TddState::Escalated);
                }
                continue;
            }

            self.transition(TddState::Compiling)?;
            let (built, _output) = self
                .run_command(
                    &self.config.build_command.clone(),
                    self.config.build_timeout,
                    ActionType::Build,
                )
                .await?;
            if !built {
                self.transition(TddState::CompileError)?;
                if self.bump_retry()? {
                    return Ok(TddState::Escalated);
                }
                self.transition(TddState::Analyzing)?;
            }
        }
    }

    /// Returns true when the retry budget is exhausted (loop escalated)
    fn bump_retry(&self) -> Result<bool> {
        let retries = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
        if retries >= self.config.max_retries {
            self.transition(TddState::Escalated)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether committing is currently blocked: delegates to a
    /// `block_commit` query, falling back to "any error-severity
    /// diagnostic blocks".
    pub fn block_commit(&self) -> bool {
        if self.kernel.holds("block_commit") {
            return true;
        }
        self.kernel
            .query("diagnostic(/error, F, L, C, M)")
            .map(|r| !r.is_empty())
            .unwrap_or(true)
    }
}
