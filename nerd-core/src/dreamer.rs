//! Speculative action simulation
//!
//! The dreamer predicts the effect of a proposed action by projecting
//! hypothetical facts into a cloned kernel and asking whether
//! `panic_state(action_id, reason)` becomes derivable. Every failure
//! path fails closed: no kernel, a failed sandbox evaluation, or a
//! failed query all mark the action unsafe.

use crate::action::{ActionRequest, ActionType};
use crate::constitution::{critical_prefix, is_dangerous_command};
use crate::kernel::types::{Fact, Value};
use crate::kernel::Kernel;
use ahash::AHashSet;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Result of simulating one action
#[derive(Debug, Clone)]
pub struct DreamResult {
    /// Id of the simulated action
    pub action_id: String,
    /// The request that was simulated
    pub request: ActionRequest,
    /// Facts projected into the sandbox
    pub projected_facts: Vec<Fact>,
    /// Whether a panic state became derivable
    pub is_unsafe: bool,
    /// First derivable panic reason, or the failure that forced
    /// fail-closed
    pub reason: Option<String>,
}

impl DreamResult {
    fn unsafe_because(request: &ActionRequest, reason: impl Into<String>) -> Self {
        DreamResult {
            action_id: request.id.clone(),
            request: request.clone(),
            projected_facts: Vec::new(),
            is_unsafe: true,
            reason: Some(reason.into()),
        }
    }
}

/// Projects hypothetical facts and consults `panic_state`
pub struct Dreamer {
    // readers simulate, writers swap the kernel; a raw pointer swap
    // would race concurrent simulations
    kernel: RwLock<Option<Arc<Kernel>>>,
    cache: DashMap<String, DreamResult>,
}

impl Dreamer {
    /// Create a dreamer with no kernel attached (fails closed until one
    /// is set)
    pub fn new() -> Self {
        Dreamer {
            kernel: RwLock::new(None),
            cache: DashMap::new(),
        }
    }

    /// Create a dreamer bound to a kernel
    pub fn with_kernel(kernel: Arc<Kernel>) -> Self {
        let dreamer = Self::new();
        dreamer.set_kernel(kernel);
        dreamer
    }

    /// Swap the kernel handle
    pub fn set_kernel(&self, kernel: Arc<Kernel>) {
        *self.kernel.write() = Some(kernel);
    }

    /// Drop every cached result
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Number of cached results
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Simulate an action. Results are cached by action id; concurrent
    /// simulations share the kernel handle under a read lock.
    #[instrument(skip(self, request), fields(action_id = %request.id))]
    pub fn simulate_action(&self, request: &ActionRequest) -> DreamResult {
        if let Some(cached) = self.cache.get(&request.id) {
            debug!("dream cache hit");
            return cached.clone();
        }

        let kernel = self.kernel.read();
        let Some(kernel) = kernel.as_ref() else {
            warn!("dreamer has no kernel, failing closed");
            return DreamResult::unsafe_because(request, "dreamer has no kernel");
        };

        let result = self.simulate_with_kernel(kernel, request);
        self.cache.insert(request.id.clone(), result.clone());
        result
    }

    fn simulate_with_kernel(&self, kernel: &Arc<Kernel>, request: &ActionRequest) -> DreamResult {
        let projections = match project(kernel, request) {
            Ok(p) => p,
            Err(e) => {
                return DreamResult::unsafe_because(request, format!("projection failed: {e}"))
            }
        };

        let sandbox = kernel.clone_sandbox();
        for fact in &projections {
            if let Err(e) = sandbox.assert_without_eval(fact.clone()) {
                return DreamResult::unsafe_because(
                    request,
                    format!("projection rejected by schema: {e}"),
                );
            }
        }
        if let Err(e) = sandbox.evaluate() {
            return DreamResult::unsafe_because(request, format!("sandbox evaluation failed: {e}"));
        }

        let panics = match sandbox.query("panic_state") {
            Ok(p) => p,
            Err(e) => {
                return DreamResult::unsafe_because(request, format!("panic query failed: {e}"))
            }
        };

        let matched = panics.iter().find(|fact| {
            fact.args
                .first()
                .map(|id| id.coerces_equal(&Value::string(&request.id)))
                .unwrap_or(false)
        });

        DreamResult {
            action_id: request.id.clone(),
            request: request.clone(),
            projected_facts: projections,
            is_unsafe: matched.is_some(),
            reason: matched.and_then(|fact| fact.args.get(1).map(|v| match v {
                Value::Str(s) => s.to_string(),
                other => other.to_string(),
            })),
        }
    }
}

impl Default for Dreamer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the hypothetical facts for a request: the `projected_action`
/// anchor, per-action-type markers, and code-graph impact projections.
fn project(kernel: &Arc<Kernel>, request: &ActionRequest) -> crate::error::Result<Vec<Fact>> {
    let id = Value::string(&request.id);
    let mut facts = vec![Fact::new(
        "projected_action",
        vec![
            id.clone(),
            request.action.as_atom(),
            Value::string(&request.target),
        ],
    )];

    let mark = |marker: &str, value: &str| {
        Fact::new(
            "projected_fact",
            vec![
                Value::string(&request.id),
                Value::name(marker),
                Value::string(value),
            ],
        )
    };

    match request.action {
        ActionType::DeleteFile => {
            facts.push(mark("/file_missing", &request.target));
            if let Some(prefix) = critical_prefix(&request.target) {
                facts.push(mark("/critical_path_hit", prefix));
            }
        }
        ActionType::WriteFile | ActionType::EditFile => {
            facts.push(mark("/modified", &request.target));
            facts.push(mark("/file_exists", &request.target));
        }
        ActionType::ExecCmd => {
            facts.push(mark("/exec_cmd", &request.target));
            if is_dangerous_command(&request.target).is_some() {
                facts.push(mark("/exec_danger", &request.target));
            }
        }
        _ => {}
    }

    if matches!(
        request.action,
        ActionType::WriteFile | ActionType::EditFile | ActionType::DeleteFile
    ) {
        project_code_graph(kernel, request, &mut facts)?;
    }

    Ok(facts)
}

/// Stream the code graph: symbols defined in the target file, then the
/// `*_test.go` callers of those symbols. Facts are filtered and emitted
/// during the stream; the full symbol and caller sets are never
/// materialized beyond what the target actually touches.
fn project_code_graph(
    kernel: &Arc<Kernel>,
    request: &ActionRequest,
    facts: &mut Vec<Fact>,
) -> crate::error::Result<()> {
    let mut local_symbols: AHashSet<String> = AHashSet::new();

    kernel.stream_facts("code_defines", |fact| {
        if let (Some(Value::Str(file)), Some(Value::Str(symbol))) =
            (fact.args.first(), fact.args.get(1))
        {
            if file.as_ref() == request.target {
                if local_symbols.insert(symbol.to_string()) {
                    facts.push(Fact::new(
                        "projected_fact",
                        vec![
                            Value::string(&request.id),
                            Value::name("/touches_symbol"),
                            Value::string(symbol.as_ref()),
                        ],
                    ));
                }
            }
        }
    })?;

    if local_symbols.is_empty() {
        return Ok(());
    }

    let mut impacted: AHashSet<String> = AHashSet::new();
    kernel.stream_facts("code_calls", |fact| {
        if let (Some(Value::Str(caller)), Some(Value::Str(symbol))) =
            (fact.args.first(), fact.args.get(1))
        {
            if caller.ends_with("_test.go")
                && local_symbols.contains(symbol.as_ref())
                && impacted.insert(caller.to_string())
            {
                facts.push(Fact::new(
                    "projected_fact",
                    vec![
                        Value::string(&request.id),
                        Value::name("/impacts_test"),
                        Value::string(caller.as_ref()),
                    ],
                ));
            }
        }
    })?;

    Ok(())
}
