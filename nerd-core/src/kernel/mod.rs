//! The deductive kernel
//!
//! Single source of truth for derivable statements about the world.
//! Schemas, policy modules and learned rules compile into a bottom-up
//! Datalog program over an in-memory fact store; the kernel evaluates to
//! fixpoint and answers pattern-filtered queries.
//!
//! The program is dirty-tracked: any mutation marks it dirty and the next
//! query or evaluate rebuilds it. A failed rebuild leaves the last
//! successful program active. Hot-loaded rules are validated in a sandbox
//! clone first so a bad rule can never corrupt the live kernel.

pub mod eval;
pub mod heal;
pub mod parser;
pub mod program;
pub mod safety;
pub mod schema;
pub mod store;
pub mod types;

pub use safety::UBIQUITOUS_PREDICATES;

use crate::error::{NerdError, Result};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, trace, warn};

use eval::Evaluator;
use heal::HealReport;
use program::Program;
use schema::{ArgType, SchemaSet};
use store::FactStore;
use types::{Atom, Fact, Rule};

/// Callback that may repair a rejected learned rule. Receives the rule
/// text and the rejection; returns replacement text to retry with.
pub type RuleRepair = Arc<dyn Fn(&str, &NerdError) -> Option<String> + Send + Sync>;

/// Kernel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// No schema loaded yet
    Uninitialized,
    /// Schema loaded, nothing asserted
    Initialized,
    /// Mutated since the last successful evaluation
    Dirty,
    /// Program compiled and facts at fixpoint
    Clean,
}

/// One named policy module, keyed by case-folded basename
#[derive(Debug, Clone)]
struct PolicyModule {
    key: String,
    text: String,
}

struct KernelInner {
    schema: SchemaSet,
    base: FactStore,
    derived: FactStore,
    policy: Vec<PolicyModule>,
    hot_rules: Vec<String>,
    learned_rules: Vec<String>,
    dirty: bool,
    state: KernelState,
    learned_path: Option<PathBuf>,
    repair: Option<RuleRepair>,
}

impl KernelInner {
    fn rule_sources(&self) -> impl Iterator<Item = &str> {
        self.policy
            .iter()
            .map(|m| m.text.as_str())
            .chain(self.hot_rules.iter().map(String::as_str))
            .chain(self.learned_rules.iter().map(String::as_str))
    }

    fn parse_all_rules(&self) -> Result<Vec<Rule>> {
        let mut rules = Vec::new();
        for source in self.rule_sources() {
            rules.extend(parser::parse_rules_text(source)?);
        }
        Ok(rules)
    }
}

/// The fact store + rule engine + query surface
pub struct Kernel {
    inner: RwLock<KernelInner>,
    program: ArcSwap<Program>,
    evaluator: Evaluator,
    evaluation_count: AtomicU64,
}

impl Kernel {
    /// Create a kernel with the standard system schema
    pub fn new() -> Self {
        Self::with_schema(default_schema())
    }

    /// Create a kernel with an explicit schema
    pub fn with_schema(schema: SchemaSet) -> Self {
        let state = if schema.is_empty() {
            KernelState::Uninitialized
        } else {
            KernelState::Initialized
        };
        Kernel {
            inner: RwLock::new(KernelInner {
                schema,
                base: FactStore::new(),
                derived: FactStore::new(),
                policy: Vec::new(),
                hot_rules: Vec::new(),
                learned_rules: Vec::new(),
                dirty: false,
                state,
                learned_path: None,
                repair: None,
            }),
            program: ArcSwap::from_pointee(Program::default()),
            evaluator: Evaluator::default(),
            evaluation_count: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> KernelState {
        self.inner.read().state
    }

    /// Extend the schema with a declaration
    pub fn declare(&self, predicate: &str, args: Vec<ArgType>) -> Result<()> {
        let mut inner = self.inner.write();
        inner.schema.declare(predicate, args)?;
        if inner.state == KernelState::Uninitialized {
            inner.state = KernelState::Initialized;
        }
        Ok(())
    }

    /// Install the rule-repair interceptor used by learned-rule loading
    pub fn set_repair_interceptor(&self, repair: RuleRepair) {
        self.inner.write().repair = Some(repair);
    }

    /// Set the path learned rules are persisted to (`.nerd/mangle/learned.mg`)
    pub fn set_learned_path(&self, path: impl Into<PathBuf>) {
        self.inner.write().learned_path = Some(path.into());
    }

    // ------------------------------------------------------------------
    // Facts

    /// Assert a ground fact and evaluate to fixpoint. Fails when the
    /// predicate is undeclared or the declaration does not match.
    /// Idempotent on duplicates.
    pub fn assert_fact(&self, fact: Fact) -> Result<()> {
        self.assert_without_eval(fact)?;
        self.evaluate()
    }

    /// Assert a ground fact without evaluating; fixpoint is deferred to
    /// the next `evaluate`. Used for batched assertion.
    pub fn assert_without_eval(&self, fact: Fact) -> Result<()> {
        let mut inner = self.inner.write();
        inner.schema.validate(&fact)?;
        if inner.base.insert(fact) {
            inner.dirty = true;
            inner.state = KernelState::Dirty;
        }
        Ok(())
    }

    /// Assert many facts, then evaluate once.
    pub fn assert_batch(&self, facts: impl IntoIterator<Item = Fact>) -> Result<()> {
        for fact in facts {
            self.assert_without_eval(fact)?;
        }
        self.evaluate()
    }

    /// Remove all ground facts of a predicate
    pub fn retract(&self, predicate: &str) -> usize {
        let mut inner = self.inner.write();
        let removed = inner.base.retract_predicate(predicate);
        if removed > 0 {
            inner.dirty = true;
            inner.state = KernelState::Dirty;
        }
        removed
    }

    /// Remove facts matching a prefix pattern: any fact whose predicate
    /// matches and whose first `k` args equal the pattern's args.
    pub fn retract_fact(&self, pattern: &Fact) -> usize {
        let mut inner = self.inner.write();
        let removed = inner.base.retract_prefix(pattern);
        if removed > 0 {
            inner.dirty = true;
            inner.state = KernelState::Dirty;
        }
        removed
    }

    // ------------------------------------------------------------------
    // Evaluation and queries

    /// Rebuild the program if dirty and run the fixpoint. A compile or
    /// evaluation failure leaves the previous program and derived facts
    /// active.
    #[instrument(skip(self))]
    pub fn evaluate(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.dirty && inner.state == KernelState::Clean {
            return Ok(());
        }

        let start = Instant::now();
        let rules = inner.parse_all_rules()?;

        let mut schema = inner.schema.clone();
        let program = Program::compile(rules, &mut schema)?;
        let derived = self.evaluator.evaluate(&program, &inner.base)?;

        inner.schema = schema;
        inner.derived = derived;
        inner.dirty = false;
        inner.state = KernelState::Clean;
        self.program.store(Arc::new(program));
        self.evaluation_count.fetch_add(1, Ordering::Relaxed);

        let elapsed = start.elapsed();
        metrics::counter!("nerd_kernel_evaluations_total", 1);
        metrics::histogram!("nerd_kernel_evaluation_seconds", elapsed.as_secs_f64());
        trace!(?elapsed, facts = inner.base.len(), "evaluated to fixpoint");
        Ok(())
    }

    /// Query with a pattern text: a bare predicate name or
    /// `pred(a1, …, an)` where each argument is a constant or variable.
    /// Variables act as wildcards; constants filter under numeric
    /// normalization. An unknown predicate yields an empty result and a
    /// warning.
    pub fn query(&self, pattern: &str) -> Result<Vec<Fact>> {
        let atom = parser::parse_query_pattern(pattern)?;
        self.query_atom(&atom)
    }

    /// Query with a parsed pattern atom. When the program is dirty the
    /// query re-evaluates first; if that fails the last successful
    /// program's facts are served (the failure stays visible through
    /// explicit `evaluate` calls).
    pub fn query_atom(&self, pattern: &Atom) -> Result<Vec<Fact>> {
        if self.inner.read().dirty {
            if let Err(e) = self.evaluate() {
                warn!(error = %e, "evaluation failed, serving last successful program");
            }
        }
        let inner = self.inner.read();
        if !inner.schema.is_declared(&pattern.predicate) {
            warn!(predicate = %pattern.predicate, "query on unknown predicate");
            return Ok(Vec::new());
        }
        let mut results = inner.base.query(pattern);
        results.extend(inner.derived.query(pattern));
        Ok(results)
    }

    /// Every fact (base and derived) grouped by predicate, for debugging
    /// and checkpoint export.
    pub fn query_all(&self) -> Result<HashMap<String, Vec<Fact>>> {
        if self.inner.read().dirty {
            if let Err(e) = self.evaluate() {
                warn!(error = %e, "evaluation failed, serving last successful program");
            }
        }
        let inner = self.inner.read();
        let mut out: HashMap<String, Vec<Fact>> = HashMap::new();
        for (pred, facts) in inner.base.iter_predicates() {
            out.entry(pred.to_string()).or_default().extend_from_slice(facts);
        }
        for (pred, facts) in inner.derived.iter_predicates() {
            out.entry(pred.to_string()).or_default().extend_from_slice(facts);
        }
        Ok(out)
    }

    /// Whether a fact (base or derived) currently holds. Evaluates first
    /// if dirty.
    pub fn holds(&self, pattern: &str) -> bool {
        self.query(pattern).map(|r| !r.is_empty()).unwrap_or(false)
    }

    /// Stream every fact of a predicate through a visitor without
    /// materializing a result vector. Evaluates first if dirty.
    pub fn stream_facts<F>(&self, predicate: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&Fact),
    {
        if self.inner.read().dirty {
            if let Err(e) = self.evaluate() {
                warn!(error = %e, "evaluation failed, serving last successful program");
            }
        }
        let inner = self.inner.read();
        for fact in inner.base.get(predicate) {
            visit(fact);
        }
        for fact in inner.derived.get(predicate) {
            visit(fact);
        }
        Ok(())
    }

    /// Total number of base facts
    pub fn fact_count(&self) -> usize {
        self.inner.read().base.len()
    }

    /// Number of successful evaluations since creation
    pub fn evaluation_count(&self) -> u64 {
        self.evaluation_count.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Cloning

    /// An independent kernel sharing the compiled program, with a
    /// copy-on-write snapshot of the fact store. Used by the dreamer for
    /// speculative evaluation.
    pub fn clone_sandbox(&self) -> Kernel {
        let inner = self.inner.read();
        Kernel {
            inner: RwLock::new(KernelInner {
                schema: inner.schema.clone(),
                base: inner.base.clone(),
                derived: inner.derived.clone(),
                policy: inner.policy.clone(),
                hot_rules: inner.hot_rules.clone(),
                learned_rules: inner.learned_rules.clone(),
                dirty: inner.dirty,
                state: inner.state,
                learned_path: None,
                repair: None,
            }),
            program: ArcSwap::new(self.program.load_full()),
            evaluator: Evaluator::default(),
            evaluation_count: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Policy

    /// Replace the base policy module
    pub fn set_policy(&self, text: impl Into<String>) {
        let mut inner = self.inner.write();
        inner.policy.retain(|m| m.key != "<base>");
        inner.policy.insert(
            0,
            PolicyModule {
                key: "<base>".to_string(),
                text: text.into(),
            },
        );
        inner.dirty = true;
        inner.state = KernelState::Dirty;
    }

    /// Append rules to the base policy module
    pub fn append_policy(&self, text: &str) {
        let mut inner = self.inner.write();
        if let Some(base) = inner.policy.iter_mut().find(|m| m.key == "<base>") {
            base.text.push('\n');
            base.text.push_str(text);
        } else {
            inner.policy.insert(
                0,
                PolicyModule {
                    key: "<base>".to_string(),
                    text: text.to_string(),
                },
            );
        }
        inner.dirty = true;
        inner.state = KernelState::Dirty;
    }

    /// Load a policy module from a file. Loading is idempotent by
    /// case-folded basename: re-loading a path with the same basename
    /// replaces that module. Returns true when the module content
    /// changed.
    pub fn load_policy_file(&self, path: &Path) -> Result<bool> {
        let key = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .ok_or_else(|| NerdError::Config(format!("not a file path: {}", path.display())))?;
        let text = std::fs::read_to_string(path)?;

        let mut inner = self.inner.write();
        if let Some(module) = inner.policy.iter_mut().find(|m| m.key == key) {
            if module.text == text {
                debug!(module = %key, "policy module unchanged");
                return Ok(false);
            }
            module.text = text;
        } else {
            inner.policy.push(PolicyModule { key, text });
        }
        inner.dirty = true;
        inner.state = KernelState::Dirty;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Hot loading

    /// Validate a rule and add it to the program.
    ///
    /// Checks, in order: negation holes (textual), parse, infinite-loop
    /// risk, then a full compile + evaluate in a sandbox clone with the
    /// rule appended. Only on sandbox success is the rule committed and
    /// the program marked dirty; a failed hot-load leaves the kernel in
    /// its pre-hot-load state.
    #[instrument(skip(self, rule_text))]
    pub fn hot_load_rule(&self, rule_text: &str) -> Result<()> {
        self.validate_in_sandbox(rule_text)?;
        let mut inner = self.inner.write();
        inner.hot_rules.push(rule_text.trim().to_string());
        inner.dirty = true;
        inner.state = KernelState::Dirty;
        Ok(())
    }

    /// As `hot_load_rule`, and additionally persists the rule to the
    /// learned-rules store. A rejected rule is offered to the repair
    /// interceptor once; repaired text goes through the same validation.
    pub fn hot_load_learned_rule(&self, rule_text: &str) -> Result<()> {
        let text = match self.validate_in_sandbox(rule_text) {
            Ok(()) => rule_text.trim().to_string(),
            Err(err) => {
                let repair = self.inner.read().repair.clone();
                let repaired = match repair.and_then(|cb| cb(rule_text, &err)) {
                    Some(repaired) => repaired,
                    None => return Err(err),
                };
                self.validate_in_sandbox(&repaired)?;
                debug!("learned rule repaired by interceptor");
                repaired.trim().to_string()
            }
        };

        let learned_path = {
            let mut inner = self.inner.write();
            inner.learned_rules.push(text.clone());
            inner.dirty = true;
            inner.state = KernelState::Dirty;
            inner.learned_path.clone()
        };

        if let Some(path) = learned_path {
            heal::append_learned_rule(&path, &text)?;
        }
        Ok(())
    }

    fn validate_in_sandbox(&self, rule_text: &str) -> Result<()> {
        safety::check_negation_holes(rule_text)?;
        let rule = parser::parse_rule_text(rule_text)?;
        safety::check_infinite_loop_risk(&rule)?;

        let sandbox = self.clone_sandbox();
        {
            let mut inner = sandbox.inner.write();
            inner.hot_rules.push(rule_text.trim().to_string());
            inner.dirty = true;
            inner.state = KernelState::Dirty;
        }
        sandbox.evaluate()
    }

    /// Load, self-heal and install the learned rules file. Remembers the
    /// path for later persistence.
    pub fn load_learned_file(&self, path: &Path) -> Result<HealReport> {
        let (rules, report) = {
            let inner = self.inner.read();
            heal::self_heal_file(path, &inner.schema)?
        };
        let mut inner = self.inner.write();
        inner.learned_path = Some(path.to_path_buf());
        inner.learned_rules = rules.iter().map(|r| r.to_string()).collect();
        if !inner.learned_rules.is_empty() {
            inner.dirty = true;
            inner.state = KernelState::Dirty;
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Transactions

    /// Apply a batch of retracts and asserts atomically with respect to
    /// observers, then evaluate once. Observers never see a state where
    /// only part of the batch has been applied.
    pub fn transaction<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut KernelTxn<'_>) -> Result<()>,
    {
        let mut inner = self.inner.write();
        let mut txn = KernelTxn { inner: &mut inner };
        let outcome = f(&mut txn);
        // the batch may have partially applied before an error; the
        // program is dirty either way
        inner.dirty = true;
        inner.state = KernelState::Dirty;
        drop(inner);
        outcome?;
        self.evaluate()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutation handle passed to `Kernel::transaction` closures
pub struct KernelTxn<'a> {
    inner: &'a mut KernelInner,
}

impl KernelTxn<'_> {
    /// Assert a fact inside the transaction
    pub fn assert_fact(&mut self, fact: Fact) -> Result<()> {
        self.inner.schema.validate(&fact)?;
        self.inner.base.insert(fact);
        Ok(())
    }

    /// Retract a predicate inside the transaction
    pub fn retract(&mut self, predicate: &str) -> usize {
        self.inner.base.retract_predicate(predicate)
    }

    /// Retract by prefix pattern inside the transaction
    pub fn retract_fact(&mut self, pattern: &Fact) -> usize {
        self.inner.base.retract_prefix(pattern)
    }
}

/// The standard system schema: action vocabulary, ubiquitous predicates,
/// tool facts, safety projections, TDD facts.
pub fn default_schema() -> SchemaSet {
    use ArgType::{Any, Int, Name, Str};
    let mut s = SchemaSet::new();
    let decls: &[(&str, &[ArgType])] = &[
        // permission gate and action routing
        ("permitted", &[Name]),
        ("next_action", &[Name, Str]),
        // ubiquitous world state
        ("current_time", &[Int]),
        ("entry_point", &[Str]),
        ("current_phase", &[Name]),
        ("build_system", &[Str]),
        ("system_startup", &[]),
        ("northstar_defined", &[]),
        ("shard_state", &[Name]),
        ("shard_status", &[Name]),
        // dreamer projections
        ("projected_action", &[Str, Name, Str]),
        ("projected_fact", &[Str, Name, Str]),
        ("panic_state", &[Str, Str]),
        // action side effects
        ("modified", &[Str]),
        ("file_missing", &[Str]),
        ("file_exists", &[Str]),
        ("element_modified", &[Str, Str, Int]),
        // code graph
        ("code_defines", &[Str, Str]),
        ("code_calls", &[Str, Str]),
        // tool registry
        ("registered_tool", &[Str, Str, Name]),
        ("tool_registered", &[Str, Int]),
        ("tool_hash", &[Str, Str]),
        ("tool_capability", &[Str, Str]),
        // shard manager
        ("shard_profile", &[Str, Str]),
        // healer
        ("healing_attempt", &[Str, Name, Int, Str, Int]),
        ("validation_max_retries_reached", &[Str]),
        // tdd loop
        ("test_state", &[Name]),
        ("retry_count", &[Int]),
        ("diagnostic", &[Name, Str, Int, Str, Str]),
        ("block_commit", &[]),
        // free-form session facts
        ("session_fact", &[Str, Any]),
    ];
    for (pred, args) in decls {
        s.declare(*pred, args.to_vec())
            .expect("default schema has no duplicate declarations");
    }
    s
}
