//! Recovery from failed validation
//!
//! On a failed validation the healer chooses a strategy from retry,
//! rollback, escalate or alternative, keyed on the error text and a
//! per-action attempt counter. Retry re-executes with capped exponential
//! backoff; rollback and alternative currently record their attempt and
//! escalate. Every attempt emits a `healing_attempt` fact.

use crate::action::{ActionRequest, ActionResult};
use crate::error::Result;
use crate::kernel::types::{Fact, Value};
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Strategy chosen for one healing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealStrategy {
    /// Re-execute the action with backoff
    Retry,
    /// Undo the action's effects (stub: records and escalates)
    Rollback,
    /// Surface the failure to the operator
    Escalate,
    /// Try a different action (stub: records and escalates)
    Alternative,
}

impl HealStrategy {
    fn atom(self) -> Value {
        match self {
            HealStrategy::Retry => Value::name("/retry"),
            HealStrategy::Rollback => Value::name("/rollback"),
            HealStrategy::Escalate => Value::name("/escalate"),
            HealStrategy::Alternative => Value::name("/alternative"),
        }
    }
}

/// Healer configuration
#[derive(Debug, Clone)]
pub struct HealerConfig {
    /// Retry budget per action id
    pub max_retries: u32,
    /// Backoff base; attempt `n` waits `base * n`
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for HealerConfig {
    fn default() -> Self {
        HealerConfig {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Outcome of a healing pass
#[derive(Debug)]
pub enum HealOutcome {
    /// A retry succeeded; the recovered result replaces the failed one
    Recovered(ActionResult),
    /// Healing gave up; the failure is operator-visible
    Escalated {
        /// Why healing stopped
        reason: String,
    },
}

/// Chooses and executes recovery strategies for failed validations
pub struct Healer {
    config: HealerConfig,
    attempts: DashMap<String, u32>,
}

impl Healer {
    /// Create a healer with the default configuration
    pub fn new() -> Self {
        Self::with_config(HealerConfig::default())
    }

    /// Create a healer with an explicit configuration
    pub fn with_config(config: HealerConfig) -> Self {
        Healer {
            config,
            attempts: DashMap::new(),
        }
    }

    /// Strategy for an error at a given attempt count
    pub fn choose_strategy(&self, error: &str, attempt: u32) -> HealStrategy {
        if attempt >= self.config.max_retries {
            return HealStrategy::Escalate;
        }
        let lowered = error.to_lowercase();
        if lowered.contains("missing") || lowered.contains("not found") || lowered.contains("no such")
        {
            return HealStrategy::Alternative;
        }
        if lowered.contains("hash mismatch") || lowered.contains("corrupt") {
            return HealStrategy::Rollback;
        }
        // transient shapes (stale mtime, concurrent modification,
        // timeouts) and anything unrecognized get the retry budget
        HealStrategy::Retry
    }

    /// Heal a failed validation. `retry` re-executes the action.
    /// Returns the outcome plus the facts to assert (`healing_attempt`
    /// per attempt, `validation_max_retries_reached` on exhaustion).
    pub async fn heal<F, Fut>(
        &self,
        request: &ActionRequest,
        error: &str,
        retry: F,
    ) -> (HealOutcome, Vec<Fact>)
    where
        F: Fn(ActionRequest) -> Fut,
        Fut: Future<Output = Result<ActionResult>>,
    {
        let mut facts = Vec::new();
        let mut last_error = error.to_string();

        loop {
            let attempt = {
                let mut entry = self.attempts.entry(request.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };

            let strategy = self.choose_strategy(&last_error, attempt - 1);
            match strategy {
                HealStrategy::Retry => {
                    let backoff = self
                        .config
                        .base_backoff
                        .saturating_mul(attempt)
                        .min(self.config.max_backoff);
                    info!(
                        action = %request.id,
                        attempt,
                        ?backoff,
                        "retrying after failed validation"
                    );
                    tokio::time::sleep(backoff).await;

                    let mut retried = request.clone();
                    retried.retry_count = attempt;
                    match retry(retried).await {
                        Ok(result) if result.success => {
                            facts.push(self.attempt_fact(request, strategy, true, &last_error));
                            self.attempts.remove(&request.id);
                            return (HealOutcome::Recovered(result), facts);
                        }
                        Ok(result) => {
                            last_error = result
                                .error
                                .unwrap_or_else(|| "handler reported failure".to_string());
                            facts.push(self.attempt_fact(request, strategy, false, &last_error));
                        }
                        Err(e) => {
                            last_error = e.to_string();
                            facts.push(self.attempt_fact(request, strategy, false, &last_error));
                        }
                    }
                }
                HealStrategy::Rollback | HealStrategy::Alternative => {
                    // recorded but not yet implemented; fall through to
                    // escalation on the next loop turn
                    facts.push(self.attempt_fact(request, strategy, false, &last_error));
                    warn!(action = %request.id, ?strategy, "strategy is a stub, escalating");
                    facts.push(self.attempt_fact(
                        request,
                        HealStrategy::Escalate,
                        false,
                        &last_error,
                    ));
                    self.attempts.remove(&request.id);
                    return (
                        HealOutcome::Escalated { reason: last_error },
                        facts,
                    );
                }
                HealStrategy::Escalate => {
                    facts.push(Fact::unary(
                        "validation_max_retries_reached",
                        Value::string(&request.id),
                    ));
                    facts.push(self.attempt_fact(request, strategy, false, &last_error));
                    self.attempts.remove(&request.id);
                    return (
                        HealOutcome::Escalated { reason: last_error },
                        facts,
                    );
                }
            }
        }
    }

    fn attempt_fact(
        &self,
        request: &ActionRequest,
        strategy: HealStrategy,
        success: bool,
        reason: &str,
    ) -> Fact {
        Fact::new(
            "healing_attempt",
            vec![
                Value::string(&request.id),
                strategy.atom(),
                Value::Int(i64::from(success)),
                Value::string(reason),
                Value::Int(chrono::Utc::now().timestamp()),
            ],
        )
    }
}

impl Default for Healer {
    fn default() -> Self {
        Self::new()
    }
}
