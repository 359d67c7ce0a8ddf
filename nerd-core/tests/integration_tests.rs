//! End-to-end scenarios over the assembled core

use nerd_core::action::{ActionRequest, ActionType};
use nerd_core::dreamer::Dreamer;
use nerd_core::error::{NerdError, Result};
use nerd_core::kernel::parser::parse_fact_text;
use nerd_core::kernel::types::{Fact, Value};
use nerd_core::kernel::Kernel;
use nerd_core::llm::{LlmClient, StaticLlmClient};
use nerd_core::scheduler::{ApiScheduler, ScheduledLlmClient, SchedulerConfig};
use nerd_core::tools::ToolRegistry;
use nerd_core::vstore::VirtualStore;
use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn kernel_with_permissions(actions: &[ActionType]) -> Arc<Kernel> {
    let kernel = Arc::new(Kernel::new());
    for action in actions {
        kernel
            .assert_without_eval(Fact::unary("permitted", action.as_atom()))
            .unwrap();
    }
    kernel.evaluate().unwrap();
    kernel
}

// scenario 1: basic dispatch with a clean dream
#[tokio::test]
async fn basic_dispatch() {
    let dir = TempDir::new().unwrap();
    let safe = dir.path().join("safe.txt");
    std::fs::write(&safe, "nothing to hide").unwrap();

    let kernel = kernel_with_permissions(&[ActionType::ReadFile]);
    let vstore = VirtualStore::new(kernel.clone());
    let dreamer = Dreamer::with_kernel(kernel.clone());

    let next_action = Fact::binary(
        "next_action",
        Value::name("/read_file"),
        Value::string(safe.to_string_lossy()),
    );
    let result = vstore.route_next_action(&next_action, "e2e-1").await.unwrap();
    assert!(result.success);
    assert_eq!(result.output, "nothing to hide");

    let request = ActionRequest::from_next_action(&next_action, "e2e-1").unwrap();
    let dream = dreamer.simulate_action(&request);
    assert!(!dream.is_unsafe);
}

// scenario 2: a policy rule turns the dream unsafe
#[tokio::test]
async fn dream_blocks_action() {
    let kernel = kernel_with_permissions(&[ActionType::ReadFile]);
    kernel.append_policy(
        "panic_state(Id, \"forbidden file\") :- projected_action(Id, /read_file, \"secret.txt\").",
    );
    kernel.evaluate().unwrap();

    let dreamer = Dreamer::with_kernel(kernel);
    let request = ActionRequest::new("e2e-2", ActionType::ReadFile, "secret.txt");
    let dream = dreamer.simulate_action(&request);
    assert!(dream.is_unsafe);
    assert_eq!(dream.reason.as_deref(), Some("forbidden file"));
}

// scenario 3: the constitution aborts before anything executes
#[tokio::test]
async fn constitution_blocks_command() {
    let kernel = kernel_with_permissions(&[ActionType::ExecCmd]);
    let vstore = VirtualStore::new(kernel);

    let next_action = Fact::binary(
        "next_action",
        Value::name("/exec_cmd"),
        Value::string("rm -rf /"),
    );
    let err = vstore
        .route_next_action(&next_action, "e2e-3")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("constitutional violation"));
}

struct TrackingClient {
    inner: StaticLlmClient,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl TrackingClient {
    fn new(delay: Duration) -> Self {
        TrackingClient {
            inner: StaticLlmClient::new("ok").with_delay(delay),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for TrackingClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.complete(prompt).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn complete_with_system(&self, _system: &str, user: &str) -> Result<String> {
        self.complete(user).await
    }
}

// scenario 4: ten workers, three slots, observed concurrency stays capped
#[tokio::test]
async fn scheduler_caps_concurrency() {
    let scheduler = Arc::new(ApiScheduler::with_config(SchedulerConfig {
        max_concurrent_api_calls: 3,
        slot_acquire_timeout: Duration::from_secs(5),
    }));
    let tracking = Arc::new(TrackingClient::new(Duration::from_millis(10)));

    let mut handles = Vec::new();
    for i in 0..10 {
        let worker = format!("worker-{i}");
        scheduler.register(&worker, "test");
        let client = ScheduledLlmClient::new(
            tracking.clone() as Arc<dyn LlmClient>,
            scheduler.clone(),
            &worker,
        );
        handles.push(tokio::spawn(async move { client.complete("go").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(tracking.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(scheduler.total_api_calls(), 10);
}

// scenario 5: hot-load rejects the loop hazard and learned.mg is untouched
#[tokio::test]
async fn hot_load_rejects_loop() {
    let dir = TempDir::new().unwrap();
    let learned = dir.path().join("learned.mg");
    std::fs::write(&learned, "# learned rules\n").unwrap();

    let kernel = Kernel::new();
    kernel.load_learned_file(&learned).unwrap();

    let err = kernel
        .hot_load_learned_rule("next_action(/foo) :- current_time(_).")
        .unwrap_err();
    assert!(err.to_string().contains("infinite loop risk"));

    let content = std::fs::read_to_string(&learned).unwrap();
    assert_eq!(content, "# learned rules\n");
}

// scenario 6: tool restoration from a compiled directory
#[tokio::test]
async fn tool_restore_from_disk() {
    let dir = TempDir::new().unwrap();
    let compiled = dir.path().join("compiled");
    std::fs::create_dir(&compiled).unwrap();
    std::fs::write(compiled.join("mytool.exe"), b"#!/bin/sh\necho hi\n").unwrap();

    let kernel = Arc::new(Kernel::new());
    let registry = ToolRegistry::new(kernel.clone());
    let (restored, errors) = registry.restore_from_dir(&compiled).unwrap();
    assert_eq!(restored, 1);
    assert!(errors.is_empty());

    assert!(registry.get_tool("mytool").is_some());

    let registered = kernel.query("registered_tool(\"mytool\", C, A)").unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].args[2], Value::name("/all"));
    assert_eq!(
        kernel.query("tool_registered(\"mytool\", T)").unwrap().len(),
        1
    );
}

// unhandled action types are rejected, not silently dropped
#[tokio::test]
async fn unknown_action_type_rejected() {
    let fact = Fact::binary(
        "next_action",
        Value::name("/summon_demon"),
        Value::string("x"),
    );
    let err = ActionRequest::from_next_action(&fact, "e2e-7").unwrap_err();
    assert!(matches!(err, NerdError::ActionRejected(_)));
}

// self-healing a learned file twice changes nothing the second time
#[test]
fn self_heal_idempotent() {
    let dir = TempDir::new().unwrap();
    let learned = dir.path().join("learned.mg");
    std::fs::write(
        &learned,
        "permitted(/read_file).\nnext_action(/foo) :- current_time(_).\nnot_a_rule!!\n",
    )
    .unwrap();

    let kernel = Kernel::new();
    let report = kernel.load_learned_file(&learned).unwrap();
    assert_eq!(report.kept, 1);
    assert_eq!(report.healed, 2);
    let after_first = std::fs::read_to_string(&learned).unwrap();
    assert_eq!(after_first.matches("# SELF-HEALED").count(), 2);

    let kernel2 = Kernel::new();
    let report2 = kernel2.load_learned_file(&learned).unwrap();
    assert_eq!(report2.healed, 0);
    assert_eq!(std::fs::read_to_string(&learned).unwrap(), after_first);
}

// assert-evaluate-query invariant over the full kernel surface
#[test]
fn assert_then_query_invariant() {
    let kernel = Kernel::new();
    let facts = [
        Fact::unary("permitted", Value::name("/exec_cmd")),
        Fact::binary("code_defines", Value::string("a.go"), Value::string("Foo")),
        Fact::unary("current_time", Value::Int(1_700_000_000)),
    ];
    for fact in &facts {
        kernel.assert_fact(fact.clone()).unwrap();
        kernel.evaluate().unwrap();
        let results = kernel.query(&fact.predicate).unwrap();
        assert!(results.contains(fact));
    }
}

// wire-format round trip for a representative literal
#[test]
fn fact_wire_format_literal() {
    let fact = parse_fact_text("predicate(/a, \"s\", 3).").unwrap();
    assert_eq!(fact.args.len(), 3);
    let atom = fact.to_atom();
    let back = atom.to_fact().unwrap();
    assert_eq!(back, fact);
    assert_eq!(back.canonical(), "predicate(/a, \"s\", 3).");
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-z][a-z0-9_]{0,8}".prop_map(Value::name),
        "[ -~&&[^\"\\\\]]{0,12}".prop_map(Value::string),
        any::<i64>().prop_map(Value::Int),
        (-1_000_000.0f64..1_000_000.0)
            .prop_filter("avoid exponent display", |f| {
                *f == 0.0 || f.abs() >= 1e-3
            })
            .prop_map(Value::Float),
    ]
}

proptest! {
    // parse(canonical(fact)) == fact for generated facts
    #[test]
    fn fact_round_trip(
        predicate in "[a-z][a-z0-9_]{0,10}",
        args in prop::collection::vec(value_strategy(), 0..5),
    ) {
        let fact = Fact::new(predicate, args);
        let parsed = parse_fact_text(&fact.canonical()).unwrap();
        prop_assert_eq!(parsed, fact);
    }

    // strings with quotes and backslashes survive escaping
    #[test]
    fn fact_round_trip_escaped_strings(raw in "[ -~]{0,16}") {
        let fact = Fact::unary("msg", Value::string(raw));
        let parsed = parse_fact_text(&fact.canonical()).unwrap();
        prop_assert_eq!(parsed, fact);
    }
}
