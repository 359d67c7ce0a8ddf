//! Shard lifecycle management
//!
//! Shards are worker agents with a type, a config (timeout, permissions,
//! model capability) and an execution context carrying a session-scoped
//! LLM client, a virtual store handle and a kernel handle. The manager
//! owns factory and profile registries, runs shards synchronously or
//! detached, and emits their state as kernel facts.

use crate::action::ActionType;
use crate::error::Result;
use crate::kernel::types::{Fact, Value};
use crate::kernel::Kernel;
use crate::limits::LimitsEnforcer;
use crate::llm::LlmClient;
use crate::scheduler::{ApiScheduler, ScheduledLlmClient};
use crate::spawn_queue::{SpawnPriority, SpawnQueue, SpawnRequest};
use crate::vstore::VirtualStore;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-shard configuration
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Wall-clock budget for one run
    pub timeout: Duration,
    /// Action types the shard may route
    pub permissions: Vec<ActionType>,
    /// Capability tier requested from the model provider
    pub model_capability: String,
    /// System shards start with the manager and bypass the shard limit
    pub system: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            timeout: Duration::from_secs(300),
            permissions: vec![ActionType::ReadFile, ActionType::Query],
            model_capability: "standard".to_string(),
            system: false,
        }
    }
}

/// A named profile binding a shard type to a config
#[derive(Debug, Clone)]
pub struct ShardProfile {
    /// Profile name
    pub name: String,
    /// Shard type the profile spawns
    pub type_name: String,
    /// Configuration applied to spawned shards
    pub config: ShardConfig,
}

/// Execution context handed to a running shard
pub struct ShardContext {
    /// Worker id registered with the API scheduler
    pub worker_id: String,
    /// Session-scoped, slot-scheduled LLM client
    pub llm: Arc<dyn LlmClient>,
    /// Kernel handle
    pub kernel: Arc<Kernel>,
    /// Virtual store handle
    pub vstore: Arc<VirtualStore>,
    /// Shard configuration
    pub config: ShardConfig,
    /// Agent prompt loaded by the prompt hook, when one is attached
    pub prompt: Option<String>,
}

/// Outcome of one shard run
#[derive(Debug, Clone)]
pub struct ShardOutcome {
    /// Worker id
    pub shard_id: String,
    /// Shard type
    pub shard_type: String,
    /// Whether the run succeeded
    pub success: bool,
    /// Shard output
    pub output: String,
    /// Error text on failure
    pub error: Option<String>,
    /// Facts the shard produced for the kernel
    pub facts: Vec<Fact>,
}

/// A worker agent executing one bounded task
#[async_trait]
pub trait Shard: Send {
    /// The shard's type name
    fn type_name(&self) -> &str;

    /// Execute the task to completion
    async fn run(&mut self, ctx: &ShardContext, task: &str) -> Result<ShardOutcome>;
}

/// Constructor for a shard type
pub type ShardFactory = Arc<dyn Fn() -> Box<dyn Shard> + Send + Sync>;

/// Prompt loader hook: shard type → agent prompt
pub type PromptLoader = Arc<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>;

/// JIT knowledge hook: (shard id, shard type)
pub type JitHook = Arc<dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default, Clone)]
struct Hooks {
    prompt_loader: Option<PromptLoader>,
    jit_registrar: Option<JitHook>,
    jit_unregistrar: Option<JitHook>,
}

/// The default shard: one scheduled completion over the task text
struct GeneralistShard;

#[async_trait]
impl Shard for GeneralistShard {
    fn type_name(&self) -> &str {
        "generalist"
    }

    async fn run(&mut self, ctx: &ShardContext, task: &str) -> Result<ShardOutcome> {
        let system = ctx
            .prompt
            .clone()
            .unwrap_or_else(|| "You are a focused coding worker.".to_string());
        let output = ctx.llm.complete_with_system(&system, task).await?;
        Ok(ShardOutcome {
            shard_id: ctx.worker_id.clone(),
            shard_type: self.type_name().to_string(),
            success: true,
            output,
            error: None,
            facts: Vec::new(),
        })
    }
}

/// Registry and lifecycle owner for worker shards
pub struct ShardManager {
    factories: RwLock<HashMap<String, ShardFactory>>,
    profiles: RwLock<HashMap<String, ShardProfile>>,
    results: Mutex<HashMap<String, ShardOutcome>>,
    scheduler: Arc<ApiScheduler>,
    kernel: Arc<Kernel>,
    vstore: Arc<VirtualStore>,
    base_client: Arc<dyn LlmClient>,
    limits: RwLock<Arc<LimitsEnforcer>>,
    hooks: RwLock<Hooks>,
    active_user_shards: AtomicUsize,
    spawn_counter: AtomicU64,
}

impl ShardManager {
    /// Create a manager. The generalist factory is pre-registered as the
    /// fallback for unknown types.
    pub fn new(
        kernel: Arc<Kernel>,
        vstore: Arc<VirtualStore>,
        scheduler: Arc<ApiScheduler>,
        base_client: Arc<dyn LlmClient>,
    ) -> Arc<Self> {
        let manager = Arc::new(ShardManager {
            factories: RwLock::new(HashMap::new()),
            profiles: RwLock::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            scheduler,
            kernel,
            vstore,
            base_client,
            limits: RwLock::new(Arc::new(LimitsEnforcer::new())),
            hooks: RwLock::new(Hooks::default()),
            active_user_shards: AtomicUsize::new(0),
            spawn_counter: AtomicU64::new(0),
        });
        manager.register_factory("generalist", Arc::new(|| Box::new(GeneralistShard)));
        manager
    }

    /// Replace the limits enforcer
    pub fn set_limits(&self, limits: Arc<LimitsEnforcer>) {
        *self.limits.write() = limits;
    }

    /// Register a shard factory
    pub fn register_factory(&self, type_name: impl Into<String>, factory: ShardFactory) {
        self.factories.write().insert(type_name.into(), factory);
    }

    /// Register a profile
    pub fn register_profile(&self, profile: ShardProfile) {
        self.profiles.write().insert(profile.name.clone(), profile);
    }

    /// Attach the prompt-loader hook
    pub fn set_prompt_loader(&self, loader: PromptLoader) {
        self.hooks.write().prompt_loader = Some(loader);
    }

    /// Attach the JIT knowledge hooks. Unregistration runs on every
    /// teardown path.
    pub fn set_jit_hooks(&self, registrar: JitHook, unregistrar: JitHook) {
        let mut hooks = self.hooks.write();
        hooks.jit_registrar = Some(registrar);
        hooks.jit_unregistrar = Some(unregistrar);
    }

    /// Number of currently running non-system shards
    pub fn active_shards(&self) -> usize {
        self.active_user_shards.load(Ordering::SeqCst)
    }

    /// Whether a non-system shard may start now
    pub fn can_spawn(&self) -> bool {
        self.limits
            .read()
            .check_shard_limit(self.active_shards())
            .is_ok()
    }

    fn config_for(&self, type_name: &str) -> ShardConfig {
        self.profiles
            .read()
            .values()
            .find(|p| p.type_name == type_name)
            .map(|p| p.config.clone())
            .unwrap_or_default()
    }

    fn factory_for(&self, type_name: &str) -> ShardFactory {
        let factories = self.factories.read();
        factories
            .get(type_name)
            .or_else(|| {
                debug!(type_name, "unknown shard type, falling back to generalist");
                factories.get("generalist")
            })
            .cloned()
            .expect("generalist factory is always registered")
    }

    /// Spawn a shard and run it synchronously to completion
    pub async fn spawn(self: &Arc<Self>, type_name: &str, task: &str) -> Result<ShardOutcome> {
        let id = format!(
            "shard-{type_name}-{}",
            self.spawn_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.run_shard(id, type_name.to_string(), task.to_string())
            .await
    }

    /// Spawn a shard detached; the outcome is retrievable once by id
    pub fn spawn_async(self: &Arc<Self>, type_name: &str, task: &str) -> String {
        let id = format!(
            "shard-{type_name}-{}",
            self.spawn_counter.fetch_add(1, Ordering::SeqCst)
        );
        let manager = self.clone();
        let id_for_task = id.clone();
        let type_name = type_name.to_string();
        let task = task.to_string();
        tokio::spawn(async move {
            let outcome = manager
                .run_shard(id_for_task.clone(), type_name.clone(), task)
                .await
                .unwrap_or_else(|e| ShardOutcome {
                    shard_id: id_for_task.clone(),
                    shard_type: type_name,
                    success: false,
                    output: String::new(),
                    error: Some(e.to_string()),
                    facts: Vec::new(),
                });
            manager.results.lock().insert(id_for_task, outcome);
        });
        id
    }

    /// Take a detached shard's result. The entry is removed so the map
    /// cannot grow without bound.
    pub fn get_result(&self, id: &str) -> Option<ShardOutcome> {
        self.results.lock().remove(id)
    }

    async fn run_shard(
        self: &Arc<Self>,
        id: String,
        type_name: String,
        task: String,
    ) -> Result<ShardOutcome> {
        let config = self.config_for(&type_name);

        if !config.system {
            self.limits.read().check_shard_limit(self.active_shards())?;
            self.active_user_shards.fetch_add(1, Ordering::SeqCst);
        }

        let outcome = self
            .run_shard_inner(&id, &type_name, &task, config.clone())
            .await;

        if !config.system {
            self.active_user_shards.fetch_sub(1, Ordering::SeqCst);
        }
        outcome
    }

    async fn run_shard_inner(
        self: &Arc<Self>,
        id: &str,
        type_name: &str,
        task: &str,
        config: ShardConfig,
    ) -> Result<ShardOutcome> {
        let hooks = self.hooks.read().clone();

        self.scheduler.register(id, type_name);

        if let Some(registrar) = &hooks.jit_registrar {
            if let Err(e) = registrar(id, type_name) {
                warn!(shard = id, error = %e, "jit registration failed");
            }
        }

        let prompt = hooks
            .prompt_loader
            .as_ref()
            .and_then(|loader| match loader(type_name) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(shard = id, error = %e, "prompt loading failed");
                    None
                }
            });

        let llm: Arc<dyn LlmClient> = Arc::new(ScheduledLlmClient::new(
            self.base_client.clone(),
            self.scheduler.clone(),
            id,
        ));
        llm.set_shard_context(id);

        let ctx = ShardContext {
            worker_id: id.to_string(),
            llm,
            kernel: self.kernel.clone(),
            vstore: self.vstore.clone(),
            config: config.clone(),
            prompt,
        };

        let mut shard = (self.factory_for(type_name))();
        let run = tokio::time::timeout(config.timeout, shard.run(&ctx, task)).await;

        let outcome = match run {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ShardOutcome {
                shard_id: id.to_string(),
                shard_type: type_name.to_string(),
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                facts: Vec::new(),
            },
            Err(_) => ShardOutcome {
                shard_id: id.to_string(),
                shard_type: type_name.to_string(),
                success: false,
                output: String::new(),
                error: Some(format!("shard timed out after {:?}", config.timeout)),
                facts: Vec::new(),
            },
        };

        ctx.llm.clear_shard_context();

        // unregistration is mandatory on every teardown path: the JIT
        // knowledge DB closes here
        if let Some(unregistrar) = &hooks.jit_unregistrar {
            if let Err(e) = unregistrar(id, type_name) {
                warn!(shard = id, error = %e, "jit unregistration failed");
            }
        }

        self.scheduler.complete(id, outcome.error.clone());
        self.scheduler.unregister(id);

        Ok(outcome)
    }

    /// Start every system profile. With a spawn queue attached the
    /// shards are enqueued at critical priority so they queue behind
    /// capacity instead of failing.
    pub fn start_system_shards(self: &Arc<Self>, queue: Option<&Arc<SpawnQueue>>) {
        let system_profiles: Vec<ShardProfile> = self
            .profiles
            .read()
            .values()
            .filter(|p| p.config.system)
            .cloned()
            .collect();

        for profile in system_profiles {
            info!(profile = %profile.name, "starting system shard");
            match queue {
                Some(queue) => {
                    let request = SpawnRequest::new(&profile.type_name, "")
                        .with_priority(SpawnPriority::Critical);
                    match queue.submit(request) {
                        Ok(receiver) => {
                            tokio::spawn(async move {
                                if let Ok(Err(e)) = receiver.await {
                                    warn!(error = %e, "system shard failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "system shard not enqueued"),
                    }
                }
                None => {
                    self.spawn_async(&profile.type_name, "");
                }
            }
        }
    }

    /// Active profiles as kernel facts: `shard_profile(name, type)`
    pub fn to_facts(&self) -> Vec<Fact> {
        self.profiles
            .read()
            .values()
            .map(|p| {
                Fact::binary(
                    "shard_profile",
                    Value::string(&p.name),
                    Value::string(&p.type_name),
                )
            })
            .collect()
    }

    /// Tools relevant to a shard type: registered tools whose affinity
    /// is `/all` or the type's atom, with their capabilities.
    pub fn relevant_tools(&self, shard_type: &str) -> Result<Vec<(String, Vec<String>)>> {
        let affinity = Value::name(format!("/{}", shard_type.to_lowercase()));
        let all = Value::name("/all");

        let mut names = Vec::new();
        for fact in self.kernel.query("registered_tool")? {
            let (Some(Value::Str(name)), Some(tool_affinity)) =
                (fact.args.first(), fact.args.get(2))
            else {
                continue;
            };
            if tool_affinity == &all || tool_affinity == &affinity {
                names.push(name.to_string());
            }
        }

        let mut out = Vec::new();
        for name in names {
            let capabilities = self
                .kernel
                .query(&format!("tool_capability(\"{name}\", C)"))?
                .iter()
                .filter_map(|f| f.args.get(1).and_then(|v| v.as_str().map(String::from)))
                .collect();
            out.push((name, capabilities));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StaticLlmClient;
    use crate::scheduler::SchedulerConfig;
    use std::sync::atomic::AtomicBool;

    fn manager_with(client: Arc<dyn LlmClient>) -> Arc<ShardManager> {
        let kernel = Arc::new(Kernel::new());
        let vstore = VirtualStore::new(kernel.clone());
        let scheduler = Arc::new(ApiScheduler::with_config(SchedulerConfig {
            max_concurrent_api_calls: 2,
            slot_acquire_timeout: Duration::from_secs(2),
        }));
        ShardManager::new(kernel, vstore, scheduler, client)
    }

    #[tokio::test]
    async fn test_spawn_generalist_fallback() {
        let manager = manager_with(Arc::new(StaticLlmClient::new("done")));
        let outcome = manager.spawn("no_such_type", "do the thing").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "done");
        assert_eq!(outcome.shard_type, "generalist");
    }

    #[tokio::test]
    async fn test_spawn_async_and_take_result_once() {
        let manager = manager_with(Arc::new(StaticLlmClient::new("done")));
        let id = manager.spawn_async("generalist", "task");

        let outcome = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(outcome) = manager.get_result(&id) {
                    return outcome;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(outcome.success);

        // removed on retrieval
        assert!(manager.get_result(&id).is_none());
    }

    #[tokio::test]
    async fn test_shard_timeout() {
        let manager = manager_with(Arc::new(
            StaticLlmClient::new("slow").with_delay(Duration::from_secs(5)),
        ));
        manager.register_profile(ShardProfile {
            name: "snappy".to_string(),
            type_name: "generalist".to_string(),
            config: ShardConfig {
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
        });

        let outcome = manager.spawn("generalist", "task").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_jit_hooks_run_on_both_paths() {
        let manager = manager_with(Arc::new(StaticLlmClient::failing("llm down")));
        let registered = Arc::new(AtomicBool::new(false));
        let unregistered = Arc::new(AtomicBool::new(false));

        let reg = registered.clone();
        let unreg = unregistered.clone();
        manager.set_jit_hooks(
            Arc::new(move |_id, _ty| {
                reg.store(true, Ordering::SeqCst);
                Ok(())
            }),
            Arc::new(move |_id, _ty| {
                unreg.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );

        let outcome = manager.spawn("generalist", "task").await.unwrap();
        assert!(!outcome.success);
        // unregistration is mandatory even when the run failed
        assert!(registered.load(Ordering::SeqCst));
        assert!(unregistered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_prompt_loader_feeds_context() {
        let manager = manager_with(Arc::new(StaticLlmClient::new("ok")));
        manager.set_prompt_loader(Arc::new(|ty| Ok(format!("prompt for {ty}"))));
        let outcome = manager.spawn("generalist", "task").await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_profile_facts() {
        let manager = manager_with(Arc::new(StaticLlmClient::new("ok")));
        manager.register_profile(ShardProfile {
            name: "researcher".to_string(),
            type_name: "research".to_string(),
            config: ShardConfig::default(),
        });
        let facts = manager.to_facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].predicate.as_ref(), "shard_profile");
        assert_eq!(facts[0].args[0], Value::string("researcher"));
    }

    #[tokio::test]
    async fn test_relevant_tools_by_affinity() {
        let manager = manager_with(Arc::new(StaticLlmClient::new("ok")));
        manager
            .kernel
            .assert_batch([
                Fact::new(
                    "registered_tool",
                    vec![
                        Value::string("linter"),
                        Value::string("/bin/lint"),
                        Value::name("/all"),
                    ],
                ),
                Fact::new(
                    "registered_tool",
                    vec![
                        Value::string("prover"),
                        Value::string("/bin/prove"),
                        Value::name("/research"),
                    ],
                ),
                Fact::binary(
                    "tool_capability",
                    Value::string("linter"),
                    Value::string("style"),
                ),
            ])
            .unwrap();

        let tools = manager.relevant_tools("coder").unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "linter");
        assert_eq!(tools[0].1, vec!["style".to_string()]);

        let tools = manager.relevant_tools("research").unwrap();
        assert_eq!(tools.len(), 2);
    }
}
