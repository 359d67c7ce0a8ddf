//! API call scheduler
//!
//! A counted semaphore over outbound LLM calls. Workers register, then
//! acquire a slot per call; a slot is held for the duration of exactly
//! one call and release increments the global call counter. Double
//! release is detected and logged, never allowed to over-signal the
//! semaphore. Priority ordering does not live here (see the spawn
//! queue); slot hand-off is FIFO by semaphore acquisition.
//!
//! Cancellation is drop-to-cancel: dropping an acquire future abandons
//! the wait. `slot_acquire_timeout` bounds every wait internally.

use crate::error::{NerdError, Result};
use crate::llm::{LlmClient, StreamingReceivers};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Semaphore size: maximum in-flight LLM calls
    pub max_concurrent_api_calls: usize,
    /// Upper bound on any single slot wait
    pub slot_acquire_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent_api_calls: 4,
            slot_acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    /// Registered, no call yet
    Initializing,
    /// Blocked on the semaphore
    WaitingForSlot,
    /// Holding a slot, call in flight
    ExecutingApi,
    /// Slot released, processing the response
    ProcessingResult,
    /// Worker finished successfully
    Completed,
    /// Worker finished with an error
    Failed,
}

/// Per-worker execution state. `GetShardState` hands out deep copies so
/// callers cannot race the scheduler's own mutations.
#[derive(Debug, Clone)]
pub struct ShardExecutionState {
    /// Worker id
    pub id: String,
    /// Worker type name
    pub shard_type: String,
    /// Current phase
    pub phase: ShardPhase,
    /// Calls issued by this worker
    pub api_call_count: u64,
    /// Cumulative time spent waiting for slots
    pub total_wait_time: Duration,
    /// When the worker registered
    pub start_time: Instant,
    /// When the worker last entered `ExecutingApi`
    pub last_api_call: Option<Instant>,
    /// Per-call progress stash surviving suspension between calls
    pub checkpoint: HashMap<String, serde_json::Value>,
    /// Terminal error, if the worker failed
    pub error: Option<String>,
}

/// The process-wide LLM call scheduler
pub struct ApiScheduler {
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    states: RwLock<HashMap<String, ShardExecutionState>>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    // introspection only; slot ordering is FIFO by acquisition
    wait_queue: Mutex<Vec<String>>,
    total_api_calls: AtomicU64,
    stopped: AtomicBool,
}

impl ApiScheduler {
    /// Create a scheduler with the default configuration
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with an explicit configuration
    pub fn with_config(config: SchedulerConfig) -> Self {
        ApiScheduler {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_api_calls)),
            config,
            states: RwLock::new(HashMap::new()),
            permits: Mutex::new(HashMap::new()),
            wait_queue: Mutex::new(Vec::new()),
            total_api_calls: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set a worker's phase; a no-op if the worker isn't registered.
    fn set_phase(&self, worker_id: &str, phase: ShardPhase) {
        if let Some(state) = self.states.write().get_mut(worker_id) {
            state.phase = phase;
        }
    }

    /// Register a worker. Registration must precede acquisition.
    pub fn register(&self, worker_id: impl Into<String>, shard_type: impl Into<String>) {
        let id = worker_id.into();
        let state = ShardExecutionState {
            id: id.clone(),
            shard_type: shard_type.into(),
            phase: ShardPhase::Initializing,
            api_call_count: 0,
            total_wait_time: Duration::ZERO,
            start_time: Instant::now(),
            last_api_call: None,
            checkpoint: HashMap::new(),
            error: None,
        };
        self.states.write().insert(id, state);
    }

    /// Remove a worker, dropping any slot it still holds
    pub fn unregister(&self, worker_id: &str) {
        if self.permits.lock().remove(worker_id).is_some() {
            warn!(worker = worker_id, "unregistered while holding a slot");
            self.total_api_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.states.write().remove(worker_id);
        self.wait_queue.lock().retain(|w| w != worker_id);
    }

    /// Acquire a slot for one LLM call. Blocks until a slot frees, the
    /// scheduler stops, or `slot_acquire_timeout` fires. A worker holds
    /// at most one slot.
    pub async fn acquire(&self, worker_id: &str) -> Result<()> {
        if !self.states.read().contains_key(worker_id) {
            return Err(NerdError::WorkerNotRegistered(worker_id.to_string()));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NerdError::SchedulerStopped);
        }
        if self.permits.lock().contains_key(worker_id) {
            return Err(NerdError::Shard(format!(
                "worker {worker_id} already holds an API slot"
            )));
        }

        self.set_phase(worker_id, ShardPhase::WaitingForSlot);
        self.wait_queue.lock().push(worker_id.to_string());
        let wait_start = Instant::now();

        let acquired = tokio::time::timeout(
            self.config.slot_acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await;

        self.wait_queue.lock().retain(|w| w != worker_id);

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            // the semaphore is closed by stop()
            Ok(Err(_)) => return Err(NerdError::SchedulerStopped),
            Err(_) => {
                self.set_phase(worker_id, ShardPhase::Initializing);
                return Err(NerdError::SlotTimeout(self.config.slot_acquire_timeout));
            }
        };

        self.permits.lock().insert(worker_id.to_string(), permit);
        {
            let mut states = self.states.write();
            if let Some(state) = states.get_mut(worker_id) {
                state.total_wait_time += wait_start.elapsed();
                state.phase = ShardPhase::ExecutingApi;
                state.api_call_count += 1;
                state.last_api_call = Some(Instant::now());
            }
        }
        debug!(worker = worker_id, "slot acquired");
        Ok(())
    }

    /// Release a worker's slot. Releasing increments the global call
    /// counter. A release without a held slot is logged as a double
    /// release and otherwise ignored so the semaphore is never
    /// over-signaled.
    pub fn release(&self, worker_id: &str) {
        match self.permits.lock().remove(worker_id) {
            Some(permit) => {
                drop(permit);
                self.total_api_calls.fetch_add(1, Ordering::SeqCst);
                metrics::counter!("nerd_api_calls_total", 1);
                self.set_phase(worker_id, ShardPhase::ProcessingResult);
                debug!(worker = worker_id, "slot released");
            }
            None => {
                warn!(worker = worker_id, "double release detected");
            }
        }
    }

    /// Mark a worker finished
    pub fn complete(&self, worker_id: &str, error: Option<String>) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(worker_id) {
            state.phase = if error.is_some() {
                ShardPhase::Failed
            } else {
                ShardPhase::Completed
            };
            state.error = error;
        }
    }

    /// Stash a checkpoint value for a worker
    pub fn save_checkpoint(
        &self,
        worker_id: &str,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut states = self.states.write();
        let state = states
            .get_mut(worker_id)
            .ok_or_else(|| NerdError::WorkerNotRegistered(worker_id.to_string()))?;
        state.checkpoint.insert(key.into(), value);
        Ok(())
    }

    /// Load a checkpoint value; the returned value is a deep copy
    pub fn load_checkpoint(&self, worker_id: &str, key: &str) -> Option<serde_json::Value> {
        self.states
            .read()
            .get(worker_id)
            .and_then(|s| s.checkpoint.get(key).cloned())
    }

    /// Deep copy of a worker's state, checkpoint map included
    pub fn get_shard_state(&self, worker_id: &str) -> Option<ShardExecutionState> {
        self.states.read().get(worker_id).cloned()
    }

    /// Workers currently blocked on the semaphore (introspection only)
    pub fn waiting_workers(&self) -> Vec<String> {
        self.wait_queue.lock().clone()
    }

    /// Total completed API calls
    pub fn total_api_calls(&self) -> u64 {
        self.total_api_calls.load(Ordering::SeqCst)
    }

    /// Slots currently in use
    pub fn active_calls(&self) -> usize {
        self.config.max_concurrent_api_calls - self.semaphore.available_permits()
    }

    /// Maximum concurrent calls
    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent_api_calls
    }

    /// Stop the scheduler; pending and future waits fail with
    /// `SchedulerStopped`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.semaphore.close();
    }
}

impl Default for ApiScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Global singleton

static GLOBAL_SCHEDULER: OnceCell<Arc<ApiScheduler>> = OnceCell::new();
static PENDING_CONFIG: Mutex<Option<SchedulerConfig>> = Mutex::new(None);

/// Stage configuration for the global scheduler before first use.
/// Fails once the global instance exists.
pub fn configure_global(config: SchedulerConfig) -> Result<()> {
    if GLOBAL_SCHEDULER.get().is_some() {
        return Err(NerdError::Shard(
            "global scheduler already initialized".to_string(),
        ));
    }
    *PENDING_CONFIG.lock() = Some(config);
    Ok(())
}

/// The process-wide scheduler. The concurrency limit is a property of
/// the external LLM provider, not of one agent instance; initialization
/// is race-safe and one-shot.
pub fn global() -> Arc<ApiScheduler> {
    GLOBAL_SCHEDULER
        .get_or_init(|| {
            let config = PENDING_CONFIG.lock().take().unwrap_or_default();
            Arc::new(ApiScheduler::with_config(config))
        })
        .clone()
}

// ---------------------------------------------------------------------
// Scheduled client wrapper

/// An `LlmClient` that acquires a scheduler slot around every call of an
/// inner client. The slot is released on every exit path: the inner call
/// runs in a spawned task, so a panic surfaces as a join error while the
/// guard still releases the slot.
pub struct ScheduledLlmClient {
    inner: Arc<dyn LlmClient>,
    scheduler: Arc<ApiScheduler>,
    worker_id: String,
}

struct SlotGuard {
    scheduler: Arc<ApiScheduler>,
    worker_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.release(&self.worker_id);
    }
}

impl ScheduledLlmClient {
    /// Wrap a client for a registered worker
    pub fn new(
        inner: Arc<dyn LlmClient>,
        scheduler: Arc<ApiScheduler>,
        worker_id: impl Into<String>,
    ) -> Self {
        let client = ScheduledLlmClient {
            inner,
            scheduler,
            worker_id: worker_id.into(),
        };
        client.inner.disable_semaphore();
        client
    }

    async fn scheduled<F, Fut>(&self, call: F) -> Result<String>
    where
        F: FnOnce(Arc<dyn LlmClient>) -> Fut,
        Fut: std::future::Future<Output = Result<String>> + Send + 'static,
    {
        self.scheduler.acquire(&self.worker_id).await?;
        let _guard = SlotGuard {
            scheduler: self.scheduler.clone(),
            worker_id: self.worker_id.clone(),
        };

        let handle = tokio::spawn(call(self.inner.clone()));
        match handle.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(NerdError::Llm(format!(
                "client panicked: {join_error}"
            ))),
            Err(join_error) => Err(NerdError::Llm(join_error.to_string())),
        }
    }

    /// Completion with retries. Every attempt acquires a fresh slot so
    /// other workers interleave between failures; backoff doubles per
    /// attempt and is capped at 5 seconds.
    pub async fn complete_with_retry(
        &self,
        system: &str,
        user: &str,
        max_retries: u32,
    ) -> Result<String> {
        let mut last_error = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100)
                    .saturating_mul(1u32 << (attempt - 1).min(10))
                    .min(Duration::from_secs(5));
                tokio::time::sleep(backoff).await;
            }
            let system = system.to_string();
            let user = user.to_string();
            match self
                .scheduled(move |client| async move {
                    client.complete_with_system(&system, &user).await
                })
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(attempt, error = %e, "scheduled call failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NerdError::Llm("no attempts made".to_string())))
    }
}

#[async_trait]
impl LlmClient for ScheduledLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let prompt = prompt.to_string();
        self.scheduled(move |client| async move { client.complete(&prompt).await })
            .await
    }

    async fn complete_with_system(&self, system: &str, user: &str) -> Result<String> {
        let system = system.to_string();
        let user = user.to_string();
        self.scheduled(move |client| async move {
            client.complete_with_system(&system, &user).await
        })
        .await
    }

    /// Streaming holds the slot for the duration of the stream and
    /// releases it once both inner channels have drained.
    async fn complete_with_streaming(
        &self,
        system: &str,
        user: &str,
        thinking: bool,
    ) -> Option<StreamingReceivers> {
        if self.scheduler.acquire(&self.worker_id).await.is_err() {
            return None;
        }
        let guard = SlotGuard {
            scheduler: self.scheduler.clone(),
            worker_id: self.worker_id.clone(),
        };

        let Some((mut content_in, mut errors_in)) = self
            .inner
            .complete_with_streaming(system, user, thinking)
            .await
        else {
            // guard drops here, releasing the slot
            return None;
        };

        let (content_tx, content_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let _guard = guard;
            let mut errors_done = false;
            loop {
                tokio::select! {
                    chunk = content_in.recv() => match chunk {
                        Some(chunk) => {
                            if content_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // content done; drain remaining errors
                            while let Some(e) = errors_in.recv().await {
                                let _ = error_tx.send(e).await;
                            }
                            break;
                        }
                    },
                    error = errors_in.recv(), if !errors_done => match error {
                        Some(e) => {
                            let _ = error_tx.send(e).await;
                        }
                        None => errors_done = true,
                    },
                }
            }
            // slot released when _guard drops
        });

        Some((content_rx, error_rx))
    }

    fn set_shard_context(&self, shard_id: &str) {
        self.inner.set_shard_context(shard_id);
    }

    fn clear_shard_context(&self) {
        self.inner.clear_shard_context();
    }
}
