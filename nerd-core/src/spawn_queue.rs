//! Prioritized spawn queue with backpressure
//!
//! Four bounded buffers, one per priority, in front of the shard
//! manager. Admission sheds load early: `low` is rejected above the
//! high-water mark, everything but `critical` above 90% utilization,
//! and everything at absolute capacity. A fixed pool of workers drains
//! the highest-priority non-empty buffer, waits for shard capacity with
//! exponential backoff, dispatches through the manager, and polls for
//! completion.

use crate::error::{NerdError, Result};
use crate::shard::{ShardManager, ShardOutcome};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawn request priority, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpawnPriority {
    /// Shed first under load
    Low,
    /// Default
    Normal,
    /// Ahead of normal work
    High,
    /// Admitted until absolute capacity
    Critical,
}

impl SpawnPriority {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            SpawnPriority::Low => 0,
            SpawnPriority::Normal => 1,
            SpawnPriority::High => 2,
            SpawnPriority::Critical => 3,
        }
    }
}

/// A queued request to spawn a shard
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Request id; assigned at submission when empty
    pub id: String,
    /// Shard type to spawn
    pub type_name: String,
    /// Task text handed to the shard
    pub task: String,
    /// Admission priority
    pub priority: SpawnPriority,
    /// When the request was submitted
    pub submitted_at: Instant,
    /// Completion deadline; the queue default applies when absent
    pub deadline: Option<Duration>,
    /// Caller-supplied context
    pub ctx: HashMap<String, serde_json::Value>,
}

impl SpawnRequest {
    /// Create a normal-priority request
    pub fn new(type_name: impl Into<String>, task: impl Into<String>) -> Self {
        SpawnRequest {
            id: String::new(),
            type_name: type_name.into(),
            task: task.into(),
            priority: SpawnPriority::Normal,
            submitted_at: Instant::now(),
            deadline: None,
            ctx: HashMap::new(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: SpawnPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set an explicit deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The eventual outcome delivered on the result channel
pub type SpawnResult = Result<ShardOutcome>;

struct Ticket {
    request: SpawnRequest,
    reply: oneshot::Sender<SpawnResult>,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct SpawnQueueConfig {
    /// Absolute depth across all priorities
    pub max_queue_size: usize,
    /// Capacity of each priority buffer
    pub per_priority_capacity: usize,
    /// Utilization above which `low` is rejected
    pub high_water_mark: f64,
    /// Dispatch worker count
    pub worker_count: usize,
    /// Deadline applied when a request has none
    pub default_timeout: Duration,
    /// How long `stop` waits for workers before failing the remainder
    pub drain_timeout: Duration,
    /// Completion poll tick
    pub poll_interval: Duration,
    /// Shard-slot wait backoff floor
    pub slot_backoff_start: Duration,
    /// Shard-slot wait backoff ceiling
    pub slot_backoff_max: Duration,
}

impl Default for SpawnQueueConfig {
    fn default() -> Self {
        SpawnQueueConfig {
            max_queue_size: 64,
            per_priority_capacity: 32,
            high_water_mark: 0.75,
            worker_count: 2,
            default_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            slot_backoff_start: Duration::from_millis(100),
            slot_backoff_max: Duration::from_secs(5),
        }
    }
}

/// Priority queue with backpressure in front of the shard manager
pub struct SpawnQueue {
    config: SpawnQueueConfig,
    queues: Vec<ArrayQueue<Ticket>>,
    notify: Notify,
    running: RwLock<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    manager: Arc<ShardManager>,
    id_counter: AtomicU64,
}

impl SpawnQueue {
    /// Create a stopped queue; call `start` to launch the workers
    pub fn new(manager: Arc<ShardManager>, config: SpawnQueueConfig) -> Arc<Self> {
        let queues = (0..SpawnPriority::COUNT)
            .map(|_| ArrayQueue::new(config.per_priority_capacity))
            .collect();
        Arc::new(SpawnQueue {
            config,
            queues,
            notify: Notify::new(),
            running: RwLock::new(false),
            workers: Mutex::new(Vec::new()),
            manager,
            id_counter: AtomicU64::new(0),
        })
    }

    /// Launch the dispatch workers. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        *self.running.write() = true;
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for worker_index in 0..self.config.worker_count {
            let queue = self.clone();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_index).await;
            }));
        }
    }

    /// Whether the workers are running
    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    /// Current total depth across priorities
    pub fn depth(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Admission check. Utilization sheds `low` above the high-water
    /// mark and everything but `critical` above 0.9; absolute and
    /// per-priority capacity bound everything.
    pub fn can_accept(&self, priority: SpawnPriority) -> bool {
        if !self.is_running() {
            return false;
        }
        let depth = self.depth();
        if depth >= self.config.max_queue_size {
            return false;
        }
        if self.queues[priority.index()].is_full() {
            return false;
        }
        let utilization = depth as f64 / self.config.max_queue_size as f64;
        if priority == SpawnPriority::Low && utilization > self.config.high_water_mark {
            return false;
        }
        if priority != SpawnPriority::Critical && utilization > 0.9 {
            return false;
        }
        true
    }

    /// Submit a request; the receiver yields the eventual result
    pub fn submit(&self, mut request: SpawnRequest) -> Result<oneshot::Receiver<SpawnResult>> {
        if !self.is_running() {
            return Err(NerdError::QueueStopped);
        }
        if !self.can_accept(request.priority) {
            metrics::counter!("nerd_spawn_rejected_total", 1);
            return Err(NerdError::QueueFull(format!(
                "depth {} of {}, priority {:?}",
                self.depth(),
                self.config.max_queue_size,
                request.priority
            )));
        }

        if request.id.is_empty() {
            request.id = format!("spawn-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
        }

        let (reply, receiver) = oneshot::channel();
        let index = request.priority.index();
        if self.queues[index].push(Ticket { request, reply }).is_err() {
            return Err(NerdError::QueueFull(format!(
                "priority buffer {index} filled concurrently"
            )));
        }
        metrics::counter!("nerd_spawn_submitted_total", 1);
        self.notify.notify_one();
        Ok(receiver)
    }

    /// Submit and block until the result or the deadline
    pub async fn submit_and_wait(&self, request: SpawnRequest) -> SpawnResult {
        let deadline = request.deadline.unwrap_or(self.config.default_timeout);
        let receiver = self.submit(request)?;
        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NerdError::QueueStopped),
            Err(_) => Err(NerdError::QueueTimeout(deadline)),
        }
    }

    fn next_ticket(&self) -> Option<Ticket> {
        // highest priority first
        for index in (0..SpawnPriority::COUNT).rev() {
            if let Some(ticket) = self.queues[index].pop() {
                return Some(ticket);
            }
        }
        None
    }

    async fn worker_loop(self: Arc<Self>, worker_index: usize) {
        debug!(worker = worker_index, "spawn worker started");
        loop {
            if !self.is_running() {
                break;
            }
            let Some(ticket) = self.next_ticket() else {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };
            self.dispatch(ticket).await;
        }
        debug!(worker = worker_index, "spawn worker stopped");
    }

    async fn dispatch(&self, ticket: Ticket) {
        let Ticket { request, reply } = ticket;

        // caller may have given up while the request was queued
        if reply.is_closed() {
            debug!(id = %request.id, "caller gone, dropping request");
            return;
        }

        let deadline = request.deadline.unwrap_or(self.config.default_timeout);

        // wait for a shard slot with exponential backoff
        let mut backoff = self.config.slot_backoff_start;
        while !self.manager.can_spawn() {
            if !self.is_running() {
                let _ = reply.send(Err(NerdError::QueueStopped));
                return;
            }
            if request.submitted_at.elapsed() > deadline || reply.is_closed() {
                let _ = reply.send(Err(NerdError::QueueTimeout(deadline)));
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.slot_backoff_max);
        }

        let shard_id = self.manager.spawn_async(&request.type_name, &request.task);
        debug!(id = %request.id, shard = %shard_id, "dispatched");

        // poll the manager for completion at a fixed tick
        loop {
            if let Some(outcome) = self.manager.get_result(&shard_id) {
                let _ = reply.send(Ok(outcome));
                return;
            }
            if request.submitted_at.elapsed() > deadline {
                let _ = reply.send(Err(NerdError::QueueTimeout(deadline)));
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stop the queue: workers drain within `drain_timeout`, then every
    /// remaining request receives `QueueStopped`.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        self.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.config.drain_timeout, join_all)
            .await
            .is_err()
        {
            warn!("spawn workers did not drain in time");
        }

        while let Some(ticket) = self.next_ticket() {
            let _ = ticket.reply.send(Err(NerdError::QueueStopped));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::llm::StaticLlmClient;
    use crate::scheduler::{ApiScheduler, SchedulerConfig};
    use crate::vstore::VirtualStore;

    fn manager() -> Arc<ShardManager> {
        let kernel = Arc::new(Kernel::new());
        let vstore = VirtualStore::new(kernel.clone());
        let scheduler = Arc::new(ApiScheduler::with_config(SchedulerConfig {
            max_concurrent_api_calls: 4,
            slot_acquire_timeout: Duration::from_secs(2),
        }));
        ShardManager::new(
            kernel,
            vstore,
            scheduler,
            Arc::new(StaticLlmClient::new("done")),
        )
    }

    fn small_config() -> SpawnQueueConfig {
        SpawnQueueConfig {
            max_queue_size: 10,
            per_priority_capacity: 10,
            high_water_mark: 0.7,
            worker_count: 1,
            default_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            slot_backoff_start: Duration::from_millis(10),
            slot_backoff_max: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_submit_and_wait_round_trip() {
        let queue = SpawnQueue::new(manager(), small_config());
        queue.start();

        let outcome = queue
            .submit_and_wait(SpawnRequest::new("generalist", "task"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "done");

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_queue_rejects() {
        let queue = SpawnQueue::new(manager(), small_config());
        let err = queue.submit(SpawnRequest::new("generalist", "t")).unwrap_err();
        assert!(matches!(err, NerdError::QueueStopped));
    }

    #[tokio::test]
    async fn test_capacity_boundary() {
        let queue = SpawnQueue::new(manager(), small_config());
        *queue.running.write() = true; // admit without draining

        let mut receivers = Vec::new();
        for _ in 0..9 {
            receivers.push(queue.submit(SpawnRequest::new("generalist", "t")).unwrap());
        }
        // depth 9 of 10: utilization 0.9, not above; critical still fits
        assert!(queue.can_accept(SpawnPriority::Critical));
        receivers.push(
            queue
                .submit(
                    SpawnRequest::new("generalist", "t")
                        .with_priority(SpawnPriority::Critical),
                )
                .unwrap(),
        );

        // at exactly max_queue_size everything is rejected
        assert_eq!(queue.depth(), 10);
        for priority in [
            SpawnPriority::Low,
            SpawnPriority::Normal,
            SpawnPriority::High,
            SpawnPriority::Critical,
        ] {
            assert!(!queue.can_accept(priority));
        }
        let err = queue
            .submit(SpawnRequest::new("generalist", "t").with_priority(SpawnPriority::Critical))
            .unwrap_err();
        assert!(matches!(err, NerdError::QueueFull(_)));
    }

    #[tokio::test]
    async fn test_high_water_mark_sheds_low() {
        let queue = SpawnQueue::new(manager(), small_config());
        *queue.running.write() = true;

        for _ in 0..8 {
            queue
                .submit(SpawnRequest::new("generalist", "t"))
                .unwrap();
        }
        // utilization 0.8 > high water 0.7: low rejected, normal accepted
        assert!(!queue.can_accept(SpawnPriority::Low));
        assert!(queue.can_accept(SpawnPriority::Normal));
        assert!(queue.can_accept(SpawnPriority::Critical));

        queue.submit(SpawnRequest::new("generalist", "t")).unwrap();
        // utilization exactly 0.9 does not exceed the 0.9 shed rule
        assert!(queue.can_accept(SpawnPriority::Normal));
        assert!(queue.can_accept(SpawnPriority::Critical));

        queue
            .submit(
                SpawnRequest::new("generalist", "t").with_priority(SpawnPriority::Critical),
            )
            .unwrap();
        // depth 10 of 10: absolute capacity rejects everything
        assert!(!queue.can_accept(SpawnPriority::Normal));
        assert!(!queue.can_accept(SpawnPriority::Critical));
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = SpawnQueue::new(manager(), small_config());
        *queue.running.write() = true;

        let low = queue
            .submit(SpawnRequest::new("generalist", "low").with_priority(SpawnPriority::Low))
            .unwrap();
        let critical = queue
            .submit(
                SpawnRequest::new("generalist", "critical")
                    .with_priority(SpawnPriority::Critical),
            )
            .unwrap();

        queue.start();

        let critical_outcome = critical.await.unwrap().unwrap();
        let low_outcome = low.await.unwrap().unwrap();

        // single worker: critical dispatched first, so its shard counter
        // is lower
        let counter = |id: &str| -> u64 {
            id.rsplit('-').next().unwrap().parse().unwrap()
        };
        assert!(counter(&critical_outcome.shard_id) < counter(&low_outcome.shard_id));

        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_fails_pending() {
        let queue = SpawnQueue::new(manager(), small_config());
        *queue.running.write() = true;
        let receiver = queue.submit(SpawnRequest::new("generalist", "t")).unwrap();

        queue.stop().await;
        assert!(matches!(
            receiver.await.unwrap(),
            Err(NerdError::QueueStopped)
        ));
    }

    #[tokio::test]
    async fn test_deadline_timeout() {
        let queue = SpawnQueue::new(manager(), small_config());
        // workers never started: the request sits queued past its deadline
        *queue.running.write() = true;

        let result = queue
            .submit_and_wait(
                SpawnRequest::new("generalist", "t")
                    .with_deadline(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(NerdError::QueueTimeout(_))));
    }
}
