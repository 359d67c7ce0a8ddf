//! Policy module hot reload
//!
//! Watches `.nerd/mangle/*.mg` policy modules and re-loads a module
//! through the kernel when its file settles after a change. A failed
//! reload keeps the previous program active; outcomes are published on
//! an event channel.

use crate::error::{NerdError, Result};
use crate::kernel::Kernel;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// File change event
#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    /// Path that changed
    pub path: PathBuf,
    /// Type of change
    pub kind: ChangeKind,
    /// When the change was observed
    pub timestamp: Instant,
}

/// Type of file change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// File was created
    Created,
    /// File was modified
    Modified,
    /// File was removed
    Removed,
}

fn process_notify_event(event: Event) -> Option<FileChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return None,
    };
    let path = event.paths.into_iter().next()?;
    Some(FileChangeEvent {
        path,
        kind,
        timestamp: Instant::now(),
    })
}

/// File watcher over policy modules
pub struct PolicyWatcher {
    watcher: RecommendedWatcher,
    event_rx: Receiver<FileChangeEvent>,
    watched_paths: HashSet<PathBuf>,
    extensions: Vec<String>,
}

impl PolicyWatcher {
    /// Create a watcher for `.mg` modules
    pub fn new() -> Result<Self> {
        let (tx, rx): (Sender<FileChangeEvent>, _) = channel();

        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if let Some(change) = process_notify_event(event) {
                        if tx.send(change).is_err() {
                            error!("policy watch channel closed");
                        }
                    }
                }
                Err(e) => error!("policy watch error: {e}"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )
        .map_err(|e| NerdError::Config(format!("failed to create watcher: {e}")))?;

        Ok(PolicyWatcher {
            watcher,
            event_rx: rx,
            watched_paths: HashSet::new(),
            extensions: vec!["mg".to_string()],
        })
    }

    /// Watch a file or directory
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.watched_paths.contains(path) {
            debug!(path = %path.display(), "already watching");
            return Ok(());
        }
        let mode = if path.is_dir() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .watch(path, mode)
            .map_err(|e| NerdError::Config(format!("failed to watch {}: {e}", path.display())))?;
        self.watched_paths.insert(path.to_path_buf());
        info!(path = %path.display(), "watching policy path");
        Ok(())
    }

    /// Whether this watcher cares about a path
    pub fn should_watch(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x == e))
            .unwrap_or(false)
    }

    /// Non-blocking event poll
    pub fn try_recv(&self) -> Option<FileChangeEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Blocking event poll with timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Option<FileChangeEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Paths currently watched
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watched_paths.iter().cloned().collect()
    }
}

/// Collapses bursts of events per path until they settle
pub struct EventDebouncer {
    duration: Duration,
    pending: HashMap<PathBuf, FileChangeEvent>,
}

impl EventDebouncer {
    /// Create a debouncer with a settle duration
    pub fn new(duration: Duration) -> Self {
        EventDebouncer {
            duration,
            pending: HashMap::new(),
        }
    }

    /// Record an event, replacing any pending event for the same path
    pub fn add_event(&mut self, event: FileChangeEvent) {
        self.pending.insert(event.path.clone(), event);
    }

    /// Drain events whose last change is older than the settle duration
    pub fn get_settled_events(&mut self) -> Vec<FileChangeEvent> {
        let now = Instant::now();
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, e)| now.duration_since(e.timestamp) >= self.duration)
            .map(|(p, _)| p.clone())
            .collect();
        settled
            .into_iter()
            .filter_map(|p| self.pending.remove(&p))
            .collect()
    }

    /// Whether events are waiting to settle
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Result of a reload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadResult {
    /// Module loaded and program re-evaluated
    Success,
    /// Reload failed; the previous program stays active
    Failed(String),
    /// Path ignored (wrong extension, removal)
    Skipped(String),
}

/// Reload event published to subscribers
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Path that triggered the reload
    pub path: PathBuf,
    /// Outcome
    pub result: ReloadResult,
    /// When the reload finished
    pub timestamp: Instant,
}

/// Configuration for the reload coordinator
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Wait for writes to settle
    pub debounce_duration: Duration,
    /// React to events automatically
    pub auto_reload: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            debounce_duration: Duration::from_millis(500),
            auto_reload: true,
        }
    }
}

/// Watches policy modules and re-loads them through the kernel
pub struct PolicyReloadCoordinator {
    kernel: Arc<Kernel>,
    watcher: PolicyWatcher,
    debouncer: EventDebouncer,
    config: WatchConfig,
    event_tx: Option<mpsc::UnboundedSender<ReloadEvent>>,
}

impl PolicyReloadCoordinator {
    /// Create a coordinator with the default configuration
    pub fn new(kernel: Arc<Kernel>) -> Result<Self> {
        Self::with_config(kernel, WatchConfig::default())
    }

    /// Create a coordinator with an explicit configuration
    pub fn with_config(kernel: Arc<Kernel>, config: WatchConfig) -> Result<Self> {
        let watcher = PolicyWatcher::new()?;
        let debouncer = EventDebouncer::new(config.debounce_duration);
        Ok(PolicyReloadCoordinator {
            kernel,
            watcher,
            debouncer,
            config,
            event_tx: None,
        })
    }

    /// Watch the `.nerd/mangle` directory of a workspace root
    pub fn watch_workspace(&mut self, root: &Path) -> Result<()> {
        self.watch_path(&root.join(".nerd/mangle"))
    }

    /// Watch one path (file or directory)
    pub fn watch_path(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(NerdError::Config(format!(
                "path does not exist: {}",
                path.display()
            )));
        }
        self.watcher.watch(path)
    }

    /// Subscribe to reload events
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    /// Run the coordinator loop; it only returns when the kernel side
    /// shuts the process down.
    pub async fn run(mut self) -> Result<()> {
        info!("policy reload coordinator started");
        loop {
            if let Some(event) = self.watcher.recv_timeout(Duration::from_millis(100)) {
                debug!(?event, "policy file change");
                self.debouncer.add_event(event);
            }

            for event in self.debouncer.get_settled_events() {
                if !self.config.auto_reload {
                    continue;
                }
                let result = self.reload_file(&event.path);
                if let Some(tx) = &self.event_tx {
                    let reload_event = ReloadEvent {
                        path: event.path.clone(),
                        result,
                        timestamp: Instant::now(),
                    };
                    if tx.send(reload_event).is_err() {
                        warn!("reload event dropped (no subscribers)");
                    }
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Reload one module immediately
    pub fn manual_reload(&self, path: &Path) -> ReloadResult {
        self.reload_file(path)
    }

    fn reload_file(&self, path: &Path) -> ReloadResult {
        if !self.watcher.should_watch(path) {
            return ReloadResult::Skipped(format!("not a policy module: {}", path.display()));
        }
        if !path.exists() {
            return ReloadResult::Skipped(format!("removed: {}", path.display()));
        }

        // validate in a sandbox clone first so a broken module never
        // dirties the live kernel
        let sandbox = self.kernel.clone_sandbox();
        let staged = match sandbox.load_policy_file(path) {
            Ok(staged) => staged,
            Err(e) => return ReloadResult::Failed(e.to_string()),
        };
        if !staged {
            debug!(path = %path.display(), "module unchanged");
            return ReloadResult::Success;
        }
        if let Err(e) = sandbox.evaluate() {
            error!(path = %path.display(), error = %e, "reload failed, previous program retained");
            return ReloadResult::Failed(e.to_string());
        }

        match self
            .kernel
            .load_policy_file(path)
            .and_then(|_| self.kernel.evaluate())
        {
            Ok(()) => {
                info!(path = %path.display(), "policy module reloaded");
                ReloadResult::Success
            }
            Err(e) => ReloadResult::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::Fact;
    use std::io::Write;
    use tempfile::TempDir;

    fn coordinator() -> (PolicyReloadCoordinator, Arc<Kernel>, TempDir) {
        let kernel = Arc::new(Kernel::new());
        let coordinator = PolicyReloadCoordinator::new(kernel.clone()).unwrap();
        (coordinator, kernel, TempDir::new().unwrap())
    }

    fn write_module(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{content}").unwrap();
        path
    }

    #[tokio::test]
    async fn test_manual_reload_installs_policy() {
        let (coordinator, kernel, dir) = coordinator();
        let path = write_module(
            &dir,
            "safety.mg",
            "permitted(/read_file) :- system_startup.\n",
        );

        assert_eq!(coordinator.manual_reload(&path), ReloadResult::Success);

        kernel.assert_fact(Fact::new("system_startup", vec![])).unwrap();
        assert!(kernel.holds("permitted(/read_file)"));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_program() {
        let (coordinator, kernel, dir) = coordinator();
        let path = write_module(&dir, "rules.mg", "current_phase(/boot) :- system_startup.\n");
        assert_eq!(coordinator.manual_reload(&path), ReloadResult::Success);
        kernel.assert_fact(Fact::new("system_startup", vec![])).unwrap();
        assert!(kernel.holds("current_phase(/boot)"));

        // overwrite the same module with a broken rule
        write_module(&dir, "rules.mg", "current_phase(/boot) :- phantom(X).\n");
        let result = coordinator.manual_reload(&path);
        assert!(matches!(result, ReloadResult::Failed(_)));

        // the old derivation is still active
        assert!(kernel.holds("current_phase(/boot)"));
    }

    #[tokio::test]
    async fn test_non_module_skipped() {
        let (coordinator, _kernel, dir) = coordinator();
        let path = write_module(&dir, "notes.txt", "not a module");
        assert!(matches!(
            coordinator.manual_reload(&path),
            ReloadResult::Skipped(_)
        ));
    }

    #[test]
    fn test_debouncer_settles() {
        let mut debouncer = EventDebouncer::new(Duration::from_millis(20));
        debouncer.add_event(FileChangeEvent {
            path: PathBuf::from("a.mg"),
            kind: ChangeKind::Modified,
            timestamp: Instant::now(),
        });
        assert!(debouncer.has_pending());
        assert!(debouncer.get_settled_events().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        let settled = debouncer.get_settled_events();
        assert_eq!(settled.len(), 1);
        assert!(!debouncer.has_pending());
    }

    #[test]
    fn test_debouncer_coalesces_bursts() {
        let mut debouncer = EventDebouncer::new(Duration::from_millis(20));
        for _ in 0..5 {
            debouncer.add_event(FileChangeEvent {
                path: PathBuf::from("a.mg"),
                kind: ChangeKind::Modified,
                timestamp: Instant::now(),
            });
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(debouncer.get_settled_events().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_missing_path_rejected() {
        let (mut coordinator, _kernel, _dir) = coordinator();
        assert!(coordinator
            .watch_path(Path::new("/no/such/dir"))
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_and_subscribe() {
        let (mut coordinator, _kernel, dir) = coordinator();
        write_module(&dir, "a.mg", "# empty\n");
        coordinator.watch_path(dir.path()).unwrap();
        let _rx = coordinator.subscribe();
        assert_eq!(coordinator.watcher.watched_paths().len(), 1);
    }
}
