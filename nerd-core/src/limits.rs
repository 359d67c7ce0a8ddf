//! Resource limits enforcement
//!
//! Tracks process memory, concurrent non-system shards, and session
//! duration against configured budgets, with callbacks on violation.

use crate::error::{NerdError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Limit budgets
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Process memory budget in bytes
    pub max_memory_bytes: u64,
    /// Maximum concurrent non-system shards
    pub max_concurrent_shards: usize,
    /// Maximum session duration
    pub max_session_duration: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_memory_bytes: 10 * 1024 * 1024 * 1024,
            max_concurrent_shards: 8,
            max_session_duration: Duration::from_secs(4 * 60 * 60),
        }
    }
}

/// A limit that was exceeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitViolation {
    /// Memory budget exceeded (current, budget)
    Memory(u64, u64),
    /// Shard budget exceeded (active, budget)
    Shards(usize, usize),
    /// Session duration exceeded
    SessionDuration(Duration),
}

type ViolationCallback = Arc<dyn Fn(&LimitViolation) + Send + Sync>;

/// Tracks resource use against the configured budgets
pub struct LimitsEnforcer {
    config: LimitsConfig,
    session_start: Instant,
    callbacks: RwLock<Vec<ViolationCallback>>,
}

impl LimitsEnforcer {
    /// Create an enforcer with the default budgets
    pub fn new() -> Self {
        Self::with_config(LimitsConfig::default())
    }

    /// Create an enforcer with explicit budgets
    pub fn with_config(config: LimitsConfig) -> Self {
        LimitsEnforcer {
            config,
            session_start: Instant::now(),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a violation callback
    pub fn on_violation(&self, callback: impl Fn(&LimitViolation) + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    fn fire(&self, violation: &LimitViolation) {
        warn!(?violation, "resource limit violated");
        for callback in self.callbacks.read().iter() {
            callback(violation);
        }
    }

    /// Error when starting one more shard would exceed the budget
    pub fn check_shard_limit(&self, active: usize) -> Result<()> {
        if active >= self.config.max_concurrent_shards {
            let violation = LimitViolation::Shards(active, self.config.max_concurrent_shards);
            self.fire(&violation);
            return Err(NerdError::LimitExceeded(format!(
                "{active} active shards at limit {}",
                self.config.max_concurrent_shards
            )));
        }
        Ok(())
    }

    /// Error when the process RSS exceeds the memory budget. On
    /// platforms without an RSS source the check passes.
    pub fn check_memory(&self) -> Result<()> {
        let Some(rss) = current_rss_bytes() else {
            return Ok(());
        };
        if rss > self.config.max_memory_bytes {
            let violation = LimitViolation::Memory(rss, self.config.max_memory_bytes);
            self.fire(&violation);
            return Err(NerdError::LimitExceeded(format!(
                "rss {rss} bytes over budget {}",
                self.config.max_memory_bytes
            )));
        }
        Ok(())
    }

    /// Error once the session has outlived its budget
    pub fn check_session_duration(&self) -> Result<()> {
        let elapsed = self.session_start.elapsed();
        if elapsed > self.config.max_session_duration {
            let violation = LimitViolation::SessionDuration(elapsed);
            self.fire(&violation);
            return Err(NerdError::LimitExceeded(format!(
                "session {elapsed:?} over budget {:?}",
                self.config.max_session_duration
            )));
        }
        Ok(())
    }

    /// Elapsed session time
    pub fn session_elapsed(&self) -> Duration {
        self.session_start.elapsed()
    }
}

impl Default for LimitsEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size of this process, when the platform exposes one
#[cfg(target_os = "linux")]
pub fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Resident set size of this process, when the platform exposes one
#[cfg(not(target_os = "linux"))]
pub fn current_rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_shard_limit() {
        let enforcer = LimitsEnforcer::with_config(LimitsConfig {
            max_concurrent_shards: 2,
            ..Default::default()
        });
        assert!(enforcer.check_shard_limit(0).is_ok());
        assert!(enforcer.check_shard_limit(1).is_ok());
        assert!(enforcer.check_shard_limit(2).is_err());
        assert!(enforcer.check_shard_limit(5).is_err());
    }

    #[test]
    fn test_violation_callback_fires() {
        let enforcer = LimitsEnforcer::with_config(LimitsConfig {
            max_concurrent_shards: 1,
            ..Default::default()
        });
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = fired.clone();
        enforcer.on_violation(move |violation| {
            assert!(matches!(violation, LimitViolation::Shards(1, 1)));
            fired_in.fetch_add(1, Ordering::SeqCst);
        });
        let _ = enforcer.check_shard_limit(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_duration() {
        let enforcer = LimitsEnforcer::with_config(LimitsConfig {
            max_session_duration: Duration::from_secs(0),
            ..Default::default()
        });
        std::thread::sleep(Duration::from_millis(5));
        assert!(enforcer.check_session_duration().is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_readable_on_linux() {
        let rss = current_rss_bytes().unwrap();
        assert!(rss > 0);
    }

    #[test]
    fn test_memory_within_default_budget() {
        let enforcer = LimitsEnforcer::new();
        assert!(enforcer.check_memory().is_ok());
    }
}
