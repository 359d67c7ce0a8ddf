//! Tracing and metrics bootstrap
//!
//! Library-surface observability: an env-filtered tracing subscriber and
//! a Prometheus recorder whose handle renders to text. There is no HTTP
//! listener here; embedding binaries decide how to expose the rendered
//! metrics.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Counter: successful kernel evaluations
pub const KERNEL_EVALUATIONS: &str = "nerd_kernel_evaluations_total";
/// Histogram: kernel evaluation latency in seconds
pub const KERNEL_EVALUATION_SECONDS: &str = "nerd_kernel_evaluation_seconds";
/// Counter: completed API calls (incremented on slot release)
pub const API_CALLS: &str = "nerd_api_calls_total";
/// Counter: spawn requests admitted
pub const SPAWN_SUBMITTED: &str = "nerd_spawn_submitted_total";
/// Counter: spawn requests rejected at admission
pub const SPAWN_REJECTED: &str = "nerd_spawn_rejected_total";

static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize the tracing subscriber from `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Install the Prometheus recorder and return its render handle.
/// Subsequent calls return the handle installed first.
pub fn install_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    METRICS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        metrics::describe_counter!(KERNEL_EVALUATIONS, "successful kernel evaluations");
        metrics::describe_histogram!(
            KERNEL_EVALUATION_SECONDS,
            "kernel evaluation latency in seconds"
        );
        metrics::describe_counter!(API_CALLS, "completed API calls");
        metrics::describe_counter!(SPAWN_SUBMITTED, "spawn requests admitted");
        metrics::describe_counter!(SPAWN_REJECTED, "spawn requests rejected at admission");
        info!("prometheus recorder installed");
        Ok(handle)
    })
}

/// Render the current metrics in Prometheus exposition format; empty
/// when the recorder is not installed.
pub fn render_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
