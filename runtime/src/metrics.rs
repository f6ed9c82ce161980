//! Prometheus metrics of the state machine.
//!
//! Recorded from the transition pipeline, the manager's flow registry and
//! the Flow Hospital:
//! - Flows started, finished and in flight
//! - Transition latency per event
//! - Checkpoint writes
//! - Hospital admissions and verdicts
//!
//! # Example
//!
//! ```rust,no_run
//! use flowmachine_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder for the node.
///
/// The server does not listen itself: the host binds [`MetricsServer::addr`]
/// and answers `/metrics` with [`MetricsServer::render`].
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the node exposes `/metrics` on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (several managers in one test
    /// binary) is not an error; this server then has no handle to render.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the host should expose `/metrics` on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Flows
    describe_counter!("flows_started_total", "Total number of flows added to the manager");
    describe_counter!(
        "flows_finished_total",
        "Total number of flows removed from the manager, by outcome"
    );
    describe_gauge!("flows_in_flight", "Number of flows currently registered");
    describe_counter!(
        "flows_retried_total",
        "Total number of flows restarted from their last checkpoint"
    );

    // Transitions
    describe_counter!("flow_transitions_total", "Total number of transitions, by event");
    describe_counter!(
        "flow_transition_failures_total",
        "Total number of transitions whose actions failed"
    );
    describe_histogram!(
        "flow_transition_duration_seconds",
        "Time taken to compute and execute a transition"
    );

    // Checkpoints
    describe_counter!("checkpoints_written_total", "Total number of checkpoints committed");
    describe_counter!("checkpoints_removed_total", "Total number of checkpoints deleted");

    // Hospital
    describe_counter!(
        "hospital_admissions_total",
        "Total number of Flow Hospital admissions, by verdict"
    );
}

/// Flow registry metrics recorder.
pub struct FlowMetrics;

impl FlowMetrics {
    /// Record a flow added to the manager.
    pub fn record_started() {
        counter!("flows_started_total").increment(1);
    }

    /// Record a flow leaving the manager.
    pub fn record_finished(success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!("flows_finished_total", "outcome" => outcome).increment(1);
    }

    /// Record a retry from the last checkpoint.
    pub fn record_retry() {
        counter!("flows_retried_total").increment(1);
    }

    /// Record the number of registered flows.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_in_flight(count: usize) {
        gauge!("flows_in_flight").set(count as f64);
    }
}

/// Transition pipeline metrics recorder.
pub struct TransitionMetrics;

impl TransitionMetrics {
    /// Record one transition.
    pub fn record_transition(event: &'static str, duration: Duration) {
        counter!("flow_transitions_total", "event" => event).increment(1);
        histogram!("flow_transition_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a transition whose actions failed.
    pub fn record_failure() {
        counter!("flow_transition_failures_total").increment(1);
    }
}

/// Checkpoint store metrics recorder.
pub struct CheckpointMetrics;

impl CheckpointMetrics {
    /// Record a committed checkpoint write.
    pub fn record_write() {
        counter!("checkpoints_written_total").increment(1);
    }

    /// Record a committed checkpoint removal.
    pub fn record_remove() {
        counter!("checkpoints_removed_total").increment(1);
    }
}

/// Flow Hospital metrics recorder.
pub struct HospitalMetrics;

impl HospitalMetrics {
    /// Record an admission and its verdict.
    pub fn record_admission(verdict: &'static str) {
        counter!("hospital_admissions_total", "verdict" => verdict).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn flow_metrics_are_rendered() {
        let addr = "127.0.0.1:9464".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();
        assert_eq!(server.addr(), addr);

        FlowMetrics::record_started();
        FlowMetrics::record_finished(true);
        TransitionMetrics::record_transition("Suspend", Duration::from_millis(2));

        // Another test may have installed the recorder first; then there is
        // nothing to render, but recording must still not panic.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("flows_started_total"));
            assert!(rendered.contains("flow_transitions_total"));
        }
    }

    #[tokio::test]
    async fn hospital_and_checkpoint_metrics_are_rendered() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CheckpointMetrics::record_write();
        CheckpointMetrics::record_remove();
        HospitalMetrics::record_admission("retry");

        if let Some(rendered) = server.render() {
            assert!(rendered.contains("checkpoints_written_total"));
            assert!(rendered.contains("hospital_admissions_total"));
        }
    }
}
