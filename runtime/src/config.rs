//! Configuration of the state machine manager.
//!
//! Loading configuration is up to the host; everything here derives `serde`
//! so it can be embedded in whatever file format the node uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout supervision of timed flows.
///
/// The `n`th consecutive timeout of a flow fires after roughly
/// `timeout × backoff_base^min(n, max_restart_count)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowTimeoutConfig {
    /// Delay before the first timeout. Also the floor for custom timeouts.
    pub timeout: Duration,
    /// Retry count after which the delay stops growing.
    pub max_restart_count: u32,
    /// Growth factor of the delay per retry.
    pub backoff_base: f64,
}

impl FlowTimeoutConfig {
    /// Set the base timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry count at which backoff stops growing.
    #[must_use]
    pub const fn with_max_restart_count(mut self, count: u32) -> Self {
        self.max_restart_count = count;
        self
    }

    /// Set the backoff growth factor.
    #[must_use]
    pub const fn with_backoff_base(mut self, base: f64) -> Self {
        self.backoff_base = base;
        self
    }
}

impl Default for FlowTimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_restart_count: 6,
            backoff_base: 1.8,
        }
    }
}

/// Policy knobs of the default Flow Hospital staff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalConfig {
    /// How often a flow failing with transient errors is retried before it
    /// is kept for observation.
    pub max_transient_retries: u32,
}

impl Default for HospitalConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
        }
    }
}

/// Configuration of a [`FlowStateMachineManager`](crate::FlowStateMachineManager).
///
/// # Example
///
/// ```
/// use flowmachine_runtime::config::{FlowTimeoutConfig, StateMachineConfig};
/// use std::time::Duration;
///
/// let config = StateMachineConfig::default()
///     .with_flow_timeout(FlowTimeoutConfig::default().with_timeout(Duration::from_secs(5)))
///     .with_dev_mode(true);
/// assert!(config.dev_mode);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// Timeout supervision.
    pub flow_timeout: FlowTimeoutConfig,
    /// Keep per-flow transition history and dump it when a flow errors.
    pub dev_mode: bool,
    /// Verify in the background that every checkpoint can be restored.
    pub check_checkpoints: bool,
    /// Log every transition.
    pub trace_transitions: bool,
    /// Flow Hospital policy.
    pub hospital: HospitalConfig,
}

impl StateMachineConfig {
    /// Set timeout supervision.
    #[must_use]
    pub fn with_flow_timeout(mut self, flow_timeout: FlowTimeoutConfig) -> Self {
        self.flow_timeout = flow_timeout;
        self
    }

    /// Enable or disable transition history dumps.
    #[must_use]
    pub const fn with_dev_mode(mut self, enabled: bool) -> Self {
        self.dev_mode = enabled;
        self
    }

    /// Enable or disable background checkpoint verification.
    #[must_use]
    pub const fn with_check_checkpoints(mut self, enabled: bool) -> Self {
        self.check_checkpoints = enabled;
        self
    }

    /// Enable or disable transition tracing.
    #[must_use]
    pub const fn with_trace_transitions(mut self, enabled: bool) -> Self {
        self.trace_transitions = enabled;
        self
    }

    /// Set Flow Hospital policy.
    #[must_use]
    pub const fn with_hospital(mut self, hospital: HospitalConfig) -> Self {
        self.hospital = hospital;
        self
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            flow_timeout: FlowTimeoutConfig::default(),
            dev_mode: false,
            check_checkpoints: false,
            trace_transitions: false,
            hospital: HospitalConfig::default(),
        }
    }
}
