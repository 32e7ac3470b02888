use std::time::Duration;

use happen_flow_balance::Thresholds;
use happen_node::NodeConfig;
use happen_resilience::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the Happen runtime.
///
/// Bundles the per-node defaults every spawned [`crate::Runtime::spawn_node`]
/// call starts from, the Flow-Balance thresholds and polling cadence, and the
/// transport's buffer capacity. Construction is infallible; `RuntimeConfig`
/// values are only validated once handed to [`crate::Runtime::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ring buffer capacity of the in-memory transport's broadcast channel.
    pub transport_capacity: usize,
    /// Defaults applied to every node spawned on this runtime.
    pub node: NodeConfig,
    /// Lag/ack-rate thresholds Flow-Balance uses to derive health and detect
    /// patterns.
    pub flow_balance_thresholds: Thresholds,
    /// How often Flow-Balance polls consumer telemetry.
    pub flow_balance_polling_interval: Duration,
    /// The transport stream Flow-Balance polls consumer telemetry from.
    pub flow_balance_stream: String,
    /// Error-rate thresholds and restart policy the runtime's node
    /// supervisor applies to every spawned node.
    pub supervisor: SupervisorConfig,
    /// `RUST_LOG`-style filter directive used when [`crate::init_tracing`] is
    /// called and no `RUST_LOG` environment variable is set.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transport_capacity: 1024,
            node: NodeConfig::default(),
            flow_balance_thresholds: Thresholds {
                minor_lag: 100,
                moderate_lag: 500,
                severe_lag: 1000,
                critical_lag: 5000,
                min_ack_rate: 0.5,
            },
            flow_balance_polling_interval: Duration::from_secs(5),
            flow_balance_stream: "happen-events".to_string(),
            supervisor: SupervisorConfig {
                time_window: Duration::from_secs(60),
                error_threshold: 4,
                restart_delay: Duration::from_secs(2),
                max_restarts: 3,
            },
            log_level: "info".to_string(),
        }
    }
}

/// Build a runtime configuration suitable for unit and integration tests:
/// small transport buffer, fast polling, Flow-Balance disabled by default
/// cadence tightened so tests don't need to sleep long.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        transport_capacity: 64,
        flow_balance_polling_interval: Duration::from_millis(50),
        ..RuntimeConfig::default()
    }
}
