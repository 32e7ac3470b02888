use happen_types::NodeId;

use crate::metrics::ConsumerMetrics;

/// Lag/ack-rate thresholds governing health state and pattern detection.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Thresholds {
    /// Lag at or above which `overload` starts counting a node as affected.
    pub minor_lag: u64,
    /// Lag at or above which a node is `degraded` and `bottleneck` fires.
    pub moderate_lag: u64,
    /// Lag at or above which a node is `unhealthy` and `partition` fires.
    pub severe_lag: u64,
    /// Lag at or above which `node-failure` fires.
    pub critical_lag: u64,
    /// Ack rate below which a node is considered `unhealthy`.
    pub min_ack_rate: f64,
}

/// Per-node health classification, re-derived every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// Lag and ack rate both within tolerance.
    Healthy,
    /// Lag has crossed `moderate_lag`.
    Degraded,
    /// Lag has crossed `severe_lag`, or ack rate fell below `min_ack_rate`.
    Unhealthy,
}

/// Derive this tick's health for a node from its metrics.
pub fn derive_health(metrics: &ConsumerMetrics, thresholds: &Thresholds) -> NodeHealth {
    if metrics.consumer_lag >= thresholds.severe_lag || metrics.ack_rate < thresholds.min_ack_rate {
        NodeHealth::Unhealthy
    } else if metrics.consumer_lag >= thresholds.moderate_lag {
        NodeHealth::Degraded
    } else {
        NodeHealth::Healthy
    }
}

/// Severity tag attached to a detected pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Noticeable but not urgent.
    Moderate,
    /// Urgent, spanning multiple nodes or sustained.
    Severe,
    /// Requires immediate attention.
    Critical,
}

/// A named, severity-tagged classification of system health.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowPattern {
    /// A single node's lag reached `critical_lag`.
    NodeFailure {
        /// The node that failed.
        node: NodeId,
        /// Severity of the failure.
        severity: Severity,
    },
    /// A single node is lagging and not making progress.
    Bottleneck {
        /// The node that is bottlenecked.
        node: NodeId,
        /// Severity of the bottleneck.
        severity: Severity,
    },
    /// Two or more nodes have crossed `severe_lag`.
    Partition {
        /// Nodes affected by the partition.
        affected: Vec<NodeId>,
        /// Severity of the partition.
        severity: Severity,
    },
    /// At least 70% of nodes have crossed `minor_lag`.
    Overload {
        /// Nodes affected by the overload.
        affected: Vec<NodeId>,
        /// Severity of the overload.
        severity: Severity,
        /// Average lag across affected nodes.
        avg_lag: f64,
    },
}

/// Evaluate every detection rule against this tick's snapshot. Rules do not
/// preempt one another -- a node can simultaneously trigger `node-failure`
/// and contribute to `partition`/`overload`.
pub fn detect_patterns(snapshot: &[(NodeId, ConsumerMetrics)], thresholds: &Thresholds) -> Vec<FlowPattern> {
    let mut patterns = Vec::new();

    for (node, metrics) in snapshot {
        if metrics.consumer_lag >= thresholds.critical_lag {
            patterns.push(FlowPattern::NodeFailure { node: node.clone(), severity: Severity::Critical });
        }
    }

    for (node, metrics) in snapshot {
        if metrics.consumer_lag >= thresholds.moderate_lag && metrics.processing_rate < 1.0 {
            let severity = if metrics.consumer_lag >= thresholds.severe_lag {
                Severity::Severe
            } else {
                Severity::Moderate
            };
            patterns.push(FlowPattern::Bottleneck { node: node.clone(), severity });
        }
    }

    let severely_lagging: Vec<NodeId> = snapshot
        .iter()
        .filter(|(_, m)| m.consumer_lag >= thresholds.severe_lag)
        .map(|(n, _)| n.clone())
        .collect();
    if severely_lagging.len() >= 2 {
        let total = snapshot.len();
        let severity = if total > 0 && severely_lagging.len() * 2 >= total {
            Severity::Critical
        } else {
            Severity::Severe
        };
        patterns.push(FlowPattern::Partition { affected: severely_lagging, severity });
    }

    let minor_lagging: Vec<NodeId> = snapshot
        .iter()
        .filter(|(_, m)| m.consumer_lag >= thresholds.minor_lag)
        .map(|(n, _)| n.clone())
        .collect();
    if !snapshot.is_empty() && minor_lagging.len() as f64 >= 0.7 * snapshot.len() as f64 {
        let avg_lag =
            snapshot.iter().map(|(_, m)| m.consumer_lag as f64).sum::<f64>() / snapshot.len() as f64;
        let severity = if avg_lag >= thresholds.severe_lag as f64 { Severity::Severe } else { Severity::Moderate };
        patterns.push(FlowPattern::Overload { affected: minor_lagging, severity, avg_lag });
    }

    patterns
}
