use happen_transport::ConsumerInfo;

/// Derived per-consumer health metrics for a single tick.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ConsumerMetrics {
    /// `delivered - ack_floor`.
    pub consumer_lag: u64,
    /// `delivered / max(1, seconds_since_created)`.
    pub processing_rate: f64,
    /// `ack_floor / max(1, delivered)`.
    pub ack_rate: f64,
    /// `num_redelivered`, a proxy for delivery failures.
    pub delivery_failures: u64,
}

/// Compute this tick's metrics for `info`, given the current wall-clock time.
pub fn compute_metrics(info: &ConsumerInfo, now_epoch_secs: i64) -> ConsumerMetrics {
    let consumer_lag = info.delivered.saturating_sub(info.ack_floor);
    let age_secs = (now_epoch_secs - info.created_epoch_secs).max(1) as f64;
    let processing_rate = info.delivered as f64 / age_secs;
    let ack_rate = info.ack_floor as f64 / (info.delivered.max(1) as f64);

    ConsumerMetrics {
        consumer_lag,
        processing_rate,
        ack_rate,
        delivery_failures: info.num_redelivered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_lag_rate_and_ack_rate() {
        let info = ConsumerInfo {
            delivered: 100,
            ack_floor: 80,
            num_pending: 20,
            num_redelivered: 3,
            created_epoch_secs: 0,
        };
        let metrics = compute_metrics(&info, 10);
        assert_eq!(metrics.consumer_lag, 20);
        assert_eq!(metrics.processing_rate, 10.0);
        assert_eq!(metrics.ack_rate, 0.8);
        assert_eq!(metrics.delivery_failures, 3);
    }

    #[test]
    fn guards_against_zero_elapsed_and_zero_delivered() {
        let info = ConsumerInfo {
            delivered: 0,
            ack_floor: 0,
            num_pending: 0,
            num_redelivered: 0,
            created_epoch_secs: 5,
        };
        let metrics = compute_metrics(&info, 5);
        assert_eq!(metrics.processing_rate, 0.0);
        assert_eq!(metrics.ack_rate, 0.0);
    }
}
