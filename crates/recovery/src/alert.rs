//! Alerts raised when a sweep cycle fails too often.

use crate::sweep::RecoveryItemError;
use async_trait::async_trait;
use tracing::error;

/// A sweep cycle whose per-item error rate crossed the threshold.
#[derive(Debug, Clone)]
pub struct RecoveryAlert {
    /// Correlation id of the cycle
    pub correlation_id: String,
    /// Expired leases found in the cycle
    pub expired_count: usize,
    /// Failed recoveries
    pub errors: Vec<RecoveryItemError>,
    /// `errors / (expired + orphaned)`
    pub error_rate: f64,
    /// Threshold that was crossed
    pub threshold: f64,
}

/// Receiver of recovery alerts (pager, chat hook, ...).
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Delivery failures are the sink's problem.
    async fn alert(&self, alert: &RecoveryAlert);
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, alert: &RecoveryAlert) {
        let resources: Vec<&str> = alert.errors.iter().map(|e| e.resource.as_str()).collect();
        error!(
            correlation_id = %alert.correlation_id,
            expired = alert.expired_count,
            failed = alert.errors.len(),
            error_rate = alert.error_rate,
            threshold = alert.threshold,
            ?resources,
            "recovery error rate above threshold"
        );
    }
}
