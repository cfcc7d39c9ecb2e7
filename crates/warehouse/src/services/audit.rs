//! Audit event delivery.
//!
//! The engine hands events to an [`AuditSink`] after the mutation they describe
//! has committed. A sink failure never undoes the mutation: it is logged,
//! reported to Sentry, counted, and surfaced as `audited == false` on the
//! operation's result.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::models::AuditEvent;

/// Errors reported by audit sinks.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The sink cannot accept events right now.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit events. Owned by an external audit-log subsystem.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    ///
    /// # Errors
    ///
    /// Returns `AuditError` if the event could not be recorded.
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            event_id = %event.id,
            actor = %event.actor,
            action = %event.action,
            entity_type = event.entity_type.as_str(),
            entity_id = %event.entity_id,
            details = %event.details,
            "audit"
        );
        Ok(())
    }
}

/// Forwards audit events to a bounded channel drained by another task.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver that drains it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AuditError::Unavailable("audit channel is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                AuditError::Unavailable("audit channel is closed".to_string())
            }
        })
    }
}

/// Keeps every event in memory. Can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl RecordingAuditSink {
    /// Create an empty, healthy sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent `record` calls fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Unavailable("recording sink is failing".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Delivers events to a sink and accounts for failures.
#[derive(Clone)]
pub struct AuditReporter {
    sink: Arc<dyn AuditSink>,
    failures: Arc<AtomicU64>,
}

impl std::fmt::Debug for AuditReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditReporter")
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}

impl AuditReporter {
    /// Wrap a sink.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver every event, returning whether all were recorded.
    ///
    /// Delivery continues past a failed event.
    pub fn emit(&self, events: &[AuditEvent]) -> bool {
        let mut delivered = true;
        for event in events {
            if let Err(err) = self.sink.record(event) {
                delivered = false;
                self.failures.fetch_add(1, Ordering::Relaxed);
                let sentry_event_id = sentry::capture_error(&err);
                error!(
                    error = %err,
                    event_id = %event.id,
                    action = %event.action,
                    entity_id = %event.entity_id,
                    sentry_event_id = %sentry_event_id,
                    "Failed to record audit event"
                );
            }
        }
        delivered
    }

    /// Number of events that failed delivery since this reporter was created.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use lotkeeper_core::ActorId;
    use serde_json::json;

    use super::*;
    use crate::models::{AuditAction, AuditEntity};

    fn event() -> AuditEvent {
        AuditEvent::new(
            ActorId::new(1),
            AuditAction::Picked,
            AuditEntity::OrderPick,
            42,
            json!({ "quantity": "5" }),
        )
    }

    #[test]
    fn test_reporter_delivers_to_sink() {
        let sink = Arc::new(RecordingAuditSink::new());
        let reporter = AuditReporter::new(sink.clone());
        assert!(reporter.emit(&[event(), event()]));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(reporter.failure_count(), 0);
    }

    #[test]
    fn test_reporter_counts_failures() {
        let sink = Arc::new(RecordingAuditSink::new());
        sink.set_failing(true);
        let reporter = AuditReporter::new(sink.clone());
        assert!(!reporter.emit(&[event(), event()]));
        assert_eq!(reporter.failure_count(), 2);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelAuditSink::new(4);
        let sent = event();
        sink.record(&sent).unwrap();
        assert_eq!(rx.recv().await.unwrap(), sent);
    }

    #[test]
    fn test_channel_sink_reports_full_channel() {
        let (sink, _rx) = ChannelAuditSink::new(1);
        sink.record(&event()).unwrap();
        assert!(matches!(
            sink.record(&event()),
            Err(AuditError::Unavailable(_))
        ));
    }

    #[test]
    fn test_channel_sink_reports_closed_channel() {
        let (sink, rx) = ChannelAuditSink::new(1);
        drop(rx);
        assert!(sink.record(&event()).is_err());
    }
}
