//! Telemetry sinks
//!
//! The core reports lifecycle and heartbeat events fire-and-forget through a
//! [`TelemetrySink`]. Sinks must not block: they are called on the coordinating
//! task between frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::session::{ConnectionId, ConnectionStatus};

/// Event reported by the core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    HeartbeatReceived {
        profile: String,
    },
    HeartbeatResponded {
        latency: Duration,
    },
    HeartbeatTimeout {
        timeout: Duration,
    },
    HeartbeatFailure {
        consecutive: u32,
        threshold: u32,
        reason: String,
    },
    StateChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    ReconnectAttempt {
        attempt: u32,
        delay: Duration,
    },
    OwnershipTransferred {
        staged: usize,
    },
    OwnershipTransferAborted {
        reason: String,
    },
    Terminated {
        reason: String,
    },
}

impl TelemetryEvent {
    /// Stable dotted event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeartbeatReceived { .. } => "heartbeat.received",
            Self::HeartbeatResponded { .. } => "heartbeat.responded",
            Self::HeartbeatTimeout { .. } => "heartbeat.timeout",
            Self::HeartbeatFailure { .. } => "heartbeat.failure",
            Self::StateChanged { .. } => "connection.state_changed",
            Self::ReconnectAttempt { .. } => "reconnect.attempt",
            Self::OwnershipTransferred { .. } => "ownership.transferred",
            Self::OwnershipTransferAborted { .. } => "ownership.transfer_aborted",
            Self::Terminated { .. } => "connection.terminated",
        }
    }
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, connection: &ConnectionId, event: &TelemetryEvent);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn emit(&self, _connection: &ConnectionId, _event: &TelemetryEvent) {}
}

/// Structured log lines via `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, connection: &ConnectionId, event: &TelemetryEvent) {
        match event {
            // Per-probe events are hot path
            TelemetryEvent::HeartbeatReceived { profile } => {
                trace!(connection = %connection, profile = %profile, "heartbeat_received");
            }
            TelemetryEvent::HeartbeatResponded { latency } => {
                trace!(
                    connection = %connection,
                    latency_us = latency.as_micros() as u64,
                    "heartbeat_responded"
                );
            }
            TelemetryEvent::HeartbeatTimeout { timeout } => {
                warn!(
                    connection = %connection,
                    timeout_ms = timeout.as_millis() as u64,
                    "heartbeat_timeout"
                );
            }
            TelemetryEvent::HeartbeatFailure {
                consecutive,
                threshold,
                reason,
            } => {
                warn!(
                    connection = %connection,
                    consecutive,
                    threshold,
                    reason = %reason,
                    "heartbeat_failure"
                );
            }
            TelemetryEvent::StateChanged { from, to } => {
                debug!(connection = %connection, from = %from, to = %to, "connection_state_changed");
            }
            TelemetryEvent::ReconnectAttempt { attempt, delay } => {
                info!(
                    connection = %connection,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect_attempt"
                );
            }
            TelemetryEvent::OwnershipTransferred { staged } => {
                info!(connection = %connection, staged, "ownership_transferred");
            }
            TelemetryEvent::OwnershipTransferAborted { reason } => {
                warn!(connection = %connection, reason = %reason, "ownership_transfer_aborted");
            }
            TelemetryEvent::Terminated { reason } => {
                info!(connection = %connection, reason = %reason, "connection_terminated");
            }
        }
    }
}

/// Telemetry event stamped with wall-clock time and the connection id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub at: DateTime<Utc>,
    pub connection: ConnectionId,
    pub event: TelemetryEvent,
}

/// Publishes records on a broadcast channel; slow subscribers lag, the core never waits
#[derive(Debug, Clone)]
pub struct BroadcastTelemetry {
    tx: broadcast::Sender<TelemetryRecord>,
}

impl BroadcastTelemetry {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.tx.subscribe()
    }
}

impl TelemetrySink for BroadcastTelemetry {
    fn emit(&self, connection: &ConnectionId, event: &TelemetryEvent) {
        let record = TelemetryRecord {
            at: Utc::now(),
            connection: *connection,
            event: event.clone(),
        };
        // No subscribers is fine
        let _ = self.tx.send(record);
    }
}

/// Link counters for monitoring
#[derive(Debug, Default)]
pub struct LinkMetrics {
    pub heartbeats_received: AtomicU64,
    pub heartbeats_responded: AtomicU64,
    pub heartbeat_timeouts: AtomicU64,
    pub heartbeat_failures: AtomicU64,
    pub state_changes: AtomicU64,
    pub opens: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub total_backoff_ms: AtomicU64,
    pub transfers: AtomicU64,
    pub transfer_aborts: AtomicU64,
    pub terminations: AtomicU64,
    pub response_latency_us_total: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean heartbeat response latency over the lifetime of the sink
    pub fn mean_response_latency(&self) -> Option<Duration> {
        let n = self.heartbeats_responded.load(Ordering::Relaxed);
        if n == 0 {
            return None;
        }
        let total = self.response_latency_us_total.load(Ordering::Relaxed);
        Some(Duration::from_micros(total / n))
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "opens={} reconnects={} backoff_ms={} hb={}/{} hb_timeouts={} hb_failures={} transfers={}/{} terminated={}",
            self.opens.load(Ordering::Relaxed),
            self.reconnect_attempts.load(Ordering::Relaxed),
            self.total_backoff_ms.load(Ordering::Relaxed),
            self.heartbeats_responded.load(Ordering::Relaxed),
            self.heartbeats_received.load(Ordering::Relaxed),
            self.heartbeat_timeouts.load(Ordering::Relaxed),
            self.heartbeat_failures.load(Ordering::Relaxed),
            self.transfers.load(Ordering::Relaxed),
            self.transfers.load(Ordering::Relaxed) + self.transfer_aborts.load(Ordering::Relaxed),
            self.terminations.load(Ordering::Relaxed),
        )
    }
}

impl TelemetrySink for LinkMetrics {
    fn emit(&self, _connection: &ConnectionId, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::HeartbeatReceived { .. } => {
                self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::HeartbeatResponded { latency } => {
                self.heartbeats_responded.fetch_add(1, Ordering::Relaxed);
                self.response_latency_us_total
                    .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
            }
            TelemetryEvent::HeartbeatTimeout { .. } => {
                self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::HeartbeatFailure { .. } => {
                self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::StateChanged { to, .. } => {
                self.state_changes.fetch_add(1, Ordering::Relaxed);
                if *to == ConnectionStatus::Open {
                    self.opens.fetch_add(1, Ordering::Relaxed);
                }
            }
            TelemetryEvent::ReconnectAttempt { delay, .. } => {
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                self.total_backoff_ms
                    .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
            }
            TelemetryEvent::OwnershipTransferred { .. } => {
                self.transfers.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::OwnershipTransferAborted { .. } => {
                self.transfer_aborts.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::Terminated { .. } => {
                self.terminations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Forwards every event to each inner sink in order
#[derive(Clone, Default)]
pub struct Fanout {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for Fanout {
    fn emit(&self, connection: &ConnectionId, event: &TelemetryEvent) {
        for sink in &self.sinks {
            sink.emit(connection, event);
        }
    }
}

/// Default sink used when none is configured
pub fn default_sink() -> Arc<dyn TelemetrySink> {
    debug!("telemetry_default_tracing_sink");
    Arc::new(TracingTelemetry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = TelemetryEvent::ReconnectAttempt {
            attempt: 1,
            delay: Duration::from_secs(1),
        };
        assert_eq!(event.name(), "reconnect.attempt");
        let event = TelemetryEvent::OwnershipTransferAborted {
            reason: "ack timeout".into(),
        };
        assert_eq!(event.name(), "ownership.transfer_aborted");
    }

    #[test]
    fn test_metrics_counts_and_summary() {
        let metrics = LinkMetrics::new();
        let id = ConnectionId::new();

        metrics.emit(&id, &TelemetryEvent::HeartbeatReceived { profile: "p".into() });
        metrics.emit(
            &id,
            &TelemetryEvent::HeartbeatResponded {
                latency: Duration::from_micros(300),
            },
        );
        metrics.emit(
            &id,
            &TelemetryEvent::StateChanged {
                from: ConnectionStatus::Upgrading,
                to: ConnectionStatus::Open,
            },
        );
        metrics.emit(
            &id,
            &TelemetryEvent::ReconnectAttempt {
                attempt: 1,
                delay: Duration::from_millis(1100),
            },
        );

        assert_eq!(metrics.opens.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.mean_response_latency(), Some(Duration::from_micros(300)));
        let summary = metrics.summary();
        assert!(summary.contains("opens=1"));
        assert!(summary.contains("backoff_ms=1100"));
        assert!(summary.contains("hb=1/1"));
    }

    #[test]
    fn test_broadcast_and_fanout() {
        let broadcast = BroadcastTelemetry::new(16);
        let mut rx = broadcast.subscribe();
        let metrics = Arc::new(LinkMetrics::new());
        let fanout = Fanout::new()
            .with(Arc::new(broadcast.clone()))
            .with(metrics.clone());

        let id = ConnectionId::new();
        fanout.emit(&id, &TelemetryEvent::OwnershipTransferred { staged: 3 });

        let record = rx.try_recv().unwrap();
        assert_eq!(record.connection, id);
        assert_eq!(record.event, TelemetryEvent::OwnershipTransferred { staged: 3 });
        assert_eq!(metrics.transfers.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_record_serializes_as_json() {
        let id = ConnectionId::new();
        let record = TelemetryRecord {
            at: Utc::now(),
            connection: id,
            event: TelemetryEvent::StateChanged {
                from: ConnectionStatus::Reconnecting,
                to: ConnectionStatus::Connecting,
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["connection"], id.to_string());
        assert_eq!(value["event"]["event"], "state_changed");
        assert_eq!(value["event"]["to"], "CONNECTING");
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_sink_logs_transitions_at_debug() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let id = ConnectionId::new();
            TracingTelemetry.emit(
                &id,
                &TelemetryEvent::StateChanged {
                    from: ConnectionStatus::Open,
                    to: ConnectionStatus::Reconnecting,
                },
            );
            TracingTelemetry.emit(&id, &TelemetryEvent::Terminated { reason: "closed".into() });
        });

        // The machine already logs every transition at info
        let out = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(!out.contains("connection_state_changed"));
        assert!(out.contains("connection_terminated"));
    }
}
