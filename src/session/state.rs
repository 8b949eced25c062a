//! Connection state: status, identity and the per-instance counters

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::heartbeat::{HeartbeatConfig, HeartbeatManager};
use crate::reconnect::BackoffState;
use crate::telemetry::TelemetrySink;

/// Lifecycle status of a logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Created, no open requested yet
    Idle,
    /// Transport connect in progress
    Connecting,
    /// Protocol upgrade (and post-reconnect recovery) in progress
    Upgrading,
    /// Live; heartbeats answered, payload forwarded
    Open,
    /// Graceful close: pending sends complete, then Closed
    Draining,
    /// Waiting for the backoff timer
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether a transport handle may be attached in this status
    pub fn holds_transport(self) -> bool {
        matches!(self, Self::Upgrading | Self::Open | Self::Draining)
    }

    pub fn can_transition_to(self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, to) {
            (Failed, _) | (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting) => true,
            (Connecting, Upgrading) | (Connecting, Failed) | (Connecting, Reconnecting) => true,
            (Upgrading, Open) | (Upgrading, Failed) | (Upgrading, Reconnecting) => true,
            (Open, Draining) | (Open, Reconnecting) | (Open, Failed) => true,
            (Reconnecting, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Upgrading => write!(f, "UPGRADING"),
            Self::Open => write!(f, "OPEN"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Failed => write!(f, "FAILED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Reason for a status transition (for logging/metrics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    OpenRequested,
    ConnectSuccess,
    ConnectFailed,
    UpgradeAcknowledged,
    UpgradeRejected,
    RecoveryComplete,
    RecoveryFailed,
    ProtocolViolation,
    RemoteDisconnect,
    HeartbeatFailure,
    BackoffElapsed,
    AttemptsExhausted,
    CloseRequested,
    DrainComplete,
    DrainTimeout,
    ShutdownRequested,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenRequested => write!(f, "open_requested"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::UpgradeAcknowledged => write!(f, "upgrade_ok"),
            Self::UpgradeRejected => write!(f, "upgrade_rejected"),
            Self::RecoveryComplete => write!(f, "recovery_ok"),
            Self::RecoveryFailed => write!(f, "recovery_failed"),
            Self::ProtocolViolation => write!(f, "protocol_violation"),
            Self::RemoteDisconnect => write!(f, "remote_disconnect"),
            Self::HeartbeatFailure => write!(f, "heartbeat_failure"),
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::CloseRequested => write!(f, "close_requested"),
            Self::DrainComplete => write!(f, "drain_complete"),
            Self::DrainTimeout => write!(f, "drain_timeout"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

/// Opaque connection identifier, stable across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authoritative state of one logical connection. Owned and mutated only by
/// the state machine on its coordinating task.
#[derive(Debug)]
pub struct ConnectionState {
    pub(crate) id: ConnectionId,
    pub(crate) status: ConnectionStatus,
    /// Bumped for every successor instance; work tagged with an older
    /// generation is discarded
    pub(crate) generation: u64,
    pub(crate) heartbeat: HeartbeatManager,
    pub(crate) last_activity_at: Option<Instant>,
    pub(crate) reconnect_attempt: u32,
    pub(crate) backoff: BackoffState,
}

impl ConnectionState {
    pub fn new(
        heartbeat: HeartbeatConfig,
        telemetry: Arc<dyn TelemetrySink>,
        jitter_seed: Option<u64>,
    ) -> Self {
        let id = ConnectionId::new();
        Self {
            id,
            status: ConnectionStatus::Idle,
            generation: 0,
            heartbeat: HeartbeatManager::new(heartbeat, id, telemetry),
            last_activity_at: None,
            reconnect_attempt: 0,
            backoff: BackoffState::new(jitter_seed),
        }
    }

    /// Instance that replaces this one on the reconnect path. Keeps identity,
    /// heartbeat profile, attempt count and backoff; resets transient counters.
    pub fn successor(&self) -> Self {
        Self {
            id: self.id,
            status: self.status,
            generation: self.generation + 1,
            heartbeat: self.heartbeat.successor(),
            last_activity_at: None,
            reconnect_attempt: self.reconnect_attempt,
            backoff: self.backoff.clone(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn heartbeat(&self) -> &HeartbeatManager {
        &self.heartbeat
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.heartbeat.consecutive_failures()
    }

    pub fn last_activity_at(&self) -> Option<Instant> {
        self.last_activity_at
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        let window = self.heartbeat.window();
        ConnectionSnapshot {
            id: self.id,
            status: self.status,
            generation: self.generation,
            profile: self.heartbeat.config().profile_name().to_string(),
            consecutive_failures: self.heartbeat.consecutive_failures(),
            failure_threshold: self.heartbeat.config().failure_threshold(),
            pending_heartbeats: self.heartbeat.pending_count(),
            window_len: window.len(),
            success_ratio: window.success_ratio(),
            mean_latency: window.mean_latency(),
            p99_latency: window.percentile(99.0),
            idle_for: self
                .last_activity_at
                .map(|at| now.saturating_duration_since(at)),
            reconnect_attempt: self.reconnect_attempt,
            current_backoff: self.backoff.current_delay,
        }
    }
}

/// Point-in-time copy of a connection's state for callers and transfer offers
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub status: ConnectionStatus,
    pub generation: u64,
    pub profile: String,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub pending_heartbeats: usize,
    pub window_len: usize,
    pub success_ratio: Option<f64>,
    pub mean_latency: Option<Duration>,
    pub p99_latency: Option<Duration>,
    /// Time since the last inbound frame
    pub idle_for: Option<Duration>,
    pub reconnect_attempt: u32,
    pub current_backoff: Duration,
}
