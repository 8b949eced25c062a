//! Heartbeat manager
//!
//! Classifies inbound frames, builds replies for liveness probes and keeps the
//! failure accounting. Sending is left to the coordinating task: a probe that
//! needs a reply comes back as a [`ResponseDispatch`] with its own id and
//! deadline, and is later settled with the send outcome or expired by the
//! deadline sweep. Whichever happens first counts, exactly once.
//!
//! Reaching the failure threshold is reported as `forced_disconnect` on the
//! verdict. The manager never touches the transport.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::profile::{Detection, HeartbeatConfig, HeartbeatReply};
use super::window::{ResponseSample, ResponseWindow};
use crate::error::{TransportError, TransportErrorKind};
use crate::frame::Frame;
use crate::session::ConnectionId;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::transport::FrameWriter;

/// Classification of an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Heartbeat(HeartbeatStatus),
    /// Payload for the application handler
    Application(Frame),
    /// Control frame that is neither a probe nor payload
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatStatus {
    /// Settled on receipt (no reply needed, or reply declined)
    Answered(HeartbeatVerdict),
    /// Reply must be written before `deadline`
    Pending(ResponseDispatch),
}

/// Settled outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatVerdict {
    pub responded: bool,
    pub latency: Duration,
    /// Failure threshold reached; the connection must leave Open
    pub forced_disconnect: bool,
}

/// Reply frame to write for a probe
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDispatch {
    pub id: u64,
    pub frame: Frame,
    pub detected_at: Instant,
    pub deadline: Instant,
}

/// Result of writing a heartbeat reply
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent,
    Failed(TransportError),
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy)]
struct PendingProbe {
    detected_at: Instant,
    deadline: Instant,
}

pub struct HeartbeatManager {
    config: HeartbeatConfig,
    connection: ConnectionId,
    telemetry: Arc<dyn TelemetrySink>,
    consecutive_failures: u32,
    window: ResponseWindow,
    pending: BTreeMap<u64, PendingProbe>,
    next_id: u64,
}

impl HeartbeatManager {
    pub fn new(
        config: HeartbeatConfig,
        connection: ConnectionId,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            connection,
            telemetry,
            consecutive_failures: 0,
            window: ResponseWindow::new(),
            pending: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Fresh manager for a successor connection: same profile, clean counters
    pub fn successor(&self) -> Self {
        Self::new(self.config.clone(), self.connection, self.telemetry.clone())
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn window(&self) -> &ResponseWindow {
        &self.window
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest deadline among in-flight replies
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Classify one inbound frame (hot path)
    pub fn observe(&mut self, frame: Frame, now: Instant) -> Observation {
        let token = match self.config.detect(&frame) {
            Detection::Heartbeat(token) => token,
            Detection::NotHeartbeat => {
                return match frame {
                    Frame::Text(_) | Frame::Binary(_) => Observation::Application(frame),
                    Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) => Observation::Ignored,
                };
            }
        };

        self.telemetry.emit(
            &self.connection,
            &TelemetryEvent::HeartbeatReceived {
                profile: self.config.profile_name().to_string(),
            },
        );

        let status = match self.config.respond(&token) {
            HeartbeatReply::Send(reply) => {
                let id = self.next_id;
                self.next_id += 1;
                let deadline = now + self.config.timeout();
                self.pending.insert(
                    id,
                    PendingProbe {
                        detected_at: now,
                        deadline,
                    },
                );
                HeartbeatStatus::Pending(ResponseDispatch {
                    id,
                    frame: reply,
                    detected_at: now,
                    deadline,
                })
            }
            HeartbeatReply::NoResponse => HeartbeatStatus::Answered(self.record_success(Duration::ZERO)),
            HeartbeatReply::Decline(reason) => {
                HeartbeatStatus::Answered(self.record_failure(Duration::ZERO, &reason))
            }
        };
        Observation::Heartbeat(status)
    }

    /// Record the send outcome of a dispatched reply. `None` if the probe was
    /// already expired or belongs to a cancelled batch.
    pub fn settle(
        &mut self,
        id: u64,
        outcome: SendOutcome,
        completed_at: Instant,
    ) -> Option<HeartbeatVerdict> {
        let probe = self.pending.remove(&id)?;
        let latency = completed_at.saturating_duration_since(probe.detected_at);
        let verdict = match outcome {
            SendOutcome::Sent if completed_at < probe.deadline => self.record_success(latency),
            SendOutcome::Sent | SendOutcome::DeadlineExceeded => self.record_timeout(),
            SendOutcome::Failed(err) if err.kind == TransportErrorKind::SendTimeout => self.record_timeout(),
            SendOutcome::Failed(err) => self.record_failure(latency, &err.to_string()),
        };
        Some(verdict)
    }

    /// Expire every reply whose deadline has passed, earliest first
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<HeartbeatVerdict> {
        let mut overdue: Vec<(u64, Instant)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| (*id, p.deadline))
            .collect();
        overdue.sort_by_key(|(id, deadline)| (*deadline, *id));

        overdue
            .into_iter()
            .map(|(id, _)| {
                self.pending.remove(&id);
                self.record_timeout()
            })
            .collect()
    }

    /// Drop all in-flight replies without counting them. Returns how many were dropped.
    pub fn cancel_pending(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    fn record_success(&mut self, latency: Duration) -> HeartbeatVerdict {
        self.consecutive_failures = 0;
        self.window.record(ResponseSample {
            latency,
            responded: true,
        });
        self.telemetry
            .emit(&self.connection, &TelemetryEvent::HeartbeatResponded { latency });
        HeartbeatVerdict {
            responded: true,
            latency,
            forced_disconnect: false,
        }
    }

    fn record_timeout(&mut self) -> HeartbeatVerdict {
        let timeout = self.config.timeout();
        self.telemetry
            .emit(&self.connection, &TelemetryEvent::HeartbeatTimeout { timeout });
        self.record_failure(timeout, "deadline exceeded")
    }

    fn record_failure(&mut self, latency: Duration, reason: &str) -> HeartbeatVerdict {
        let threshold = self.config.failure_threshold();
        self.consecutive_failures = (self.consecutive_failures + 1).min(threshold);
        self.window.record(ResponseSample {
            latency,
            responded: false,
        });
        self.telemetry.emit(
            &self.connection,
            &TelemetryEvent::HeartbeatFailure {
                consecutive: self.consecutive_failures,
                threshold,
                reason: reason.to_string(),
            },
        );
        HeartbeatVerdict {
            responded: false,
            latency,
            forced_disconnect: self.consecutive_failures >= threshold,
        }
    }
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("config", &self.config)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("window_len", &self.window.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Write a heartbeat reply before its deadline. A failed write is retried once
/// immediately; the whole attempt is bounded by the deadline.
pub async fn deliver(
    writer: Arc<dyn FrameWriter>,
    dispatch: ResponseDispatch,
) -> (u64, SendOutcome, Instant) {
    let ResponseDispatch {
        id, frame, deadline, ..
    } = dispatch;

    let attempt = async {
        match writer.send(frame.clone(), deadline).await {
            Ok(()) => SendOutcome::Sent,
            Err(err) if err.kind == TransportErrorKind::SendTimeout => SendOutcome::DeadlineExceeded,
            Err(err) => {
                debug!(id, error = %err, "heartbeat_send_retry");
                match writer.send(frame, deadline).await {
                    Ok(()) => SendOutcome::Sent,
                    Err(err) if err.kind == TransportErrorKind::SendTimeout => {
                        SendOutcome::DeadlineExceeded
                    }
                    Err(err) => SendOutcome::Failed(err),
                }
            }
        }
    };

    let outcome = timeout_at(deadline, attempt)
        .await
        .unwrap_or(SendOutcome::DeadlineExceeded);
    (id, outcome, Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::profiles::{ControlPingProfile, ReceiptOnlyProfile};
    use crate::heartbeat::HeartbeatProfile;
    use crate::telemetry::NullTelemetry;
    use crate::transport::{MemoryTransport, OpenOptions, SendMode, TransportChannel, UpgradeRequest};

    fn manager_with(profile: Arc<dyn HeartbeatProfile>, timeout_ms: u64, threshold: u32) -> HeartbeatManager {
        HeartbeatManager::new(
            HeartbeatConfig::new(profile, Duration::from_millis(timeout_ms), threshold),
            ConnectionId::new(),
            Arc::new(NullTelemetry),
        )
    }

    fn manager(timeout_ms: u64, threshold: u32) -> HeartbeatManager {
        manager_with(Arc::new(ControlPingProfile), timeout_ms, threshold)
    }

    fn dispatch_of(obs: Observation) -> ResponseDispatch {
        match obs {
            Observation::Heartbeat(HeartbeatStatus::Pending(d)) => d,
            other => panic!("expected pending reply, got {:?}", other),
        }
    }

    #[test]
    fn test_application_frames_leave_counters_alone() {
        let mut hb = manager(3000, 3);
        let now = Instant::now();
        for i in 0..50 {
            let obs = hb.observe(Frame::text(format!("trade {}", i)), now);
            assert!(matches!(obs, Observation::Application(_)));
        }
        assert_eq!(hb.observe(Frame::Pong(vec![]), now), Observation::Ignored);
        assert_eq!(hb.consecutive_failures(), 0);
        assert!(hb.window().is_empty());
        assert_eq!(hb.pending_count(), 0);
    }

    #[test]
    fn test_probe_dispatch_and_settle() {
        let mut hb = manager(3000, 3);
        let now = Instant::now();
        let dispatch = dispatch_of(hb.observe(Frame::Ping(vec![9]), now));
        assert_eq!(dispatch.frame, Frame::Pong(vec![9]));
        assert_eq!(dispatch.deadline, now + Duration::from_millis(3000));
        assert_eq!(hb.next_deadline(), Some(dispatch.deadline));

        let verdict = hb
            .settle(dispatch.id, SendOutcome::Sent, now + Duration::from_millis(2))
            .unwrap();
        assert!(verdict.responded);
        assert_eq!(verdict.latency, Duration::from_millis(2));
        assert_eq!(hb.pending_count(), 0);

        // Settling twice is a no-op
        assert!(hb.settle(dispatch.id, SendOutcome::Sent, now).is_none());
        assert_eq!(hb.window().len(), 1);
    }

    #[test]
    fn test_three_misses_force_disconnect() {
        let mut hb = manager(3000, 3);
        let mut now = Instant::now();
        let mut last = None;
        for _ in 0..3 {
            hb.observe(Frame::Ping(vec![]), now);
            now += Duration::from_millis(3000);
            let verdicts = hb.expire_overdue(now);
            assert_eq!(verdicts.len(), 1);
            last = verdicts.into_iter().next();
        }
        let last = last.unwrap();
        assert!(!last.responded);
        assert!(last.forced_disconnect);
        assert_eq!(hb.consecutive_failures(), 3);

        // Saturates at the threshold
        hb.observe(Frame::Ping(vec![]), now);
        hb.expire_overdue(now + Duration::from_secs(4));
        assert_eq!(hb.consecutive_failures(), 3);
    }

    #[test]
    fn test_success_after_two_failures_resets() {
        let mut hb = manager(3000, 3);
        let now = Instant::now();
        let a = dispatch_of(hb.observe(Frame::Ping(vec![1]), now));
        let b = dispatch_of(hb.observe(Frame::Ping(vec![2]), now));
        let c = dispatch_of(hb.observe(Frame::Ping(vec![3]), now));

        let err = TransportError::send("broken pipe");
        assert!(!hb.settle(a.id, SendOutcome::Failed(err.clone()), now).unwrap().forced_disconnect);
        assert!(!hb.settle(b.id, SendOutcome::Failed(err), now).unwrap().forced_disconnect);
        assert_eq!(hb.consecutive_failures(), 2);

        let verdict = hb.settle(c.id, SendOutcome::Sent, now + Duration::from_millis(1)).unwrap();
        assert!(verdict.responded);
        assert_eq!(hb.consecutive_failures(), 0);
        assert_eq!(hb.window().success_ratio(), Some(1.0 / 3.0));
    }

    #[test]
    fn test_late_send_counts_as_timeout() {
        let mut hb = manager(100, 3);
        let now = Instant::now();
        let d = dispatch_of(hb.observe(Frame::Ping(vec![]), now));
        let verdict = hb.settle(d.id, SendOutcome::Sent, d.deadline).unwrap();
        assert!(!verdict.responded);
        assert_eq!(verdict.latency, Duration::from_millis(100));
    }

    #[test]
    fn test_overlapping_probes_tracked_independently() {
        let mut hb = manager(1000, 5);
        let t0 = Instant::now();
        let first = dispatch_of(hb.observe(Frame::Ping(vec![1]), t0));
        let second = dispatch_of(hb.observe(Frame::Ping(vec![2]), t0 + Duration::from_millis(600)));
        assert_ne!(first.id, second.id);

        // Only the first has expired at t0+1000ms
        let expired = hb.expire_overdue(t0 + Duration::from_millis(1000));
        assert_eq!(expired.len(), 1);
        assert_eq!(hb.pending_count(), 1);
        assert!(hb
            .settle(second.id, SendOutcome::Sent, t0 + Duration::from_millis(700))
            .unwrap()
            .responded);
    }

    #[test]
    fn test_receipt_only_counts_as_immediate_success() {
        let mut hb = manager_with(Arc::new(ReceiptOnlyProfile::new("channel", "heartbeat")), 3000, 3);
        let obs = hb.observe(Frame::text(r#"{"channel":"heartbeat"}"#), Instant::now());
        match obs {
            Observation::Heartbeat(HeartbeatStatus::Answered(v)) => {
                assert!(v.responded);
                assert_eq!(v.latency, Duration::ZERO);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hb.pending_count(), 0);
    }

    #[test]
    fn test_quiet_gap_records_nothing() {
        let mut hb = manager(3000, 3);
        let now = Instant::now();
        assert!(hb.expire_overdue(now + Duration::from_millis(5000)).is_empty());
        assert_eq!(hb.consecutive_failures(), 0);
        assert!(hb.window().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_retries_once_then_fails() {
        let transport = MemoryTransport::new();
        let mut handle = transport.open("mem://hb", &OpenOptions::default()).await.unwrap();
        handle.upgrade(&UpgradeRequest::default()).await.unwrap();
        let remote = transport.remote(0).unwrap();
        let writer = handle.writer().unwrap();

        let now = Instant::now();
        let dispatch = ResponseDispatch {
            id: 7,
            frame: Frame::Pong(vec![]),
            detected_at: now,
            deadline: now + Duration::from_millis(500),
        };

        remote.set_send_mode(SendMode::FailNext(1));
        let (id, outcome, _) = deliver(writer.clone(), dispatch.clone()).await;
        assert_eq!(id, 7);
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(remote.send_attempts(), 2);

        remote.set_send_mode(SendMode::FailAll);
        let (_, outcome, _) = deliver(writer.clone(), dispatch.clone()).await;
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        assert_eq!(remote.send_attempts(), 4);

        remote.set_send_mode(SendMode::Stall);
        let (_, outcome, completed_at) = deliver(writer, dispatch.clone()).await;
        assert_eq!(outcome, SendOutcome::DeadlineExceeded);
        assert!(completed_at >= dispatch.deadline);
    }
}
