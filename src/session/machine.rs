//! Connection state machine
//!
//! Pure step function over [`ConnectionState`]: `handle(event, now)` validates
//! the transition, mutates the state and returns the effects the coordinating
//! task must carry out. No I/O happens here; telemetry is fire-and-forget.

use std::fmt;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::state::{ConnectionSnapshot, ConnectionState, ConnectionStatus, TransitionReason};
use crate::error::{
    LinkError, LinkResult, ProtocolViolation, RecoveryError, TransportError, UpgradeError,
};
use crate::frame::Frame;
use crate::heartbeat::{
    HeartbeatConfig, HeartbeatStatus, HeartbeatVerdict, Observation, ResponseDispatch, SendOutcome,
};
use crate::reconnect::ReconnectionPolicy;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::transport::{DisconnectReason, UpgradeAck};

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    OpenRequested,
    /// Transport connect succeeded; a handle is attached
    TransportConnected,
    ConnectFailed(TransportError),
    Upgraded(UpgradeAck),
    UpgradeFailed(UpgradeError),
    RecoveryFinished(Result<(), RecoveryError>),
    Frame(Frame),
    HeartbeatSettled {
        id: u64,
        outcome: SendOutcome,
        completed_at: Instant,
    },
    /// Earliest heartbeat deadline reached
    HeartbeatDeadline,
    /// Read-side error; a disconnect follows
    TransportError(TransportError),
    Violation(ProtocolViolation),
    Disconnected(DisconnectReason),
    BackoffElapsed,
    CloseRequested,
    /// All pending application sends completed
    Drained,
    DrainTimedOut,
    ShutdownRequested,
}

/// Work for the coordinating task
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the transport
    Connect,
    /// Upgrade the attached handle
    Upgrade,
    /// Run re-authentication and re-subscription
    Recover,
    /// Write a heartbeat reply before its deadline
    Respond(ResponseDispatch),
    /// Abort in-flight heartbeat reply writes
    CancelHeartbeats,
    /// Hand a payload frame to the application
    Deliver(Frame),
    ScheduleReconnect { attempt: u32, delay: Duration },
    /// Wait for pending application sends, bounded by the drain timeout
    Drain,
    /// Close and drop the transport handle
    ReleaseTransport,
    StateChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Connection reached a terminal status; the coordinating task exits
    Terminate(Termination),
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Failed(LinkError),
    ReconnectExhausted { attempts: u32 },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Failed(err) => write!(f, "failed: {}", err),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "reconnect exhausted after {} attempts", attempts)
            }
        }
    }
}

/// Sole mutator of a [`ConnectionState`]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectionPolicy,
    /// Run recovery hooks on the initial open as well
    recover_on_open: bool,
    /// Upgrade acknowledged, recovery in flight
    recovering: bool,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ConnectionStateMachine {
    pub fn new(
        heartbeat: HeartbeatConfig,
        policy: ReconnectionPolicy,
        recover_on_open: bool,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let seed = policy.config().seed;
        Self {
            state: ConnectionState::new(heartbeat, telemetry.clone(), seed),
            policy,
            recover_on_open,
            recovering: false,
            telemetry,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    pub fn telemetry(&self) -> &Arc<dyn TelemetrySink> {
        &self.telemetry
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionSnapshot {
        self.state.snapshot(now)
    }

    /// Earliest in-flight heartbeat deadline while a transport is attached
    pub fn next_heartbeat_deadline(&self) -> Option<Instant> {
        if self.state.status.holds_transport() {
            self.state.heartbeat.next_deadline()
        } else {
            None
        }
    }

    /// Whether application sends are accepted
    pub fn accepts_sends(&self) -> bool {
        matches!(self.state.status, ConnectionStatus::Open)
            || (self.state.status == ConnectionStatus::Upgrading && self.recovering)
    }

    /// Apply one event. Errors are returned only for requests that are not
    /// valid in the current status; stale transport events are ignored.
    pub fn handle(&mut self, event: LinkEvent, now: Instant) -> LinkResult<Vec<Effect>> {
        use ConnectionStatus::*;

        let mut fx = Vec::new();
        let status = self.state.status;

        match event {
            LinkEvent::OpenRequested => match status {
                Idle => {
                    self.transition(Connecting, TransitionReason::OpenRequested, &mut fx);
                    fx.push(Effect::Connect);
                }
                s if s.is_terminal() => return Err(LinkError::Terminal(s)),
                s => {
                    return Err(LinkError::InvalidTransition {
                        from: s,
                        to: Connecting,
                    })
                }
            },

            LinkEvent::TransportConnected => {
                if status == Connecting {
                    self.transition(Upgrading, TransitionReason::ConnectSuccess, &mut fx);
                    fx.push(Effect::Upgrade);
                }
            }

            LinkEvent::ConnectFailed(err) => {
                if status == Connecting {
                    self.connect_failure(TransitionReason::ConnectFailed, err.into(), &mut fx);
                }
            }

            LinkEvent::Upgraded(ack) => {
                if status == Upgrading && !self.recovering {
                    debug!(status = ack.status, protocol = ?ack.protocol, "upgrade_acknowledged");
                    if self.state.reconnect_attempt > 0 || self.recover_on_open {
                        self.recovering = true;
                        fx.push(Effect::Recover);
                    } else {
                        self.enter_open(TransitionReason::UpgradeAcknowledged, &mut fx);
                    }
                }
            }

            LinkEvent::UpgradeFailed(err) => {
                if status == Upgrading && !self.recovering {
                    match err {
                        UpgradeError::Rejected(e) => {
                            self.connect_failure(TransitionReason::UpgradeRejected, e.into(), &mut fx)
                        }
                        UpgradeError::Malformed(v) => self.fail(TransitionReason::ProtocolViolation, v.into(), &mut fx),
                    }
                }
            }

            LinkEvent::RecoveryFinished(result) => {
                if status == Upgrading && self.recovering {
                    match result {
                        Ok(()) => self.enter_open(TransitionReason::RecoveryComplete, &mut fx),
                        Err(e) => self.connect_failure(TransitionReason::RecoveryFailed, e.into(), &mut fx),
                    }
                }
            }

            LinkEvent::Frame(frame) => {
                if status.holds_transport() {
                    self.state.last_activity_at = Some(now);
                    match self.state.heartbeat.observe(frame, now) {
                        Observation::Application(frame) => fx.push(Effect::Deliver(frame)),
                        Observation::Heartbeat(HeartbeatStatus::Pending(dispatch)) => {
                            fx.push(Effect::Respond(dispatch))
                        }
                        Observation::Heartbeat(HeartbeatStatus::Answered(verdict)) => {
                            self.apply_verdict(verdict, &mut fx)
                        }
                        Observation::Ignored => {}
                    }
                }
            }

            LinkEvent::HeartbeatSettled {
                id,
                outcome,
                completed_at,
            } => {
                if status.holds_transport() {
                    if let Some(verdict) = self.state.heartbeat.settle(id, outcome, completed_at) {
                        self.apply_verdict(verdict, &mut fx);
                    }
                }
            }

            LinkEvent::HeartbeatDeadline => {
                if status.holds_transport() {
                    for verdict in self.state.heartbeat.expire_overdue(now) {
                        self.apply_verdict(verdict, &mut fx);
                        if !self.state.status.holds_transport() {
                            break;
                        }
                    }
                }
            }

            LinkEvent::TransportError(err) => {
                if status.holds_transport() {
                    warn!(connection = %self.state.id, error = %err, "transport_error");
                }
            }

            LinkEvent::Violation(violation) => match status {
                Upgrading | Open => self.fail(TransitionReason::ProtocolViolation, violation.into(), &mut fx),
                Draining => {
                    warn!(connection = %self.state.id, violation = %violation, "violation_while_draining");
                    self.close(TransitionReason::ProtocolViolation, &mut fx);
                }
                _ => {}
            },

            LinkEvent::Disconnected(reason) => match status {
                Open => {
                    info!(connection = %self.state.id, reason = %reason, "transport_disconnected");
                    self.connection_lost(TransitionReason::RemoteDisconnect, &mut fx);
                }
                Upgrading => {
                    let err = TransportError::connect(format!("disconnected during upgrade: {}", reason));
                    self.connect_failure(TransitionReason::RemoteDisconnect, err.into(), &mut fx);
                }
                Draining => self.close(TransitionReason::RemoteDisconnect, &mut fx),
                _ => {}
            },

            LinkEvent::BackoffElapsed => {
                if status == Reconnecting {
                    self.transition(Connecting, TransitionReason::BackoffElapsed, &mut fx);
                    fx.push(Effect::Connect);
                }
            }

            LinkEvent::CloseRequested => match status {
                Open => {
                    self.transition(Draining, TransitionReason::CloseRequested, &mut fx);
                    fx.push(Effect::Drain);
                }
                Draining => {}
                s if s.is_terminal() => return Err(LinkError::Terminal(s)),
                _ => self.close(TransitionReason::CloseRequested, &mut fx),
            },

            LinkEvent::Drained => {
                if status == Draining {
                    self.close(TransitionReason::DrainComplete, &mut fx);
                }
            }

            LinkEvent::DrainTimedOut => {
                if status == Draining {
                    self.close(TransitionReason::DrainTimeout, &mut fx);
                }
            }

            LinkEvent::ShutdownRequested => {
                if !status.is_terminal() {
                    self.close(TransitionReason::ShutdownRequested, &mut fx);
                }
            }
        }

        Ok(fx)
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    fn transition(&mut self, to: ConnectionStatus, reason: TransitionReason, fx: &mut Vec<Effect>) {
        let from = self.state.status;
        debug_assert!(from.can_transition_to(to), "{} -> {}", from, to);
        self.state.status = to;

        info!(
            connection = %self.state.id,
            from = %from,
            to = %to,
            reason = %reason,
            attempt = self.state.reconnect_attempt,
            "session_transition"
        );
        self.telemetry
            .emit(&self.state.id, &TelemetryEvent::StateChanged { from, to });
        fx.push(Effect::StateChanged { from, to });
    }

    fn enter_open(&mut self, reason: TransitionReason, fx: &mut Vec<Effect>) {
        self.recovering = false;
        self.state.reconnect_attempt = 0;
        self.state.backoff.reset();
        self.transition(ConnectionStatus::Open, reason, fx);
    }

    fn apply_verdict(&mut self, verdict: HeartbeatVerdict, fx: &mut Vec<Effect>) {
        if !verdict.forced_disconnect {
            return;
        }
        match self.state.status {
            ConnectionStatus::Open => self.connection_lost(TransitionReason::HeartbeatFailure, fx),
            ConnectionStatus::Upgrading => {
                let err = TransportError::connect("heartbeat failure threshold reached during recovery");
                self.connect_failure(TransitionReason::HeartbeatFailure, err.into(), fx);
            }
            // Already closing
            _ => {}
        }
    }

    /// Open connection lost: reconnect, or fail when reconnection is disabled
    fn connection_lost(&mut self, reason: TransitionReason, fx: &mut Vec<Effect>) {
        if self.policy.enabled() {
            self.begin_reconnect(reason, fx);
        } else {
            let err = TransportError::closed();
            self.fail(reason, err.into(), fx);
        }
    }

    /// Connect, upgrade or recovery failed. The initial attempt and a
    /// link with reconnection disabled fail permanently.
    fn connect_failure(&mut self, reason: TransitionReason, err: LinkError, fx: &mut Vec<Effect>) {
        warn!(connection = %self.state.id, error = %err, reason = %reason, "connect_attempt_failed");
        if self.state.reconnect_attempt == 0 || !self.policy.enabled() {
            self.fail(reason, err, fx);
        } else {
            self.begin_reconnect(reason, fx);
        }
    }

    fn begin_reconnect(&mut self, reason: TransitionReason, fx: &mut Vec<Effect>) {
        fx.push(Effect::CancelHeartbeats);
        fx.push(Effect::ReleaseTransport);
        self.recovering = false;
        self.transition(ConnectionStatus::Reconnecting, reason, fx);

        // Successor instance; work of the previous generation is stale from here on
        self.state = self.state.successor();

        let attempt = self.state.reconnect_attempt + 1;
        self.state.reconnect_attempt = attempt;

        if !self.policy.allows(attempt) {
            let attempts = attempt - 1;
            self.transition(ConnectionStatus::Closed, TransitionReason::AttemptsExhausted, fx);
            self.terminate(Termination::ReconnectExhausted { attempts }, fx);
            return;
        }

        let delay = self.policy.next_delay(attempt - 1, &mut self.state.backoff);
        self.telemetry.emit(
            &self.state.id,
            &TelemetryEvent::ReconnectAttempt { attempt, delay },
        );
        fx.push(Effect::ScheduleReconnect { attempt, delay });
    }

    fn fail(&mut self, reason: TransitionReason, err: LinkError, fx: &mut Vec<Effect>) {
        fx.push(Effect::CancelHeartbeats);
        fx.push(Effect::ReleaseTransport);
        self.recovering = false;
        self.transition(ConnectionStatus::Failed, reason, fx);
        self.terminate(Termination::Failed(err), fx);
    }

    fn close(&mut self, reason: TransitionReason, fx: &mut Vec<Effect>) {
        fx.push(Effect::CancelHeartbeats);
        fx.push(Effect::ReleaseTransport);
        self.recovering = false;
        self.transition(ConnectionStatus::Closed, reason, fx);
        self.terminate(Termination::Closed, fx);
    }

    fn terminate(&mut self, termination: Termination, fx: &mut Vec<Effect>) {
        self.state.heartbeat.cancel_pending();
        self.telemetry.emit(
            &self.state.id,
            &TelemetryEvent::Terminated {
                reason: termination.to_string(),
            },
        );
        fx.push(Effect::Terminate(termination));
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("policy", &self.policy)
            .field("recover_on_open", &self.recover_on_open)
            .field("recovering", &self.recovering)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::{ControlPingProfile, ReceiptOnlyProfile};
    use crate::reconnect::BackoffConfig;
    use crate::telemetry::NullTelemetry;

    fn machine_with(backoff: BackoffConfig, recover_on_open: bool) -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            HeartbeatConfig::new(Arc::new(ControlPingProfile), Duration::from_millis(3000), 3),
            ReconnectionPolicy::new(backoff),
            recover_on_open,
            Arc::new(NullTelemetry),
        )
    }

    fn machine() -> ConnectionStateMachine {
        machine_with(
            BackoffConfig {
                seed: Some(1),
                ..BackoffConfig::default()
            },
            false,
        )
    }

    fn open(m: &mut ConnectionStateMachine, now: Instant) {
        m.handle(LinkEvent::OpenRequested, now).unwrap();
        m.handle(LinkEvent::TransportConnected, now).unwrap();
        m.handle(LinkEvent::Upgraded(UpgradeAck::switching_protocols()), now)
            .unwrap();
        assert_eq!(m.status(), ConnectionStatus::Open);
    }

    fn scheduled(fx: &[Effect]) -> Option<(u32, Duration)> {
        fx.iter().find_map(|e| match e {
            Effect::ScheduleReconnect { attempt, delay } => Some((*attempt, *delay)),
            _ => None,
        })
    }

    fn terminated(fx: &[Effect]) -> Option<&Termination> {
        fx.iter().find_map(|e| match e {
            Effect::Terminate(t) => Some(t),
            _ => None,
        })
    }

    #[test]
    fn test_happy_path_effects() {
        let mut m = machine();
        let now = Instant::now();

        let fx = m.handle(LinkEvent::OpenRequested, now).unwrap();
        assert_eq!(
            fx,
            vec![
                Effect::StateChanged {
                    from: ConnectionStatus::Idle,
                    to: ConnectionStatus::Connecting
                },
                Effect::Connect
            ]
        );

        let fx = m.handle(LinkEvent::TransportConnected, now).unwrap();
        assert!(fx.contains(&Effect::Upgrade));
        assert_eq!(m.status(), ConnectionStatus::Upgrading);

        let fx = m
            .handle(LinkEvent::Upgraded(UpgradeAck::switching_protocols()), now)
            .unwrap();
        assert!(fx.contains(&Effect::StateChanged {
            from: ConnectionStatus::Upgrading,
            to: ConnectionStatus::Open
        }));
    }

    #[test]
    fn test_open_twice_is_rejected() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        assert!(matches!(
            m.handle(LinkEvent::OpenRequested, now),
            Err(LinkError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_initial_connect_failure_is_terminal() {
        let mut m = machine();
        let now = Instant::now();
        m.handle(LinkEvent::OpenRequested, now).unwrap();
        let fx = m
            .handle(LinkEvent::ConnectFailed(TransportError::connect("refused")), now)
            .unwrap();
        assert_eq!(m.status(), ConnectionStatus::Failed);
        assert!(matches!(terminated(&fx), Some(Termination::Failed(LinkError::Transport(_)))));
        assert!(matches!(
            m.handle(LinkEvent::OpenRequested, now),
            Err(LinkError::Terminal(ConnectionStatus::Failed))
        ));
    }

    #[test]
    fn test_malformed_upgrade_fails_without_retry() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        m.handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();
        m.handle(LinkEvent::BackoffElapsed, now).unwrap();
        m.handle(LinkEvent::TransportConnected, now).unwrap();

        let violation = ProtocolViolation::MalformedUpgrade("bad accept key".into());
        let fx = m
            .handle(LinkEvent::UpgradeFailed(UpgradeError::Malformed(violation)), now)
            .unwrap();
        assert_eq!(m.status(), ConnectionStatus::Failed);
        assert!(matches!(terminated(&fx), Some(Termination::Failed(LinkError::Protocol(_)))));
    }

    #[test]
    fn test_disconnect_schedules_first_backoff() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        let generation = m.generation();

        let fx = m
            .handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);
        assert_eq!(m.state().reconnect_attempt(), 1);
        assert_eq!(m.generation(), generation + 1);
        assert!(fx.contains(&Effect::ReleaseTransport));

        let (attempt, delay) = scheduled(&fx).unwrap();
        assert_eq!(attempt, 1);
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_attempts_grow_until_open_then_reset() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        m.handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();

        for expected in 2..=4u32 {
            m.handle(LinkEvent::BackoffElapsed, now).unwrap();
            assert_eq!(m.status(), ConnectionStatus::Connecting);
            let fx = m
                .handle(LinkEvent::ConnectFailed(TransportError::connect("refused")), now)
                .unwrap();
            assert_eq!(m.status(), ConnectionStatus::Reconnecting);
            assert_eq!(scheduled(&fx).unwrap().0, expected);
            assert_eq!(m.state().reconnect_attempt(), expected);
        }

        // Reconnect path runs recovery before Open
        m.handle(LinkEvent::BackoffElapsed, now).unwrap();
        m.handle(LinkEvent::TransportConnected, now).unwrap();
        let fx = m
            .handle(LinkEvent::Upgraded(UpgradeAck::switching_protocols()), now)
            .unwrap();
        assert_eq!(fx, vec![Effect::Recover]);
        assert_eq!(m.status(), ConnectionStatus::Upgrading);
        assert!(m.accepts_sends());

        m.handle(LinkEvent::RecoveryFinished(Ok(())), now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Open);
        assert_eq!(m.state().reconnect_attempt(), 0);
        assert_eq!(m.state().backoff().current_delay, Duration::ZERO);
    }

    #[test]
    fn test_recovery_failure_reenters_backoff() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        m.handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();
        m.handle(LinkEvent::BackoffElapsed, now).unwrap();
        m.handle(LinkEvent::TransportConnected, now).unwrap();
        m.handle(LinkEvent::Upgraded(UpgradeAck::switching_protocols()), now)
            .unwrap();

        let err = RecoveryError::new(crate::error::RecoveryStep::Reauthenticate, "bad signature");
        let fx = m.handle(LinkEvent::RecoveryFinished(Err(err)), now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Reconnecting);
        assert_eq!(scheduled(&fx).unwrap().0, 2);
    }

    #[test]
    fn test_exhaustion_closes() {
        let mut m = machine_with(
            BackoffConfig {
                max_attempts: 2,
                seed: Some(3),
                ..BackoffConfig::default()
            },
            false,
        );
        let now = Instant::now();
        open(&mut m, now);
        m.handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();
        m.handle(LinkEvent::BackoffElapsed, now).unwrap();
        m.handle(LinkEvent::ConnectFailed(TransportError::connect("x")), now)
            .unwrap();
        m.handle(LinkEvent::BackoffElapsed, now).unwrap();
        let fx = m
            .handle(LinkEvent::ConnectFailed(TransportError::connect("x")), now)
            .unwrap();

        assert_eq!(m.status(), ConnectionStatus::Closed);
        assert_eq!(
            terminated(&fx),
            Some(&Termination::ReconnectExhausted { attempts: 2 })
        );
        assert!(fx.contains(&Effect::StateChanged {
            from: ConnectionStatus::Reconnecting,
            to: ConnectionStatus::Closed
        }));
    }

    #[test]
    fn test_heartbeat_threshold_forces_reconnect() {
        let mut m = machine();
        let mut now = Instant::now();
        open(&mut m, now);

        for i in 0..3 {
            let fx = m.handle(LinkEvent::Frame(Frame::Ping(vec![i])), now).unwrap();
            assert!(matches!(fx.as_slice(), [Effect::Respond(_)]));
            now += Duration::from_millis(3000);
            let fx = m.handle(LinkEvent::HeartbeatDeadline, now).unwrap();
            if i < 2 {
                assert!(fx.is_empty());
                assert_eq!(m.state().consecutive_failures(), u32::from(i) + 1);
            } else {
                assert_eq!(m.status(), ConnectionStatus::Reconnecting);
                assert!(fx.contains(&Effect::CancelHeartbeats));
                assert_eq!(scheduled(&fx).unwrap().0, 1);
            }
        }
        // Successor starts clean
        assert_eq!(m.state().consecutive_failures(), 0);
    }

    #[test]
    fn test_heartbeat_threshold_without_reconnect_fails() {
        let mut m = machine_with(
            BackoffConfig {
                enabled: false,
                ..BackoffConfig::default()
            },
            false,
        );
        let mut now = Instant::now();
        open(&mut m, now);
        for i in 0..3u8 {
            m.handle(LinkEvent::Frame(Frame::Ping(vec![i])), now).unwrap();
            now += Duration::from_millis(3000);
            m.handle(LinkEvent::HeartbeatDeadline, now).unwrap();
        }
        assert_eq!(m.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut m = machine();
        let mut now = Instant::now();
        open(&mut m, now);

        for _ in 0..2 {
            m.handle(LinkEvent::Frame(Frame::Ping(vec![])), now).unwrap();
            now += Duration::from_millis(3000);
            m.handle(LinkEvent::HeartbeatDeadline, now).unwrap();
        }
        assert_eq!(m.state().consecutive_failures(), 2);

        let fx = m.handle(LinkEvent::Frame(Frame::Ping(vec![1])), now).unwrap();
        let Some(Effect::Respond(dispatch)) = fx.into_iter().next() else {
            panic!("expected reply");
        };
        m.handle(
            LinkEvent::HeartbeatSettled {
                id: dispatch.id,
                outcome: SendOutcome::Sent,
                completed_at: now + Duration::from_millis(1),
            },
            now,
        )
        .unwrap();
        assert_eq!(m.state().consecutive_failures(), 0);
        assert_eq!(m.status(), ConnectionStatus::Open);
    }

    #[test]
    fn test_application_frames_are_delivered() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        let fx = m.handle(LinkEvent::Frame(Frame::text("book")), now).unwrap();
        assert_eq!(fx, vec![Effect::Deliver(Frame::text("book"))]);
        assert_eq!(m.state().last_activity_at(), Some(now));
        assert!(m.state().heartbeat().window().is_empty());
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let mut m = machine();
        let now = Instant::now();
        assert!(m.handle(LinkEvent::Frame(Frame::text("x")), now).unwrap().is_empty());
        assert!(m.handle(LinkEvent::BackoffElapsed, now).unwrap().is_empty());
        assert!(m
            .handle(
                LinkEvent::HeartbeatSettled {
                    id: 0,
                    outcome: SendOutcome::Sent,
                    completed_at: now
                },
                now
            )
            .unwrap()
            .is_empty());
        assert_eq!(m.status(), ConnectionStatus::Idle);
    }

    #[test]
    fn test_graceful_close_drains() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        let fx = m.handle(LinkEvent::CloseRequested, now).unwrap();
        assert!(fx.contains(&Effect::Drain));
        assert_eq!(m.status(), ConnectionStatus::Draining);

        // Still answering probes while draining
        let fx = m.handle(LinkEvent::Frame(Frame::Ping(vec![])), now).unwrap();
        assert!(matches!(fx.as_slice(), [Effect::Respond(_)]));

        let fx = m.handle(LinkEvent::Drained, now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Closed);
        assert!(fx.contains(&Effect::CancelHeartbeats));
        assert_eq!(m.state().consecutive_failures(), 0);
        assert_eq!(terminated(&fx), Some(&Termination::Closed));
        assert!(matches!(
            m.handle(LinkEvent::CloseRequested, now),
            Err(LinkError::Terminal(ConnectionStatus::Closed))
        ));
    }

    #[test]
    fn test_close_during_backoff_goes_straight_to_closed() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        m.handle(LinkEvent::Disconnected(DisconnectReason::StreamEnded), now)
            .unwrap();
        let fx = m.handle(LinkEvent::CloseRequested, now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Closed);
        assert_eq!(terminated(&fx), Some(&Termination::Closed));
    }

    #[test]
    fn test_shutdown_from_any_state() {
        let mut m = machine();
        let now = Instant::now();
        m.handle(LinkEvent::OpenRequested, now).unwrap();
        let fx = m.handle(LinkEvent::ShutdownRequested, now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Closed);
        assert_eq!(terminated(&fx), Some(&Termination::Closed));
        // Idempotent once terminal
        assert!(m.handle(LinkEvent::ShutdownRequested, now).unwrap().is_empty());
    }

    #[test]
    fn test_violation_while_open_fails() {
        let mut m = machine();
        let now = Instant::now();
        open(&mut m, now);
        let fx = m
            .handle(
                LinkEvent::Violation(ProtocolViolation::UnrecognizedFrame("raw".into())),
                now,
            )
            .unwrap();
        assert_eq!(m.status(), ConnectionStatus::Failed);
        assert!(matches!(terminated(&fx), Some(Termination::Failed(LinkError::Protocol(_)))));
    }

    #[test]
    fn test_recover_on_open_runs_hooks_initially() {
        let mut m = machine_with(BackoffConfig::default(), true);
        let now = Instant::now();
        m.handle(LinkEvent::OpenRequested, now).unwrap();
        m.handle(LinkEvent::TransportConnected, now).unwrap();
        let fx = m
            .handle(LinkEvent::Upgraded(UpgradeAck::switching_protocols()), now)
            .unwrap();
        assert_eq!(fx, vec![Effect::Recover]);

        // Initial recovery failure is terminal
        let err = RecoveryError::new(crate::error::RecoveryStep::Resubscribe, "denied");
        m.handle(LinkEvent::RecoveryFinished(Err(err)), now).unwrap();
        assert_eq!(m.status(), ConnectionStatus::Failed);
    }

    #[test]
    fn test_receipt_only_profile_never_fails() {
        let mut m = ConnectionStateMachine::new(
            HeartbeatConfig::new(
                Arc::new(ReceiptOnlyProfile::new("channel", "heartbeat")),
                Duration::from_millis(3000),
                3,
            ),
            ReconnectionPolicy::default(),
            false,
            Arc::new(NullTelemetry),
        );
        let now = Instant::now();
        open(&mut m, now);
        for _ in 0..10 {
            let fx = m
                .handle(LinkEvent::Frame(Frame::text(r#"{"channel":"heartbeat"}"#)), now)
                .unwrap();
            assert!(fx.is_empty());
        }
        assert_eq!(m.state().heartbeat().window().success_ratio(), Some(1.0));
        assert_eq!(m.next_heartbeat_deadline(), None);
    }
}
