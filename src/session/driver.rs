//! Coordinating task
//!
//! One driver per connection. It owns the state machine, the transport handle
//! and every in-flight task, and is the only place effects are executed:
//! - lifecycle steps (connect, upgrade, recovery) run as tasks tagged with the
//!   state generation that started them; stale results are dropped
//! - heartbeat replies run as independent tasks bounded by their deadline
//! - application sends are written one at a time, in order
//! - timers (backoff, heartbeat deadline, drain, transfer ack) are select arms
//!
//! Everything that has to move on ownership transfer lives in [`LinkCore`].

use std::collections::VecDeque;
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::handle::{Command, LinkExit, LinkHandle, LinkMessage, SpawnedLink};
use super::machine::{ConnectionStateMachine, Effect, LinkEvent, Termination};
use super::state::{ConnectionId, ConnectionSnapshot, ConnectionStatus};
use crate::error::{
    LinkError, LinkResult, OwnershipTransferError, RecoveryError, RecoveryStep, TransportError,
    TransportErrorKind, UpgradeError,
};
use crate::frame::Frame;
use crate::heartbeat::{deliver, SendOutcome};
use crate::reconnect::{run_recovery, RecoveryHooks};
use crate::telemetry::TelemetryEvent;
use crate::transfer::{StagingQueue, TransferAck, TransferConfig, TransferOffer, TransferTarget};
use crate::transport::{
    DisconnectReason, FrameWriter, OpenOptions, TransportChannel, TransportEvent, TransportEvents, TransportHandle,
    UpgradeAck, UpgradeRequest,
};

/// Runtime settings for the coordinating task
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub endpoint: String,
    pub open: OpenOptions,
    pub upgrade: UpgradeRequest,
    pub upgrade_timeout: Duration,
    /// Deadline for each application send
    pub send_timeout: Duration,
    pub recovery_step_timeout: Duration,
    pub drain_timeout: Duration,
    pub transfer: TransferConfig,
    pub command_capacity: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            open: OpenOptions::default(),
            upgrade: UpgradeRequest::default(),
            upgrade_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            recovery_step_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            transfer: TransferConfig::default(),
            command_capacity: 256,
        }
    }
}

/// Result of a heartbeat reply task
#[derive(Debug)]
struct Settlement {
    generation: u64,
    id: u64,
    outcome: SendOutcome,
    completed_at: Instant,
}

/// Result of a lifecycle task
enum StepOutput {
    Connected(Result<Box<dyn TransportHandle>, TransportError>),
    Upgraded(Box<dyn TransportHandle>, Result<UpgradeAck, UpgradeError>),
    Recovered(Result<(), RecoveryError>),
}

type SendResult = Option<(Frame, TransportError)>;

/// Inbound event held back while a transfer is pending
#[derive(Debug)]
struct Staged {
    event: TransportEvent,
    received_at: Instant,
}

/// State, transport and in-flight work of one link; moves as a unit on transfer
pub(crate) struct LinkCore {
    machine: ConnectionStateMachine,
    settings: Arc<DriverSettings>,
    channel: Arc<dyn TransportChannel>,
    hooks: Arc<dyn RecoveryHooks>,
    handle: Option<Box<dyn TransportHandle>>,
    writer: Option<Arc<dyn FrameWriter>>,
    events: Option<TransportEvents>,
    heartbeats: JoinSet<Settlement>,
    /// At most one application send in flight
    sends: JoinSet<SendResult>,
    outbox: VecDeque<Frame>,
    staging: StagingQueue<Staged>,
}

impl LinkCore {
    pub(crate) fn new(
        machine: ConnectionStateMachine,
        settings: DriverSettings,
        channel: Arc<dyn TransportChannel>,
        hooks: Arc<dyn RecoveryHooks>,
    ) -> Self {
        let staging = StagingQueue::new(settings.transfer.staging_capacity);
        Self {
            machine,
            settings: Arc::new(settings),
            channel,
            hooks,
            handle: None,
            writer: None,
            events: None,
            heartbeats: JoinSet::new(),
            sends: JoinSet::new(),
            outbox: VecDeque::new(),
            staging,
        }
    }

    fn id(&self) -> ConnectionId {
        self.machine.state().id()
    }
}

/// A link handed over by its previous owner
pub struct OwnedLink {
    core: LinkCore,
}

impl OwnedLink {
    pub fn id(&self) -> ConnectionId {
        self.core.id()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.core.machine.snapshot(Instant::now())
    }

    /// Inbound events that arrived during the transfer and will be replayed first
    pub fn staged(&self) -> usize {
        self.core.staging.len()
    }

    /// Become the coordinating task for this link
    pub fn spawn(self) -> SpawnedLink {
        LinkDriver::spawn(self.core)
    }
}

impl fmt::Debug for OwnedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedLink")
            .field("id", &self.core.id())
            .field("status", &self.core.machine.status())
            .field("staged", &self.core.staging.len())
            .finish()
    }
}

struct PendingTransfer {
    ack: oneshot::Receiver<TransferAck>,
    deadline: Instant,
    reply: oneshot::Sender<LinkResult<()>>,
}

enum Flow {
    Exit(Termination),
    HandOver {
        slot: oneshot::Sender<OwnedLink>,
        reply: oneshot::Sender<LinkResult<()>>,
    },
}

pub(crate) struct LinkDriver {
    core: LinkCore,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    messages: mpsc::UnboundedSender<LinkMessage>,
    lifecycle: JoinSet<(u64, StepOutput)>,
    retired: Vec<Box<dyn TransportHandle>>,
    backoff_until: Option<Instant>,
    drain_deadline: Option<Instant>,
    transfer: Option<PendingTransfer>,
    exit: Option<Termination>,
}

impl LinkDriver {
    /// Start a coordinating task for `core`
    pub(crate) fn spawn(core: LinkCore) -> SpawnedLink {
        let (tx, commands) = mpsc::channel(core.settings.command_capacity.max(1));
        let (messages, rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(core.id(), tx);
        let driver = Self {
            core,
            commands,
            commands_closed: false,
            messages,
            lifecycle: JoinSet::new(),
            retired: Vec::new(),
            backoff_until: None,
            drain_deadline: None,
            transfer: None,
            exit: None,
        };
        let task = tokio::spawn(driver.run());
        SpawnedLink {
            handle,
            messages: rx,
            task,
        }
    }

    pub(crate) async fn run(mut self) -> LinkResult<LinkExit> {
        info!(
            connection = %self.core.id(),
            endpoint = %self.core.settings.endpoint,
            status = %self.core.machine.status(),
            "link_driver_started"
        );
        loop {
            match self.next_flow().await {
                Flow::Exit(termination) => return self.finish(termination).await,
                Flow::HandOver { slot, reply } => match self.hand_over(slot, reply) {
                    Ok(exit) => return Ok(exit),
                    Err(driver) => self = *driver,
                },
            }
        }
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    async fn next_flow(&mut self) -> Flow {
        // Events staged by a previous owner come first
        self.replay_staged();

        loop {
            if let Some(termination) = self.exit.take() {
                return Flow::Exit(termination);
            }
            for handle in self.retired.drain(..) {
                tokio::spawn(close_quietly(handle));
            }

            // Nothing may move the link out of Open while staged events wait;
            // heartbeat settlements and deadlines are left for the next owner
            let no_transfer = self.transfer.is_none();
            let heartbeat_deadline = if no_transfer {
                self.core.machine.next_heartbeat_deadline()
            } else {
                None
            };
            let transfer_deadline = self.transfer.as_ref().map(|t| t.deadline);
            let read_events = no_transfer || !self.core.staging.is_full();

            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!(connection = %self.core.id(), "link_handles_dropped");
                        self.commands_closed = true;
                        self.cancel_transfer("owner handles dropped");
                        self.apply(LinkEvent::ShutdownRequested);
                    }
                },
                Some(joined) = self.lifecycle.join_next(), if no_transfer && !self.lifecycle.is_empty() => {
                    self.on_lifecycle(joined);
                }
                Some(joined) = self.core.heartbeats.join_next(), if no_transfer && !self.core.heartbeats.is_empty() => {
                    self.on_settlement(joined);
                }
                Some(joined) = self.core.sends.join_next(), if !self.core.sends.is_empty() => {
                    self.on_send_complete(joined);
                }
                event = next_event(&mut self.core.events), if read_events => {
                    self.on_transport_event(event);
                }
                _ = sleep_until_opt(self.backoff_until) => {
                    self.backoff_until = None;
                    self.apply(LinkEvent::BackoffElapsed);
                }
                _ = sleep_until_opt(heartbeat_deadline) => {
                    self.apply(LinkEvent::HeartbeatDeadline);
                }
                _ = sleep_until_opt(self.drain_deadline) => {
                    self.drain_deadline = None;
                    self.apply(LinkEvent::DrainTimedOut);
                }
                ack = transfer_ack(&mut self.transfer) => {
                    if let Some(flow) = self.on_transfer_ack(ack) {
                        return flow;
                    }
                }
                _ = sleep_until_opt(transfer_deadline) => {
                    if let Some(pending) = self.transfer.take() {
                        let after = self.core.settings.transfer.ack_timeout;
                        self.abort_transfer(pending.reply, OwnershipTransferError::AckTimeout(after));
                    }
                }
            }

            // A transfer only completes from Open
            let status = self.core.machine.status();
            if status != ConnectionStatus::Open {
                if let Some(pending) = self.transfer.take() {
                    self.abort_transfer(pending.reply, OwnershipTransferError::NotTransferable(status));
                }
            }
        }
    }

    async fn finish(mut self, termination: Termination) -> LinkResult<LinkExit> {
        for mut handle in self.retired.drain(..) {
            match timeout(Duration::from_secs(1), handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "transport_close_failed"),
                Err(_) => debug!("transport_close_timed_out"),
            }
        }
        self.core.heartbeats.abort_all();

        info!(connection = %self.core.id(), reason = %termination, "link_driver_stopped");
        match termination {
            Termination::Closed => Ok(LinkExit::Closed),
            Termination::Failed(err) => Ok(LinkExit::Failed(err)),
            Termination::ReconnectExhausted { attempts } => {
                Err(LinkError::ReconnectExhausted { attempts })
            }
        }
    }

    /// Apply an event, logging a rejection
    fn apply(&mut self, event: LinkEvent) {
        if let Err(err) = self.dispatch(event) {
            debug!(connection = %self.core.id(), error = %err, "link_event_rejected");
        }
    }

    /// Feed an event and any follow-ups to the state machine and execute the
    /// effects. Only a rejection of the first event is returned.
    fn dispatch(&mut self, event: LinkEvent) -> LinkResult<()> {
        self.dispatch_at(event, Instant::now())
    }

    /// Like `dispatch`, with the first event observed at `at`
    fn dispatch_at(&mut self, event: LinkEvent, at: Instant) -> LinkResult<()> {
        let mut queue = VecDeque::from([event]);
        let mut first = true;
        while let Some(event) = queue.pop_front() {
            let now = if first { at } else { Instant::now() };
            let effects = match self.core.machine.handle(event, now) {
                Ok(effects) => effects,
                Err(err) if first => return Err(err),
                Err(err) => {
                    warn!(connection = %self.core.id(), error = %err, "follow_up_event_rejected");
                    continue;
                }
            };
            first = false;
            for effect in effects {
                self.execute(effect, &mut queue);
            }
            if self.exit.is_some() {
                break;
            }
        }
        Ok(())
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    fn execute(&mut self, effect: Effect, queue: &mut VecDeque<LinkEvent>) {
        let generation = self.core.machine.generation();
        match effect {
            Effect::Connect => {
                let channel = self.core.channel.clone();
                let settings = self.core.settings.clone();
                debug!(connection = %self.core.id(), endpoint = %settings.endpoint, "transport_connect");
                self.lifecycle.spawn(async move {
                    let limit = settings.open.connect_timeout;
                    let opened = match timeout(limit, channel.open(&settings.endpoint, &settings.open)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::timeout(TransportErrorKind::ConnectTimeout, limit)),
                    };
                    (generation, StepOutput::Connected(opened))
                });
            }
            Effect::Upgrade => match self.core.handle.take() {
                Some(mut handle) => {
                    let settings = self.core.settings.clone();
                    self.lifecycle.spawn(async move {
                        let limit = settings.upgrade_timeout;
                        let result = match timeout(limit, handle.upgrade(&settings.upgrade)).await {
                            Ok(result) => result,
                            Err(_) => Err(UpgradeError::Rejected(TransportError::timeout(
                                TransportErrorKind::UpgradeTimeout,
                                limit,
                            ))),
                        };
                        (generation, StepOutput::Upgraded(handle, result))
                    });
                }
                None => queue.push_back(LinkEvent::UpgradeFailed(UpgradeError::Rejected(
                    TransportError::closed(),
                ))),
            },
            Effect::Recover => match self.core.writer.clone() {
                Some(writer) => {
                    let hooks = self.core.hooks.clone();
                    let step_timeout = self.core.settings.recovery_step_timeout;
                    self.lifecycle.spawn(async move {
                        let result = run_recovery(hooks, writer, step_timeout).await;
                        (generation, StepOutput::Recovered(result))
                    });
                }
                None => queue.push_back(LinkEvent::RecoveryFinished(Err(RecoveryError::new(
                    RecoveryStep::Reauthenticate,
                    "transport not writable",
                )))),
            },
            Effect::Respond(dispatch) => match self.core.writer.clone() {
                Some(writer) => {
                    self.core.heartbeats.spawn(async move {
                        let (id, outcome, completed_at) = deliver(writer, dispatch).await;
                        Settlement {
                            generation,
                            id,
                            outcome,
                            completed_at,
                        }
                    });
                }
                None => queue.push_back(LinkEvent::HeartbeatSettled {
                    id: dispatch.id,
                    outcome: SendOutcome::Failed(TransportError::closed()),
                    completed_at: Instant::now(),
                }),
            },
            Effect::CancelHeartbeats => self.core.heartbeats.abort_all(),
            Effect::Deliver(frame) => self.notify(LinkMessage::Frame(frame)),
            Effect::ScheduleReconnect { attempt, delay } => {
                debug!(
                    connection = %self.core.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect_scheduled"
                );
                self.backoff_until = Some(Instant::now() + delay);
            }
            Effect::Drain => {
                if self.sends_idle() {
                    queue.push_back(LinkEvent::Drained);
                } else {
                    self.drain_deadline = Some(Instant::now() + self.core.settings.drain_timeout);
                }
            }
            Effect::ReleaseTransport => self.release_transport(),
            Effect::StateChanged { from, to } => self.notify(LinkMessage::StateChanged { from, to }),
            Effect::Terminate(termination) => {
                self.notify(LinkMessage::Terminated(termination.clone()));
                self.exit = Some(termination);
            }
        }
    }

    fn release_transport(&mut self) {
        self.core.writer = None;
        self.core.events = None;
        self.lifecycle.abort_all();
        self.drain_deadline = None;
        if let Some(handle) = self.core.handle.take() {
            self.retired.push(handle);
        }
        // Queued sends can no longer be written on this transport
        while let Some(frame) = self.core.outbox.pop_front() {
            self.notify(LinkMessage::SendFailed {
                frame,
                error: TransportError::closed(),
            });
        }
    }

    fn notify(&self, message: LinkMessage) {
        if self.messages.send(message).is_err() {
            trace!(connection = %self.core.id(), "application_receiver_dropped");
        }
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Open(reply) => {
                let _ = reply.send(self.dispatch(LinkEvent::OpenRequested));
            }
            Command::Send(frame) => self.enqueue_send(frame),
            Command::Close(reply) => {
                self.cancel_transfer("close requested");
                let _ = reply.send(self.dispatch(LinkEvent::CloseRequested));
            }
            Command::Shutdown => {
                self.cancel_transfer("shutdown requested");
                self.apply(LinkEvent::ShutdownRequested);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.core.machine.snapshot(Instant::now()));
            }
            Command::Transfer { target, reply } => self.begin_transfer(target, reply),
        }
    }

    fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        let event = match event {
            Some(event) => event,
            None => {
                // Reader went away without reporting a disconnect
                self.core.events = None;
                TransportEvent::Disconnected(DisconnectReason::StreamEnded)
            }
        };

        let received_at = Instant::now();
        if self.transfer.is_some() {
            if let Err(staged) = self.core.staging.push(Staged { event, received_at }) {
                // Unreachable while reads pause on a full queue
                warn!(connection = %self.core.id(), "staging_overflow");
                self.process_transport_event(staged.event, staged.received_at);
            }
            return;
        }
        self.process_transport_event(event, received_at);
    }

    fn process_transport_event(&mut self, event: TransportEvent, received_at: Instant) {
        let event = match event {
            TransportEvent::Connected => {
                debug!(connection = %self.core.id(), "transport_stream_connected");
                return;
            }
            TransportEvent::Frame(frame) => LinkEvent::Frame(frame),
            TransportEvent::Error(err) => LinkEvent::TransportError(err),
            TransportEvent::Violation(violation) => LinkEvent::Violation(violation),
            TransportEvent::Disconnected(reason) => LinkEvent::Disconnected(reason),
        };
        if let Err(err) = self.dispatch_at(event, received_at) {
            debug!(connection = %self.core.id(), error = %err, "link_event_rejected");
        }
    }

    fn on_lifecycle(&mut self, joined: Result<(u64, StepOutput), JoinError>) {
        let (generation, output) = match joined {
            Ok(result) => result,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(connection = %self.core.id(), error = %e, "lifecycle_task_failed");
                }
                return;
            }
        };

        if generation != self.core.machine.generation() {
            debug!(connection = %self.core.id(), generation, "stale_lifecycle_result");
            match output {
                StepOutput::Connected(Ok(handle)) | StepOutput::Upgraded(handle, _) => {
                    self.retired.push(handle)
                }
                _ => {}
            }
            return;
        }

        match output {
            StepOutput::Connected(Ok(handle)) => {
                self.core.handle = Some(handle);
                self.apply(LinkEvent::TransportConnected);
            }
            StepOutput::Connected(Err(err)) => self.apply(LinkEvent::ConnectFailed(err)),
            StepOutput::Upgraded(mut handle, Ok(ack)) => {
                self.core.writer = handle.writer();
                self.core.events = handle.monitor();
                self.core.handle = Some(handle);
                self.apply(LinkEvent::Upgraded(ack));
            }
            StepOutput::Upgraded(handle, Err(err)) => {
                self.core.handle = Some(handle);
                self.apply(LinkEvent::UpgradeFailed(err));
            }
            StepOutput::Recovered(result) => self.apply(LinkEvent::RecoveryFinished(result)),
        }
    }

    fn on_settlement(&mut self, joined: Result<Settlement, JoinError>) {
        let settlement = match joined {
            Ok(settlement) => settlement,
            // Aborted when the connection left Open
            Err(_) => return,
        };
        if settlement.generation != self.core.machine.generation() {
            return;
        }
        self.apply(LinkEvent::HeartbeatSettled {
            id: settlement.id,
            outcome: settlement.outcome,
            completed_at: settlement.completed_at,
        });
    }

    // =========================================================================
    // APPLICATION SENDS
    // =========================================================================

    fn enqueue_send(&mut self, frame: Frame) {
        if !self.core.machine.accepts_sends() || self.core.writer.is_none() {
            self.notify(LinkMessage::SendFailed {
                frame,
                error: TransportError::closed(),
            });
            return;
        }
        self.core.outbox.push_back(frame);
        self.pump_sends();
    }

    fn pump_sends(&mut self) {
        if !self.core.sends.is_empty() {
            return;
        }
        let Some(writer) = self.core.writer.clone() else {
            return;
        };
        if let Some(frame) = self.core.outbox.pop_front() {
            let deadline = Instant::now() + self.core.settings.send_timeout;
            self.core.sends.spawn(async move {
                match writer.send(frame.clone(), deadline).await {
                    Ok(()) => None,
                    Err(err) => Some((frame, err)),
                }
            });
        }
    }

    fn sends_idle(&self) -> bool {
        self.core.sends.is_empty() && self.core.outbox.is_empty()
    }

    fn on_send_complete(&mut self, joined: Result<SendResult, JoinError>) {
        if let Ok(Some((frame, error))) = joined {
            warn!(connection = %self.core.id(), frame = %frame, error = %error, "send_failed");
            self.notify(LinkMessage::SendFailed { frame, error });
        }
        self.pump_sends();
        if self.core.machine.status() == ConnectionStatus::Draining && self.sends_idle() {
            self.apply(LinkEvent::Drained);
        }
    }

    // =========================================================================
    // OWNERSHIP TRANSFER
    // =========================================================================

    fn begin_transfer(&mut self, target: TransferTarget, reply: oneshot::Sender<LinkResult<()>>) {
        if self.transfer.is_some() {
            let err = OwnershipTransferError::HandleConflict("transfer already in progress".into());
            let _ = reply.send(Err(err.into()));
            return;
        }
        let status = self.core.machine.status();
        if status != ConnectionStatus::Open {
            let _ = reply.send(Err(OwnershipTransferError::NotTransferable(status).into()));
            return;
        }

        // Stop processing: whatever the transport already buffered is staged
        let now = Instant::now();
        if let Some(events) = self.core.events.as_mut() {
            while !self.core.staging.is_full() {
                match events.try_recv() {
                    Ok(event) => {
                        let _ = self.core.staging.push(Staged {
                            event,
                            received_at: now,
                        });
                    }
                    Err(_) => break,
                }
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let staged = self.core.staging.len();
        let offer = TransferOffer::new(self.core.machine.snapshot(now), staged, ack_tx);
        if let Err(err) = target.offer(offer) {
            self.abort_transfer(reply, err);
            return;
        }

        info!(connection = %self.core.id(), staged, "ownership_transfer_offered");
        self.transfer = Some(PendingTransfer {
            ack: ack_rx,
            deadline: now + self.core.settings.transfer.ack_timeout,
            reply,
        });
    }

    fn on_transfer_ack(
        &mut self,
        ack: Result<TransferAck, oneshot::error::RecvError>,
    ) -> Option<Flow> {
        let pending = self.transfer.take()?;
        match ack {
            Ok(TransferAck::Accepted(slot)) => Some(Flow::HandOver {
                slot,
                reply: pending.reply,
            }),
            Ok(TransferAck::Declined) => {
                self.abort_transfer(pending.reply, OwnershipTransferError::Declined);
                None
            }
            Err(_) => {
                self.abort_transfer(pending.reply, OwnershipTransferError::OwnerGone);
                None
            }
        }
    }

    fn cancel_transfer(&mut self, reason: &str) {
        if let Some(pending) = self.transfer.take() {
            self.abort_transfer(
                pending.reply,
                OwnershipTransferError::HandleConflict(reason.to_string()),
            );
        }
    }

    /// Original owner keeps the link and processes what it staged
    fn abort_transfer(&mut self, reply: oneshot::Sender<LinkResult<()>>, err: OwnershipTransferError) {
        let id = self.core.id();
        warn!(connection = %id, error = %err, staged = self.core.staging.len(), "ownership_transfer_aborted");
        self.core.machine.telemetry().emit(
            &id,
            &TelemetryEvent::OwnershipTransferAborted {
                reason: err.to_string(),
            },
        );
        let _ = reply.send(Err(err.into()));
        self.replay_staged();
    }

    fn replay_staged(&mut self) {
        while self.exit.is_none() {
            match self.core.staging.pop() {
                Some(staged) => self.process_transport_event(staged.event, staged.received_at),
                None => break,
            }
        }
    }

    /// Move the core into the acknowledged slot. Gives the driver back when
    /// the new owner is already gone.
    fn hand_over(
        self,
        slot: oneshot::Sender<OwnedLink>,
        reply: oneshot::Sender<LinkResult<()>>,
    ) -> Result<LinkExit, Box<LinkDriver>> {
        let id = self.core.id();
        let telemetry = self.core.machine.telemetry().clone();
        let staged = self.core.staging.len();

        let LinkDriver {
            core,
            commands,
            commands_closed,
            messages,
            lifecycle,
            retired,
            backoff_until,
            drain_deadline,
            transfer: _,
            exit,
        } = self;

        match slot.send(OwnedLink { core }) {
            Ok(()) => {
                telemetry.emit(&id, &TelemetryEvent::OwnershipTransferred { staged });
                info!(connection = %id, staged, "ownership_relinquished");
                let _ = reply.send(Ok(()));
                for handle in retired {
                    tokio::spawn(close_quietly(handle));
                }
                Ok(LinkExit::Relinquished)
            }
            Err(returned) => {
                let mut driver = LinkDriver {
                    core: returned.core,
                    commands,
                    commands_closed,
                    messages,
                    lifecycle,
                    retired,
                    backoff_until,
                    drain_deadline,
                    transfer: None,
                    exit,
                };
                driver.abort_transfer(reply, OwnershipTransferError::OwnerGone);
                Err(Box::new(driver))
            }
        }
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn transfer_ack(
    transfer: &mut Option<PendingTransfer>,
) -> Result<TransferAck, oneshot::error::RecvError> {
    match transfer {
        Some(pending) => (&mut pending.ack).await,
        None => pending().await,
    }
}

async fn close_quietly(mut handle: Box<dyn TransportHandle>) {
    if let Err(e) = handle.close().await {
        debug!(error = %e, "transport_close_failed");
    }
}
