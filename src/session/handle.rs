//! Command handle and application-facing messages

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::machine::Termination;
use super::state::{ConnectionId, ConnectionSnapshot, ConnectionStatus};
use crate::error::{LinkError, LinkResult, TransportError};
use crate::frame::Frame;
use crate::transfer::TransferTarget;

/// Delivered to the application handler, in order
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    /// Payload frame (heartbeats never reach the application)
    Frame(Frame),
    StateChanged {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// An application send could not be written
    SendFailed { frame: Frame, error: TransportError },
    Terminated(Termination),
}

/// Why a coordinating task stopped without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkExit {
    Closed,
    Failed(LinkError),
    /// Ownership moved to another task
    Relinquished,
}

#[derive(Debug)]
pub(crate) enum Command {
    Open(oneshot::Sender<LinkResult<()>>),
    Send(Frame),
    Close(oneshot::Sender<LinkResult<()>>),
    Shutdown,
    Snapshot(oneshot::Sender<ConnectionSnapshot>),
    Transfer {
        target: TransferTarget,
        reply: oneshot::Sender<LinkResult<()>>,
    },
}

/// Cloneable handle to a running link. Every call is a message to the
/// coordinating task; none of them touches connection state directly.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Command>,
}

impl LinkHandle {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::Sender<Command>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether the coordinating task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Start connecting. Fails unless the link is Idle.
    pub async fn open(&self) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Open(reply)).await?;
        rx.await.map_err(|_| LinkError::OwnerUnavailable)?
    }

    /// Queue a frame for sending. Write failures arrive as `LinkMessage::SendFailed`.
    pub async fn send(&self, frame: Frame) -> LinkResult<()> {
        self.command(Command::Send(frame)).await
    }

    /// Graceful close: pending sends drain, then the link closes
    pub async fn close(&self) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Close(reply)).await?;
        rx.await.map_err(|_| LinkError::OwnerUnavailable)?
    }

    /// Terminal shutdown from any state
    pub async fn shutdown(&self) -> LinkResult<()> {
        self.command(Command::Shutdown).await
    }

    pub async fn snapshot(&self) -> LinkResult<ConnectionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot(reply)).await?;
        rx.await.map_err(|_| LinkError::OwnerUnavailable)
    }

    /// Offer the link to another owner. Resolves once the target has taken
    /// over, or with the reason the transfer was aborted.
    pub async fn transfer_to(&self, target: &TransferTarget) -> LinkResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Transfer {
            target: target.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::OwnerUnavailable)?
    }

    async fn command(&self, command: Command) -> LinkResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| LinkError::OwnerUnavailable)
    }
}

/// A running link: command handle, message stream and the coordinating task
#[derive(Debug)]
pub struct SpawnedLink {
    pub handle: LinkHandle,
    pub messages: mpsc::UnboundedReceiver<LinkMessage>,
    pub task: JoinHandle<LinkResult<LinkExit>>,
}
