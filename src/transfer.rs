//! Ownership transfer between coordinating tasks
//!
//! 1. Current owner stops processing inbound events and stages them (bounded)
//! 2. Owner sends a [`TransferOffer`] with a state snapshot and staged count
//! 3. Target acknowledges by accepting, supplying a one-shot slot
//! 4. Owner moves the link (handle, staged events, state) into the slot and stops
//! 5. Target replays staged events in order, then goes live
//!
//! Nothing moves before the acknowledgment. If the target never answers, or its
//! slot is gone at hand-over time, the original owner keeps the link and replays
//! the staged events itself.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::OwnershipTransferError;
use crate::session::{ConnectionSnapshot, OwnedLink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Inbound events held while waiting for the acknowledgment
    pub staging_capacity: usize,
    pub ack_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            staging_capacity: 1024,
            ack_timeout: Duration::from_secs(2),
        }
    }
}

/// Bounded FIFO for inbound events received during a transfer
#[derive(Debug)]
pub struct StagingQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> StagingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the item back when the queue is full
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Mailbox pair for receiving transfer offers
pub fn mailbox(capacity: usize) -> (TransferTarget, TransferInbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (TransferTarget { tx }, TransferInbox { rx })
}

/// Address of a prospective new owner
#[derive(Debug, Clone)]
pub struct TransferTarget {
    tx: mpsc::Sender<TransferOffer>,
}

impl TransferTarget {
    /// Deliver an offer without waiting
    pub(crate) fn offer(&self, offer: TransferOffer) -> Result<(), OwnershipTransferError> {
        self.tx.try_send(offer).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                OwnershipTransferError::HandleConflict("target has an unanswered offer".into())
            }
            mpsc::error::TrySendError::Closed(_) => OwnershipTransferError::OwnerGone,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side held by the prospective owner
#[derive(Debug)]
pub struct TransferInbox {
    rx: mpsc::Receiver<TransferOffer>,
}

impl TransferInbox {
    pub async fn recv(&mut self) -> Option<TransferOffer> {
        self.rx.recv().await
    }
}

pub(crate) enum TransferAck {
    Accepted(oneshot::Sender<OwnedLink>),
    Declined,
}

/// Transfer-ready message from the current owner
#[derive(Debug)]
pub struct TransferOffer {
    snapshot: ConnectionSnapshot,
    staged: usize,
    ack: oneshot::Sender<TransferAck>,
}

impl TransferOffer {
    pub(crate) fn new(
        snapshot: ConnectionSnapshot,
        staged: usize,
        ack: oneshot::Sender<TransferAck>,
    ) -> Self {
        Self {
            snapshot,
            staged,
            ack,
        }
    }

    pub fn snapshot(&self) -> &ConnectionSnapshot {
        &self.snapshot
    }

    /// Events staged when the offer was made
    pub fn staged(&self) -> usize {
        self.staged
    }

    /// Acknowledge the offer. Fails with `OwnerGone` if the owner already gave up.
    pub fn accept(self) -> Result<IncomingLink, OwnershipTransferError> {
        let (slot, rx) = oneshot::channel();
        self.ack
            .send(TransferAck::Accepted(slot))
            .map_err(|_| OwnershipTransferError::OwnerGone)?;
        Ok(IncomingLink { rx })
    }

    pub fn decline(self) {
        let _ = self.ack.send(TransferAck::Declined);
    }
}

impl std::fmt::Debug for TransferAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted(_) => write!(f, "Accepted"),
            Self::Declined => write!(f, "Declined"),
        }
    }
}

/// Acknowledged transfer waiting for the link to arrive
#[derive(Debug)]
pub struct IncomingLink {
    rx: oneshot::Receiver<OwnedLink>,
}

impl IncomingLink {
    pub async fn receive(self, wait: Duration) -> Result<OwnedLink, OwnershipTransferError> {
        match timeout(wait, self.rx).await {
            Ok(Ok(link)) => Ok(link),
            Ok(Err(_)) => Err(OwnershipTransferError::OwnerGone),
            Err(_) => Err(OwnershipTransferError::AckTimeout(wait)),
        }
    }
}
