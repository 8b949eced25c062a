//! Transport collaborator interface
//!
//! The link core never touches sockets. It drives a [`TransportChannel`] to open
//! a [`TransportHandle`], upgrades it, writes through a [`FrameWriter`] and reads
//! a stream of [`TransportEvent`]s from `monitor`.
//!
//! Two implementations ship with the crate:
//! - [`tungstenite::TungsteniteChannel`] for real exchange endpoints
//! - [`memory::MemoryTransport`] for tests and dry runs

pub mod memory;
pub mod tungstenite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ProtocolViolation, TransportError, UpgradeError};
use crate::frame::Frame;

pub use memory::{MemoryRemote, MemoryTransport, OpenBehavior, SendMode};
pub use tungstenite::TungsteniteChannel;

/// Inbound event stream of an upgraded handle
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Options for establishing the raw connection
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub connect_timeout: Duration,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
    pub max_message_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            event_capacity: 1024,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Protocol upgrade request
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    /// Request path; empty means the path of the endpoint URL
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// Server acknowledgment of the upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeAck {
    pub status: u16,
    pub protocol: Option<String>,
}

impl UpgradeAck {
    pub fn switching_protocols() -> Self {
        Self {
            status: 101,
            protocol: None,
        }
    }
}

/// Why the transport went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote closed with a close frame
    RemoteClose { code: u16, reason: String },
    /// Stream ended without a close handshake
    StreamEnded,
    /// Read error
    Error(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteClose { code, reason } => write!(f, "remote_close({} {})", code, reason),
            Self::StreamEnded => write!(f, "stream_ended"),
            Self::Error(e) => write!(f, "error({})", e),
        }
    }
}

/// Events emitted by `monitor`
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Frame(Frame),
    Error(TransportError),
    Violation(ProtocolViolation),
    Disconnected(DisconnectReason),
}

/// Writes frames with a hard deadline
#[async_trait]
pub trait FrameWriter: Send + Sync {
    async fn send(&self, frame: Frame, deadline: Instant) -> Result<(), TransportError>;
}

/// One connection attempt, exclusively owned by the current coordinating task
#[async_trait]
pub trait TransportHandle: Send {
    /// Perform the protocol upgrade on an opened connection
    async fn upgrade(&mut self, request: &UpgradeRequest) -> Result<UpgradeAck, UpgradeError>;

    /// Writer for the upgraded connection; `None` before upgrade
    fn writer(&self) -> Option<Arc<dyn FrameWriter>>;

    /// Take the inbound event stream. Yields `Some` once, after upgrade.
    fn monitor(&mut self) -> Option<TransportEvents>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for transport handles
#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        options: &OpenOptions,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}
