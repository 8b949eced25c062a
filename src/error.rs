//! Error taxonomy for the link runtime.
//!
//! Transport and recovery failures are recoverable and feed the reconnect cycle.
//! Protocol violations fail the connection outright. Ownership transfer errors
//! never touch connection state. `ReconnectExhausted` is the only error that is
//! fatal to a connection and surfaced to the owner.

use std::fmt;
use std::time::Duration;

use crate::session::ConnectionStatus;

/// What part of the transport failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Connect,
    ConnectTimeout,
    Upgrade,
    UpgradeTimeout,
    Send,
    SendTimeout,
    Closed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::ConnectTimeout => write!(f, "connect_timeout"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::UpgradeTimeout => write!(f, "upgrade_timeout"),
            Self::Send => write!(f, "send"),
            Self::SendTimeout => write!(f, "send_timeout"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Connect, upgrade or send failure reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn upgrade(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Upgrade, message)
    }

    pub fn send(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Send, message)
    }

    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "transport closed")
    }

    pub fn timeout(kind: TransportErrorKind, after: Duration) -> Self {
        Self::new(kind, format!("timed out after {}ms", after.as_millis()))
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport {} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// Remote side spoke something the link cannot interpret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    MalformedUpgrade(String),
    UnrecognizedFrame(String),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedUpgrade(detail) => write!(f, "malformed upgrade response: {}", detail),
            Self::UnrecognizedFrame(detail) => write!(f, "unrecognized frame: {}", detail),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// Outcome of a failed protocol upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    /// Server refused the upgrade (non-101 status, auth failure)
    Rejected(TransportError),
    /// Upgrade response could not be parsed
    Malformed(ProtocolViolation),
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "upgrade rejected: {}", e),
            Self::Malformed(v) => write!(f, "{}", v),
        }
    }
}

impl std::error::Error for UpgradeError {}

impl From<TransportError> for UpgradeError {
    fn from(err: TransportError) -> Self {
        Self::Rejected(err)
    }
}

/// Post-reconnect recovery step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    Reauthenticate,
    Resubscribe,
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reauthenticate => write!(f, "reauthenticate"),
            Self::Resubscribe => write!(f, "resubscribe"),
        }
    }
}

/// A recovery callback failed or timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryError {
    pub step: RecoveryStep,
    pub message: String,
}

impl RecoveryError {
    pub fn new(step: RecoveryStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recovery step {} failed: {}", self.step, self.message)
    }
}

impl std::error::Error for RecoveryError {}

/// Ownership transfer did not complete; the original owner keeps the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnershipTransferError {
    /// New owner did not acknowledge in time
    AckTimeout(Duration),
    /// New owner refused the offer
    Declined,
    /// Another transfer is in flight or the target is the current owner
    HandleConflict(String),
    /// Only an Open connection can be transferred
    NotTransferable(ConnectionStatus),
    /// Target mailbox or acknowledged slot went away
    OwnerGone,
}

impl fmt::Display for OwnershipTransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AckTimeout(after) => {
                write!(f, "transfer not acknowledged within {}ms", after.as_millis())
            }
            Self::Declined => write!(f, "transfer declined by target"),
            Self::HandleConflict(detail) => write!(f, "transport handle conflict: {}", detail),
            Self::NotTransferable(status) => {
                write!(f, "connection in state {} cannot be transferred", status)
            }
            Self::OwnerGone => write!(f, "transfer counterpart went away"),
        }
    }
}

impl std::error::Error for OwnershipTransferError {}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config `{}`: {}", self.field, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Top-level error for link operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    Transport(TransportError),
    Protocol(ProtocolViolation),
    Recovery(RecoveryError),
    Transfer(OwnershipTransferError),
    Config(ConfigError),
    /// Maximum reconnect attempts used up; the connection is closed
    ReconnectExhausted { attempts: u32 },
    /// Event not valid for the current state
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// Request made against a connection that already reached Closed or Failed
    Terminal(ConnectionStatus),
    /// Coordinating task is no longer running
    OwnerUnavailable,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Protocol(v) => write!(f, "protocol violation: {}", v),
            Self::Recovery(e) => write!(f, "{}", e),
            Self::Transfer(e) => write!(f, "ownership transfer failed: {}", e),
            Self::Config(e) => write!(f, "{}", e),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "reconnect exhausted after {} attempts", attempts)
            }
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition {} -> {}", from, to)
            }
            Self::Terminal(status) => write!(f, "connection is terminal ({})", status),
            Self::OwnerUnavailable => write!(f, "connection owner task is not running"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<ProtocolViolation> for LinkError {
    fn from(err: ProtocolViolation) -> Self {
        Self::Protocol(err)
    }
}

impl From<RecoveryError> for LinkError {
    fn from(err: RecoveryError) -> Self {
        Self::Recovery(err)
    }
}

impl From<OwnershipTransferError> for LinkError {
    fn from(err: OwnershipTransferError) -> Self {
        Self::Transfer(err)
    }
}

impl From<ConfigError> for LinkError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<UpgradeError> for LinkError {
    fn from(err: UpgradeError) -> Self {
        match err {
            UpgradeError::Rejected(e) => Self::Transport(e),
            UpgradeError::Malformed(v) => Self::Protocol(v),
        }
    }
}

pub type LinkResult<T> = std::result::Result<T, LinkError>;
