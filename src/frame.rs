//! Inbound/outbound frame model shared by transports, profiles and the state machine.

use std::fmt;

/// Close handshake details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;

    pub fn normal() -> Self {
        Self {
            code: Self::NORMAL,
            reason: String::new(),
        }
    }
}

/// A single WebSocket message as seen by the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

impl Frame {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    /// Serialize a JSON value into a text frame
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(body) => Some(body),
            _ => None,
        }
    }

    /// Parse a text frame as JSON. Binary frames are tried as UTF-8 JSON as well.
    pub fn parse_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Text(body) => serde_json::from_str(body).ok(),
            Self::Binary(bytes) => serde_json::from_slice(bytes).ok(),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close(_) => "close",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Text(body) => body.len(),
            Self::Binary(bytes) | Self::Ping(bytes) | Self::Pong(bytes) => bytes.len(),
            Self::Close(reason) => reason.as_ref().map(|r| r.reason.len() + 2).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(body) => {
                let preview: String = body.chars().take(120).collect();
                write!(f, "text({})", preview)
            }
            Self::Close(Some(reason)) => write!(f, "close({} {})", reason.code, reason.reason),
            other => write!(f, "{}[{}]", other.kind(), other.len()),
        }
    }
}
