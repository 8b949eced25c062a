//! Platform heartbeat capability: detection and reply construction.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;

/// Profile-specific evidence that a frame was a liveness probe
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatToken {
    /// Control-frame probe; carries the ping payload
    Control(Vec<u8>),
    /// Text probe matched literally
    Literal(String),
    /// JSON probe; carries the parsed message
    Json(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Heartbeat(HeartbeatToken),
    NotHeartbeat,
}

/// What the profile wants sent back for a probe
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatReply {
    Send(Frame),
    /// Receipt is the acknowledgment; counts as an immediate success
    NoResponse,
    /// Probe recognised but no reply can be built; counts as a failure
    Decline(String),
}

/// Exchange-specific liveness rules injected into the generic core
pub trait HeartbeatProfile: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn detect(&self, frame: &Frame) -> Detection;

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply;
}

/// Active heartbeat profile with its deadline and failure budget
#[derive(Clone)]
pub struct HeartbeatConfig {
    profile: Arc<dyn HeartbeatProfile>,
    timeout: Duration,
    failure_threshold: u32,
}

impl HeartbeatConfig {
    pub fn new(profile: Arc<dyn HeartbeatProfile>, timeout: Duration, failure_threshold: u32) -> Self {
        Self {
            profile,
            timeout,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn detect(&self, frame: &Frame) -> Detection {
        self.profile.detect(frame)
    }

    pub fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        self.profile.respond(token)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn profile_name(&self) -> &str {
        self.profile.name()
    }
}

impl fmt::Debug for HeartbeatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatConfig")
            .field("profile", &self.profile.name())
            .field("timeout_ms", &self.timeout.as_millis())
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}
