//! Heartbeat handling: per-exchange profiles, response statistics and the
//! manager that turns probes into deadline-bound replies.

pub mod manager;
pub mod profile;
pub mod profiles;
pub mod window;

pub use manager::{
    deliver, HeartbeatManager, HeartbeatStatus, HeartbeatVerdict, Observation, ResponseDispatch,
    SendOutcome,
};
pub use profile::{Detection, HeartbeatConfig, HeartbeatProfile, HeartbeatReply, HeartbeatToken};
pub use profiles::{
    ControlPingProfile, JsonOpProfile, JsonRpcHeartbeatProfile, ProfileChain, ProfileKind,
    ReceiptOnlyProfile, TextPingProfile,
};
pub use window::{ResponseSample, ResponseWindow, RESPONSE_WINDOW_CAPACITY};
