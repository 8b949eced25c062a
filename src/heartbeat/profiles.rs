//! Built-in heartbeat profiles for common exchange conventions
//!
//! - `ControlPing`: WebSocket ping control frames answered with a pong (Binance)
//! - `TextPing`: literal "ping" text answered with "pong" (OKX)
//! - `JsonOp`: `{"op":"ping"}` answered with `{"op":"pong"}` (Bybit-style)
//! - `JsonRpcHeartbeat`: `test_request` heartbeats answered with `public/test` (Deribit)
//! - `ReceiptOnly`: heartbeat notifications that need no reply (Kraken)
//! - `Chain`: several of the above on one connection, first match wins

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::profile::{Detection, HeartbeatProfile, HeartbeatReply, HeartbeatToken};
use crate::frame::Frame;

/// Serializable selection of a built-in profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileKind {
    ControlPing,
    TextPing {
        #[serde(default = "default_ping")]
        probe: String,
        #[serde(default = "default_pong")]
        reply: String,
    },
    JsonOp {
        #[serde(default = "default_op_field")]
        field: String,
        #[serde(default = "default_ping")]
        probe: String,
        #[serde(default = "default_pong")]
        reply: String,
    },
    JsonRpcHeartbeat {
        #[serde(default = "default_rpc_method")]
        method: String,
        #[serde(default = "default_reply_method")]
        reply_method: String,
    },
    ReceiptOnly {
        #[serde(default = "default_channel_field")]
        field: String,
        #[serde(default = "default_rpc_method")]
        value: String,
    },
    Chain {
        profiles: Vec<ProfileKind>,
    },
}

fn default_ping() -> String {
    "ping".to_string()
}

fn default_pong() -> String {
    "pong".to_string()
}

fn default_op_field() -> String {
    "op".to_string()
}

fn default_rpc_method() -> String {
    "heartbeat".to_string()
}

fn default_reply_method() -> String {
    "public/test".to_string()
}

fn default_channel_field() -> String {
    "channel".to_string()
}

impl Default for ProfileKind {
    fn default() -> Self {
        Self::ControlPing
    }
}

impl ProfileKind {
    pub fn build(&self) -> Arc<dyn HeartbeatProfile> {
        match self {
            Self::ControlPing => Arc::new(ControlPingProfile),
            Self::TextPing { probe, reply } => Arc::new(TextPingProfile::new(probe, reply)),
            Self::JsonOp {
                field,
                probe,
                reply,
            } => Arc::new(JsonOpProfile::new(field, probe, reply)),
            Self::JsonRpcHeartbeat {
                method,
                reply_method,
            } => Arc::new(JsonRpcHeartbeatProfile::new(method, reply_method)),
            Self::ReceiptOnly { field, value } => Arc::new(ReceiptOnlyProfile::new(field, value)),
            Self::Chain { profiles } => {
                Arc::new(ProfileChain::new(profiles.iter().map(|p| p.build()).collect()))
            }
        }
    }
}

/// Ping control frame → pong with the same payload
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlPingProfile;

impl HeartbeatProfile for ControlPingProfile {
    fn name(&self) -> &str {
        "control_ping"
    }

    fn detect(&self, frame: &Frame) -> Detection {
        match frame {
            Frame::Ping(payload) => Detection::Heartbeat(HeartbeatToken::Control(payload.clone())),
            _ => Detection::NotHeartbeat,
        }
    }

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        match token {
            HeartbeatToken::Control(payload) => HeartbeatReply::Send(Frame::Pong(payload.clone())),
            other => HeartbeatReply::Decline(format!("unexpected token {:?}", other)),
        }
    }
}

/// Literal text probe
#[derive(Debug, Clone)]
pub struct TextPingProfile {
    probe: String,
    reply: String,
}

impl TextPingProfile {
    pub fn new(probe: &str, reply: &str) -> Self {
        Self {
            probe: probe.to_string(),
            reply: reply.to_string(),
        }
    }
}

impl HeartbeatProfile for TextPingProfile {
    fn name(&self) -> &str {
        "text_ping"
    }

    fn detect(&self, frame: &Frame) -> Detection {
        match frame {
            Frame::Text(body) if body.trim() == self.probe => {
                Detection::Heartbeat(HeartbeatToken::Literal(self.probe.clone()))
            }
            _ => Detection::NotHeartbeat,
        }
    }

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        match token {
            HeartbeatToken::Literal(_) => HeartbeatReply::Send(Frame::text(self.reply.clone())),
            other => HeartbeatReply::Decline(format!("unexpected token {:?}", other)),
        }
    }
}

/// `{"<field>":"<probe>"}` answered with `{"<field>":"<reply>"}`.
/// A `req_id` on the probe is echoed back.
#[derive(Debug, Clone)]
pub struct JsonOpProfile {
    field: String,
    probe: String,
    reply: String,
}

impl JsonOpProfile {
    pub fn new(field: &str, probe: &str, reply: &str) -> Self {
        Self {
            field: field.to_string(),
            probe: probe.to_string(),
            reply: reply.to_string(),
        }
    }
}

impl HeartbeatProfile for JsonOpProfile {
    fn name(&self) -> &str {
        "json_op"
    }

    fn detect(&self, frame: &Frame) -> Detection {
        let Frame::Text(body) = frame else {
            return Detection::NotHeartbeat;
        };
        // Cheap substring check keeps JSON parsing off the market-data path
        if !body.contains(self.probe.as_str()) {
            return Detection::NotHeartbeat;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) if value.get(&self.field).and_then(Value::as_str) == Some(self.probe.as_str()) => {
                Detection::Heartbeat(HeartbeatToken::Json(value))
            }
            _ => Detection::NotHeartbeat,
        }
    }

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        let HeartbeatToken::Json(probe) = token else {
            return HeartbeatReply::Decline(format!("unexpected token {:?}", token));
        };
        let mut reply = serde_json::Map::new();
        reply.insert(self.field.clone(), Value::String(self.reply.clone()));
        if let Some(req_id) = probe.get("req_id") {
            reply.insert("req_id".to_string(), req_id.clone());
        }
        HeartbeatReply::Send(Frame::json(&Value::Object(reply)))
    }
}

/// JSON-RPC heartbeat notifications. Only `test_request` probes need a reply;
/// plain heartbeat notifications are acknowledged by receipt.
#[derive(Debug, Clone)]
pub struct JsonRpcHeartbeatProfile {
    method: String,
    reply_method: String,
}

impl JsonRpcHeartbeatProfile {
    pub fn new(method: &str, reply_method: &str) -> Self {
        Self {
            method: method.to_string(),
            reply_method: reply_method.to_string(),
        }
    }
}

impl Default for JsonRpcHeartbeatProfile {
    fn default() -> Self {
        Self::new("heartbeat", "public/test")
    }
}

impl HeartbeatProfile for JsonRpcHeartbeatProfile {
    fn name(&self) -> &str {
        "json_rpc_heartbeat"
    }

    fn detect(&self, frame: &Frame) -> Detection {
        let Frame::Text(body) = frame else {
            return Detection::NotHeartbeat;
        };
        if !body.contains(self.method.as_str()) {
            return Detection::NotHeartbeat;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) if value.get("method").and_then(Value::as_str) == Some(self.method.as_str()) => {
                Detection::Heartbeat(HeartbeatToken::Json(value))
            }
            _ => Detection::NotHeartbeat,
        }
    }

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        let HeartbeatToken::Json(probe) = token else {
            return HeartbeatReply::Decline(format!("unexpected token {:?}", token));
        };
        let kind = probe
            .get("params")
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        match kind {
            Some("test_request") => HeartbeatReply::Send(Frame::json(&json!({
                "jsonrpc": "2.0",
                "method": self.reply_method,
                "params": {},
            }))),
            _ => HeartbeatReply::NoResponse,
        }
    }
}

/// `{"<field>":"<value>"}` notifications that only need to be received
#[derive(Debug, Clone)]
pub struct ReceiptOnlyProfile {
    field: String,
    value: String,
}

impl ReceiptOnlyProfile {
    pub fn new(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }
}

impl HeartbeatProfile for ReceiptOnlyProfile {
    fn name(&self) -> &str {
        "receipt_only"
    }

    fn detect(&self, frame: &Frame) -> Detection {
        let Frame::Text(body) = frame else {
            return Detection::NotHeartbeat;
        };
        if !body.contains(self.value.as_str()) {
            return Detection::NotHeartbeat;
        }
        match serde_json::from_str::<Value>(body) {
            Ok(value) if value.get(&self.field).and_then(Value::as_str) == Some(self.value.as_str()) => {
                Detection::Heartbeat(HeartbeatToken::Json(value))
            }
            _ => Detection::NotHeartbeat,
        }
    }

    fn respond(&self, _token: &HeartbeatToken) -> HeartbeatReply {
        HeartbeatReply::NoResponse
    }
}

/// Ordered list of profiles; the first detector that matches owns the probe
#[derive(Debug, Clone)]
pub struct ProfileChain {
    profiles: Vec<Arc<dyn HeartbeatProfile>>,
    name: String,
}

impl ProfileChain {
    pub fn new(profiles: Vec<Arc<dyn HeartbeatProfile>>) -> Self {
        let name = format!(
            "chain({})",
            profiles.iter().map(|p| p.name()).collect::<Vec<_>>().join(",")
        );
        Self { profiles, name }
    }
}

impl HeartbeatProfile for ProfileChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, frame: &Frame) -> Detection {
        for (index, profile) in self.profiles.iter().enumerate() {
            if let Detection::Heartbeat(token) = profile.detect(frame) {
                // Remember which profile matched so the reply comes from the same one
                return Detection::Heartbeat(HeartbeatToken::Json(json!({
                    "chain_index": index,
                    "token": encode_token(&token),
                })));
            }
        }
        Detection::NotHeartbeat
    }

    fn respond(&self, token: &HeartbeatToken) -> HeartbeatReply {
        let HeartbeatToken::Json(wrapped) = token else {
            return HeartbeatReply::Decline("chain token expected".to_string());
        };
        let index = wrapped.get("chain_index").and_then(Value::as_u64);
        let inner = wrapped.get("token").and_then(decode_token);
        match (index, inner) {
            (Some(index), Some(inner)) => match self.profiles.get(index as usize) {
                Some(profile) => profile.respond(&inner),
                None => HeartbeatReply::Decline(format!("no profile at index {}", index)),
            },
            _ => HeartbeatReply::Decline("malformed chain token".to_string()),
        }
    }
}

fn encode_token(token: &HeartbeatToken) -> Value {
    match token {
        HeartbeatToken::Control(payload) => json!({ "control": payload }),
        HeartbeatToken::Literal(text) => json!({ "literal": text }),
        HeartbeatToken::Json(value) => json!({ "json": value }),
    }
}

fn decode_token(value: &Value) -> Option<HeartbeatToken> {
    if let Some(payload) = value.get("control") {
        let bytes: Vec<u8> = serde_json::from_value(payload.clone()).ok()?;
        return Some(HeartbeatToken::Control(bytes));
    }
    if let Some(text) = value.get("literal").and_then(Value::as_str) {
        return Some(HeartbeatToken::Literal(text.to_string()));
    }
    value.get("json").cloned().map(HeartbeatToken::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_for(profile: &dyn HeartbeatProfile, frame: &Frame) -> Option<HeartbeatReply> {
        match profile.detect(frame) {
            Detection::Heartbeat(token) => Some(profile.respond(&token)),
            Detection::NotHeartbeat => None,
        }
    }

    #[test]
    fn test_control_ping_echoes_payload() {
        let reply = reply_for(&ControlPingProfile, &Frame::Ping(vec![7, 8])).unwrap();
        assert_eq!(reply, HeartbeatReply::Send(Frame::Pong(vec![7, 8])));
        assert!(reply_for(&ControlPingProfile, &Frame::Pong(vec![])).is_none());
    }

    #[test]
    fn test_text_ping() {
        let profile = TextPingProfile::new("ping", "pong");
        assert_eq!(
            reply_for(&profile, &Frame::text("ping")),
            Some(HeartbeatReply::Send(Frame::text("pong")))
        );
        assert!(reply_for(&profile, &Frame::text("pinged")).is_none());
    }

    #[test]
    fn test_json_op_echoes_req_id() {
        let profile = JsonOpProfile::new("op", "ping", "pong");
        let reply = reply_for(&profile, &Frame::text(r#"{"op":"ping","req_id":"42"}"#)).unwrap();
        let HeartbeatReply::Send(frame) = reply else {
            panic!("expected reply frame");
        };
        let value = frame.parse_json().unwrap();
        assert_eq!(value["op"], "pong");
        assert_eq!(value["req_id"], "42");

        // Market data mentioning "ping" in a field value is not a probe
        assert!(reply_for(&profile, &Frame::text(r#"{"topic":"ping","op":"data"}"#)).is_none());
    }

    #[test]
    fn test_json_rpc_test_request_and_notification() {
        let profile = JsonRpcHeartbeatProfile::default();

        let probe = Frame::text(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#);
        let HeartbeatReply::Send(frame) = reply_for(&profile, &probe).unwrap() else {
            panic!("test_request must be answered");
        };
        assert_eq!(frame.parse_json().unwrap()["method"], "public/test");

        let notice = Frame::text(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"heartbeat"}}"#);
        assert_eq!(reply_for(&profile, &notice), Some(HeartbeatReply::NoResponse));

        let data = Frame::text(r#"{"jsonrpc":"2.0","method":"subscription","params":{}}"#);
        assert!(reply_for(&profile, &data).is_none());
    }

    #[test]
    fn test_receipt_only() {
        let profile = ReceiptOnlyProfile::new("channel", "heartbeat");
        assert_eq!(
            reply_for(&profile, &Frame::text(r#"{"channel":"heartbeat"}"#)),
            Some(HeartbeatReply::NoResponse)
        );
        assert!(reply_for(&profile, &Frame::text(r#"{"channel":"book"}"#)).is_none());
    }

    #[test]
    fn test_chain_routes_reply_to_matching_profile() {
        let chain = ProfileKind::Chain {
            profiles: vec![
                ProfileKind::ControlPing,
                ProfileKind::TextPing {
                    probe: "ping".into(),
                    reply: "pong".into(),
                },
            ],
        }
        .build();

        assert_eq!(
            reply_for(chain.as_ref(), &Frame::Ping(vec![1])),
            Some(HeartbeatReply::Send(Frame::Pong(vec![1])))
        );
        assert_eq!(
            reply_for(chain.as_ref(), &Frame::text("ping")),
            Some(HeartbeatReply::Send(Frame::text("pong")))
        );
        assert!(reply_for(chain.as_ref(), &Frame::text("trade")).is_none());
        assert_eq!(chain.name(), "chain(control_ping,text_ping)");
    }

    #[test]
    fn test_profile_kind_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            profile: ProfileKind,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [profile]
            kind = "json_op"
            field = "event"
            "#,
        )
        .unwrap();
        assert_eq!(
            parsed.profile,
            ProfileKind::JsonOp {
                field: "event".into(),
                probe: "ping".into(),
                reply: "pong".into(),
            }
        );
    }
}
