//! Shared helpers for link integration tests
//!
//! All tests run on a paused clock: timers fire as soon as every task is idle.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use exchange_link::telemetry::NullTelemetry;
use exchange_link::transport::MemoryTransport;
use exchange_link::{
    ConnectionSnapshot, ConnectionStatus, Link, LinkConfig, LinkHandle, LinkMessage, SpawnedLink,
};

pub fn config() -> LinkConfig {
    let mut config = LinkConfig::new("ws://exchange.test/ws");
    config.backoff.seed = Some(42);
    config.heartbeat.timeout_ms = 500;
    config
}

pub fn spawn(transport: &MemoryTransport, config: LinkConfig) -> SpawnedLink {
    Link::builder(config)
        .transport(Arc::new(transport.clone()))
        .telemetry(Arc::new(NullTelemetry))
        .spawn()
        .expect("valid config")
}

/// Collect messages until the link enters `status`
pub async fn until_status(
    messages: &mut UnboundedReceiver<LinkMessage>,
    status: ConnectionStatus,
) -> Vec<LinkMessage> {
    let mut seen = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(120), messages.recv())
            .await
            .unwrap_or_else(|_| panic!("no transition to {} within 120s: {:?}", status, seen))
            .unwrap_or_else(|| panic!("link stopped before {}: {:?}", status, seen));
        let reached = matches!(message, LinkMessage::StateChanged { to, .. } if to == status);
        seen.push(message);
        if reached {
            return seen;
        }
    }
}

/// Next message that is not a state change
pub async fn next_payload(messages: &mut UnboundedReceiver<LinkMessage>) -> LinkMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(30), messages.recv())
            .await
            .expect("message within 30s")
            .expect("link still running");
        if !matches!(message, LinkMessage::StateChanged { .. }) {
            return message;
        }
    }
}

/// Transitions in `messages`, in order
pub fn transitions(messages: &[LinkMessage]) -> Vec<(ConnectionStatus, ConnectionStatus)> {
    messages
        .iter()
        .filter_map(|m| match m {
            LinkMessage::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

/// Poll `check` while letting the runtime make progress
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Poll snapshots until `check` holds; heartbeat settlements land asynchronously
pub async fn snapshot_until(
    handle: &LinkHandle,
    check: impl Fn(&ConnectionSnapshot) -> bool,
) -> ConnectionSnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.expect("link running");
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("snapshot condition not reached");
}
