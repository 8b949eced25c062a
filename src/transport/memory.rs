//! In-process transport with a scriptable remote side
//!
//! Each `open` consumes the next [`OpenBehavior`] from the script (default
//! `Accept`) and registers a [`MemoryRemote`] that tests use to push frames,
//! drop the connection and inspect what the link sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

use super::{
    DisconnectReason, FrameWriter, OpenOptions, TransportChannel, TransportEvent, TransportEvents,
    TransportHandle, UpgradeAck, UpgradeRequest,
};
use crate::error::{ProtocolViolation, TransportError, TransportErrorKind, UpgradeError};
use crate::frame::Frame;

/// Outcome of the next `open` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehavior {
    Accept,
    RefuseConnect,
    RejectUpgrade(u16),
    MalformedUpgrade,
}

/// How the remote treats frames the link writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Deliver,
    /// Fail the next `n` sends, then deliver
    FailNext(u32),
    FailAll,
    /// Never complete; the writer reports a timeout at the deadline
    Stall,
}

#[derive(Default)]
struct Shared {
    script: VecDeque<OpenBehavior>,
    remotes: Vec<MemoryRemote>,
    opens: usize,
}

/// Transport factory backed by in-process channels
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    opened: Arc<Notify>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for upcoming `open` calls
    pub fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.shared.lock().script.extend(behaviors);
    }

    /// Number of `open` calls so far, including refused ones
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    /// Remote side of the n-th accepted connection
    pub fn remote(&self, index: usize) -> Option<MemoryRemote> {
        self.shared.lock().remotes.get(index).cloned()
    }

    pub fn remotes(&self) -> Vec<MemoryRemote> {
        self.shared.lock().remotes.clone()
    }

    /// Wait until the n-th accepted connection exists
    pub async fn wait_for_remote(&self, index: usize) -> MemoryRemote {
        loop {
            let notified = self.opened.notified();
            if let Some(remote) = self.remote(index) {
                return remote;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TransportChannel for MemoryTransport {
    async fn open(
        &self,
        endpoint: &str,
        options: &OpenOptions,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let behavior = {
            let mut shared = self.shared.lock();
            shared.opens += 1;
            shared.script.pop_front().unwrap_or(OpenBehavior::Accept)
        };

        if behavior == OpenBehavior::RefuseConnect {
            return Err(TransportError::connect(format!("{} refused connection", endpoint)));
        }

        let (events_tx, events_rx) = mpsc::channel(options.event_capacity);
        let remote = MemoryRemote {
            inner: Arc::new(RemoteInner {
                events: events_tx,
                sent: Mutex::new(Vec::new()),
                send_mode: Mutex::new(SendMode::Deliver),
                closed: AtomicBool::new(false),
                upgraded: AtomicBool::new(false),
                send_attempts: AtomicUsize::new(0),
            }),
        };
        self.shared.lock().remotes.push(remote.clone());
        self.opened.notify_waiters();

        Ok(Box::new(MemoryHandle {
            remote,
            behavior,
            events: Some(events_rx),
        }))
    }
}

struct RemoteInner {
    events: mpsc::Sender<TransportEvent>,
    sent: Mutex<Vec<Frame>>,
    send_mode: Mutex<SendMode>,
    closed: AtomicBool,
    upgraded: AtomicBool,
    send_attempts: AtomicUsize,
}

/// Remote end of one in-memory connection
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<RemoteInner>,
}

impl MemoryRemote {
    /// Deliver a frame to the link. Returns false if the link stopped reading.
    pub fn push(&self, frame: Frame) -> bool {
        self.inner.events.try_send(TransportEvent::Frame(frame)).is_ok()
    }

    pub fn push_text(&self, body: &str) -> bool {
        self.push(Frame::text(body))
    }

    /// Inject an arbitrary transport event
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.inner.events.try_send(event).is_ok()
    }

    /// Drop the connection from the remote side
    pub fn disconnect(&self) -> bool {
        self.emit(TransportEvent::Disconnected(DisconnectReason::StreamEnded))
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        *self.inner.send_mode.lock() = mode;
    }

    /// Frames the link successfully wrote
    pub fn sent(&self) -> Vec<Frame> {
        self.inner.sent.lock().clone()
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.send_attempts.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner.upgraded.load(Ordering::Relaxed)
    }
}

struct MemoryHandle {
    remote: MemoryRemote,
    behavior: OpenBehavior,
    events: Option<TransportEvents>,
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn upgrade(&mut self, _request: &UpgradeRequest) -> Result<UpgradeAck, UpgradeError> {
        match self.behavior {
            OpenBehavior::RejectUpgrade(status) => Err(UpgradeError::Rejected(
                TransportError::upgrade(format!("server answered {}", status)),
            )),
            OpenBehavior::MalformedUpgrade => Err(UpgradeError::Malformed(
                ProtocolViolation::MalformedUpgrade("missing Sec-WebSocket-Accept".into()),
            )),
            OpenBehavior::Accept | OpenBehavior::RefuseConnect => {
                self.remote.inner.upgraded.store(true, Ordering::Relaxed);
                Ok(UpgradeAck::switching_protocols())
            }
        }
    }

    fn writer(&self) -> Option<Arc<dyn FrameWriter>> {
        if self.remote.is_upgraded() {
            Some(Arc::new(MemoryWriter {
                remote: self.remote.clone(),
            }))
        } else {
            None
        }
    }

    fn monitor(&mut self) -> Option<TransportEvents> {
        if self.remote.is_upgraded() {
            self.events.take()
        } else {
            None
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.remote.inner.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

struct MemoryWriter {
    remote: MemoryRemote,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&self, frame: Frame, deadline: Instant) -> Result<(), TransportError> {
        let inner = &self.remote.inner;
        inner.send_attempts.fetch_add(1, Ordering::Relaxed);
        if inner.closed.load(Ordering::Relaxed) {
            return Err(TransportError::closed());
        }

        let mode = {
            let mut mode = inner.send_mode.lock();
            let current = *mode;
            if let SendMode::FailNext(n) = current {
                *mode = if n <= 1 {
                    SendMode::Deliver
                } else {
                    SendMode::FailNext(n - 1)
                };
            }
            current
        };

        match mode {
            SendMode::Deliver => {
                inner.sent.lock().push(frame);
                Ok(())
            }
            SendMode::FailNext(_) | SendMode::FailAll => Err(TransportError::send("remote rejected write")),
            SendMode::Stall => {
                sleep_until(deadline).await;
                Err(TransportError::new(TransportErrorKind::SendTimeout, "deadline exceeded"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_scripted_open_and_remote() {
        let transport = MemoryTransport::new();
        transport.script([OpenBehavior::RefuseConnect]);

        let err = transport.open("mem://a", &OpenOptions::default()).await.err().unwrap();
        assert_eq!(err.kind, TransportErrorKind::Connect);

        let mut handle = transport.open("mem://a", &OpenOptions::default()).await.unwrap();
        assert!(handle.writer().is_none());
        handle.upgrade(&UpgradeRequest::default()).await.unwrap();

        let mut events = handle.monitor().unwrap();
        let remote = transport.wait_for_remote(0).await;
        assert!(remote.push_text("hello"));
        assert_eq!(events.recv().await, Some(TransportEvent::Frame(Frame::text("hello"))));

        let writer = handle.writer().unwrap();
        writer
            .send(Frame::text("out"), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(remote.sent(), vec![Frame::text("out")]);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_then_deliver() {
        let transport = MemoryTransport::new();
        let mut handle = transport.open("mem://a", &OpenOptions::default()).await.unwrap();
        handle.upgrade(&UpgradeRequest::default()).await.unwrap();
        let remote = transport.remote(0).unwrap();
        remote.set_send_mode(SendMode::FailNext(1));

        let writer = handle.writer().unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(writer.send(Frame::text("a"), deadline).await.is_err());
        assert!(writer.send(Frame::text("b"), deadline).await.is_ok());
        assert_eq!(remote.sent(), vec![Frame::text("b")]);
        assert_eq!(remote.send_attempts(), 2);
    }
}
