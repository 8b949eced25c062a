//! WebSocket transport over tokio-tungstenite
//!
//! `open` performs the TCP connect (with TCP_NODELAY for low-latency replies),
//! `upgrade` performs TLS + the WebSocket handshake on that stream. The read half
//! runs in its own task and feeds the event channel; the write half sits behind
//! an async mutex so heartbeat replies and application sends share one sink.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{
    DisconnectReason, FrameWriter, OpenOptions, TransportChannel, TransportEvent, TransportEvents,
    TransportHandle, UpgradeAck, UpgradeRequest,
};
use crate::error::{ProtocolViolation, TransportError, TransportErrorKind, UpgradeError};
use crate::frame::{CloseReason, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections to exchange endpoints
#[derive(Debug, Clone, Default)]
pub struct TungsteniteChannel;

impl TungsteniteChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportChannel for TungsteniteChannel {
    async fn open(
        &self,
        endpoint: &str,
        options: &OpenOptions,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| TransportError::connect(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let host = uri
            .host()
            .ok_or_else(|| TransportError::connect(format!("endpoint {} has no host", endpoint)))?
            .to_string();
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
            Some("wss") | Some("https") => 443,
            _ => 80,
        });

        debug!(host = %host, port, "tcp_connect");
        let stream = timeout(options.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::timeout(TransportErrorKind::ConnectTimeout, options.connect_timeout))?
            .map_err(|e| TransportError::connect(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "tcp_nodelay_failed");
        }

        Ok(Box::new(TungsteniteHandle {
            uri,
            options: options.clone(),
            state: HandleState::Connected(stream),
        }))
    }
}

enum HandleState {
    Connected(TcpStream),
    Upgraded {
        writer: Arc<TungsteniteWriter>,
        events: Option<TransportEvents>,
        reader: JoinHandle<()>,
    },
    Closed,
}

struct TungsteniteHandle {
    uri: Uri,
    options: OpenOptions,
    state: HandleState,
}

impl TungsteniteHandle {
    fn request_url(&self, path: &str) -> String {
        let scheme = self.uri.scheme_str().unwrap_or("wss");
        let authority = self
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let path = if path.is_empty() {
            self.uri
                .path_and_query()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| "/".to_string())
        } else {
            path.to_string()
        };
        format!("{}://{}{}", scheme, authority, path)
    }
}

#[async_trait]
impl TransportHandle for TungsteniteHandle {
    async fn upgrade(&mut self, request: &UpgradeRequest) -> Result<UpgradeAck, UpgradeError> {
        let stream = match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Connected(stream) => stream,
            other => {
                self.state = other;
                return Err(UpgradeError::Rejected(TransportError::upgrade(
                    "handle is not awaiting upgrade",
                )));
            }
        };

        let url = self.request_url(&request.path);
        let mut http_request = url.clone().into_client_request().map_err(|e| {
            UpgradeError::Rejected(TransportError::upgrade(format!("bad upgrade request: {}", e)))
        })?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                UpgradeError::Rejected(TransportError::upgrade(format!("header {}: {}", name, e)))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                UpgradeError::Rejected(TransportError::upgrade(format!("header value: {}", e)))
            })?;
            http_request.headers_mut().insert(name, value);
        }

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.options.max_message_size);
        ws_config.max_frame_size = Some(self.options.max_message_size.min(4 * 1024 * 1024));

        let (ws, response) = client_async_tls_with_config(http_request, stream, Some(ws_config), None)
            .await
            .map_err(classify_handshake_error)?;

        if response.status().as_u16() != 101 {
            return Err(UpgradeError::Malformed(ProtocolViolation::MalformedUpgrade(format!(
                "unexpected status {}",
                response.status()
            ))));
        }
        let protocol = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        info!(url = %url, status = response.status().as_u16(), "websocket_upgraded");

        let (sink, stream) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(self.options.event_capacity);
        let reader = tokio::spawn(read_loop(stream, events_tx));

        self.state = HandleState::Upgraded {
            writer: Arc::new(TungsteniteWriter {
                sink: Mutex::new(sink),
            }),
            events: Some(events_rx),
            reader,
        };

        Ok(UpgradeAck {
            status: 101,
            protocol,
        })
    }

    fn writer(&self) -> Option<Arc<dyn FrameWriter>> {
        match &self.state {
            HandleState::Upgraded { writer, .. } => Some(writer.clone() as Arc<dyn FrameWriter>),
            _ => None,
        }
    }

    fn monitor(&mut self) -> Option<TransportEvents> {
        match &mut self.state {
            HandleState::Upgraded { events, .. } => events.take(),
            _ => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Upgraded { writer, reader, .. } => {
                let mut sink = writer.sink.lock().await;
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                }));
                // Remote may already be gone; closing is best effort.
                if let Err(e) = sink.send(close).await {
                    debug!(error = %e, "close_frame_not_sent");
                }
                let _ = sink.close().await;
                reader.abort();
                Ok(())
            }
            HandleState::Connected(_) | HandleState::Closed => Ok(()),
        }
    }
}

impl Drop for TungsteniteHandle {
    fn drop(&mut self) {
        if let HandleState::Upgraded { reader, .. } = &self.state {
            reader.abort();
        }
    }
}

struct TungsteniteWriter {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl FrameWriter for TungsteniteWriter {
    async fn send(&self, frame: Frame, deadline: Instant) -> Result<(), TransportError> {
        let message = into_message(frame);
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        match timeout_at(deadline, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::send(e.to_string())),
            Err(_) => Err(TransportError::new(TransportErrorKind::SendTimeout, "deadline exceeded")),
        }
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    events: mpsc::Sender<TransportEvent>,
) {
    if events.send(TransportEvent::Connected).await.is_err() {
        return;
    }

    let reason = loop {
        match stream.next().await {
            Some(Ok(message)) => {
                let event = match from_message(message) {
                    Ok(Frame::Close(close)) => {
                        let (code, reason) = close
                            .map(|c| (c.code, c.reason))
                            .unwrap_or((CloseReason::NORMAL, String::new()));
                        break DisconnectReason::RemoteClose { code, reason };
                    }
                    Ok(frame) => TransportEvent::Frame(frame),
                    Err(violation) => TransportEvent::Violation(violation),
                };
                if events.send(event).await.is_err() {
                    // Owner dropped the stream
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = events
                    .send(TransportEvent::Error(TransportError::new(
                        TransportErrorKind::Closed,
                        e.to_string(),
                    )))
                    .await;
                break DisconnectReason::Error(e.to_string());
            }
            None => break DisconnectReason::StreamEnded,
        }
    };

    debug!(reason = %reason, "reader_finished");
    let _ = events.send(TransportEvent::Disconnected(reason)).await;
}

fn classify_handshake_error(err: tungstenite::Error) -> UpgradeError {
    match err {
        tungstenite::Error::Http(response) => UpgradeError::Rejected(TransportError::upgrade(
            format!("server answered {}", response.status()),
        )),
        tungstenite::Error::Protocol(p) => {
            UpgradeError::Malformed(ProtocolViolation::MalformedUpgrade(p.to_string()))
        }
        tungstenite::Error::HttpFormat(e) => {
            UpgradeError::Malformed(ProtocolViolation::MalformedUpgrade(e.to_string()))
        }
        other => UpgradeError::Rejected(TransportError::upgrade(other.to_string())),
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(body) => Message::Text(body),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Ping(bytes) => Message::Ping(bytes),
        Frame::Pong(bytes) => Message::Pong(bytes),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Result<Frame, ProtocolViolation> {
    match message {
        Message::Text(body) => Ok(Frame::Text(body)),
        Message::Binary(bytes) => Ok(Frame::Binary(bytes)),
        Message::Ping(bytes) => Ok(Frame::Ping(bytes)),
        Message::Pong(bytes) => Ok(Frame::Pong(bytes)),
        Message::Close(close) => Ok(Frame::Close(close.map(|c| CloseReason {
            code: u16::from(c.code),
            reason: c.reason.into_owned(),
        }))),
        Message::Frame(raw) => Err(ProtocolViolation::UnrecognizedFrame(format!(
            "raw frame of {} bytes",
            raw.len()
        ))),
    }
}
