//! Real-time WebSocket connection to the delivery server.
//!
//! [`RealtimeConnection::connect`] performs the authenticated upgrade, waits
//! for the server's `ready` frame, and spawns a background reader that
//! forwards every decoded [`ServerFrame`] into a channel. Frames arrive on
//! that channel in socket order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_proto::frame::{self, ClientFrame, ServerFrame};
use courier_proto::message::Identity;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::TransportError;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// An authenticated real-time connection.
pub struct RealtimeConnection {
    identity: Identity,
    ws_sender: Mutex<WsSender>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RealtimeConnection {
    /// Connects to `url` with `token` as bearer credential.
    ///
    /// Waits up to `timeout` for both the upgrade and the `ready` frame.
    /// Every frame after `ready` is sent to `frames`; the channel closes
    /// when the socket does.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the server does not answer in time.
    /// - [`TransportError::Unauthorized`] if the credential is refused.
    /// - [`TransportError::Handshake`] if the first frame is not `ready`.
    pub async fn connect(
        url: &str,
        token: &str,
        timeout: Duration,
        frames: mpsc::Sender<ServerFrame>,
    ) -> Result<Self, TransportError> {
        let mut request = url.into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Handshake(format!("invalid token: {e}")))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, error = %e, "WebSocket connect failed");
                map_connect_error(e)
            })?;

        let (ws_sender, mut ws_reader) = ws_stream.split();

        let first = tokio::time::timeout(timeout, ws_reader.next())
            .await
            .map_err(|_| TransportError::Timeout)?;
        let identity = match first {
            Some(Ok(Message::Text(text))) => match frame::decode::<ServerFrame>(text.as_str())? {
                ServerFrame::Ready { identity } => identity,
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected ready, got {other:?}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::ConnectionClosed),
            Some(Ok(other)) => {
                return Err(TransportError::Handshake(format!(
                    "unexpected frame during handshake: {other:?}"
                )));
            }
            Some(Err(e)) => return Err(e.into()),
        };
        tracing::info!(identity = %identity, url, "real-time connection ready");

        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, frames, Arc::clone(&connected)));

        Ok(Self {
            identity,
            ws_sender: Mutex::new(ws_sender),
            connected,
            reader_handle,
        })
    }

    /// Identity the server authenticated us as.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns `true` while the socket is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the socket is down or
    /// the write fails.
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let text = frame::encode(frame)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::Text(text.into())).await.map_err(|e| {
            tracing::warn!(error = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    /// Sends a close frame and stops the reader.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        let _ = sender.close().await;
        drop(sender);
        self.reader_handle.abort();
    }
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Reads frames until the socket closes. Malformed frames are logged and
/// skipped.
async fn reader_loop(mut ws_reader: WsReader, frames: mpsc::Sender<ServerFrame>, connected: Arc<AtomicBool>) {
    while let Some(msg) = ws_reader.next().await {
        match msg {
            Ok(Message::Text(text)) => match frame::decode::<ServerFrame>(text.as_str()) {
                Ok(frame) => {
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed server frame, skipping"),
            },
            Ok(Message::Close(_)) => {
                tracing::info!("server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("reader task exiting");
}

/// Maps a connect error, surfacing a refused credential distinctly.
fn map_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
            TransportError::Unauthorized
        }
        WsError::Http(response) => {
            TransportError::Handshake(format!("HTTP status {}", response.status()))
        }
        other => TransportError::WebSocket(other),
    }
}
