//! WebSocket listener and transport using tokio-tungstenite.
//!
//! Only upgrades on the configured path are accepted; anything else gets a
//! plain 404 during the handshake. Each accepted socket is wrapped in a
//! [`WsTransport`] owned by exactly one relay session.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use zone_core::{DownstreamTransport, Received, ZoneError, ZoneResult};

/// Maximum inbound message size (1 MiB), text or binary.
const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// Upper bound on the opening handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on flushing our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// An accepted, upgraded connection.
pub struct WsConnection {
    pub transport: WsTransport,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener on `bind_addr`, upgrading only `path`.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    path: &str,
) -> ZoneResult<(SocketAddr, mpsc::Receiver<WsConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ZoneError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, path = %path, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WsConnection>(64);
    let path = path.to_string();

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        let upgrade = tokio::time::timeout(HANDSHAKE_TIMEOUT, upgrade(stream, &path));
                        match upgrade.await {
                            Ok(Ok(ws)) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WsConnection {
                                    transport: WsTransport::new(ws),
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    debug!("WebSocket connection channel closed");
                                }
                            }
                            Ok(Err(e)) => {
                                debug!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                            Err(_) => {
                                warn!(remote = %addr, "WebSocket handshake timed out");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

async fn upgrade(stream: TcpStream, path: &str) -> Result<WebSocketStream<TcpStream>, WsError> {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };
    tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(ws_config())).await
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    config
}

/// A server-side WebSocket as a [`DownstreamTransport`].
pub struct WsTransport {
    ws: WebSocketStream<TcpStream>,
    open: bool,
    closed: bool,
}

impl WsTransport {
    pub fn new(ws: WebSocketStream<TcpStream>) -> Self {
        Self {
            ws,
            open: true,
            closed: false,
        }
    }

    fn fail(&mut self, e: WsError) -> ZoneError {
        if matches!(
            e,
            WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) | WsError::Capacity(_)
        ) {
            self.open = false;
        }
        ZoneError::Transport(format!("WS {e}"))
    }
}

impl DownstreamTransport for WsTransport {
    /// UTF-8 payloads go out as text frames, anything else as binary.
    async fn send(&mut self, payload: &[u8]) -> ZoneResult<()> {
        if !self.open {
            return Err(ZoneError::Transport("WS connection closed".into()));
        }
        let message = match std::str::from_utf8(payload) {
            Ok(text) => Message::Text(text.to_string().into()),
            Err(_) => Message::Binary(payload.to_vec().into()),
        };
        match self.ws.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn receive(&mut self, timeout: Duration) -> ZoneResult<Received> {
        if !self.open {
            return Ok(Received::Closed);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(next) => next,
                Err(_) => return Ok(Received::Idle),
            };
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Received::Message(text.as_bytes().to_vec())),
                Some(Ok(Message::Binary(data))) => return Ok(Received::Message(data.to_vec())),
                Some(Ok(Message::Close(_))) | None => {
                    self.open = false;
                    return Ok(Received::Closed);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    self.open = false;
                    return Ok(Received::Closed);
                }
                Some(Err(e)) => return Err(self.fail(e)),
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;
        if tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await.is_err() {
            debug!("WS close frame not flushed in time");
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
