//! The relay session state machine.
//!
//! ```text
//! AwaitingAuth → Authenticating → Subscribing → Relaying → Closing → Closed
//! ```
//!
//! Any state may jump straight to `Closing`. A session owns its downstream
//! transport and at most one upstream handle; the task driving `run` is the
//! only writer to the transport, so event forwarding and liveness receives
//! never interleave on the wire.
//!
//! Teardown is unconditional: `run` always goes through `close`, including
//! when the driver panics, and `close` releases the upstream handle before
//! the session is dropped.

use crate::authenticator::{AuthFailure, Authenticator};
use crate::monitor::FailureReporter;
use crate::relay::registry::SessionRegistry;
use crate::upstream::{UpstreamConnector, UpstreamHandle};
use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zone_core::messages::Credentials;
use zone_core::{AuthRequest, DeviceBinding, DownstreamTransport, Received, UpstreamEvent};

/// Buffered upstream events per session before the upstream side waits.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Upper bound on a single downstream write.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle states of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Authenticating,
    Subscribing,
    Relaying,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Relaying => "relaying",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away. The normal ending.
    PeerClosed,
    /// Missing, undecodable or incomplete auth message.
    ProtocolViolation,
    /// Unknown identifier or wrong secret. Not distinguished to the client.
    Unauthenticated,
    /// The upstream connection could not be opened or was lost.
    UpstreamUnavailable,
    /// Downstream I/O failed.
    TransportFailure,
    /// Anything unanticipated, including a panic in the driver.
    InternalError,
    /// The relay is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Whether this ending goes to the failure reporter.
    pub fn is_reportable(self) -> bool {
        matches!(self, Self::UpstreamUnavailable | Self::InternalError)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::ProtocolViolation => "protocol violation",
            Self::Unauthenticated => "unauthenticated",
            Self::UpstreamUnavailable => "upstream unavailable",
            Self::TransportFailure => "transport failure",
            Self::InternalError => "internal error",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Upper bound on each liveness receive.
    pub liveness_interval: Duration,
    /// How long to wait for the auth message.
    pub auth_timeout: Duration,
    /// Upper bound on opening the upstream subscription.
    pub connect_timeout: Duration,
    /// Upper bound on forwarding one event to a client that stopped reading.
    pub write_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub authenticator: Arc<Authenticator>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub reporter: Arc<dyn FailureReporter>,
    pub registry: Arc<SessionRegistry>,
    pub settings: SessionSettings,
}

/// Summary returned once a session is fully closed.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub id: String,
    pub reason: CloseReason,
    /// Last state reached before closing.
    pub reached: SessionState,
    pub events_forwarded: u64,
}

/// How the driver ended: a reason plus detail for logs and reports.
struct Termination {
    reason: CloseReason,
    detail: String,
}

impl Termination {
    fn new(reason: CloseReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// One downstream connection and the upstream subscription it drives.
pub struct RelaySession<T: DownstreamTransport> {
    id: String,
    state: SessionState,
    binding: Option<DeviceBinding>,
    upstream: Option<Box<dyn UpstreamHandle>>,
    downstream: T,
    ctx: SessionContext,
    shutdown: watch::Receiver<bool>,
    events_forwarded: u64,
}

impl<T: DownstreamTransport> RelaySession<T> {
    /// Create a session for an accepted transport. `id` must already be
    /// registered with the context's registry.
    pub fn new(id: String, downstream: T, ctx: SessionContext, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id,
            state: SessionState::AwaitingAuth,
            binding: None,
            upstream: None,
            downstream,
            ctx,
            shutdown,
            events_forwarded: 0,
        }
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionOutcome {
        let driven = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let termination = match driven {
            Ok(termination) => termination,
            Err(panic) => Termination::new(
                CloseReason::InternalError,
                format!("session driver panicked: {}", panic_message(&*panic)),
            ),
        };
        self.close(termination).await
    }

    async fn drive(&mut self) -> Termination {
        let credentials = match self.await_credentials().await {
            Ok(credentials) => credentials,
            Err(termination) => return termination,
        };

        self.transition(SessionState::Authenticating).await;
        let binding = match self.authenticate(&credentials).await {
            Ok(binding) => binding,
            Err(termination) => return termination,
        };
        self.ctx
            .registry
            .set_device(&self.id, binding.target().to_string())
            .await;
        self.binding = Some(binding);

        self.transition(SessionState::Subscribing).await;
        let mut events = match self.subscribe().await {
            Ok(events) => events,
            Err(termination) => return termination,
        };

        self.transition(SessionState::Relaying).await;
        self.relay(&mut events).await
    }

    /// AwaitingAuth: read exactly one message and decode it.
    async fn await_credentials(&mut self) -> Result<Credentials, Termination> {
        let timeout = self.ctx.settings.auth_timeout;
        let received = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => {
                return Err(Termination::new(CloseReason::Shutdown, "shutdown before auth"));
            }
            received = self.downstream.receive(timeout) => received,
        };

        match received {
            Ok(Received::Message(data)) => AuthRequest::decode(&data)
                .and_then(AuthRequest::into_credentials)
                .map_err(|e| Termination::new(CloseReason::ProtocolViolation, e.to_string())),
            Ok(Received::Idle) => Err(Termination::new(
                CloseReason::ProtocolViolation,
                "no auth message within timeout",
            )),
            Ok(Received::Closed) => Err(Termination::new(
                CloseReason::ProtocolViolation,
                "closed before auth message",
            )),
            Err(e) => Err(Termination::new(CloseReason::TransportFailure, e.to_string())),
        }
    }

    /// Authenticating: resolve the binding. Failures never reach the client.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<DeviceBinding, Termination> {
        let verified = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => {
                return Err(Termination::new(CloseReason::Shutdown, "shutdown during auth"));
            }
            verified = self.ctx.authenticator.verify(credentials) => verified,
        };

        verified.map_err(|failure| match failure {
            AuthFailure::UnknownIdentifier | AuthFailure::SecretMismatch => {
                Termination::new(CloseReason::Unauthenticated, failure.to_string())
            }
            AuthFailure::Invalid(_) => {
                Termination::new(CloseReason::ProtocolViolation, failure.to_string())
            }
            AuthFailure::StoreUnavailable(_) => {
                Termination::new(CloseReason::InternalError, failure.to_string())
            }
        })
    }

    /// Subscribing: open the one upstream handle for this session.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<UpstreamEvent>, Termination> {
        let Some(target) = self.binding.as_ref().map(DeviceBinding::target) else {
            return Err(Termination::new(CloseReason::InternalError, "subscribe without binding"));
        };

        if let Some(mut prior) = self.upstream.take() {
            warn!("closing stale upstream handle before resubscribing");
            prior.close().await;
        }

        let identity = uuid::Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(self.ctx.settings.event_buffer.max(1));
        let connect_timeout = self.ctx.settings.connect_timeout;

        let opened = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => {
                return Err(Termination::new(CloseReason::Shutdown, "shutdown during subscribe"));
            }
            opened = tokio::time::timeout(
                connect_timeout,
                self.ctx.connector.open(&target, &identity, events_tx),
            ) => opened,
        };

        match opened {
            Ok(Ok(handle)) => {
                info!(device = %target, identity = %identity, "upstream subscription open");
                self.upstream = Some(handle);
                Ok(events_rx)
            }
            Ok(Err(e)) => Err(Termination::new(
                CloseReason::UpstreamUnavailable,
                format!("upstream connect to {target} failed: {e}"),
            )),
            Err(_) => Err(Termination::new(
                CloseReason::UpstreamUnavailable,
                format!("upstream connect to {target} timed out after {connect_timeout:?}"),
            )),
        }
    }

    /// Relaying: forward events and probe the client until one side ends.
    async fn relay(&mut self, events: &mut mpsc::Receiver<UpstreamEvent>) -> Termination {
        let interval = self.ctx.settings.liveness_interval;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    return Termination::new(CloseReason::Shutdown, "relay shutting down");
                }

                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(termination) = self.forward(&event).await {
                            return termination;
                        }
                    }
                    None => {
                        return Termination::new(
                            CloseReason::UpstreamUnavailable,
                            "upstream event stream ended",
                        );
                    }
                },

                // Payloads are ignored; a receive only proves the peer is there.
                received = self.downstream.receive(interval) => match received {
                    Ok(Received::Message(_)) | Ok(Received::Idle) => {}
                    Ok(Received::Closed) => {
                        return Termination::new(CloseReason::PeerClosed, "peer closed");
                    }
                    Err(e) => {
                        return Termination::new(CloseReason::TransportFailure, e.to_string());
                    }
                },
            }
        }
    }

    /// Write one event downstream. A failed write is only fatal once the
    /// transport reports itself closed; a stalled one is fatal after
    /// `write_timeout`. Shutdown is still observed while the write is pending.
    async fn forward(&mut self, event: &UpstreamEvent) -> Result<(), Termination> {
        let write_timeout = self.ctx.settings.write_timeout;
        let written = tokio::select! {
            _ = wait_for_shutdown(&mut self.shutdown) => {
                return Err(Termination::new(CloseReason::Shutdown, "shutdown during write"));
            }
            written = tokio::time::timeout(write_timeout, self.downstream.send(&event.payload)) => written,
        };

        match written {
            Ok(Ok(())) => {
                self.events_forwarded += 1;
                Ok(())
            }
            Ok(Err(e)) if self.downstream.is_open() => {
                warn!(event = %event.event, error = %e, "failed to forward event");
                Ok(())
            }
            Ok(Err(e)) => Err(Termination::new(CloseReason::TransportFailure, e.to_string())),
            Err(_) => Err(Termination::new(
                CloseReason::TransportFailure,
                format!("write to client stalled for {write_timeout:?}"),
            )),
        }
    }

    /// Closing → Closed. Runs on every exit path.
    async fn close(mut self, termination: Termination) -> SessionOutcome {
        let reached = self.state;
        self.transition(SessionState::Closing).await;

        if let Some(mut upstream) = self.upstream.take() {
            upstream.close().await;
        }
        self.downstream.close().await;

        let Termination { reason, detail } = termination;
        match reason {
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                info!(reason = %reason, forwarded = self.events_forwarded, "session closed");
            }
            CloseReason::ProtocolViolation | CloseReason::Unauthenticated => {
                info!(reason = %reason, detail = %detail, "session rejected");
            }
            _ => {
                warn!(reason = %reason, detail = %detail, forwarded = self.events_forwarded, "session failed");
            }
        }
        if reason.is_reportable() {
            self.ctx
                .reporter
                .report(&format!("session {} closed: {reason}", self.id), &detail);
        }

        self.transition(SessionState::Closed).await;
        self.ctx.registry.unregister(&self.id).await;

        SessionOutcome {
            id: self.id,
            reason,
            reached,
            events_forwarded: self.events_forwarded,
        }
    }

    async fn transition(&mut self, next: SessionState) {
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        self.ctx.registry.set_state(&self.id, next).await;
    }
}

/// Resolve once shutdown has been requested. Never resolves if the sender
/// is gone without requesting it.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Generate a random session ID.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
