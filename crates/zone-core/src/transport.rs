//! Abstract downstream transport contract.
//!
//! The relay session is written against this trait so it does not care
//! whether the client is on a WebSocket or something else. Exactly one task
//! owns a transport, so implementations need no internal locking.

use crate::error::ZoneResult;
use std::time::Duration;

/// Outcome of a single receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete application message.
    Message(Vec<u8>),
    /// Nothing arrived within the timeout; the peer may still be alive.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// A bidirectional message transport facing the client.
#[allow(async_fn_in_trait)]
pub trait DownstreamTransport: Send {
    /// Send one message to the client.
    async fn send(&mut self, payload: &[u8]) -> ZoneResult<()>;

    /// Wait up to `timeout` for the next message.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message that has not yet been returned.
    async fn receive(&mut self, timeout: Duration) -> ZoneResult<Received>;

    /// Close the transport. Idempotent; safe after the peer has gone.
    async fn close(&mut self);

    /// Whether `close` has not been called and the peer has not closed.
    fn is_open(&self) -> bool;
}
