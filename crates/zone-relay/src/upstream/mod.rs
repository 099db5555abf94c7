//! Upstream event sources.
//!
//! A connector opens one subscription per relay session. Events are pushed
//! onto the session's channel rather than delivered through a callback, so
//! the session alone decides when to write to its downstream transport.

pub mod mqtt;

pub use mqtt::MqttConnector;

use async_trait::async_trait;
use tokio::sync::mpsc;
use zone_core::{UpstreamEvent, UpstreamTarget, ZoneResult};

/// Opens upstream subscriptions.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect as `identity` and subscribe to every event of `target`.
    ///
    /// Events are sent on `events` in delivery order. The sender is dropped
    /// when the upstream connection ends for good.
    async fn open(
        &self,
        target: &UpstreamTarget,
        identity: &str,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> ZoneResult<Box<dyn UpstreamHandle>>;
}

/// An open upstream subscription owned by exactly one session.
#[async_trait]
pub trait UpstreamHandle: Send {
    /// Tear the subscription down. Idempotent.
    async fn close(&mut self);
}
