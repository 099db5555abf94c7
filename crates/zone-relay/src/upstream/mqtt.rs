//! MQTT connector for the IoT platform's application API.
//!
//! Each session connects as its own application client
//! (`a:<org>:<identity>`) with a clean session and subscribes at QoS 0 to
//! `iot-2/type/<type>/id/<id>/evt/+/fmt/+`. Subscriptions vanish with the
//! connection, so disconnecting is all the cleanup needed.

use super::{UpstreamConnector, UpstreamHandle};
use crate::config::UpstreamConfig;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS, SubscribeReasonCode, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zone_core::{UpstreamEvent, UpstreamTarget, ZoneError, ZoneResult};

/// Capacity of the client → event loop request queue.
const REQUEST_QUEUE: usize = 64;

/// How long `close` waits for the DISCONNECT to flush before aborting.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

pub struct MqttConnector {
    config: UpstreamConfig,
}

impl MqttConnector {
    pub fn new(config: UpstreamConfig) -> ZoneResult<Self> {
        if config.org.is_empty() {
            return Err(ZoneError::Config("upstream.org is required".into()));
        }
        Ok(Self { config })
    }

    fn options(&self, identity: &str) -> MqttOptions {
        let mut options = MqttOptions::new(
            client_id(&self.config.org, identity),
            &self.config.host,
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        if !self.config.api_key.is_empty() {
            options.set_credentials(&self.config.api_key, &self.config.auth_token);
        }
        if self.config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

/// Application client id for one session.
pub fn client_id(org: &str, identity: &str) -> String {
    format!("a:{org}:{identity}")
}

/// Wildcard topic covering every event of one device.
pub fn event_topic(target: &UpstreamTarget) -> String {
    format!(
        "iot-2/type/{}/id/{}/evt/+/fmt/+",
        target.device_type, target.device_id
    )
}

/// Extract `(event, format)` from a device event topic.
pub fn parse_event_topic(topic: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["iot-2", "type", _, "id", _, "evt", event, "fmt", format] => {
            Some((event.to_string(), format.to_string()))
        }
        _ => None,
    }
}

fn event_from_publish(publish: &Publish) -> Option<UpstreamEvent> {
    let (event, format) = parse_event_topic(&publish.topic)?;
    Some(UpstreamEvent {
        event,
        format,
        payload: publish.payload.to_vec(),
    })
}

/// Poll until the broker acknowledges the connection.
async fn await_connack(eventloop: &mut EventLoop) -> ZoneResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(ZoneError::Upstream(format!("connect failed: {e}"))),
        }
    }
}

/// Poll until the broker acknowledges the subscription.
///
/// Events that race ahead of the SUBACK are forwarded, not dropped.
async fn await_suback(
    eventloop: &mut EventLoop,
    events: &mpsc::Sender<UpstreamEvent>,
) -> ZoneResult<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(ZoneError::Upstream("subscription rejected".into()));
                }
                return Ok(());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some(event) = event_from_publish(&publish) {
                    let _ = events.send(event).await;
                }
            }
            Ok(_) => continue,
            Err(e) => return Err(ZoneError::Upstream(format!("subscribe failed: {e}"))),
        }
    }
}

/// Drive the event loop, forwarding device events until the connection
/// drops or the session stops listening.
async fn pump(mut eventloop: EventLoop, events: mpsc::Sender<UpstreamEvent>, target: UpstreamTarget) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => match event_from_publish(&publish) {
                Some(event) => {
                    if events.send(event).await.is_err() {
                        debug!(target = %target, "event receiver dropped");
                        break;
                    }
                }
                None => debug!(topic = %publish.topic, "ignoring non-event publish"),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!(target = %target, "upstream broker disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target = %target, error = %e, "upstream connection lost");
                break;
            }
        }
    }
}

#[async_trait]
impl UpstreamConnector for MqttConnector {
    async fn open(
        &self,
        target: &UpstreamTarget,
        identity: &str,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> ZoneResult<Box<dyn UpstreamHandle>> {
        let (client, mut eventloop) = AsyncClient::new(self.options(identity), REQUEST_QUEUE);

        await_connack(&mut eventloop).await?;
        debug!(target = %target, identity = %identity, "upstream connected");

        let topic = event_topic(target);
        client
            .subscribe(topic.as_str(), QoS::AtMostOnce)
            .await
            .map_err(|e| ZoneError::Upstream(format!("subscribe request failed: {e}")))?;
        await_suback(&mut eventloop, &events).await?;
        info!(target = %target, topic = %topic, "upstream subscribed");

        let pump = tokio::spawn(pump(eventloop, events, target.clone()));

        Ok(Box::new(MqttHandle {
            client: Some(client),
            pump: Some(pump),
            target: target.clone(),
        }))
    }
}

/// Handle to one MQTT subscription.
pub struct MqttHandle {
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
    target: UpstreamTarget,
}

#[async_trait]
impl UpstreamHandle for MqttHandle {
    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!(target = %self.target, error = %e, "disconnect request not queued");
            }
        }
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
            debug!(target = %self.target, "upstream closed");
        }
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
