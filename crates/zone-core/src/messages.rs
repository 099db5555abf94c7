//! Wire and domain messages shared by the relay and its collaborators.
//!
//! The downstream protocol is deliberately small: the client's first
//! message is an [`AuthRequest`] (JSON), after which the server only ever
//! sends raw event payloads. There is no acknowledgement and no error body.

use crate::error::{ZoneError, ZoneResult};
use crate::secret::NumericSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// First message sent by a downstream client.
///
/// Older browser clients send `email`/`pin`; both spellings are accepted.
/// The secret may arrive as a JSON string or a JSON integer.
#[derive(Clone, Deserialize)]
pub struct AuthRequest {
    #[serde(alias = "email")]
    pub identifier: String,
    #[serde(alias = "pin")]
    pub secret: Value,
}

/// A validated credential pair, ready to be checked against a store.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub identifier: String,
    pub secret: NumericSecret,
}

impl AuthRequest {
    /// Decode an auth message from raw bytes.
    ///
    /// Fails with [`ZoneError::Codec`] on malformed JSON or missing fields.
    pub fn decode(data: &[u8]) -> ZoneResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Validate the request into [`Credentials`].
    ///
    /// The identifier must be non-empty and the secret must be an integer.
    pub fn into_credentials(self) -> ZoneResult<Credentials> {
        let identifier = self.identifier.trim().to_string();
        if identifier.is_empty() {
            return Err(ZoneError::InvalidMessage("identifier is empty".into()));
        }
        let secret = NumericSecret::from_json(&self.secret)?;
        Ok(Credentials { identifier, secret })
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The backend device identity bound to a registered user.
///
/// Field names on the wire follow the registration document layout
/// (`type`, `id`, `authtoken`, `clientid`, `orgid`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    #[serde(rename = "type", alias = "deviceType")]
    pub device_type: String,
    #[serde(rename = "id", alias = "deviceId")]
    pub device_id: String,
    #[serde(rename = "authtoken", alias = "authToken", default)]
    pub auth_token: String,
    #[serde(rename = "clientid", alias = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "orgid", alias = "orgId")]
    pub org_id: String,
}

impl DeviceBinding {
    /// The upstream subscription scope for this binding.
    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget {
            org_id: self.org_id.clone(),
            device_type: self.device_type.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

impl fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("device_type", &self.device_type)
            .field("device_id", &self.device_id)
            .field("auth_token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("org_id", &self.org_id)
            .finish()
    }
}

/// Scope of one upstream subscription: a single device within an org.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub org_id: String,
    pub device_type: String,
    pub device_id: String,
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.device_type, self.device_id)
    }
}

/// One telemetry event delivered by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    /// Event name (e.g. `status`).
    pub event: String,
    /// Payload format advertised by the device (e.g. `json`).
    pub format: String,
    /// Raw payload, relayed to the client unmodified.
    pub payload: Vec<u8>,
}
