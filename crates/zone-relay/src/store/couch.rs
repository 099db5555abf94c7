//! CouchDB / Cloudant credential store over HTTP.
//!
//! One document per registered identifier, keyed by the identifier itself:
//!
//! ```json
//! { "pin": "1234", "device": { "type": "...", "id": "...", "authtoken": "...",
//!   "clientid": "...", "orgid": "..." } }
//! ```

use super::{validate_registration, CreateOutcome, CredentialRecord, CredentialStore};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use zone_core::{DeviceBinding, ZoneError, ZoneResult};

/// Document layout as stored by the registration service.
#[derive(Deserialize)]
struct RegistrationDoc {
    #[serde(default)]
    pin: Value,
    device: DeviceBinding,
}

pub struct CouchCredentialStore {
    base: Url,
    database: String,
    username: String,
    password: String,
    http_client: reqwest::Client,
}

impl CouchCredentialStore {
    /// Create a store against `url` (server root) and `database`.
    ///
    /// Every request is bounded by `timeout`.
    pub fn new(
        url: &str,
        database: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> ZoneResult<Self> {
        let base = Url::parse(url)
            .map_err(|e| ZoneError::Config(format!("invalid store url {url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ZoneError::Config(format!("store url is not a base: {url}")));
        }
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ZoneError::Config(format!("http client: {e}")))?;

        Ok(Self {
            base,
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            http_client,
        })
    }

    /// URL of the document for `identifier`, percent-encoded as one segment.
    fn document_url(&self, identifier: &str) -> ZoneResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ZoneError::Config("store url is not a base".into()))?
            .pop_if_empty()
            .push(&self.database)
            .push(identifier);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }
}

/// Decode a registration document body.
fn decode_document(body: &[u8]) -> ZoneResult<CredentialRecord> {
    let doc: RegistrationDoc = serde_json::from_slice(body)
        .map_err(|e| ZoneError::Store(format!("malformed registration document: {e}")))?;
    let secret = match doc.pin {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        // Anything else can never compare equal to a numeric secret.
        _ => String::new(),
    };
    Ok(CredentialRecord {
        secret,
        binding: doc.device,
    })
}

fn transport_error(e: reqwest::Error) -> ZoneError {
    if e.is_timeout() {
        ZoneError::Timeout
    } else {
        ZoneError::Store(e.to_string())
    }
}

#[async_trait]
impl CredentialStore for CouchCredentialStore {
    async fn lookup(&self, identifier: &str) -> ZoneResult<Option<CredentialRecord>> {
        let url = self.document_url(identifier)?;
        let response = self
            .authorize(self.http_client.get(url))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(transport_error)?;
                decode_document(&body).map(Some)
            }
            StatusCode::NOT_FOUND => {
                debug!(identifier = %identifier, "no registration document");
                Ok(None)
            }
            status => {
                warn!(status = %status, "unexpected store response on lookup");
                Err(ZoneError::Store(format!("lookup returned {status}")))
            }
        }
    }

    async fn create(
        &self,
        identifier: &str,
        record: CredentialRecord,
    ) -> ZoneResult<CreateOutcome> {
        validate_registration(identifier, &record.secret)?;

        let url = self.document_url(identifier)?;
        let body = json!({
            "id": identifier,
            "pin": record.secret,
            "device": record.binding,
        });
        let response = self
            .authorize(self.http_client.put(url).json(&body))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::ACCEPTED => Ok(CreateOutcome::Created),
            StatusCode::CONFLICT => Ok(CreateOutcome::AlreadyExists),
            status => {
                warn!(status = %status, "unexpected store response on create");
                Err(ZoneError::Store(format!("create returned {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str) -> CouchCredentialStore {
        CouchCredentialStore::new(url, "iotfzonesample", "", "", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn document_url_encodes_identifier() {
        let s = store("https://db.example.com");
        let url = s.document_url("a b/c@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/iotfzonesample/a%20b%2Fc@example.com"
        );
    }

    #[test]
    fn document_url_keeps_base_path() {
        let s = store("https://db.example.com/couch/");
        let url = s.document_url("a@example.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.com/couch/iotfzonesample/a@example.com"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(CouchCredentialStore::new("not a url", "db", "", "", Duration::from_secs(1)).is_err());
        assert!(CouchCredentialStore::new("mailto:x@y", "db", "", "", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn decodes_string_and_number_pins() {
        let doc = br#"{"_id":"a","pin":"0042","device":{"type":"t","id":"1","authtoken":"x","clientid":"c","orgid":"o"}}"#;
        assert_eq!(decode_document(doc).unwrap().secret, "0042");

        let doc = br#"{"pin":42,"device":{"type":"t","id":"1","orgid":"o"}}"#;
        let record = decode_document(doc).unwrap();
        assert_eq!(record.secret, "42");
        assert_eq!(record.binding.org_id, "o");
    }

    #[test]
    fn odd_pin_becomes_unmatchable() {
        let doc = br#"{"device":{"type":"t","id":"1","orgid":"o"}}"#;
        assert_eq!(decode_document(doc).unwrap().secret, "");

        let doc = br#"{"pin":{"v":1},"device":{"type":"t","id":"1","orgid":"o"}}"#;
        assert_eq!(decode_document(doc).unwrap().secret, "");
    }

    #[test]
    fn missing_device_is_store_error() {
        assert!(matches!(
            decode_document(br#"{"pin":"1"}"#).err().unwrap(),
            ZoneError::Store(_)
        ));
    }
}
