//! Credential verification.
//!
//! One routine backs both call sites: the relay session (which only cares
//! whether it may subscribe) and the one-shot check (which maps the outcome
//! to an HTTP-style status). The store is read-only here.

use crate::store::CredentialStore;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zone_core::messages::Credentials;
use zone_core::{DeviceBinding, NumericSecret, ZoneError};

/// Why a credential check did not produce a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// Input rejected before any lookup (empty identifier, non-numeric secret).
    Invalid(String),
    /// No record for this identifier.
    UnknownIdentifier,
    /// Record found but the secret does not match (or the stored one is corrupt).
    SecretMismatch,
    /// The store failed or did not answer in time.
    StoreUnavailable(String),
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(reason) => write!(f, "invalid credentials: {reason}"),
            Self::UnknownIdentifier => f.write_str("unknown identifier"),
            Self::SecretMismatch => f.write_str("secret mismatch"),
            Self::StoreUnavailable(reason) => write!(f, "credential store unavailable: {reason}"),
        }
    }
}

/// Response of the one-shot credential check.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthCheckResponse {
    pub status: u16,
    pub body: Value,
}

impl AuthCheckResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Verifies credential pairs against a [`CredentialStore`].
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    lookup_timeout: Duration,
}

impl Authenticator {
    /// Every store lookup is bounded by `lookup_timeout`.
    pub fn new(store: Arc<dyn CredentialStore>, lookup_timeout: Duration) -> Self {
        Self {
            store,
            lookup_timeout,
        }
    }

    /// Authenticate a raw identifier/secret pair.
    ///
    /// A non-numeric secret fails with [`AuthFailure::Invalid`] before the
    /// store is consulted.
    pub async fn authenticate(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<DeviceBinding, AuthFailure> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(AuthFailure::Invalid("identifier is empty".into()));
        }
        let secret =
            NumericSecret::parse(secret).map_err(|_| AuthFailure::Invalid("secret must be numeric".into()))?;

        self.verify(&Credentials {
            identifier: identifier.to_string(),
            secret,
        })
        .await
    }

    /// Authenticate already-validated credentials.
    pub async fn verify(&self, credentials: &Credentials) -> Result<DeviceBinding, AuthFailure> {
        let identifier = credentials.identifier.as_str();

        let lookup = tokio::time::timeout(self.lookup_timeout, self.store.lookup(identifier)).await;
        let record = match lookup {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                debug!(identifier = %identifier, "identifier not registered");
                return Err(AuthFailure::UnknownIdentifier);
            }
            Ok(Err(e)) => {
                warn!(identifier = %identifier, error = %e, "credential lookup failed");
                return Err(AuthFailure::StoreUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(identifier = %identifier, "credential lookup timed out");
                return Err(AuthFailure::StoreUnavailable(ZoneError::Timeout.to_string()));
            }
        };

        let stored = match NumericSecret::parse(&record.secret) {
            Ok(stored) => stored,
            Err(_) => {
                warn!(identifier = %identifier, "stored secret is not numeric");
                return Err(AuthFailure::SecretMismatch);
            }
        };

        if stored != credentials.secret {
            warn!(identifier = %identifier, "secret does not match");
            return Err(AuthFailure::SecretMismatch);
        }

        debug!(identifier = %identifier, device_id = %record.binding.device_id, "credentials accepted");
        Ok(record.binding)
    }

    /// One-shot credential check with HTTP-style status codes.
    ///
    /// 200 carries the binding; 400, 404, 403 and 503 carry an error string.
    pub async fn check(&self, identifier: &str, secret: &str) -> AuthCheckResponse {
        match self.authenticate(identifier, secret).await {
            Ok(binding) => AuthCheckResponse {
                status: 200,
                body: json!(binding),
            },
            Err(failure) => {
                let (status, message) = match &failure {
                    AuthFailure::Invalid(reason) => (400, reason.clone()),
                    AuthFailure::UnknownIdentifier => {
                        (404, format!("'{}' does not exist", identifier.trim()))
                    }
                    AuthFailure::SecretMismatch => {
                        (403, format!("incorrect code for '{}'", identifier.trim()))
                    }
                    AuthFailure::StoreUnavailable(_) => {
                        (503, "credential store unavailable".to_string())
                    }
                };
                AuthCheckResponse {
                    status,
                    body: json!({ "error": message }),
                }
            }
        }
    }
}
