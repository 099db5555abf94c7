//! Credential stores: identifier → secret + device binding.
//!
//! The relay only reads from the store. `create` exists for seeding and
//! for the registration service that shares the same records.

pub mod couch;
pub mod memory;

pub use couch::CouchCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::config::{StoreBackend, StoreSection};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zone_core::{DeviceBinding, NumericSecret, ZoneError, ZoneResult};

/// A stored registration.
///
/// `secret` is kept exactly as stored. It is only interpreted as a number
/// at comparison time, so a corrupt record surfaces as a mismatch.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub secret: String,
    pub binding: DeviceBinding,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("secret", &"<redacted>")
            .field("binding", &self.binding)
            .finish()
    }
}

/// Result of a `create` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Lookup service for credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch the record for `identifier`, `None` if it is not registered.
    async fn lookup(&self, identifier: &str) -> ZoneResult<Option<CredentialRecord>>;

    /// Store a new record unless one already exists for `identifier`.
    async fn create(&self, identifier: &str, record: CredentialRecord)
        -> ZoneResult<CreateOutcome>;
}

/// Check a registration before it is written.
///
/// Identifiers must be non-empty and free of whitespace; secrets must be
/// numeric.
pub fn validate_registration(identifier: &str, secret: &str) -> ZoneResult<()> {
    if identifier.is_empty() {
        return Err(ZoneError::InvalidMessage("identifier is empty".into()));
    }
    if identifier.chars().any(char::is_whitespace) {
        return Err(ZoneError::InvalidMessage(
            "identifier must not contain whitespace".into(),
        ));
    }
    NumericSecret::parse(secret)?;
    Ok(())
}

/// Build the configured store backend.
pub async fn build_store(config: &StoreSection) -> ZoneResult<Arc<dyn CredentialStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = MemoryCredentialStore::new();
            for user in &config.users {
                let record = CredentialRecord {
                    secret: user.secret.clone(),
                    binding: user.device.clone(),
                };
                if store.create(&user.identifier, record).await? == CreateOutcome::AlreadyExists {
                    return Err(ZoneError::Config(format!(
                        "duplicate seeded identifier: {}",
                        user.identifier
                    )));
                }
            }
            info!(users = store.len().await, "memory credential store seeded");
            Ok(Arc::new(store))
        }
        StoreBackend::Couch => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| ZoneError::Config("store.url is required for couch".into()))?;
            let store = CouchCredentialStore::new(
                url,
                &config.database,
                &config.username,
                &config.password,
                Duration::from_secs(config.timeout_secs),
            )?;
            info!(database = %config.database, "using couch credential store");
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;

    #[test]
    fn registration_rules() {
        assert!(validate_registration("a@example.com", "1234").is_ok());
        assert!(validate_registration("", "1234").is_err());
        assert!(validate_registration("a b@example.com", "1234").is_err());
        assert!(validate_registration("a\t@example.com", "1234").is_err());
        assert!(validate_registration("a@example.com", "12x4").is_err());
    }

    #[tokio::test]
    async fn builds_seeded_memory_store() {
        let file = ConfigFile::parse(
            r#"
            [[store.users]]
            identifier = "a@example.com"
            secret = "1234"
            device = { type = "zone-sample", id = "dev1", orgid = "org1" }
            "#,
        )
        .unwrap();
        let store = build_store(&file.store).await.unwrap();
        let record = store.lookup("a@example.com").await.unwrap().unwrap();
        assert_eq!(record.binding.device_id, "dev1");
        assert!(store.lookup("b@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_duplicate_seeds() {
        let file = ConfigFile::parse(
            r#"
            [[store.users]]
            identifier = "a@example.com"
            secret = "1"
            device = { type = "t", id = "1", orgid = "o" }

            [[store.users]]
            identifier = "a@example.com"
            secret = "2"
            device = { type = "t", id = "2", orgid = "o" }
            "#,
        )
        .unwrap();
        assert!(build_store(&file.store).await.is_err());
    }

    #[tokio::test]
    async fn couch_requires_url() {
        let file = ConfigFile::parse("[store]\nbackend = \"couch\"\n").unwrap();
        assert!(matches!(
            build_store(&file.store).await.err().unwrap(),
            ZoneError::Config(_)
        ));
    }
}
