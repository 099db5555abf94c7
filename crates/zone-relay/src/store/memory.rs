//! In-process credential store, seeded from config.

use super::{validate_registration, CreateOutcome, CredentialRecord, CredentialStore};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use zone_core::ZoneResult;

#[derive(Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Insert a record without validation. Used to model corrupt data.
    #[cfg(test)]
    pub async fn insert_raw(&self, identifier: &str, record: CredentialRecord) {
        self.records
            .write()
            .await
            .insert(identifier.to_string(), record);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(&self, identifier: &str) -> ZoneResult<Option<CredentialRecord>> {
        Ok(self.records.read().await.get(identifier).cloned())
    }

    async fn create(
        &self,
        identifier: &str,
        record: CredentialRecord,
    ) -> ZoneResult<CreateOutcome> {
        validate_registration(identifier, &record.secret)?;

        let mut records = self.records.write().await;
        if records.contains_key(identifier) {
            debug!(identifier = %identifier, "identifier already registered");
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(identifier.to_string(), record);
        debug!(identifier = %identifier, "registration stored");
        Ok(CreateOutcome::Created)
    }
}
