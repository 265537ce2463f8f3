use chrono::Utc;
use tracing::info;

use sketch_crypto::keys::{generate_admin_key, hash_admin_key, verify_admin_key};
use sketch_db::to_millis;
use sketch_types::SketchResult;

use crate::store::{Store, blocking};

/// Persisted, show-once distribution of the admin credential.
///
/// `init` runs once at startup. The first connection to call
/// `take_initial_key` gets the plaintext; the record is acknowledged and the
/// plaintext erased in the same store transaction.
#[derive(Clone)]
pub struct AdminKeyService {
    db: Store,
}

impl AdminKeyService {
    pub fn new(db: Store) -> Self {
        Self { db }
    }

    /// Generate the admin key if no record exists. Returns true if one was created.
    pub fn init(&self) -> anyhow::Result<bool> {
        if self.db.admin_credential()?.is_some() {
            return Ok(false);
        }
        let key = generate_admin_key();
        let hash = hash_admin_key(&key)?;
        let created = self
            .db
            .insert_admin_credential(&hash, &key, to_millis(Utc::now()))?;
        if created {
            info!("Admin credential generated, pending first connection");
        }
        Ok(created)
    }

    pub async fn take_initial_key(&self) -> SketchResult<Option<String>> {
        blocking(&self.db, |db| db.take_pending_admin_key()).await
    }

    pub async fn verify(&self, presented: &str) -> SketchResult<bool> {
        if presented.is_empty() {
            return Ok(false);
        }
        let presented = presented.to_string();
        blocking(&self.db, move |db| {
            Ok(db
                .admin_credential()?
                .is_some_and(|record| verify_admin_key(&presented, &record.key_hash)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use sketch_db::Database;

    #[tokio::test]
    async fn key_is_handed_out_once_and_still_verifies() {
        let service = AdminKeyService::new(Arc::new(Database::open_in_memory().unwrap()));
        assert!(service.init().unwrap());
        assert!(!service.init().unwrap());

        let key = service.take_initial_key().await.unwrap().unwrap();
        assert!(service.take_initial_key().await.unwrap().is_none());

        assert!(service.verify(&key).await.unwrap());
        assert!(!service.verify("guess").await.unwrap());
        assert!(!service.verify("").await.unwrap());
    }

    #[tokio::test]
    async fn nothing_verifies_before_init() {
        let service = AdminKeyService::new(Arc::new(Database::open_in_memory().unwrap()));
        assert!(service.take_initial_key().await.unwrap().is_none());
        assert!(!service.verify("anything").await.unwrap());
    }
}
