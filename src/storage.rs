//! Prediction store backed by sled
//!
//! Trees:
//! - `users`: submitter key -> [`UserRecord`]
//! - `images`: image id (BE) -> [`ImageRecord`]
//! - `predictions`: image id (BE) -> [`PredictionRecord`]
//! - `user_predictions`: `<submitter key>\0<image id BE>` -> empty, the
//!   per-submitter index that gives history its storage order
//!
//! Submitter keys are the JSON encoding of the id, so `7` and `"7"` stay
//! distinct owners. Records are stored as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::Transactional;
use std::path::Path;

use crate::error::StoreError;
use crate::inference::Label;
use crate::protocol::{HistoryEntry, SubmitterId};

#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Register a submitter; registering an existing one is a no-op
    async fn create_user(&self, submitter: &SubmitterId) -> Result<(), StoreError>;

    async fn create_image(
        &self,
        storage_path: &str,
        submitter: &SubmitterId,
    ) -> Result<ImageRecord, StoreError>;

    /// Record the outcome for an image, replacing any earlier one
    async fn save_prediction(
        &self,
        image_id: u64,
        label: Label,
        confidence: f64,
    ) -> Result<(), StoreError>;

    /// Predictions for a submitter's images, in storage order
    async fn list_predictions(
        &self,
        submitter: &SubmitterId,
    ) -> Result<Vec<PredictionRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub submitter_id: SubmitterId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: u64,
    pub submitter_id: SubmitterId,
    pub storage_path: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub image_id: u64,
    pub result: Label,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl From<PredictionRecord> for HistoryEntry {
    fn from(record: PredictionRecord) -> Self {
        HistoryEntry {
            image_id: record.image_id,
            result: record.result,
            confidence: record.confidence,
        }
    }
}

fn submitter_key(submitter: &SubmitterId) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(submitter)?)
}

fn index_prefix(user_key: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(user_key.len() + 1);
    prefix.extend_from_slice(user_key);
    prefix.push(0);
    prefix
}

fn index_key(user_key: &[u8], image_id: u64) -> Vec<u8> {
    let mut key = index_prefix(user_key);
    key.extend_from_slice(&image_id.to_be_bytes());
    key
}

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    users: sled::Tree,
    images: sled::Tree,
    predictions: sled::Tree,
    user_predictions: sled::Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        tracing::info!("Opening prediction store at {:?}", path);
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(1000))
            .open()
            .map_err(StoreError::sled("open"))?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::sled("open"))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let open_tree = |name: &str| db.open_tree(name).map_err(StoreError::sled("open_tree"));
        Ok(Self {
            users: open_tree("users")?,
            images: open_tree("images")?,
            predictions: open_tree("predictions")?,
            user_predictions: open_tree("user_predictions")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush_async()
            .await
            .map_err(StoreError::sled("flush"))?;
        Ok(())
    }

    pub async fn get_image(&self, image_id: u64) -> Result<Option<ImageRecord>, StoreError> {
        let images = self.images.clone();
        blocking(move || {
            match images
                .get(image_id.to_be_bytes())
                .map_err(StoreError::sled("get_image"))?
            {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
    }

    fn save_prediction_sync(
        &self,
        image_id: u64,
        record: &PredictionRecord,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(record)?;
        let image_key = image_id.to_be_bytes();

        let outcome = (&self.images, &self.predictions, &self.user_predictions).transaction(
            |(images, predictions, user_predictions)| -> ConflictableTransactionResult<(), StoreError> {
                let image: ImageRecord = match images.get(image_key)? {
                    Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                        ConflictableTransactionError::Abort(StoreError::Encoding(e))
                    })?,
                    None => {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::ImageNotFound(image_id),
                        ))
                    }
                };
                let user_key = submitter_key(&image.submitter_id)
                    .map_err(ConflictableTransactionError::Abort)?;

                predictions.insert(&image_key[..], encoded.as_slice())?;
                user_predictions.insert(index_key(&user_key, image_id), &[] as &[u8])?;
                Ok(())
            },
        );

        match outcome {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Transaction(e.to_string())),
        }
    }

    fn list_predictions_sync(
        &self,
        submitter: &SubmitterId,
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        let prefix = index_prefix(&submitter_key(submitter)?);
        let mut records = Vec::new();

        for entry in self.user_predictions.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(StoreError::sled("scan_user_predictions"))?;
            let image_key = &key[prefix.len()..];
            if let Some(bytes) = self
                .predictions
                .get(image_key)
                .map_err(StoreError::sled("get_prediction"))?
            {
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(records)
    }
}

/// Run sled work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Blocking(e.to_string()))?
}

#[async_trait]
impl PredictionStore for SledStore {
    async fn create_user(&self, submitter: &SubmitterId) -> Result<(), StoreError> {
        let users = self.users.clone();
        let submitter = submitter.clone();
        blocking(move || {
            let key = submitter_key(&submitter)?;
            let record = serde_json::to_vec(&UserRecord {
                submitter_id: submitter.clone(),
                created_at: Utc::now(),
            })?;
            // an existing record is left untouched
            let swapped = users
                .compare_and_swap(key, None as Option<&[u8]>, Some(record))
                .map_err(StoreError::sled("create_user"))?;
            if swapped.is_ok() {
                tracing::debug!(submitter = %submitter, "Registered submitter");
            }
            Ok(())
        })
        .await
    }

    async fn create_image(
        &self,
        storage_path: &str,
        submitter: &SubmitterId,
    ) -> Result<ImageRecord, StoreError> {
        let store = self.clone();
        let record_path = storage_path.to_string();
        let submitter = submitter.clone();
        blocking(move || {
            // sled ids start at zero; image ids start at one
            let id = store
                .db
                .generate_id()
                .map_err(StoreError::sled("generate_id"))?
                + 1;
            let record = ImageRecord {
                id,
                submitter_id: submitter,
                storage_path: record_path,
                uploaded_at: Utc::now(),
            };
            store
                .images
                .insert(id.to_be_bytes(), serde_json::to_vec(&record)?)
                .map_err(StoreError::sled("create_image"))?;
            tracing::debug!(image_id = id, path = %record.storage_path, "Stored image record");
            Ok(record)
        })
        .await
    }

    async fn save_prediction(
        &self,
        image_id: u64,
        label: Label,
        confidence: f64,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        blocking(move || {
            let record = PredictionRecord {
                image_id,
                result: label,
                confidence,
                created_at: Utc::now(),
            };
            store.save_prediction_sync(image_id, &record)
        })
        .await
    }

    async fn list_predictions(
        &self,
        submitter: &SubmitterId,
    ) -> Result<Vec<PredictionRecord>, StoreError> {
        let store = self.clone();
        let submitter = submitter.clone();
        blocking(move || store.list_predictions_sync(&submitter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_keys_sort_by_image_id() {
        let user = submitter_key(&SubmitterId::Number(3)).unwrap();
        assert!(index_key(&user, 2) < index_key(&user, 10));
        assert!(index_key(&user, 255) < index_key(&user, 256));
    }

    #[test]
    fn test_numeric_and_text_submitters_do_not_collide() {
        let number = submitter_key(&SubmitterId::Number(7)).unwrap();
        let text = submitter_key(&SubmitterId::Text("7".into())).unwrap();
        assert_ne!(number, text);
        assert!(!index_key(&text, 1).starts_with(&index_prefix(&number)));
    }

    #[tokio::test]
    async fn test_get_image_round_trip() {
        let store = SledStore::temporary().unwrap();
        let image = store.create_image("uploads/1/a.jpg", &SubmitterId::Number(1)).await.unwrap();
        let loaded = store.get_image(image.id).await.unwrap().unwrap();
        assert_eq!(loaded, image);
        assert!(store.get_image(image.id + 100).await.unwrap().is_none());
    }
}
