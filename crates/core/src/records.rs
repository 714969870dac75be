//! Typed repositories over a [`RecordStore`].

use crate::credentials::{hash_password, verify_password};
use crate::error::{CredentialError, StoreError};
use crate::models::{
    ContentType, DocumentRecord, GeneratedContent, ProcessingStatus, UserRecord,
};
use crate::traits::RecordStore;
use crate::views::latest_generated;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const DOCUMENTS: &str = "documents";
pub const GENERATED_CONTENT: &str = "generated_content";
pub const USERS: &str = "users";

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(record)?)
}

#[derive(Clone)]
pub struct DocumentRepository {
    store: Arc<dyn RecordStore>,
}

impl DocumentRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        user_id: &str,
        original_filename: &str,
        object_key: &str,
    ) -> Result<DocumentRecord, StoreError> {
        let record = DocumentRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            original_filename: original_filename.to_string(),
            object_key: object_key.to_string(),
            processing_status: ProcessingStatus::Uploading,
            uploaded_at: Utc::now(),
        };
        self.store.put(DOCUMENTS, &record.id, encode(&record)?).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        self.store
            .get(DOCUMENTS, id)
            .await?
            .map(decode)
            .transpose()
    }

    /// Moves the status forward. Returns the previous status; a move that
    /// would regress or skip `Processing` is rejected.
    pub async fn advance_status(
        &self,
        id: &str,
        next: ProcessingStatus,
    ) -> Result<ProcessingStatus, StoreError> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: DOCUMENTS.to_string(),
                id: id.to_string(),
            })?
            .processing_status;

        if !current.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }

        let mut fields = Map::new();
        fields.insert("processing_status".to_string(), encode(&next)?);
        self.store.update_fields(DOCUMENTS, id, fields).await?;
        Ok(current)
    }

    /// Oldest upload first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<DocumentRecord>, StoreError> {
        let mut documents = self
            .store
            .query(DOCUMENTS, "user_id", &json!(user_id))
            .await?
            .into_iter()
            .map(decode::<DocumentRecord>)
            .collect::<Result<Vec<_>, _>>()?;
        documents.sort_by_key(|document| document.uploaded_at);
        Ok(documents)
    }

    pub async fn display_name(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(id).await?.map(|document| document.original_filename))
    }
}

/// Append-only: reprocessing adds records, readers take the newest per type.
#[derive(Clone)]
pub struct GeneratedContentRepository {
    store: Arc<dyn RecordStore>,
}

impl GeneratedContentRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn insert(
        &self,
        document_id: &str,
        user_id: &str,
        content_type: ContentType,
        content_data: Value,
    ) -> Result<GeneratedContent, StoreError> {
        let record = GeneratedContent {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            content_type,
            content_data,
            created_at: Utc::now(),
        };
        self.store
            .put(GENERATED_CONTENT, &record.id, encode(&record)?)
            .await?;
        Ok(record)
    }

    pub async fn for_document(&self, document_id: &str) -> Result<Vec<GeneratedContent>, StoreError> {
        let mut records = self
            .store
            .query(GENERATED_CONTENT, "document_id", &json!(document_id))
            .await?
            .into_iter()
            .map(decode::<GeneratedContent>)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    pub async fn latest_for_document(&self, document_id: &str) -> Result<Vec<GeneratedContent>, StoreError> {
        Ok(latest_generated(&self.for_document(document_id).await?))
    }
}

#[derive(Clone)]
pub struct UserRepository {
    store: Arc<dyn RecordStore>,
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

impl UserRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        self.store
            .query(USERS, "email", &json!(normalize_email(email)))
            .await?
            .into_iter()
            .next()
            .map(decode)
            .transpose()
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<UserRecord, CredentialError> {
        let email = normalize_email(email);
        if self.find_by_email(&email).await?.is_some() {
            return Err(CredentialError::DuplicateEmail(email));
        }

        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            email,
            hashed_password: hash_password(password)?,
            created_at: Utc::now(),
        };
        self.store.put(USERS, &record.id, encode(&record)?).await?;
        Ok(record)
    }

    /// The user when the password verifies against the stored hash.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, CredentialError> {
        Ok(self
            .find_by_email(email)
            .await?
            .filter(|user| verify_password(password, &user.hashed_password)))
    }
}
