use crate::error::StoreError;
use crate::stores::memory::merge_fields;
use crate::traits::RecordStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// One pretty-printed JSON file per record at `<root>/<collection>/<id>.json`.
pub struct JsonDirRecordStore {
    root: PathBuf,
    writes: Mutex<()>,
}

impl JsonDirRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_segment(collection)?;
        validate_segment(id)?;
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }

    async fn read(path: &Path) -> Result<Option<Value>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write(path: &Path, record: &Value) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

fn validate_segment(segment: &str) -> Result<(), StoreError> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(segment.to_string()))
    }
}

#[async_trait]
impl RecordStore for JsonDirRecordStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Self::read(&self.record_path(collection, id)?).await
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<(), StoreError> {
        let path = self.record_path(collection, id)?;
        let _guard = self.writes.lock().await;
        Self::write(&path, &record).await
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let path = self.record_path(collection, id)?;
        let _guard = self.writes.lock().await;
        let mut record = Self::read(&path).await?.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        merge_fields(&mut record, fields, id)?;
        Self::write(&path, &record).await
    }

    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>, StoreError> {
        validate_segment(collection)?;
        let directory = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut matches = Vec::new();
        for path in paths {
            if let Some(record) = Self::read(&path).await? {
                if record.get(field) == Some(value) {
                    matches.push(record);
                }
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonDirRecordStore::new(dir.path());
        store
            .put("documents", "doc-1", json!({"user_id": "u1", "processing_status": "UPLOADING"}))
            .await
            .expect("put");

        let mut fields = Map::new();
        fields.insert("processing_status".to_string(), json!("PROCESSING"));
        store
            .update_fields("documents", "doc-1", fields)
            .await
            .expect("update");

        let reopened = JsonDirRecordStore::new(dir.path());
        let record = reopened
            .get("documents", "doc-1")
            .await
            .expect("get")
            .expect("record exists");
        assert_eq!(record["processing_status"], "PROCESSING");

        let owned = reopened
            .query("documents", "user_id", &json!("u1"))
            .await
            .expect("query");
        assert_eq!(owned.len(), 1);
        assert!(reopened
            .query("missing", "user_id", &json!("u1"))
            .await
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonDirRecordStore::new(dir.path());
        let result = store.put("documents", "../escape", json!({})).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
        assert!(store.get("documents", "").await.is_err());
    }
}
