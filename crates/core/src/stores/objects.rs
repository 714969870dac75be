use crate::error::StorageError;
use crate::traits::ObjectStore;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use url::Url;

/// Keys are `/`-separated relative paths; no empty, `.` or `..` segments.
fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && !key.contains('\\');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

/// Bucket reachable over plain HTTP GET/PUT, e.g. an S3-compatible endpoint
/// with a public or pre-authorised base URL.
pub struct HttpObjectStore {
    client: Client,
    base: Url,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base: &str, bearer_token: Option<String>) -> Result<Self, StorageError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base,
            bearer_token,
        })
    }

    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        validate_key(key)?;
        Ok(self.base.join(key)?)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut request = self.client.get(self.object_url(key)?);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status => Err(StorageError::Response {
                status: status.as_u16(),
                key: key.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put(self.object_url(key)?)
            .header("Content-Type", "application/pdf")
            .body(bytes);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StorageError::Response {
                status: response.status().as_u16(),
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys = self.objects.read().await.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_keys_are_rejected() {
        assert!(validate_key("user-1/abc.pdf").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs.pdf").is_err());
        assert!(validate_key("a//b.pdf").is_err());
        assert!(validate_key("").is_err());
    }

    #[tokio::test]
    async fn filesystem_store_round_trips_nested_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store
            .put("user-1/doc.pdf", b"%PDF-1.5".to_vec())
            .await
            .expect("put");
        assert_eq!(store.get("user-1/doc.pdf").await.expect("get"), b"%PDF-1.5");
        assert!(matches!(
            store.get("user-1/other.pdf").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn http_keys_resolve_under_the_base_path() {
        let store = HttpObjectStore::new("https://bucket.example.com/uploads", None).expect("url");
        let url = store.object_url("user-1/doc.pdf").expect("key");
        assert_eq!(url.as_str(), "https://bucket.example.com/uploads/user-1/doc.pdf");
    }
}
