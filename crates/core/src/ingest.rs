use crate::error::IngestError;
use crate::models::DocumentRecord;
use crate::records::DocumentRepository;
use crate::traits::ObjectStore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Object key for a new upload: `<user_id>/<uuid>.pdf`.
pub fn object_key_for(user_id: &str, file_name: &str) -> Result<String, IngestError> {
    if user_id.is_empty() || user_id.contains('/') || user_id.starts_with('.') {
        return Err(IngestError::InvalidArgument(format!(
            "user id cannot be used in an object key: {user_id:?}"
        )));
    }
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "pdf".to_string());
    Ok(format!("{user_id}/{}.{extension}", Uuid::new_v4().simple()))
}

#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub document: DocumentRecord,
    pub checksum: String,
    pub path: PathBuf,
}

pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

pub struct UploadReport {
    pub uploaded: Vec<UploadedDocument>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Stores PDFs and creates their `UPLOADING` records. Processing is started
/// separately, through the task queue or inline.
pub struct Uploader {
    objects: Arc<dyn ObjectStore>,
    documents: DocumentRepository,
}

impl Uploader {
    pub fn new(objects: Arc<dyn ObjectStore>, documents: DocumentRepository) -> Self {
        Self { objects, documents }
    }

    pub async fn upload_file(&self, user_id: &str, path: &Path) -> Result<UploadedDocument, IngestError> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
            })?;

        let bytes = tokio::fs::read(path).await?;
        let checksum = digest_bytes(&bytes);
        let object_key = object_key_for(user_id, file_name)?;

        self.objects.put(&object_key, bytes).await?;
        let document = self.documents.create(user_id, file_name, &object_key).await?;
        info!(
            document_id = %document.id,
            object_key = %object_key,
            file = %file_name,
            "uploaded document"
        );

        Ok(UploadedDocument {
            document,
            checksum,
            path: path.to_path_buf(),
        })
    }

    pub async fn upload_folder(&self, user_id: &str, folder: &Path) -> Result<UploadReport, IngestError> {
        let files = discover_pdf_files(folder);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut uploaded = Vec::new();
        let mut skipped_files = Vec::new();
        for path in files {
            match self.upload_file(user_id, &path).await {
                Ok(document) => uploaded.push(document),
                Err(error) => skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                }),
            }
        }

        Ok(UploadReport {
            uploaded,
            skipped_files,
        })
    }
}
