use crate::models::{ContentType, ProcessingStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("page {page} could not be analysed: {details}")]
    Page { page: u32, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding service returned {status}: {body}")]
    Response { status: u16, body: String },

    #[error("embedding dimension {actual} does not match configured {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding response was empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion service returned {status}: {body}")]
    Response { status: u16, body: String },

    #[error("completion response had no choices")]
    Empty,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{kind:?} output does not match its schema: {details}")]
    Schema { kind: ContentType, details: String },

    #[error("{kind:?} completion failed: {source}")]
    Completion {
        kind: ContentType,
        #[source]
        source: CompletionError,
    },
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("index not available yet: {0}")]
    NotReady(String),

    #[error("index {index} was built with {found}, refusing to mix in {expected}")]
    SchemaMismatch {
        index: String,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Error)]
pub enum IndexingError {
    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("object storage returned {status} for {key}")]
    Response { status: u16, key: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("status of {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("invalid record identifier: {0}")]
    InvalidId(String),
}

/// Failure of one ingestion attempt; the orchestrator retries on any of these.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("document {0} not found")]
    DocumentNotFound(String),

    #[error("document {0} has no object key")]
    MissingObjectKey(String),

    #[error(transparent)]
    Records(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query is empty")]
    EmptyQuery,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("a user with email {0} already exists")]
    DuplicateEmail(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Records(#[from] StoreError),
}
