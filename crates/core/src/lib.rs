pub mod completion;
pub mod config;
pub mod credentials;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod indexing;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod records;
pub mod retrieval;
pub mod stores;
pub mod traits;
pub mod views;

pub use completion::{
    ChatCompletionsClient, ChatCompletionsConfig, CompletionRequest, CompletionService,
};
pub use config::{
    ExtractionOptions, GenerationOptions, IndexingOptions, PipelineConfig, RetrievalOptions,
};
pub use credentials::{hash_password, verify_password};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, HttpEmbedder, HttpEmbedderConfig,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    CompletionError, CredentialError, EmbeddingError, ExtractError, GenerationError,
    IndexingError, IngestError, PipelineError, QueueError, RetrievalError, SearchError,
    StorageError, StoreError,
};
pub use extractor::ocr::{DisabledOcr, HttpOcrEngine, OcrEndpointConfig, OcrEngine};
pub use extractor::{HybridExtractor, PdfExtractor};
pub use generation::ContentGenerator;
pub use indexing::Indexer;
pub use ingest::{discover_pdf_files, SkippedPdf, UploadReport, UploadedDocument, Uploader};
pub use models::{
    ChatAnswer, ChatQuery, ContentType, DocumentRecord, GeneratedContent, ProcessingStatus,
    RetrievalHit, SourceRef, TextChunk, TextSource, UserRecord,
};
pub use orchestrator::{IngestionOrchestrator, IngestionOutcome};
pub use queue::{dispatch, Dispatch, IngestionJob, LocalTaskQueue, TaskQueue, WorkerPool};
pub use records::{DocumentRepository, GeneratedContentRepository, UserRepository};
pub use retrieval::HybridRetriever;
pub use stores::{
    ElasticsearchStore, FsObjectStore, HttpObjectStore, JsonDirRecordStore, MemoryObjectStore,
    MemoryRecordStore, MemorySearchIndex,
};
pub use traits::{ObjectStore, RecordStore, SearchIndex};
pub use views::{render, GeneratedView};
