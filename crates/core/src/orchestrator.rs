//! Per-document ingestion state machine:
//! `UPLOADING -> PROCESSING -> COMPLETED | FAILED`.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::extractor::PdfExtractor;
use crate::generation::ContentGenerator;
use crate::indexing::Indexer;
use crate::models::{DocumentRecord, ProcessingStatus};
use crate::records::{DocumentRepository, GeneratedContentRepository};
use crate::traits::ObjectStore;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionOutcome {
    Completed,
    Failed,
    /// Re-delivery for a document that already reached a terminal status.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttemptReport {
    chunks: usize,
    generated: usize,
    indexed: usize,
}

pub struct IngestionOrchestrator {
    documents: DocumentRepository,
    generated: GeneratedContentRepository,
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn PdfExtractor>,
    generator: ContentGenerator,
    indexer: Indexer,
    config: PipelineConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        documents: DocumentRepository,
        generated: GeneratedContentRepository,
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn PdfExtractor>,
        generator: ContentGenerator,
        indexer: Indexer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            documents,
            generated,
            objects,
            extractor,
            generator,
            indexer,
            config,
        }
    }

    /// Runs the pipeline for one document. Failures end in `FAILED` status
    /// and are never returned to the caller.
    pub async fn process(&self, document_id: &str, user_id: &str) -> IngestionOutcome {
        match self.begin(document_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(document_id, "document already finished, skipping re-delivery");
                return IngestionOutcome::Skipped;
            }
            Err(error) => {
                warn!(document_id, error = %error, "could not mark document as processing");
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            info!(document_id, attempt, max_attempts, "starting ingestion attempt");
            match self.attempt(document_id, user_id).await {
                Ok(report) => {
                    self.finish(document_id, ProcessingStatus::Completed).await;
                    info!(
                        document_id,
                        attempt,
                        chunks = report.chunks,
                        generated = report.generated,
                        indexed = report.indexed,
                        "ingestion completed"
                    );
                    return IngestionOutcome::Completed;
                }
                Err(error) => {
                    warn!(document_id, attempt, error = %error, "ingestion attempt failed");
                }
            }
        }

        error!(document_id, attempts = max_attempts, "ingestion retries exhausted");
        self.finish(document_id, ProcessingStatus::Failed).await;
        IngestionOutcome::Failed
    }

    /// `Ok(false)` when the document is already terminal.
    async fn begin(&self, document_id: &str) -> Result<bool, StoreError> {
        let Some(document) = self.documents.get(document_id).await? else {
            return Err(StoreError::NotFound {
                collection: crate::records::DOCUMENTS.to_string(),
                id: document_id.to_string(),
            });
        };
        if document.processing_status.is_terminal() {
            return Ok(false);
        }
        let previous = self
            .documents
            .advance_status(document_id, ProcessingStatus::Processing)
            .await?;
        info!(document_id, from = ?previous, to = ?ProcessingStatus::Processing, "status changed");
        Ok(true)
    }

    async fn finish(&self, document_id: &str, status: ProcessingStatus) {
        match self.documents.advance_status(document_id, status).await {
            Ok(previous) => {
                info!(document_id, from = ?previous, to = ?status, "status changed");
            }
            Err(error) => {
                error!(document_id, to = ?status, error = %error, "could not record final status");
            }
        }
    }

    async fn attempt(&self, document_id: &str, user_id: &str) -> Result<AttemptReport, PipelineError> {
        let document = self.load(document_id).await?;
        let bytes = self.objects.get(&document.object_key).await?;

        // Removed from disk when `download` drops, on every exit path.
        let download = tempfile::Builder::new()
            .prefix("notesmith-")
            .suffix(".pdf")
            .tempfile()?;
        write_download(&download, &bytes).await?;

        let chunks = self.extractor.extract_file(download.path()).await;
        drop(download);
        if chunks.is_empty() {
            warn!(document_id, "extraction produced no chunks");
        }

        let artifacts = self.generator.generate(&chunks).await?;
        let content = artifacts.content_data()?;
        let generated = content.len();
        for (content_type, data) in content {
            self.generated
                .insert(document_id, user_id, content_type, data)
                .await?;
        }

        let indexed = match self.indexer.index_document(document_id, user_id, &chunks).await {
            Ok(indexed) => indexed,
            Err(error) => {
                warn!(document_id, error = %error, "indexing failed, document stays usable");
                0
            }
        };

        Ok(AttemptReport {
            chunks: chunks.len(),
            generated,
            indexed,
        })
    }

    async fn load(&self, document_id: &str) -> Result<DocumentRecord, PipelineError> {
        let document = self
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| PipelineError::DocumentNotFound(document_id.to_string()))?;
        if document.object_key.trim().is_empty() {
            return Err(PipelineError::MissingObjectKey(document_id.to_string()));
        }
        Ok(document)
    }
}

async fn write_download(file: &NamedTempFile, bytes: &[u8]) -> Result<(), PipelineError> {
    tokio::fs::write(file.path(), bytes).await?;
    Ok(())
}
