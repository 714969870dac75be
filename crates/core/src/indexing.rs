use crate::config::IndexingOptions;
use crate::embeddings::Embedder;
use crate::error::IndexingError;
use crate::models::{ChunkMetadata, IndexEntry, TextChunk};
use crate::traits::{IndexSchema, SearchIndex};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Embeds chunk texts and writes them to the search index.
pub struct Indexer {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    options: IndexingOptions,
}

impl Indexer {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        options: IndexingOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            options,
        }
    }

    pub fn schema(&self) -> IndexSchema {
        IndexSchema {
            dimensions: self.embedder.dimensions(),
            embedding_model: self.embedder.model_id().to_string(),
        }
    }

    /// Indexes the non-blank chunks of one document. Returns the number of
    /// entries written.
    pub async fn index_document(
        &self,
        document_id: &str,
        user_id: &str,
        chunks: &[TextChunk],
    ) -> Result<usize, IndexingError> {
        let pairs = chunks
            .iter()
            .filter(|chunk| !chunk.text.trim().is_empty())
            .map(|chunk| {
                (
                    chunk.text.clone(),
                    ChunkMetadata {
                        document_id: document_id.to_string(),
                        user_id: user_id.to_string(),
                        page_number: chunk.page_number,
                        source: chunk.source,
                    },
                )
            })
            .collect::<Vec<_>>();
        self.index_pairs(&pairs).await
    }

    pub async fn index_pairs(&self, pairs: &[(String, ChunkMetadata)]) -> Result<usize, IndexingError> {
        if self.index.create_index_if_absent(&self.schema()).await? {
            info!(
                model = self.embedder.model_id(),
                dims = self.embedder.dimensions(),
                "created search index"
            );
        }
        if pairs.is_empty() {
            return Ok(0);
        }

        let batch_size = self.options.batch_size.max(1);
        let mut written = 0;
        for (batch_number, batch) in pairs.chunks(batch_size).enumerate() {
            let mut entries = Vec::with_capacity(batch.len());
            for (offset, (text, metadata)) in batch.iter().enumerate() {
                let ordinal = batch_number * batch_size + offset;
                entries.push(IndexEntry {
                    id: entry_id(metadata, ordinal, text),
                    text: text.clone(),
                    embedding: self.embedder.embed(text).await?,
                    metadata: metadata.clone(),
                });
            }
            self.index.upsert(&entries).await?;
            written += entries.len();
            debug!(batch = batch_number, entries = entries.len(), "upserted batch");
        }
        Ok(written)
    }
}

/// Stable id so a redelivered ingestion overwrites its own entries.
pub fn entry_id(metadata: &ChunkMetadata, ordinal: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(metadata.document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(metadata.page_number.to_be_bytes());
    hasher.update(metadata.source.as_str().as_bytes());
    hasher.update((ordinal as u64).to_be_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::TextSource;
    use crate::stores::MemorySearchIndex;

    fn indexer(index: Arc<MemorySearchIndex>, batch_size: usize) -> Indexer {
        Indexer::new(
            index,
            Arc::new(CharacterNgramEmbedder { dimensions: 16 }),
            IndexingOptions {
                batch_size,
                ..IndexingOptions::default()
            },
        )
    }

    fn chunks() -> Vec<TextChunk> {
        vec![
            TextChunk::new("| Enzyme | Role |", 1, TextSource::Table),
            TextChunk::new("Enzymes lower activation energy.", 1, TextSource::Text),
            TextChunk::new("  ", 2, TextSource::Ocr),
            TextChunk::new("Scanned appendix", 3, TextSource::Ocr),
        ]
    }

    #[tokio::test]
    async fn blank_chunks_are_skipped_and_metadata_is_attached() {
        let index = Arc::new(MemorySearchIndex::default());
        let written = indexer(index.clone(), 2)
            .index_document("doc-1", "user-1", &chunks())
            .await
            .expect("index");
        assert_eq!(written, 3);

        let entries = index.entries().await;
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|entry| entry.metadata.document_id == "doc-1"));
        assert!(entries.iter().all(|entry| entry.embedding.len() == 16));
        assert_eq!(entries[2].metadata.page_number, 3);
        assert_eq!(entries[2].metadata.source, TextSource::Ocr);
    }

    #[tokio::test]
    async fn reindexing_the_same_document_does_not_duplicate() {
        let index = Arc::new(MemorySearchIndex::default());
        let indexer = indexer(index.clone(), 64);
        indexer
            .index_document("doc-1", "user-1", &chunks())
            .await
            .expect("index");
        indexer
            .index_document("doc-1", "user-1", &chunks())
            .await
            .expect("reindex");
        assert_eq!(index.entries().await.len(), 3);
    }

    #[tokio::test]
    async fn empty_documents_still_create_the_index() {
        let index = Arc::new(MemorySearchIndex::default());
        let written = indexer(index.clone(), 8)
            .index_document("doc-1", "user-1", &[])
            .await
            .expect("index");
        assert_eq!(written, 0);
        assert!(index.index_exists().await.expect("exists"));
    }
}
