use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TextSource {
    Text,
    Ocr,
    Table,
}

impl TextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextSource::Text => "TEXT",
            TextSource::Ocr => "OCR",
            TextSource::Table => "TABLE",
        }
    }
}

/// One unit of extracted page content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub page_number: u32,
    pub source: TextSource,
}

impl TextChunk {
    pub fn new(text: impl Into<String>, page_number: u32, source: TextSource) -> Self {
        Self {
            text: text.into(),
            page_number,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    fn stage(&self) -> u8 {
        match self {
            ProcessingStatus::Uploading => 0,
            ProcessingStatus::Processing => 1,
            ProcessingStatus::Completed | ProcessingStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage() == 2
    }

    /// Status only moves forward and terminal states can only be reached
    /// from `Processing`. Re-asserting `Processing` is allowed.
    pub fn can_advance_to(&self, next: ProcessingStatus) -> bool {
        match (self, next) {
            (ProcessingStatus::Uploading, ProcessingStatus::Processing) => true,
            (ProcessingStatus::Processing, ProcessingStatus::Processing) => true,
            (ProcessingStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub user_id: String,
    pub original_filename: String,
    pub object_key: String,
    pub processing_status: ProcessingStatus,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Summary,
    Mindmap,
    Flashcards,
}

impl ContentType {
    pub const ALL: [ContentType; 3] = [
        ContentType::Summary,
        ContentType::Mindmap,
        ContentType::Flashcards,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedContent {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub content_type: ContentType,
    pub content_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MindMapNode {
    pub topic: String,
    #[serde(default)]
    pub children: Vec<MindMapNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flashcard {
    pub term: String,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlashcardList {
    pub flashcards: Vec<Flashcard>,
}

/// The three artifacts produced by one successful generation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedArtifacts {
    pub summary: Summary,
    pub mind_map: MindMapNode,
    pub flashcards: FlashcardList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub user_id: String,
    pub page_number: u32,
    pub source: TextSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A hit as returned by one retrieval leg, in that leg's rank order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
}

/// A hit after score fusion. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub fused_score: f64,
}

/// Principal and optional document scope applied to every index query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ScopeFilter {
    pub user_id: String,
    pub document_ids: Vec<String>,
}

impl ScopeFilter {
    pub fn admits(&self, metadata: &ChunkMetadata) -> bool {
        metadata.user_id == self.user_id
            && (self.document_ids.is_empty() || self.document_ids.contains(&metadata.document_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatQuery {
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub document_ids: Vec<String>,
}

impl ChatQuery {
    pub fn scope(&self) -> ScopeFilter {
        ScopeFilter {
            user_id: self.user_id.clone(),
            document_ids: self.document_ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub document_id: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}
