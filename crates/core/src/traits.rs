use crate::error::{SearchError, StorageError, StoreError};
use crate::models::{IndexEntry, RankedHit, ScopeFilter};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Where the filterable chunk fields live in an indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterLayout {
    /// `metadata.user_id`, `metadata.document_id`, ...
    Nested,
    /// `user_id`, `document_id`, ... at the top level.
    Flat,
}

impl FilterLayout {
    pub fn field(&self, name: &str) -> String {
        match self {
            FilterLayout::Nested => format!("metadata.{name}"),
            FilterLayout::Flat => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorField {
    Vector,
    Embedding,
}

impl VectorField {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorField::Vector => "vector",
            VectorField::Embedding => "embedding",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryShape {
    pub layout: FilterLayout,
    pub vector_field: VectorField,
}

/// Semantic query shapes in the order they are attempted.
pub const SEMANTIC_SHAPES: [QueryShape; 4] = [
    QueryShape {
        layout: FilterLayout::Nested,
        vector_field: VectorField::Vector,
    },
    QueryShape {
        layout: FilterLayout::Nested,
        vector_field: VectorField::Embedding,
    },
    QueryShape {
        layout: FilterLayout::Flat,
        vector_field: VectorField::Vector,
    },
    QueryShape {
        layout: FilterLayout::Flat,
        vector_field: VectorField::Embedding,
    },
];

/// Keyword query layouts in the order they are attempted.
pub const KEYWORD_LAYOUTS: [FilterLayout; 2] = [FilterLayout::Nested, FilterLayout::Flat];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub dimensions: usize,
    pub embedding_model: String,
}

impl IndexSchema {
    /// Fails when an existing index was built with another model or width.
    /// Unrecorded values are accepted.
    pub fn check_existing(
        &self,
        index: &str,
        embedding_model: Option<&str>,
        dimensions: Option<usize>,
    ) -> Result<(), SearchError> {
        let model_differs = embedding_model.is_some_and(|model| model != self.embedding_model);
        let dims_differ = dimensions.is_some_and(|dims| dims != self.dimensions);
        if !model_differs && !dims_differ {
            return Ok(());
        }
        Err(SearchError::SchemaMismatch {
            index: index.to_string(),
            expected: format!("{} ({} dims)", self.embedding_model, self.dimensions),
            found: format!(
                "{} ({} dims)",
                embedding_model.unwrap_or("an unrecorded model"),
                dimensions.map_or_else(|| "unknown".to_string(), |dims| dims.to_string())
            ),
        })
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_exists(&self) -> Result<bool, SearchError>;

    /// Returns `true` when the index was created by this call. An existing
    /// index built for another embedding model is a `SchemaMismatch`.
    async fn create_index_if_absent(&self, schema: &IndexSchema) -> Result<bool, SearchError>;

    /// Entries with an existing id replace the stored entry.
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError>;

    async fn vector_query(
        &self,
        shape: QueryShape,
        scope: &ScopeFilter,
        vector: &[f32],
        size: usize,
    ) -> Result<Vec<RankedHit>, SearchError>;

    async fn keyword_query(
        &self,
        layout: FilterLayout,
        scope: &ScopeFilter,
        text: &str,
        size: usize,
    ) -> Result<Vec<RankedHit>, SearchError>;
}

/// Schemaless record storage keyed by string ids within named collections.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<(), StoreError>;

    /// Merges `fields` into the stored record's top-level object.
    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Records whose top-level `field` equals `value`.
    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>, StoreError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
}
