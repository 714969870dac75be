//! In-process adapters for the search index and record store.

use crate::error::{SearchError, StoreError};
use crate::models::{IndexEntry, RankedHit, ScopeFilter};
use crate::traits::{FilterLayout, IndexSchema, QueryShape, RecordStore, SearchIndex, VectorField};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

const BACKEND: &str = "memory";
const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "to", "was", "what", "which", "with",
];

#[derive(Default)]
struct IndexState {
    schema: Option<IndexSchema>,
    entries: Vec<IndexEntry>,
}

/// Brute-force index: cosine similarity for vectors, BM25 with a bigram
/// bonus for keywords. `layout` and `vector_field` describe how entries are
/// stored, so queries in a different shape behave like they would against a
/// real index (no field, or no matches).
pub struct MemorySearchIndex {
    state: RwLock<IndexState>,
    layout: FilterLayout,
    vector_field: VectorField,
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self::with_layout(FilterLayout::Nested, VectorField::Vector)
    }
}

impl MemorySearchIndex {
    pub fn with_layout(layout: FilterLayout, vector_field: VectorField) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            layout,
            vector_field,
        }
    }

    pub async fn entries(&self) -> Vec<IndexEntry> {
        self.state.read().await.entries.clone()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

fn bigrams(tokens: &[String]) -> HashSet<(String, String)> {
    tokens
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;
    for (a, b) in left.iter().zip(right) {
        dot += f64::from(*a) * f64::from(*b);
        left_norm += f64::from(*a) * f64::from(*a);
        right_norm += f64::from(*b) * f64::from(*b);
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

fn ranked(mut scored: Vec<(f64, &IndexEntry)>, size: usize) -> Vec<RankedHit> {
    scored.sort_by(|left, right| right.0.total_cmp(&left.0).then(left.1.id.cmp(&right.1.id)));
    scored
        .into_iter()
        .take(size)
        .map(|(score, entry)| RankedHit {
            id: entry.id.clone(),
            text: entry.text.clone(),
            metadata: entry.metadata.clone(),
            score,
        })
        .collect()
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn index_exists(&self) -> Result<bool, SearchError> {
        Ok(self.state.read().await.schema.is_some())
    }

    async fn create_index_if_absent(&self, schema: &IndexSchema) -> Result<bool, SearchError> {
        let mut state = self.state.write().await;
        if let Some(existing) = &state.schema {
            schema.check_existing(
                BACKEND,
                Some(existing.embedding_model.as_str()),
                Some(existing.dimensions),
            )?;
            return Ok(false);
        }
        state.schema = Some(schema.clone());
        Ok(true)
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError> {
        let mut state = self.state.write().await;
        let dimensions = match &state.schema {
            Some(schema) => schema.dimensions,
            None => return Err(SearchError::NotReady(BACKEND.to_string())),
        };

        if let Some(entry) = entries
            .iter()
            .find(|entry| entry.embedding.len() != dimensions)
        {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!(
                    "vector of {} dims for a {dimensions}-dim index",
                    entry.embedding.len()
                ),
            });
        }

        for entry in entries {
            match state.entries.iter_mut().find(|stored| stored.id == entry.id) {
                Some(stored) => *stored = entry.clone(),
                None => state.entries.push(entry.clone()),
            }
        }
        Ok(())
    }

    async fn vector_query(
        &self,
        shape: QueryShape,
        scope: &ScopeFilter,
        vector: &[f32],
        size: usize,
    ) -> Result<Vec<RankedHit>, SearchError> {
        if shape.vector_field != self.vector_field {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("no vector field named {}", shape.vector_field.as_str()),
            });
        }
        if shape.layout != self.layout {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let scored = state
            .entries
            .iter()
            .filter(|entry| scope.admits(&entry.metadata))
            .map(|entry| (cosine_similarity(vector, &entry.embedding) + 1.0, entry))
            .collect();
        Ok(ranked(scored, size))
    }

    async fn keyword_query(
        &self,
        layout: FilterLayout,
        scope: &ScopeFilter,
        text: &str,
        size: usize,
    ) -> Result<Vec<RankedHit>, SearchError> {
        if layout != self.layout {
            return Ok(Vec::new());
        }

        let query_terms = tokenize(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let query_bigrams = bigrams(&query_terms);

        let state = self.state.read().await;
        let documents = state
            .entries
            .iter()
            .map(|entry| (entry, tokenize(&entry.text)))
            .collect::<Vec<_>>();

        let total = documents.len() as f64;
        let average_length = documents
            .iter()
            .map(|(_, tokens)| tokens.len() as f64)
            .sum::<f64>()
            / total.max(1.0);

        let mut document_frequency = HashMap::<&str, f64>::new();
        for term in &query_terms {
            let count = documents
                .iter()
                .filter(|(_, tokens)| tokens.contains(term))
                .count();
            document_frequency.insert(term.as_str(), count as f64);
        }

        let mut scored = Vec::new();
        for (entry, tokens) in &documents {
            if !scope.admits(&entry.metadata) {
                continue;
            }

            let length = tokens.len() as f64;
            let mut score = 0.0;
            for term in &query_terms {
                let frequency = tokens.iter().filter(|token| *token == term).count() as f64;
                if frequency == 0.0 {
                    continue;
                }
                let df = document_frequency.get(term.as_str()).copied().unwrap_or(0.0);
                let idf = (1.0 + (total - df + 0.5) / (df + 0.5)).ln();
                let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * length / average_length.max(1.0));
                score += idf * frequency * (BM25_K1 + 1.0) / (frequency + norm);
            }

            // Text field carries a boost of 2; the shingle field rewards phrases.
            let phrase_matches = bigrams(tokens).intersection(&query_bigrams).count() as f64;
            let score = (2.0 * score).max(phrase_matches);
            if score > 0.0 {
                scored.push((score, *entry));
            }
        }
        Ok(ranked(scored, size))
    }
}

/// Collections of JSON records held in memory. Records are returned in id
/// order.
#[derive(Default)]
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn update_fields(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        merge_fields(record, fields, id)
    }

    async fn query(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|record| record.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub(crate) fn merge_fields(record: &mut Value, fields: Map<String, Value>, id: &str) -> Result<(), StoreError> {
    let Some(object) = record.as_object_mut() else {
        return Err(StoreError::InvalidId(format!("{id} is not an object record")));
    };
    for (name, value) in fields {
        object.insert(name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, TextSource};
    use crate::traits::SEMANTIC_SHAPES;
    use serde_json::json;

    fn entry(id: &str, document_id: &str, user_id: &str, text: &str, embedding: Vec<f32>) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            metadata: ChunkMetadata {
                document_id: document_id.to_string(),
                user_id: user_id.to_string(),
                page_number: 1,
                source: TextSource::Text,
            },
        }
    }

    fn schema() -> IndexSchema {
        IndexSchema {
            dimensions: 2,
            embedding_model: "test".to_string(),
        }
    }

    fn scope(user_id: &str, document_ids: &[&str]) -> ScopeFilter {
        ScopeFilter {
            user_id: user_id.to_string(),
            document_ids: document_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    async fn seeded(index: &MemorySearchIndex) {
        assert!(index.create_index_if_absent(&schema()).await.expect("create"));
        assert!(!index.create_index_if_absent(&schema()).await.expect("create again"));
        index
            .upsert(&[
                entry("a", "doc-1", "user-1", "The Krebs cycle releases carbon dioxide", vec![1.0, 0.0]),
                entry("b", "doc-2", "user-1", "Glycolysis happens in the cytoplasm", vec![0.0, 1.0]),
                entry("c", "doc-3", "user-2", "The Krebs cycle in bacteria", vec![1.0, 0.1]),
            ])
            .await
            .expect("upsert");
    }

    #[tokio::test]
    async fn vector_query_ranks_by_cosine_within_scope() {
        let index = MemorySearchIndex::default();
        seeded(&index).await;

        let hits = index
            .vector_query(SEMANTIC_SHAPES[0], &scope("user-1", &[]), &[1.0, 0.0], 10)
            .await
            .expect("query");
        assert_eq!(hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!((hits[0].score - 2.0).abs() < 1e-9);

        let scoped = index
            .vector_query(SEMANTIC_SHAPES[0], &scope("user-1", &["doc-2"]), &[1.0, 0.0], 10)
            .await
            .expect("query");
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].metadata.document_id, "doc-2");
    }

    #[tokio::test]
    async fn other_shapes_miss_or_fail() {
        let index = MemorySearchIndex::with_layout(FilterLayout::Flat, VectorField::Embedding);
        seeded(&index).await;

        let unknown_field = index
            .vector_query(SEMANTIC_SHAPES[0], &scope("user-1", &[]), &[1.0, 0.0], 10)
            .await;
        assert!(unknown_field.is_err());

        let wrong_layout = index
            .vector_query(SEMANTIC_SHAPES[1], &scope("user-1", &[]), &[1.0, 0.0], 10)
            .await
            .expect("query");
        assert!(wrong_layout.is_empty());

        let matching = index
            .vector_query(SEMANTIC_SHAPES[3], &scope("user-1", &[]), &[1.0, 0.0], 10)
            .await
            .expect("query");
        assert_eq!(matching.len(), 2);
    }

    #[tokio::test]
    async fn keyword_query_prefers_phrase_matches_and_respects_owner() {
        let index = MemorySearchIndex::default();
        seeded(&index).await;

        let hits = index
            .keyword_query(FilterLayout::Nested, &scope("user-1", &[]), "what is the krebs cycle", 10)
            .await
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let flat = index
            .keyword_query(FilterLayout::Flat, &scope("user-1", &[]), "krebs", 10)
            .await
            .expect("query");
        assert!(flat.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_entries_with_the_same_id() {
        let index = MemorySearchIndex::default();
        seeded(&index).await;
        index
            .upsert(&[entry("a", "doc-1", "user-1", "rewritten", vec![0.5, 0.5])])
            .await
            .expect("upsert");

        let entries = index.entries().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].text, "rewritten");
    }

    #[tokio::test]
    async fn a_bad_vector_rejects_the_whole_batch() {
        let index = MemorySearchIndex::default();
        seeded(&index).await;

        let result = index
            .upsert(&[
                entry("d", "doc-4", "user-1", "valid width", vec![0.3, 0.7]),
                entry("e", "doc-4", "user-1", "too wide", vec![0.1, 0.2, 0.3]),
            ])
            .await;
        assert!(matches!(result, Err(SearchError::BackendResponse { .. })));

        let ids = index
            .entries()
            .await
            .into_iter()
            .map(|entry| entry.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn reopening_with_another_model_is_refused() {
        let index = MemorySearchIndex::default();
        seeded(&index).await;

        let other_model = IndexSchema {
            embedding_model: "other-model".to_string(),
            ..schema()
        };
        let result = index.create_index_if_absent(&other_model).await;
        assert!(matches!(result, Err(SearchError::SchemaMismatch { .. })));

        let wider = IndexSchema {
            dimensions: 3,
            ..schema()
        };
        assert!(index.create_index_if_absent(&wider).await.is_err());
    }

    #[tokio::test]
    async fn record_store_updates_and_queries() {
        let store = MemoryRecordStore::new();
        store
            .put("users", "u1", json!({"email": "ada@example.com", "name": "Ada"}))
            .await
            .expect("put");

        let mut fields = Map::new();
        fields.insert("name".to_string(), json!("Ada L."));
        store.update_fields("users", "u1", fields).await.expect("update");

        let found = store
            .query("users", "email", &json!("ada@example.com"))
            .await
            .expect("query");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["name"], "Ada L.");

        let missing = store.update_fields("users", "nobody", Map::new()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }
}
