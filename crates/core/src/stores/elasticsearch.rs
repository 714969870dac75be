use crate::error::SearchError;
use crate::models::{ChunkMetadata, IndexEntry, RankedHit, ScopeFilter, TextSource};
use crate::traits::{FilterLayout, IndexSchema, QueryShape, SearchIndex};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BACKEND: &str = "elasticsearch";

pub struct ElasticsearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

impl ElasticsearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            index_name: index_name.into(),
        }
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.index_name)
    }

    async fn search(&self, body: &Value) -> Result<Vec<RankedHit>, SearchError> {
        let response = self
            .client
            .post(format!("{}/_search", self.index_url()))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SearchError::NotReady(self.index_name.clone()));
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let response_json: Value = response.json().await?;
        Ok(parse_hits(&response_json))
    }

    async fn check_existing_schema(&self, schema: &IndexSchema) -> Result<(), SearchError> {
        let response = self
            .client
            .get(format!("{}/_mapping", self.index_url()))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: response.status().to_string(),
            });
        }

        let mapping: Value = response.json().await?;
        let (model, dimensions) = recorded_schema(&mapping);
        if model.is_none() {
            warn!(index = %self.index_name, "index records no embedding model");
        }
        schema.check_existing(&self.index_name, model.as_deref(), dimensions)
    }
}

/// Index settings and mapping. Filter fields are mapped both flat and under
/// `metadata`. This crate writes vectors to `vector` only; `embedding` is
/// declared for entries written by indexers that use that field name, which
/// the semantic query shapes fall back to.
pub fn index_mapping(schema: &IndexSchema) -> Value {
    let filter_fields = json!({
        "page_number": {"type": "integer"},
        "source": {"type": "keyword"},
        "document_id": {"type": "keyword"},
        "user_id": {"type": "keyword"}
    });
    let dense_vector = json!({
        "type": "dense_vector",
        "dims": schema.dimensions,
        "index": true,
        "similarity": "cosine"
    });

    let mut properties = json!({
        "text": {
            "type": "text",
            "analyzer": "english",
            "fields": {
                "keyword": {"type": "keyword", "ignore_above": 256},
                "shingles": {"type": "text", "analyzer": "english_shingle"}
            }
        },
        "embedding": dense_vector.clone(),
        "vector": dense_vector,
        "metadata": {"properties": filter_fields.clone()}
    });
    if let (Some(target), Some(fields)) = (properties.as_object_mut(), filter_fields.as_object()) {
        for (name, mapping) in fields {
            target.insert(name.clone(), mapping.clone());
        }
    }

    json!({
        "settings": {
            "analysis": {
                "analyzer": {
                    "english_shingle": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "english_stop", "shingle"]
                    }
                },
                "filter": {
                    "english_stop": {"type": "stop", "stopwords": "_english_"},
                    "shingle": {"type": "shingle", "min_shingle_size": 2, "max_shingle_size": 3}
                }
            }
        },
        "mappings": {
            "_meta": {"embedding_model": schema.embedding_model},
            "properties": properties
        }
    })
}

/// Embedding model and vector width recorded in a `GET <index>/_mapping`
/// response.
fn recorded_schema(mapping_response: &Value) -> (Option<String>, Option<usize>) {
    let mappings = mapping_response
        .as_object()
        .and_then(|indices| indices.values().next())
        .and_then(|index| index.get("mappings"));
    let Some(mappings) = mappings else {
        return (None, None);
    };

    let model = mappings
        .pointer("/_meta/embedding_model")
        .and_then(Value::as_str)
        .map(str::to_string);
    let dimensions = mappings
        .pointer("/properties/vector/dims")
        .and_then(Value::as_u64)
        .map(|dims| dims as usize);
    (model, dimensions)
}

fn entry_document(entry: &IndexEntry) -> Value {
    let metadata = &entry.metadata;
    json!({
        "text": entry.text,
        "vector": entry.embedding,
        "document_id": metadata.document_id,
        "user_id": metadata.user_id,
        "page_number": metadata.page_number,
        "source": metadata.source,
        "metadata": {
            "document_id": metadata.document_id,
            "user_id": metadata.user_id,
            "page_number": metadata.page_number,
            "source": metadata.source
        }
    })
}

pub fn scope_filters(layout: FilterLayout, scope: &ScopeFilter) -> Vec<Value> {
    let mut predicates = vec![json!({"term": {(layout.field("user_id")): scope.user_id}})];
    if !scope.document_ids.is_empty() {
        predicates.push(json!({"terms": {(layout.field("document_id")): scope.document_ids}}));
    }
    predicates
}

pub fn vector_query_body(shape: QueryShape, scope: &ScopeFilter, vector: &[f32], size: usize) -> Value {
    json!({
        "size": size,
        "_source": {"excludes": ["vector", "embedding"]},
        "query": {
            "script_score": {
                "query": {"bool": {"filter": scope_filters(shape.layout, scope)}},
                "script": {
                    "source": format!(
                        "cosineSimilarity(params.query_vector, '{}') + 1.0",
                        shape.vector_field.as_str()
                    ),
                    "params": {"query_vector": vector}
                }
            }
        }
    })
}

pub fn keyword_query_body(layout: FilterLayout, scope: &ScopeFilter, text: &str, size: usize) -> Value {
    json!({
        "size": size,
        "_source": {"excludes": ["vector", "embedding"]},
        "query": {
            "bool": {
                "must": [{
                    "multi_match": {
                        "query": text,
                        "fields": ["text^2", "text.shingles"],
                        "type": "best_fields"
                    }
                }],
                "filter": scope_filters(layout, scope)
            }
        }
    })
}

fn parse_hits(response_json: &Value) -> Vec<RankedHit> {
    let hits = response_json
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut result = Vec::new();
    for raw in hits {
        let source = raw.get("_source").cloned().unwrap_or(Value::Null);
        let id = raw
            .pointer("/_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let score = raw.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
        let text = source
            .pointer("/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        result.push(RankedHit {
            id,
            text,
            metadata: hit_metadata(&source),
            score,
        });
    }
    result
}

/// Reads filter fields from `metadata` when present, else from the top level.
fn hit_metadata(source: &Value) -> ChunkMetadata {
    let fields = source
        .get("metadata")
        .filter(|value| value.get("document_id").is_some())
        .unwrap_or(source);

    let text_field = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    ChunkMetadata {
        document_id: text_field("document_id"),
        user_id: text_field("user_id"),
        page_number: fields
            .get("page_number")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        source: fields
            .get("source")
            .cloned()
            .and_then(|value| serde_json::from_value::<TextSource>(value).ok())
            .unwrap_or(TextSource::Text),
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchStore {
    async fn index_exists(&self) -> Result<bool, SearchError> {
        let response = self.client.head(self.index_url()).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: other.to_string(),
            }),
        }
    }

    async fn create_index_if_absent(&self, schema: &IndexSchema) -> Result<bool, SearchError> {
        if self.index_exists().await? {
            debug!(index = %self.index_name, "index already exists");
            self.check_existing_schema(schema).await?;
            return Ok(false);
        }

        let response = self
            .client
            .put(self.index_url())
            .json(&index_mapping(schema))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(index = %self.index_name, dims = schema.dimensions, "created index");
            return Ok(true);
        }

        let details = response.text().await.unwrap_or_default();
        // Lost a creation race with another worker.
        if status == StatusCode::BAD_REQUEST && details.contains("resource_already_exists_exception") {
            return Ok(false);
        }
        Err(SearchError::Request(format!(
            "elasticsearch index setup failed with {status}: {details}"
        )))
    }

    async fn upsert(&self, entries: &[IndexEntry]) -> Result<(), SearchError> {
        let mut operations = Vec::new();
        for entry in entries {
            operations.push(json!({
                "index": {
                    "_index": self.index_name,
                    "_id": entry.id,
                }
            }));
            operations.push(entry_document(entry));
        }

        if operations.is_empty() {
            return Ok(());
        }

        let payload: String = operations
            .into_iter()
            .map(|value| serde_json::to_string(&value))
            .collect::<Result<Vec<_>, serde_json::Error>>()?
            .join("\n")
            + "\n";

        let response = self
            .client
            .post(format!("{}/_bulk?refresh=wait_for", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: response.status().to_string(),
            });
        }

        let response_json: Value = response.json().await?;
        if response_json.get("errors").and_then(Value::as_bool) == Some(true) {
            let reason = response_json
                .pointer("/items/0/index/error/reason")
                .and_then(Value::as_str)
                .unwrap_or("bulk request reported item errors");
            return Err(SearchError::BackendResponse {
                backend: BACKEND.to_string(),
                details: reason.to_string(),
            });
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
        self.search(&vector_query_body(shape, scope, vector, size)).await
    }

    async fn keyword_query(
        &self,
        layout: FilterLayout,
        scope: &ScopeFilter,
        text: &str,
        size: usize,
    ) -> Result<Vec<RankedHit>, SearchError> {
        self.search(&keyword_query_body(layout, scope, text, size)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{VectorField, SEMANTIC_SHAPES};

    fn scope() -> ScopeFilter {
        ScopeFilter {
            user_id: "user-1".to_string(),
            document_ids: vec!["doc-1".to_string()],
        }
    }

    #[test]
    fn filters_follow_the_layout() {
        let nested = scope_filters(FilterLayout::Nested, &scope());
        assert_eq!(nested[0], json!({"term": {"metadata.user_id": "user-1"}}));
        assert_eq!(nested[1], json!({"terms": {"metadata.document_id": ["doc-1"]}}));

        let unscoped = ScopeFilter {
            user_id: "user-1".to_string(),
            document_ids: Vec::new(),
        };
        let flat = scope_filters(FilterLayout::Flat, &unscoped);
        assert_eq!(flat, vec![json!({"term": {"user_id": "user-1"}})]);
    }

    #[test]
    fn vector_query_scores_by_the_shape_field() {
        let shape = QueryShape {
            layout: FilterLayout::Flat,
            vector_field: VectorField::Embedding,
        };
        let body = vector_query_body(shape, &scope(), &[0.5, 0.25], 10);
        assert_eq!(body["size"], 10);
        assert_eq!(
            body.pointer("/query/script_score/script/source"),
            Some(&json!("cosineSimilarity(params.query_vector, 'embedding') + 1.0"))
        );
        assert_eq!(
            body.pointer("/query/script_score/query/bool/filter/0/term/user_id"),
            Some(&json!("user-1"))
        );
        assert_eq!(SEMANTIC_SHAPES[0].vector_field, VectorField::Vector);
    }

    #[test]
    fn keyword_query_boosts_text_and_uses_shingles() {
        let body = keyword_query_body(FilterLayout::Nested, &scope(), "krebs cycle", 10);
        assert_eq!(
            body.pointer("/query/bool/must/0/multi_match/fields"),
            Some(&json!(["text^2", "text.shingles"]))
        );
    }

    #[test]
    fn mapping_declares_both_vector_fields() {
        let mapping = index_mapping(&IndexSchema {
            dimensions: 768,
            embedding_model: "all-mpnet-base-v2".to_string(),
        });
        assert_eq!(mapping.pointer("/mappings/properties/vector/dims"), Some(&json!(768)));
        assert_eq!(
            mapping.pointer("/mappings/properties/embedding/similarity"),
            Some(&json!("cosine"))
        );
        assert_eq!(
            mapping.pointer("/mappings/properties/user_id/type"),
            Some(&json!("keyword"))
        );
        assert_eq!(
            mapping.pointer("/mappings/properties/metadata/properties/page_number/type"),
            Some(&json!("integer"))
        );
    }

    #[test]
    fn recorded_schema_is_compared_with_the_embedder() {
        let schema = IndexSchema {
            dimensions: 768,
            embedding_model: "all-mpnet-base-v2".to_string(),
        };
        let mapping = json!({
            "pdf_chunks": {
                "mappings": index_mapping(&schema)["mappings"].clone()
            }
        });
        let (model, dimensions) = recorded_schema(&mapping);
        assert_eq!(model.as_deref(), Some("all-mpnet-base-v2"));
        assert_eq!(dimensions, Some(768));
        assert!(schema
            .check_existing("pdf_chunks", model.as_deref(), dimensions)
            .is_ok());

        let other = IndexSchema {
            dimensions: 768,
            embedding_model: "text-embedding-3-small".to_string(),
        };
        assert!(matches!(
            other.check_existing("pdf_chunks", model.as_deref(), dimensions),
            Err(SearchError::SchemaMismatch { .. })
        ));

        let foreign = json!({"pdf_chunks": {"mappings": {"properties": {}}}});
        assert_eq!(recorded_schema(&foreign), (None, None));
        assert!(other.check_existing("pdf_chunks", None, None).is_ok());
    }

    #[test]
    fn entries_are_written_to_the_vector_field() {
        let entry = IndexEntry {
            id: "a".to_string(),
            text: "Osmosis moves water".to_string(),
            embedding: vec![0.1, 0.2],
            metadata: ChunkMetadata {
                document_id: "doc-1".to_string(),
                user_id: "user-1".to_string(),
                page_number: 2,
                source: TextSource::Text,
            },
        };
        let document = entry_document(&entry);
        assert_eq!(document["vector"], json!([0.1f32, 0.2f32]));
        assert!(document.get("embedding").is_none());
        assert_eq!(document.pointer("/metadata/page_number"), Some(&json!(2)));
    }

    #[test]
    fn hits_read_nested_or_flat_metadata() {
        let response = json!({
            "hits": {"hits": [
                {
                    "_id": "a",
                    "_score": 1.7,
                    "_source": {
                        "text": "nested",
                        "metadata": {"document_id": "doc-1", "user_id": "user-1", "page_number": 3, "source": "TABLE"}
                    }
                },
                {
                    "_id": "b",
                    "_score": 1.2,
                    "_source": {"text": "flat", "document_id": "doc-2", "user_id": "user-1", "page_number": 1, "source": "OCR"}
                }
            ]}
        });

        let hits = parse_hits(&response);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.page_number, 3);
        assert_eq!(hits[0].metadata.source, TextSource::Table);
        assert_eq!(hits[1].metadata.document_id, "doc-2");
        assert_eq!(hits[1].metadata.source, TextSource::Ocr);
    }
}
