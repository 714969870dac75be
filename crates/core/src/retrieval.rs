//! Hybrid retrieval: a semantic and a keyword leg fused with weighted
//! reciprocal rank fusion, then a grounded answer over the fused context.

use crate::completion::{CompletionRequest, CompletionService};
use crate::config::RetrievalOptions;
use crate::embeddings::Embedder;
use crate::error::{RetrievalError, SearchError};
use crate::generation::strip_code_fence;
use crate::models::{ChatAnswer, ChatQuery, RankedHit, RetrievalHit, ScopeFilter, SourceRef};
use crate::records::DocumentRepository;
use crate::traits::{SearchIndex, KEYWORD_LAYOUTS, SEMANTIC_SHAPES};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const NOTHING_INDEXED_ANSWER: &str =
    "No documents have been indexed yet. Upload PDFs to index them before querying.";
pub const NOT_ENOUGH_INFORMATION_ANSWER: &str =
    "I don't have enough information in the provided documents to answer that.";
pub const UNKNOWN_DOCUMENT: &str = "Unknown Document";

const SYSTEM_PROMPT: &str = "You are an expert tutor with deep knowledge across many domains. \
Give clear, accurate and well-structured explanations that help students understand complex concepts. \
Write simple markdown that renders cleanly in a web page and cite every source you rely on.";

const ANSWER_INSTRUCTIONS: &str = "INSTRUCTIONS:
1. Start with a direct answer of two or three sentences.
2. Expand with a structured explanation. Use **bold** for key terms and bullet or numbered lists for steps.
3. Give a concrete example when it helps.
4. Cite the context as *[Source: DocumentName, Page X]* whenever you use it.
5. Finish with two or three key takeaways.

RULES:
- Use ONLY information from the CONTEXT.
- Keep headers to ## and ###. No horizontal rules, HTML or nested structures.
- If the CONTEXT does not contain enough information, say: \"I don't have enough information in the provided documents to fully answer that question.\"
- Reply with a JSON object: {\"answer\": <markdown>, \"sources\": [{\"document_id\": <id>, \"page\": <page>}]}. \
Take document ids from the DOCUMENTS list.";

pub struct HybridRetriever {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionService>,
    documents: DocumentRepository,
    options: RetrievalOptions,
    names: Mutex<HashMap<String, String>>,
}

/// One fused hit with its resolved document name.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    pub hit: RetrievalHit,
    pub document_name: String,
}

impl ContextBlock {
    pub fn header(&self) -> String {
        format!(
            "[Source: {}, Page {}]",
            self.document_name, self.hit.metadata.page_number
        )
    }

    pub fn render(&self) -> String {
        format!("{}\n{}", self.header(), self.hit.text)
    }
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        completion: Arc<dyn CompletionService>,
        documents: DocumentRepository,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            completion,
            documents,
            options,
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Fused, deduplicated hits within the query's scope, best first.
    /// Leg failures are absorbed; an unknown index yields no hits.
    pub async fn search(&self, query: &ChatQuery) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if !self.index_ready().await {
            return Ok(Vec::new());
        }

        let scope = query.scope();
        let (semantic, keyword) = tokio::join!(
            self.semantic_leg(&scope, text),
            self.keyword_leg(&scope, text)
        );
        let semantic = semantic.unwrap_or_else(|error| {
            warn!(leg = "semantic", error = %error, "retrieval leg failed");
            Vec::new()
        });
        let keyword = keyword.unwrap_or_else(|error| {
            warn!(leg = "keyword", error = %error, "retrieval leg failed");
            Vec::new()
        });

        let semantic = in_scope(semantic, &scope);
        let keyword = in_scope(keyword, &scope);
        debug!(semantic = semantic.len(), keyword = keyword.len(), "retrieval legs finished");

        let fused = fuse(&semantic, &keyword, &self.options);
        Ok(dedup_by_text(fused, self.options.context_hits))
    }

    pub async fn answer(&self, query: &ChatQuery) -> Result<ChatAnswer, RetrievalError> {
        if query.text.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if !self.index_ready().await {
            return Ok(ChatAnswer {
                answer: NOTHING_INDEXED_ANSWER.to_string(),
                sources: Vec::new(),
            });
        }

        let hits = self.search(query).await?;
        let mut blocks = Vec::with_capacity(hits.len());
        for hit in hits {
            let document_name = self.document_name(&hit.metadata.document_id).await;
            blocks.push(ContextBlock { hit, document_name });
        }
        info!(blocks = blocks.len(), "assembled answer context");

        let context = blocks
            .iter()
            .map(ContextBlock::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = CompletionRequest::new(answer_prompt(&context, &blocks, query.text.trim()))
            .with_system(SYSTEM_PROMPT)
            .with_schema(answer_schema())
            .with_temperature(self.options.temperature);

        let reply = match self.completion.complete(&request).await {
            Ok(raw) => Some(parse_reply(&raw)),
            Err(error) => {
                warn!(error = %error, "answer generation failed");
                None
            }
        };

        Ok(ground(reply, &blocks))
    }

    async fn index_ready(&self) -> bool {
        match self.index.index_exists().await {
            Ok(exists) => exists,
            Err(error) => {
                warn!(error = %error, "could not check the search index");
                false
            }
        }
    }

    /// First query shape that runs without error wins.
    async fn semantic_leg(&self, scope: &ScopeFilter, text: &str) -> Result<Vec<RankedHit>, SearchError> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|error| SearchError::Request(error.to_string()))?;

        let mut last_error = None;
        for shape in SEMANTIC_SHAPES {
            match self
                .index
                .vector_query(shape, scope, &vector, self.options.leg_top_k)
                .await
            {
                Ok(hits) => return Ok(hits),
                Err(error) => {
                    debug!(?shape, error = %error, "semantic query shape failed");
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| SearchError::Request("no semantic query shapes".to_string())))
    }

    /// Falls through to the next layout on error or on an empty result.
    async fn keyword_leg(&self, scope: &ScopeFilter, text: &str) -> Result<Vec<RankedHit>, SearchError> {
        let mut last_error = None;
        for layout in KEYWORD_LAYOUTS {
            match self
                .index
                .keyword_query(layout, scope, text, self.options.leg_top_k)
                .await
            {
                Ok(hits) if !hits.is_empty() => return Ok(hits),
                Ok(_) => last_error = None,
                Err(error) => {
                    debug!(?layout, error = %error, "keyword query layout failed");
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(Vec::new()),
        }
    }

    async fn document_name(&self, document_id: &str) -> String {
        if let Some(name) = self.names.lock().await.get(document_id) {
            return name.clone();
        }

        let name = match self.documents.display_name(document_id).await {
            Ok(Some(name)) => name,
            Ok(None) => UNKNOWN_DOCUMENT.to_string(),
            Err(error) => {
                warn!(document_id, error = %error, "document name lookup failed");
                UNKNOWN_DOCUMENT.to_string()
            }
        };
        self.names
            .lock()
            .await
            .insert(document_id.to_string(), name.clone());
        name
    }
}

fn in_scope(hits: Vec<RankedHit>, scope: &ScopeFilter) -> Vec<RankedHit> {
    hits.into_iter()
        .filter(|hit| scope.admits(&hit.metadata))
        .collect()
}

/// Weighted reciprocal rank fusion. Ranks are 1-based; a hit missing from a
/// leg contributes nothing for it. Ties keep first-seen order.
pub fn fuse(semantic: &[RankedHit], keyword: &[RankedHit], options: &RetrievalOptions) -> Vec<RetrievalHit> {
    let mut order = Vec::<String>::new();
    let mut scored = HashMap::<String, RetrievalHit>::new();
    apply_rrf(&mut scored, &mut order, semantic, options.semantic_weight, options.rrf_k);
    apply_rrf(&mut scored, &mut order, keyword, options.keyword_weight, options.rrf_k);

    let mut fused = order
        .iter()
        .filter_map(|id| scored.remove(id))
        .collect::<Vec<_>>();
    fused.sort_by(|left, right| right.fused_score.total_cmp(&left.fused_score));
    fused
}

fn apply_rrf(
    target: &mut HashMap<String, RetrievalHit>,
    order: &mut Vec<String>,
    hits: &[RankedHit],
    weight: f64,
    k: f64,
) {
    for (position, hit) in hits.iter().enumerate() {
        let contribution = weight / (k + (position as f64 + 1.0));
        let entry = target.entry(hit.id.clone()).or_insert_with(|| {
            order.push(hit.id.clone());
            RetrievalHit {
                id: hit.id.clone(),
                text: hit.text.clone(),
                metadata: hit.metadata.clone(),
                fused_score: 0.0,
            }
        });
        entry.fused_score += contribution;
    }
}

/// Keeps the best-ranked hit per exact text, then the first `limit`.
pub fn dedup_by_text(hits: Vec<RetrievalHit>, limit: usize) -> Vec<RetrievalHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(hit.text.clone()))
        .take(limit)
        .collect()
}

fn answer_prompt(context: &str, blocks: &[ContextBlock], question: &str) -> String {
    let documents = blocks
        .iter()
        .map(|block| {
            format!(
                "- {} = document_id {}",
                block.document_name, block.hit.metadata.document_id
            )
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "CONTEXT:\n{context}\n\nDOCUMENTS:\n{documents}\n\nQUESTION:\n{question}\n\n{ANSWER_INSTRUCTIONS}"
    )
}

fn answer_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "answer": {"type": "string"},
            "sources": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "document_id": {"type": "string"},
                        "page": {"type": "integer"}
                    },
                    "required": ["document_id"]
                }
            }
        },
        "required": ["answer"]
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelSource {
    Reference(SourceRef),
    DocumentId(String),
}

impl From<ModelSource> for SourceRef {
    fn from(source: ModelSource) -> Self {
        match source {
            ModelSource::Reference(reference) => reference,
            ModelSource::DocumentId(document_id) => SourceRef {
                document_id,
                page: None,
                score: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StructuredReply {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    sources: Vec<ModelSource>,
}

#[derive(Debug, Clone, PartialEq)]
struct ModelReply {
    answer: Option<String>,
    sources: Vec<SourceRef>,
}

/// Structured `{answer, sources}` when the output parses; otherwise the raw
/// text is the answer.
fn parse_reply(raw: &str) -> ModelReply {
    let trimmed = raw.trim();
    // Markdown answers may contain fences of their own, so bare JSON is tried
    // before the fenced body.
    let structured = serde_json::from_str::<StructuredReply>(trimmed)
        .or_else(|_| serde_json::from_str::<StructuredReply>(strip_code_fence(trimmed)));
    match structured {
        Ok(reply) if reply.answer.as_deref().is_some_and(|a| !a.trim().is_empty()) => ModelReply {
            answer: reply.answer,
            sources: reply.sources.into_iter().map(SourceRef::from).collect(),
        },
        _ => ModelReply {
            answer: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            sources: Vec::new(),
        },
    }
}

/// First line of each of the top two context blocks.
pub fn extractive_fallback(blocks: &[ContextBlock]) -> String {
    if blocks.is_empty() {
        return NOT_ENOUGH_INFORMATION_ANSWER.to_string();
    }
    let lines = blocks
        .iter()
        .take(2)
        .map(ContextBlock::header)
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Based on the retrieved documents:\n{lines}")
}

fn context_sources(blocks: &[ContextBlock]) -> Vec<SourceRef> {
    blocks
        .iter()
        .map(|block| SourceRef {
            document_id: block.hit.metadata.document_id.clone(),
            page: Some(block.hit.metadata.page_number),
            score: Some(block.hit.fused_score),
        })
        .collect()
}

/// Returned sources are always drawn from the retrieved documents; an answer
/// whose citations all fall outside them is replaced.
fn ground(reply: Option<ModelReply>, blocks: &[ContextBlock]) -> ChatAnswer {
    let fallback = || ChatAnswer {
        answer: extractive_fallback(blocks),
        sources: Vec::new(),
    };

    let Some(ModelReply {
        answer: Some(answer),
        sources,
    }) = reply
    else {
        info!("no answer produced, using extractive fallback");
        return fallback();
    };

    if sources.is_empty() {
        return ChatAnswer {
            answer,
            sources: context_sources(blocks),
        };
    }

    let retrieved = blocks
        .iter()
        .map(|block| block.hit.metadata.document_id.as_str())
        .collect::<HashSet<_>>();
    let cited = sources.len();
    let grounded = sources
        .into_iter()
        .filter(|source| retrieved.contains(source.document_id.as_str()))
        .collect::<Vec<_>>();

    if grounded.is_empty() {
        warn!(cited, "answer cited no retrieved document, using extractive fallback");
        return fallback();
    }
    ChatAnswer {
        answer,
        sources: grounded,
    }
}
