//! Schema-constrained study artifacts: summary, mind map and flashcards.

use crate::completion::{CompletionRequest, CompletionService};
use crate::config::GenerationOptions;
use crate::error::GenerationError;
use crate::models::{
    ContentType, FlashcardList, GeneratedArtifacts, MindMapNode, Summary, TextChunk,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub struct ContentGenerator {
    completion: Arc<dyn CompletionService>,
    options: GenerationOptions,
}

impl ContentGenerator {
    pub fn new(completion: Arc<dyn CompletionService>, options: GenerationOptions) -> Self {
        Self {
            completion,
            options,
        }
    }

    /// Runs the three generations concurrently. Any failure fails the whole
    /// pass.
    pub async fn generate(&self, chunks: &[TextChunk]) -> Result<GeneratedArtifacts, GenerationError> {
        let text = document_text(chunks);
        let text = truncate_chars(&text, self.options.max_prompt_chars);

        let (summary, mind_map, flashcards) = tokio::try_join!(
            self.request::<Summary>(ContentType::Summary, text),
            self.request::<MindMapNode>(ContentType::Mindmap, text),
            self.request::<FlashcardList>(ContentType::Flashcards, text),
        )?;

        let (mind_map, pruned) = prune_mind_map(
            mind_map,
            self.options.mind_map_max_depth,
            self.options.mind_map_max_children,
        );
        if pruned > 0 {
            warn!(pruned, "mind map exceeded its depth or fan-out cap");
        }

        Ok(GeneratedArtifacts {
            summary,
            mind_map,
            flashcards,
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        kind: ContentType,
        document_text: &str,
    ) -> Result<T, GenerationError> {
        let schema = schema_for(kind);
        let prompt = format!(
            "{}\nFollow the output schema exactly and answer with a single JSON object.\n\n\
             Output schema:\n{}\n\nDocument Text:\n{}",
            instruction_for(kind),
            schema,
            document_text
        );
        let request = CompletionRequest::new(prompt)
            .with_schema(schema)
            .with_temperature(self.options.temperature);

        debug!(?kind, "requesting generation");
        let raw = self
            .completion
            .complete(&request)
            .await
            .map_err(|source| GenerationError::Completion { kind, source })?;
        parse_artifact(kind, &raw)
    }
}

impl GeneratedArtifacts {
    /// Persistable payloads in `ContentType::ALL` order.
    pub fn content_data(&self) -> Result<Vec<(ContentType, Value)>, GenerationError> {
        Ok(vec![
            (ContentType::Summary, to_data(ContentType::Summary, &self.summary)?),
            (ContentType::Mindmap, to_data(ContentType::Mindmap, &self.mind_map)?),
            (
                ContentType::Flashcards,
                to_data(ContentType::Flashcards, &self.flashcards)?,
            ),
        ])
    }
}

fn to_data<T: Serialize>(kind: ContentType, value: &T) -> Result<Value, GenerationError> {
    serde_json::to_value(value).map_err(|error| GenerationError::Schema {
        kind,
        details: error.to_string(),
    })
}

fn instruction_for(kind: ContentType) -> &'static str {
    match kind {
        ContentType::Summary => {
            "You are an expert tutor. Produce a concise summary of the following document text."
        }
        ContentType::Mindmap => {
            "Create a hierarchical mind map of the key topics in the following document text. \
             Every node has a topic and a list of child nodes."
        }
        ContentType::Flashcards => {
            "Generate a list of concise flashcards (term + definition) from the following document text."
        }
    }
}

pub fn schema_for(kind: ContentType) -> Value {
    match kind {
        ContentType::Summary => json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string", "description": "A concise summary of the document."}
            },
            "required": ["summary"]
        }),
        ContentType::Mindmap => json!({
            "$defs": {
                "MindMapNode": {
                    "type": "object",
                    "properties": {
                        "topic": {"type": "string", "description": "The central topic or idea."},
                        "children": {
                            "type": "array",
                            "items": {"$ref": "#/$defs/MindMapNode"},
                            "description": "Subtopics."
                        }
                    },
                    "required": ["topic"]
                }
            },
            "$ref": "#/$defs/MindMapNode"
        }),
        ContentType::Flashcards => json!({
            "type": "object",
            "properties": {
                "flashcards": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "term": {"type": "string"},
                            "definition": {"type": "string"}
                        },
                        "required": ["term", "definition"]
                    }
                }
            },
            "required": ["flashcards"]
        }),
    }
}

/// Chunk texts in chunk order, separated by blank lines.
pub fn document_text(chunks: &[TextChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.text.trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Models often wrap JSON in a markdown fence; accept that.
fn code_fence() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)\s*```").ok())
        .as_ref()
}

/// Body of the first markdown code fence, or the trimmed input when there is
/// none.
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    code_fence()
        .and_then(|fence| fence.captures(trimmed))
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .unwrap_or(trimmed)
}

fn parse_artifact<T: DeserializeOwned>(kind: ContentType, raw: &str) -> Result<T, GenerationError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|error| GenerationError::Schema {
        kind,
        details: error.to_string(),
    })
}

/// Drops nodes below `max_depth` levels (the root is level 1) and children
/// beyond `max_children` per node. Returns the pruned tree and the number of
/// nodes removed.
pub fn prune_mind_map(
    node: MindMapNode,
    max_depth: usize,
    max_children: usize,
) -> (MindMapNode, usize) {
    fn count(node: &MindMapNode) -> usize {
        1 + node.children.iter().map(count).sum::<usize>()
    }

    fn prune(node: MindMapNode, depth: usize, max_depth: usize, max_children: usize) -> (MindMapNode, usize) {
        let mut removed = 0;
        let mut children = Vec::new();
        for (index, child) in node.children.into_iter().enumerate() {
            if depth >= max_depth || index >= max_children {
                removed += count(&child);
                continue;
            }
            let (child, child_removed) = prune(child, depth + 1, max_depth, max_children);
            removed += child_removed;
            children.push(child);
        }
        (
            MindMapNode {
                topic: node.topic,
                children,
            },
            removed,
        )
    }

    prune(node, 1, max_depth.max(1), max_children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompletionError;
    use crate::models::TextSource;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers by the instruction at the start of the prompt.
    struct ScriptedCompletion {
        summary: String,
        mind_map: String,
        flashcards: String,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedCompletion {
        fn new(summary: &str, mind_map: &str, flashcards: &str) -> Self {
            Self {
                summary: summary.to_string(),
                mind_map: mind_map.to_string(),
                flashcards: flashcards.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
            self.prompts
                .lock()
                .expect("lock")
                .push(request.prompt.clone());
            let reply = if request.prompt.contains("concise summary") {
                &self.summary
            } else if request.prompt.contains("mind map") {
                &self.mind_map
            } else {
                &self.flashcards
            };
            Ok(reply.clone())
        }
    }

    fn chunks() -> Vec<TextChunk> {
        vec![
            TextChunk::new("| Term | Meaning |", 1, TextSource::Table),
            TextChunk::new("", 1, TextSource::Ocr),
            TextChunk::new("Glycolysis splits glucose.", 2, TextSource::Text),
        ]
    }

    #[tokio::test]
    async fn generates_all_three_artifacts() {
        let completion = Arc::new(ScriptedCompletion::new(
            r#"{"summary": "Cells make energy."}"#,
            "```json\n{\"topic\": \"Respiration\", \"children\": [{\"topic\": \"Glycolysis\"}]}\n```",
            r#"{"flashcards": [{"term": "ATP", "definition": "Energy carrier"}]}"#,
        ));
        let generator = ContentGenerator::new(completion.clone(), GenerationOptions::default());

        let artifacts = generator.generate(&chunks()).await.expect("generate");
        assert_eq!(artifacts.summary.summary, "Cells make energy.");
        assert_eq!(artifacts.mind_map.topic, "Respiration");
        assert_eq!(artifacts.mind_map.children[0].topic, "Glycolysis");
        assert_eq!(artifacts.flashcards.flashcards[0].term, "ATP");

        let prompts = completion.prompts.lock().expect("lock");
        assert_eq!(prompts.len(), 3);
        assert!(prompts
            .iter()
            .all(|prompt| prompt.ends_with("| Term | Meaning |\n\nGlycolysis splits glucose.")));

        let data = artifacts.content_data().expect("content data");
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].0, ContentType::Summary);
        assert_eq!(data[2].1["flashcards"][0]["definition"], "Energy carrier");
    }

    #[tokio::test]
    async fn any_schema_mismatch_fails_the_pass() {
        let completion = Arc::new(ScriptedCompletion::new(
            r#"{"summary": "ok"}"#,
            r#"{"title": "no topic here"}"#,
            r#"{"flashcards": []}"#,
        ));
        let generator = ContentGenerator::new(completion, GenerationOptions::default());

        let error = generator.generate(&chunks()).await.expect_err("must fail");
        assert!(matches!(
            error,
            GenerationError::Schema {
                kind: ContentType::Mindmap,
                ..
            }
        ));
    }

    #[test]
    fn pruning_caps_depth_and_fan_out() {
        let leaf = |topic: &str| MindMapNode {
            topic: topic.to_string(),
            children: Vec::new(),
        };
        let root = MindMapNode {
            topic: "root".to_string(),
            children: vec![
                MindMapNode {
                    topic: "a".to_string(),
                    children: vec![leaf("a1"), leaf("a2")],
                },
                leaf("b"),
                leaf("c"),
            ],
        };

        let (pruned, removed) = prune_mind_map(root, 2, 2);
        assert_eq!(pruned.children.len(), 2);
        assert!(pruned.children[0].children.is_empty());
        assert_eq!(removed, 3);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(
            strip_code_fence("Here it is:\n```\n{\"a\":1}\n```\nDone."),
            "{\"a\":1}"
        );
    }
}
