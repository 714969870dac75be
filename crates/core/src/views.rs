//! Read-side shapes of generated content.

use crate::models::{ContentType, FlashcardList, GeneratedContent, MindMapNode, Summary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub level: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MindMapGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionCard {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ViewData {
    Summary(Summary),
    MindMap(MindMapGraph),
    Flashcards { flashcards: Vec<QuestionCard> },
    /// Stored payload that no longer parses as its type; shown as stored.
    Raw(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeneratedView {
    pub id: String,
    pub document_id: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
    pub content_data: ViewData,
}

#[derive(Debug, Default)]
struct NodeIds {
    next: usize,
}

impl NodeIds {
    fn issue(&mut self) -> String {
        let id = format!("node_{}", self.next);
        self.next += 1;
        id
    }
}

/// Flattens the tree depth-first; ids are `node_0`, `node_1`, ... in visit
/// order and `level` is the depth below the root.
pub fn mind_map_graph(root: &MindMapNode) -> MindMapGraph {
    fn visit(
        node: &MindMapNode,
        parent: Option<&str>,
        level: usize,
        ids: &mut NodeIds,
    ) -> MindMapGraph {
        let id = ids.issue();
        let mut graph = MindMapGraph::default();
        if let Some(parent) = parent {
            graph.edges.push(GraphEdge {
                from: parent.to_string(),
                to: id.clone(),
            });
        }
        graph.nodes.push(GraphNode {
            id: id.clone(),
            label: node.topic.clone(),
            level,
            parent: parent.map(str::to_string),
        });

        for child in &node.children {
            let sub = visit(child, Some(&id), level + 1, ids);
            graph.nodes.extend(sub.nodes);
            graph.edges.extend(sub.edges);
        }
        graph
    }

    visit(root, None, 0, &mut NodeIds::default())
}

pub fn question_cards(list: &FlashcardList) -> Vec<QuestionCard> {
    list.flashcards
        .iter()
        .map(|card| QuestionCard {
            question: card.term.clone(),
            answer: card.definition.clone(),
        })
        .collect()
}

pub fn render(content: &GeneratedContent) -> GeneratedView {
    let data = &content.content_data;
    let content_data = match content.content_type {
        ContentType::Summary => serde_json::from_value::<Summary>(data.clone())
            .map(ViewData::Summary)
            .unwrap_or_else(|_| ViewData::Raw(data.clone())),
        ContentType::Mindmap => serde_json::from_value::<MindMapNode>(data.clone())
            .map(|tree| ViewData::MindMap(mind_map_graph(&tree)))
            .unwrap_or_else(|_| ViewData::Raw(data.clone())),
        ContentType::Flashcards => serde_json::from_value::<FlashcardList>(data.clone())
            .map(|list| ViewData::Flashcards {
                flashcards: question_cards(&list),
            })
            .unwrap_or_else(|_| ViewData::Raw(data.clone())),
    };

    GeneratedView {
        id: content.id.clone(),
        document_id: content.document_id.clone(),
        content_type: content.content_type,
        created_at: content.created_at,
        content_data,
    }
}

/// Newest record of each content type, in `ContentType::ALL` order.
/// Reprocessing appends records, so older ones are superseded here.
pub fn latest_generated(records: &[GeneratedContent]) -> Vec<GeneratedContent> {
    ContentType::ALL
        .iter()
        .filter_map(|kind| {
            records
                .iter()
                .filter(|record| record.content_type == *kind)
                .max_by_key(|record| record.created_at)
                .cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Flashcard;
    use chrono::Duration;
    use serde_json::json;

    fn node(topic: &str, children: Vec<MindMapNode>) -> MindMapNode {
        MindMapNode {
            topic: topic.to_string(),
            children,
        }
    }

    #[test]
    fn mind_map_flattens_depth_first_with_levels() {
        let tree = node(
            "Biology",
            vec![
                node("Cells", vec![node("Organelles", Vec::new())]),
                node("Genetics", Vec::new()),
            ],
        );

        let graph = mind_map_graph(&tree);
        let ids = graph.nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["node_0", "node_1", "node_2", "node_3"]);
        assert_eq!(graph.nodes[2].label, "Organelles");
        assert_eq!(graph.nodes[2].level, 2);
        assert_eq!(graph.nodes[3].parent.as_deref(), Some("node_0"));
        assert_eq!(graph.nodes[0].parent, None);
        assert_eq!(
            graph.edges,
            vec![
                GraphEdge { from: "node_0".into(), to: "node_1".into() },
                GraphEdge { from: "node_1".into(), to: "node_2".into() },
                GraphEdge { from: "node_0".into(), to: "node_3".into() },
            ]
        );
    }

    #[test]
    fn flashcards_render_as_questions() {
        let list = FlashcardList {
            flashcards: vec![Flashcard {
                term: "Osmosis".to_string(),
                definition: "Diffusion of water".to_string(),
            }],
        };
        let cards = question_cards(&list);
        assert_eq!(cards[0].question, "Osmosis");
        assert_eq!(cards[0].answer, "Diffusion of water");
    }

    #[test]
    fn latest_record_per_type_wins() {
        let now = Utc::now();
        let record = |id: &str, kind: ContentType, age: i64| GeneratedContent {
            id: id.to_string(),
            document_id: "doc".to_string(),
            user_id: "user".to_string(),
            content_type: kind,
            content_data: json!({"summary": id}),
            created_at: now - Duration::seconds(age),
        };

        let records = vec![
            record("old-summary", ContentType::Summary, 60),
            record("new-summary", ContentType::Summary, 0),
            record("cards", ContentType::Flashcards, 30),
        ];
        let latest = latest_generated(&records);
        let ids = latest.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["new-summary", "cards"]);

        let view = render(&latest[0]);
        assert_eq!(
            view.content_data,
            ViewData::Summary(Summary {
                summary: "new-summary".to_string()
            })
        );
        assert!(matches!(render(&latest[1]).content_data, ViewData::Raw(_)));
    }
}
