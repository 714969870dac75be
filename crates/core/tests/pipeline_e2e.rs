use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use notesmith_core::{
    CharacterNgramEmbedder, ChatQuery, CompletionError, CompletionRequest, CompletionService,
    ContentGenerator, DisabledOcr, DocumentRepository, ExtractionOptions,
    GeneratedContentRepository, HybridExtractor, HybridRetriever, Indexer, IngestionOrchestrator,
    IngestionOutcome, MemoryObjectStore, MemoryRecordStore, MemorySearchIndex, PipelineConfig,
    ProcessingStatus, RecordStore, Uploader,
};
use std::error::Error;
use std::sync::Arc;
use tempfile::tempdir;

fn one_page_pdf(lines: &[(&str, i64, i64)]) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut document = Document::with_version("1.5");
    let pages_id = document.new_object_id();
    let font_id = document.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = document.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut operations = Vec::new();
    for (text, x, y) in lines {
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), 11.into()]));
        operations.push(Operation::new("Td", vec![(*x).into(), (*y).into()]));
        operations.push(Operation::new("Tj", vec![Object::string_literal(*text)]));
        operations.push(Operation::new("ET", vec![]));
    }
    let content_id =
        document.add_object(Stream::new(dictionary! {}, Content { operations }.encode()?));
    let page_id = document.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
    });
    document.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = document.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    document.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    document.save_to(&mut bytes)?;
    Ok(bytes)
}

/// Generation prompts get fixed artifacts; the chat prompt is answered in
/// plain text citing the first context block it was given.
struct ScriptedModel;

#[async_trait]
impl CompletionService for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        if request.system.is_some() {
            let citation = request
                .prompt
                .lines()
                .find(|line| line.starts_with("[Source: "))
                .unwrap_or("no context");
            return Ok(format!(
                "Plants capture light and store it as chemical energy. *{citation}*"
            ));
        }

        let reply = if request.prompt.contains("concise summary") {
            r#"{"summary": "Photosynthesis stores light energy in glucose."}"#
        } else if request.prompt.contains("mind map") {
            r#"{"topic": "Photosynthesis", "children": [{"topic": "Light reactions", "children": []}, {"topic": "Calvin cycle", "children": []}]}"#
        } else {
            r#"{"flashcards": [{"term": "Chlorophyll", "definition": "Pigment that absorbs light"}]}"#
        };
        Ok(reply.to_string())
    }
}

#[tokio::test]
async fn digital_pdf_is_processed_indexed_and_answerable() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("photosynthesis.pdf");
    std::fs::write(
        &path,
        one_page_pdf(&[
            ("Photosynthesis converts light energy", 72, 720),
            ("into chemical energy stored in glucose.", 72, 706),
        ])?,
    )?;

    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let documents = DocumentRepository::new(records.clone());
    let generated = GeneratedContentRepository::new(records);
    let objects = Arc::new(MemoryObjectStore::new());
    let index = Arc::new(MemorySearchIndex::default());
    let embedder = Arc::new(CharacterNgramEmbedder::default());
    let model = Arc::new(ScriptedModel);
    let config = PipelineConfig::default();

    let uploaded = Uploader::new(objects.clone(), documents.clone())
        .upload_file("user-1", &path)
        .await?;
    let document_id = uploaded.document.id.clone();
    assert_eq!(uploaded.document.processing_status, ProcessingStatus::Uploading);

    let orchestrator = IngestionOrchestrator::new(
        documents.clone(),
        generated.clone(),
        objects,
        Arc::new(HybridExtractor::new(DisabledOcr, ExtractionOptions::default())),
        ContentGenerator::new(model.clone(), config.generation.clone()),
        Indexer::new(index.clone(), embedder.clone(), config.indexing.clone()),
        config.clone(),
    );
    let outcome = orchestrator.process(&document_id, "user-1").await;
    assert_eq!(outcome, IngestionOutcome::Completed);

    let stored = documents.get(&document_id).await?.ok_or("document disappeared")?;
    assert_eq!(stored.processing_status, ProcessingStatus::Completed);
    assert_eq!(generated.for_document(&document_id).await?.len(), 3);

    let entries = index.entries().await;
    assert!(entries
        .iter()
        .any(|entry| entry.metadata.document_id == document_id));

    let retriever = HybridRetriever::new(
        index,
        embedder,
        model,
        documents,
        config.retrieval.clone(),
    );
    let answer = retriever
        .answer(&ChatQuery {
            text: "How do plants store light energy?".to_string(),
            user_id: "user-1".to_string(),
            document_ids: vec![document_id.clone()],
        })
        .await?;

    assert!(!answer.answer.trim().is_empty());
    assert!(answer
        .answer
        .contains("[Source: photosynthesis.pdf, Page 1]"));
    assert!(!answer.sources.is_empty());
    assert!(answer
        .sources
        .iter()
        .all(|source| source.document_id == document_id));
    Ok(())
}
