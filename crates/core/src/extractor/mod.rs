//! Hybrid PDF extraction: ruled tables first, then the page's prose, then OCR
//! for pages whose prose is too short to be real text.

pub mod layout;
pub mod ocr;
pub mod tables;

use crate::config::ExtractionOptions;
use crate::error::ExtractError;
use crate::models::{TextChunk, TextSource};
use async_trait::async_trait;
use layout::{build_blocks, PageLayout, Rect};
use lopdf::Document;
use ocr::{OcrEngine, PageSnapshot};
use std::path::Path;
use tables::detect_tables;
use tracing::{debug, warn};

#[async_trait]
pub trait PdfExtractor: Send + Sync {
    /// Chunks in page order. Never fails: unreadable files yield no chunks and
    /// unreadable pages yield an empty `OCR` chunk.
    async fn extract_file(&self, path: &Path) -> Vec<TextChunk>;
}

pub struct HybridExtractor<O> {
    ocr: O,
    options: ExtractionOptions,
}

impl<O: OcrEngine> HybridExtractor<O> {
    pub fn new(ocr: O, options: ExtractionOptions) -> Self {
        Self { ocr, options }
    }

    pub async fn extract_bytes(&self, bytes: &[u8]) -> Vec<TextChunk> {
        let planned = match plan_document(bytes, &self.options) {
            Ok(planned) => planned,
            Err(error) => {
                warn!(error = %error, "could not open pdf");
                return Vec::new();
            }
        };

        let mut chunks = Vec::new();
        for page in planned {
            chunks.extend(page.chunks);

            let Some(snapshot) = page.ocr else {
                continue;
            };
            let recognized = match snapshot {
                Ok(snapshot) => self.ocr.recognize(&snapshot).await,
                Err(error) => Err(error),
            };
            let text = recognized.unwrap_or_else(|error| {
                warn!(page = page.page_number, error = %error, "ocr failed, emitting empty chunk");
                String::new()
            });
            chunks.push(TextChunk::new(text.trim(), page.page_number, TextSource::Ocr));
        }
        chunks
    }
}

#[async_trait]
impl<O: OcrEngine> PdfExtractor for HybridExtractor<O> {
    async fn extract_file(&self, path: &Path) -> Vec<TextChunk> {
        match tokio::fs::read(path).await {
            Ok(bytes) => self.extract_bytes(&bytes).await,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "could not read pdf");
                Vec::new()
            }
        }
    }
}

struct PlannedPage {
    page_number: u32,
    chunks: Vec<TextChunk>,
    ocr: Option<Result<PageSnapshot, ExtractError>>,
}

/// What the text layer of one page yields before any OCR.
#[derive(Debug, PartialEq)]
struct PageAnalysis {
    chunks: Vec<TextChunk>,
    needs_ocr: bool,
}

/// Runs every synchronous step so the parsed document is dropped before any
/// OCR request is awaited.
fn plan_document(bytes: &[u8], options: &ExtractionOptions) -> Result<Vec<PlannedPage>, ExtractError> {
    let document =
        Document::load_mem(bytes).map_err(|error| ExtractError::PdfParse(error.to_string()))?;

    let mut planned = Vec::new();
    for (page_number, page_id) in document.get_pages() {
        let analysis = match PageLayout::analyse(&document, page_number, page_id) {
            Ok(layout) => analyse_page(&layout, options),
            Err(error) => {
                warn!(page = page_number, error = %error, "page extraction failed");
                planned.push(PlannedPage {
                    page_number,
                    chunks: vec![TextChunk::new("", page_number, TextSource::Ocr)],
                    ocr: None,
                });
                continue;
            }
        };

        let ocr = analysis
            .needs_ocr
            .then(|| PageSnapshot::from_document(&document, page_number));
        planned.push(PlannedPage {
            page_number,
            chunks: analysis.chunks,
            ocr,
        });
    }
    Ok(planned)
}

fn analyse_page(layout: &PageLayout, options: &ExtractionOptions) -> PageAnalysis {
    if layout.undecoded_runs > 0 {
        debug!(
            page = layout.page_number,
            undecoded = layout.undecoded_runs,
            "skipped strings without a readable encoding"
        );
    }

    let mut chunks = Vec::new();
    let detected = detect_tables(&layout.rulings, &layout.runs);
    let regions = detected.iter().map(|table| table.bbox).collect::<Vec<Rect>>();
    for table in &detected {
        if let Some(markdown) = table.to_markdown() {
            chunks.push(TextChunk::new(markdown, layout.page_number, TextSource::Table));
        }
    }

    let prose = build_blocks(&layout.runs, &regions)
        .into_iter()
        .filter(|block| !regions.iter().any(|region| region.contains(&block.bbox)))
        .map(|block| block.text)
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let prose = prose.trim();

    if prose.chars().count() >= options.min_text_chars {
        chunks.push(TextChunk::new(prose, layout.page_number, TextSource::Text));
        return PageAnalysis {
            chunks,
            needs_ocr: false,
        };
    }

    PageAnalysis {
        chunks,
        needs_ocr: true,
    }
}
