use crate::error::ExtractError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// One page cut out of its document as a standalone PDF, ready to be
/// rasterized by the recogniser.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub page_number: u32,
    pub pdf: Vec<u8>,
}

impl PageSnapshot {
    pub fn from_document(document: &Document, page_number: u32) -> Result<Self, ExtractError> {
        let mut single = document.clone();
        let others = single
            .get_pages()
            .keys()
            .copied()
            .filter(|number| *number != page_number)
            .collect::<Vec<_>>();

        if !others.is_empty() {
            single.delete_pages(&others);
        }
        single.prune_objects();

        let mut pdf = Vec::new();
        single
            .save_to(&mut pdf)
            .map_err(|error| ExtractError::Page {
                page: page_number,
                details: format!("could not snapshot page: {error}"),
            })?;

        Ok(Self { page_number, pdf })
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognised text of the page; empty when nothing was recognised.
    async fn recognize(&self, page: &PageSnapshot) -> Result<String, ExtractError>;
}

/// Recognises nothing. Used when no OCR endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize(&self, _page: &PageSnapshot) -> Result<String, ExtractError> {
        Ok(String::new())
    }
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("LLM_OCR_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|key| !key.is_empty());

        Some(Self { endpoint, api_key })
    }
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    page_number: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Multimodal OCR service reached over HTTP. The service renders the posted
/// single-page PDF and returns the recognised text.
pub struct HttpOcrEngine {
    config: OcrEndpointConfig,
    client: Client,
}

impl HttpOcrEngine {
    pub fn new(config: OcrEndpointConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(&self, page: &PageSnapshot) -> Result<String, ExtractError> {
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(&page.pdf),
            page_number: page.page_number,
        };

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ExtractError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                self.config.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json().await?;
        Ok(payload_to_text(&payload))
    }
}

fn payload_to_text(payload: &LlmOcrResponse) -> String {
    if let Some(listed) = &payload.pages {
        let mut listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref()?.trim();
                (!text.is_empty()).then(|| (page.page.unwrap_or(1), text.to_string()))
            })
            .collect::<Vec<_>>();
        listed.sort_by_key(|(number, _)| *number);

        if !listed.is_empty() {
            return listed
                .into_iter()
                .map(|(_, text)| text)
                .collect::<Vec<_>>()
                .join("\n");
        }
    }

    payload
        .text
        .as_deref()
        .map(|text| text.replace('\u{000c}', "\n").trim().to_string())
        .unwrap_or_default()
}
