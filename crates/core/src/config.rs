//! Tunables for every pipeline stage. Defaults reproduce the production values.

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Prose shorter than this is treated as a scanned page and sent to OCR.
    pub min_text_chars: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self { min_text_chars: 20 }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub max_prompt_chars: usize,
    pub mind_map_max_depth: usize,
    pub mind_map_max_children: usize,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_prompt_chars: 120_000,
            mind_map_max_depth: 6,
            mind_map_max_children: 12,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexingOptions {
    pub batch_size: usize,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalOptions {
    pub leg_top_k: usize,
    pub rrf_k: f64,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub context_hits: usize,
    pub temperature: f32,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            leg_top_k: 10,
            rrf_k: 60.0,
            semantic_weight: 0.6,
            keyword_weight: 0.4,
            context_hits: 6,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_attempts: u32,
    pub extraction: ExtractionOptions,
    pub generation: GenerationOptions,
    pub indexing: IndexingOptions,
    pub retrieval: RetrievalOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            extraction: ExtractionOptions::default(),
            generation: GenerationOptions::default(),
            indexing: IndexingOptions::default(),
            retrieval: RetrievalOptions::default(),
        }
    }
}
