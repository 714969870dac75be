use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use notesmith_core::completion::DEFAULT_COMPLETION_MODEL;
use notesmith_core::views::latest_generated;
use notesmith_core::{
    dispatch, render, CharacterNgramEmbedder, ChatCompletionsClient, ChatCompletionsConfig,
    ChatQuery, CompletionService, ContentGenerator, DisabledOcr, Dispatch, DocumentRepository,
    ElasticsearchStore, Embedder, FsObjectStore, GeneratedContentRepository, HttpEmbedder,
    HttpEmbedderConfig, HttpObjectStore, HttpOcrEngine, HybridExtractor, HybridRetriever,
    Indexer, IngestionJob, IngestionOrchestrator, JsonDirRecordStore, MemorySearchIndex,
    ObjectStore, OcrEndpointConfig, PdfExtractor, PipelineConfig, RecordStore, SearchIndex,
    TaskQueue, Uploader, UserRepository, WorkerPool,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "notesmith", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    services: ServiceArgs,
}

#[derive(Args)]
struct ServiceArgs {
    /// Directory holding records and, without an object store URL, uploaded PDFs.
    #[arg(long, env = "NOTESMITH_DATA_DIR", default_value = ".notesmith")]
    data_dir: PathBuf,

    /// Elasticsearch base URL. Without it an in-process index is used.
    #[arg(long, env = "ELASTICSEARCH_URL")]
    elasticsearch_url: Option<String>,

    /// Search index name
    #[arg(long, env = "ELASTICSEARCH_INDEX", default_value = "pdf_chunks")]
    index_name: String,

    /// Base URL of an S3-compatible bucket.
    #[arg(long, env = "OBJECT_STORE_URL")]
    object_store_url: Option<String>,

    #[arg(long, env = "OBJECT_STORE_TOKEN", hide_env_values = true)]
    object_store_token: Option<String>,

    /// OpenAI-compatible chat completions endpoint
    #[arg(
        long,
        env = "COMPLETION_ENDPOINT",
        default_value = "https://api.mistral.ai/v1/chat/completions"
    )]
    completion_endpoint: String,

    #[arg(long, env = "COMPLETION_API_KEY", hide_env_values = true)]
    completion_api_key: Option<String>,

    #[arg(long, env = "COMPLETION_MODEL", default_value = DEFAULT_COMPLETION_MODEL)]
    completion_model: String,

    /// OpenAI-compatible embeddings endpoint. Without it a local hashing embedder is used.
    #[arg(long, env = "EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    #[arg(
        long,
        env = "EMBEDDING_MODEL",
        default_value = "sentence-transformers/all-mpnet-base-v2"
    )]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value = "768")]
    embedding_dimensions: usize,

    /// Ingestion workers used when uploads are queued.
    #[arg(long, env = "NOTESMITH_WORKERS", default_value = "2")]
    workers: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account and print its user id.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "NOTESMITH_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Check credentials and print the user id.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "NOTESMITH_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Upload PDFs and process them.
    Upload {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
        /// A single PDF.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Process on this task instead of the worker pool.
        #[arg(long, default_value_t = false)]
        inline: bool,
    },
    /// Process an uploaded document (no-op once terminal).
    Process {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
        #[arg(long)]
        document: String,
    },
    /// List the user's documents and their processing status.
    Documents {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
    },
    /// Print the newest summary, mind map and flashcards of a document.
    Generated {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
        #[arg(long)]
        document: String,
        /// Print every stored version, oldest first.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Print the fused evidence for a query.
    Search {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
        #[arg(long)]
        query: String,
        /// Restrict to these documents.
        #[arg(long = "document")]
        documents: Vec<String>,
    },
    /// Ask a question answered from the user's documents, with citations.
    Chat {
        #[arg(long, env = "NOTESMITH_USER_ID")]
        user: String,
        #[arg(long)]
        query: String,
        #[arg(long = "document")]
        documents: Vec<String>,
    },
}

struct Services {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    completion: Arc<dyn CompletionService>,
    extractor: Arc<dyn PdfExtractor>,
    config: PipelineConfig,
}

impl Services {
    fn connect(args: &ServiceArgs) -> anyhow::Result<Self> {
        let config = PipelineConfig::default();

        let records: Arc<dyn RecordStore> =
            Arc::new(JsonDirRecordStore::new(args.data_dir.join("records")));

        let objects: Arc<dyn ObjectStore> = match &args.object_store_url {
            Some(url) => Arc::new(
                HttpObjectStore::new(url, args.object_store_token.clone())
                    .with_context(|| format!("invalid object store url {url}"))?,
            ),
            None => Arc::new(FsObjectStore::new(args.data_dir.join("objects"))),
        };

        let index: Arc<dyn SearchIndex> = match &args.elasticsearch_url {
            Some(url) => Arc::new(ElasticsearchStore::new(url.as_str(), args.index_name.as_str())),
            None => {
                warn!("ELASTICSEARCH_URL not set, search index lives only for this process");
                Arc::new(MemorySearchIndex::default())
            }
        };

        let embedder: Arc<dyn Embedder> = match &args.embedding_endpoint {
            Some(endpoint) => Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
                endpoint: endpoint.clone(),
                api_key: args.embedding_api_key.clone(),
                model: args.embedding_model.clone(),
                dimensions: args.embedding_dimensions,
            })),
            None => Arc::new(CharacterNgramEmbedder::default()),
        };

        let completion: Arc<dyn CompletionService> =
            Arc::new(ChatCompletionsClient::new(ChatCompletionsConfig {
                endpoint: args.completion_endpoint.clone(),
                api_key: args.completion_api_key.clone(),
                model: args.completion_model.clone(),
                ..ChatCompletionsConfig::default()
            })?);
        if args.completion_api_key.is_none() {
            warn!("COMPLETION_API_KEY not set, generation and chat calls may be rejected");
        }

        let extractor: Arc<dyn PdfExtractor> = match OcrEndpointConfig::from_env() {
            Some(ocr) => Arc::new(HybridExtractor::new(
                HttpOcrEngine::new(ocr),
                config.extraction.clone(),
            )),
            None => {
                info!("LLM_OCR_ENDPOINT not set, scanned pages yield empty OCR chunks");
                Arc::new(HybridExtractor::new(DisabledOcr, config.extraction.clone()))
            }
        };

        Ok(Self {
            records,
            objects,
            index,
            embedder,
            completion,
            extractor,
            config,
        })
    }

    fn documents(&self) -> DocumentRepository {
        DocumentRepository::new(self.records.clone())
    }

    fn generated(&self) -> GeneratedContentRepository {
        GeneratedContentRepository::new(self.records.clone())
    }

    fn users(&self) -> UserRepository {
        UserRepository::new(self.records.clone())
    }

    fn uploader(&self) -> Uploader {
        Uploader::new(self.objects.clone(), self.documents())
    }

    fn orchestrator(&self) -> IngestionOrchestrator {
        IngestionOrchestrator::new(
            self.documents(),
            self.generated(),
            self.objects.clone(),
            self.extractor.clone(),
            ContentGenerator::new(self.completion.clone(), self.config.generation.clone()),
            Indexer::new(
                self.index.clone(),
                self.embedder.clone(),
                self.config.indexing.clone(),
            ),
            self.config.clone(),
        )
    }

    fn retriever(&self) -> HybridRetriever {
        HybridRetriever::new(
            self.index.clone(),
            self.embedder.clone(),
            self.completion.clone(),
            self.documents(),
            self.config.retrieval.clone(),
        )
    }
}

async fn owned_document(
    services: &Services,
    user: &str,
    document_id: &str,
) -> anyhow::Result<notesmith_core::DocumentRecord> {
    match services.documents().get(document_id).await? {
        Some(document) if document.user_id == user => Ok(document),
        _ => bail!("document {document_id} not found"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let services = Services::connect(&cli.services)?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "notesmith boot"
    );

    match cli.command {
        Command::Register { email, password } => {
            let user = services.users().register(&email, &password).await?;
            println!("registered user_id={} email={}", user.id, user.email);
        }
        Command::Login { email, password } => {
            let user = services
                .users()
                .authenticate(&email, &password)
                .await?
                .ok_or_else(|| anyhow!("incorrect email or password"))?;
            println!("user_id={}", user.id);
        }
        Command::Upload {
            user,
            file,
            folder,
            inline,
        } => {
            let uploader = services.uploader();
            let uploaded = match (file, folder) {
                (Some(file), _) => vec![uploader.upload_file(&user, &file).await?],
                (None, Some(folder)) => {
                    let report = uploader.upload_folder(&user, &folder).await?;
                    for skipped in &report.skipped_files {
                        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                    }
                    report.uploaded
                }
                (None, None) => bail!("either --file or --folder is required"),
            };

            for item in &uploaded {
                println!(
                    "uploaded document_id={} file={} sha256={}",
                    item.document.id,
                    item.path.display(),
                    item.checksum
                );
            }

            let orchestrator = Arc::new(services.orchestrator());
            let pool = (!inline).then(|| {
                WorkerPool::start(orchestrator.clone(), cli.services.workers, uploaded.len())
            });
            for item in &uploaded {
                let job = IngestionJob::new(&item.document.id, &user);
                let queue = pool.as_ref().map(|(queue, _)| queue as &dyn TaskQueue);
                if let Dispatch::Inline(outcome) = dispatch(queue, &orchestrator, job).await {
                    println!("document_id={} outcome={outcome:?}", item.document.id);
                }
            }
            if let Some((_, pool)) = pool {
                pool.shutdown().await;
            }

            let documents = services.documents();
            for item in &uploaded {
                if let Some(document) = documents.get(&item.document.id).await? {
                    println!(
                        "document_id={} status={:?}",
                        document.id, document.processing_status
                    );
                }
            }
        }
        Command::Process { user, document } => {
            let document = owned_document(&services, &user, &document).await?;
            let outcome = services.orchestrator().process(&document.id, &user).await;
            println!("document_id={} outcome={outcome:?}", document.id);
        }
        Command::Documents { user } => {
            for document in services.documents().list_for_user(&user).await? {
                println!(
                    "{} {:?} {} uploaded_at={}",
                    document.id,
                    document.processing_status,
                    document.original_filename,
                    document.uploaded_at.to_rfc3339()
                );
            }
        }
        Command::Generated {
            user,
            document,
            all,
        } => {
            let document = owned_document(&services, &user, &document).await?;
            let records = services.generated().for_document(&document.id).await?;
            let records = if all { records } else { latest_generated(&records) };
            let views = records.iter().map(render).collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Command::Search {
            user,
            query,
            documents,
        } => {
            let hits = services
                .retriever()
                .search(&ChatQuery {
                    text: query,
                    user_id: user,
                    document_ids: documents,
                })
                .await?;
            for hit in hits {
                println!(
                    "[{}] score={:.4} document_id={} page={}",
                    hit.metadata.source.as_str(),
                    hit.fused_score,
                    hit.metadata.document_id,
                    hit.metadata.page_number
                );
                println!("  chunk_text:\n{}", hit.text);
            }
        }
        Command::Chat {
            user,
            query,
            documents,
        } => {
            let answer = services
                .retriever()
                .answer(&ChatQuery {
                    text: query,
                    user_id: user,
                    document_ids: documents,
                })
                .await?;
            println!("{}", answer.answer);
            for source in answer.sources {
                match source.page {
                    Some(page) => println!("source: document_id={} page={page}", source.document_id),
                    None => println!("source: document_id={}", source.document_id),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn process_help_says_finished_documents_are_left_alone() {
        let command = Cli::command();
        let about = command
            .find_subcommand("process")
            .and_then(|process| process.get_about())
            .map(|about| about.to_string())
            .unwrap_or_default();
        assert!(about.contains("no-op once terminal"), "{about}");
    }

    #[test]
    fn process_takes_a_document_and_user() {
        let cli = Cli::try_parse_from([
            "notesmith",
            "process",
            "--user",
            "user-1",
            "--document",
            "doc-1",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Process { ref user, ref document } if user == "user-1" && document == "doc-1"
        ));
    }
}
