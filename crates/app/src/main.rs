use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use datasheet_search_core::{
    Catalog, CharacterNgramEmbedder, Embedder, HttpEmbedder, HttpOcr, HybridSearchEngine,
    IngestPipeline, LopdfReader, NewProduct, OcrEngine, SearchQuery, TesseractOcr, TextExtractor,
    VectorIndexManager,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "datasheet-search", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Corpus root laid out as Company/.../ProductType/Product.pdf
    #[arg(long, env = "DATASHEETS_DIR", default_value = "DataSheets")]
    datasheets_dir: PathBuf,

    /// SQLite catalog holding products and cached extracted text
    #[arg(long, env = "CATALOG_DATABASE", default_value = "Server/database.sqlite")]
    database: PathBuf,

    /// Directory holding the persisted vector index files
    #[arg(long, env = "VECTOR_INDEX_DIR", default_value = "Server/faiss_index")]
    index_dir: PathBuf,

    /// Base URL of an embedding service; takes precedence over the local model
    #[arg(long, env = "EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embed locally with all-MiniLM-L6-v2 (needs the `local-embeddings` feature);
    /// otherwise the built-in trigram embedder is used
    #[arg(long, env = "LOCAL_EMBEDDINGS")]
    local_embeddings: bool,

    /// Where the local embedding model is downloaded and cached
    #[arg(long, env = "EMBEDDING_MODEL_CACHE")]
    model_cache_dir: Option<PathBuf>,

    /// Model name sent to the embedding service
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "all-minilm")]
    embedding_model: String,

    /// Vector length produced by the embedding service
    #[arg(long, env = "EMBEDDING_DIMENSIONS", default_value_t = 384)]
    embedding_dimensions: usize,

    /// Multimodal OCR endpoint; Tesseract is used when unset
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// Bearer token for the OCR endpoint
    #[arg(long, env = "LLM_OCR_API_KEY")]
    ocr_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the corpus and index every datasheet not yet catalogued.
    Ingest,
    /// Rank products against a capability query.
    Search {
        /// Free-text requirements, e.g. "24V relay"
        #[arg(long)]
        requirements: String,
    },
    /// List every catalogued product.
    Products,
    /// Add a product by hand.
    Add {
        #[arg(long)]
        company: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "Unknown")]
        product_type: String,
        #[arg(long, default_value = "N/A")]
        datasheet_path: String,
        #[arg(long, default_value = "")]
        specs: String,
    },
    /// Catalog a single PDF outside the corpus tree.
    Upload {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the datasheet file path of a product.
    Datasheet {
        #[arg(long)]
        product_id: i64,
    },
}

struct Services {
    catalog: Arc<Catalog>,
    pipeline: IngestPipeline,
    search: HybridSearchEngine,
}

#[cfg(feature = "local-embeddings")]
async fn local_embedder(cache_dir: Option<PathBuf>) -> anyhow::Result<Arc<dyn Embedder>> {
    use datasheet_search_core::FastEmbedEmbedder;

    let embedder = tokio::task::spawn_blocking(move || FastEmbedEmbedder::new(cache_dir.as_deref()))
        .await
        .context("loading local embedding model")??;
    Ok(Arc::new(embedder))
}

#[cfg(not(feature = "local-embeddings"))]
async fn local_embedder(_cache_dir: Option<PathBuf>) -> anyhow::Result<Arc<dyn Embedder>> {
    bail!("local embeddings are not compiled in; rebuild with `--features local-embeddings`")
}

async fn build_services(cli: &Cli) -> anyhow::Result<Services> {
    let embedder: Arc<dyn Embedder> = match &cli.embedding_endpoint {
        Some(endpoint) => Arc::new(
            HttpEmbedder::new(endpoint, &cli.embedding_model, cli.embedding_dimensions)
                .context("invalid embedding endpoint")?,
        ),
        None if cli.local_embeddings => local_embedder(cli.model_cache_dir.clone()).await?,
        None => Arc::new(CharacterNgramEmbedder::default()),
    };
    info!(dimensions = embedder.dimensions(), "embedding provider ready");

    let ocr: Arc<dyn OcrEngine> = match &cli.ocr_endpoint {
        Some(endpoint) => Arc::new(HttpOcr::new(endpoint, cli.ocr_api_key.clone())),
        None => Arc::new(TesseractOcr::default()),
    };

    let catalog = Arc::new(
        Catalog::open(&cli.database)
            .await
            .with_context(|| format!("opening catalog {}", cli.database.display()))?,
    );
    let index = Arc::new(VectorIndexManager::new(&cli.index_dir, embedder.clone()));
    let extractor = TextExtractor::new(Arc::new(LopdfReader), ocr);

    Ok(Services {
        pipeline: IngestPipeline::new(catalog.clone(), extractor, index.clone()),
        search: HybridSearchEngine::new(catalog.clone(), index, embedder),
        catalog,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "datasheet-search boot"
    );

    let services = build_services(&cli).await?;

    match cli.command {
        Command::Ingest => {
            let report = services
                .pipeline
                .populate(&cli.datasheets_dir)
                .await
                .context("populating catalog")?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
            }

            println!(
                "{} new products ({} already catalogued, {} without text, {} skipped), {} total; run started {}",
                report.inserted,
                report.already_processed,
                report.empty_text.len(),
                report.skipped_files.len(),
                report.total_products,
                report.started_at.to_rfc3339()
            );
        }
        Command::Search { requirements } => {
            let response = services
                .search
                .search(&SearchQuery { requirements })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Products => {
            let products = services.catalog.all_products().await?;
            info!(count = products.len(), "retrieved products");
            println!("{}", serde_json::to_string_pretty(&json!({ "products": products }))?);
        }
        Command::Add {
            company,
            name,
            product_type,
            datasheet_path,
            specs,
        } => {
            let product_id = services
                .pipeline
                .add_product(NewProduct {
                    company,
                    name,
                    product_type,
                    datasheet_path,
                    directory: String::new(),
                    specs,
                })
                .await?;
            println!("{}", json!({ "product_id": product_id }));
        }
        Command::Upload { file } => {
            let product_id = services.pipeline.ingest_upload(&file).await?;
            println!(
                "{}",
                json!({ "product_id": product_id, "datasheet_path": file.to_string_lossy() })
            );
        }
        Command::Datasheet { product_id } => match services.catalog.datasheet_file(product_id).await? {
            Some(path) => println!("{}", path.display()),
            None => bail!("datasheet not found for product {product_id}"),
        },
    }

    Ok(())
}
