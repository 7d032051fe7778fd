pub mod catalog;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod scanner;
pub mod search;
pub mod vector_index;

pub use catalog::Catalog;
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, HttpEmbedder, ALL_MINILM_L6_V2_DIMENSIONS,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
#[cfg(feature = "local-embeddings")]
pub use embeddings::FastEmbedEmbedder;
pub use error::{CatalogError, EmbeddingError, ExtractError, IndexError, IngestError, SearchError};
pub use extractor::{
    normalize_text, Extraction, ExtractionMethod, LopdfReader, PageContent, PdfReader,
    TextExtractor,
};
pub use ingest::{IngestPipeline, IngestionReport, SkippedPdf};
pub use models::{
    IngestionOptions, NewProduct, Product, RetryPolicy, SearchMode, SearchOptions, SearchQuery,
    SearchResponse, SearchResult, MISSING_DATASHEET,
};
pub use ocr::{HttpOcr, OcrEngine, TesseractOcr};
pub use scanner::{derive_metadata, discover_documents, scan_documents, DocumentDescriptor, DocumentMetadata};
pub use search::{HybridSearchEngine, RankedResults, SemanticOutcome};
pub use vector_index::{similarity_score, Neighbor, VectorIndexManager, SENTINEL_PRODUCT_ID};
