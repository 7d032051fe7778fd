use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("datasheet path already catalogued: {0}")]
    DuplicatePath(String),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("ocr failed: {0}")]
    OcrFailed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("extraction task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("embedding provider failed: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index is corrupt: {0}")]
    Corrupt(String),

    #[error("vector dimension {found} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("text count {texts} doesn't match product id count {ids}")]
    LengthMismatch { texts: usize, ids: usize },

    #[error("embedder returned {vectors} vectors for {texts} texts")]
    EmbeddingCountMismatch { texts: usize, vectors: usize },

    #[error("index rebuild failed after `{original}`: {source}")]
    RebuildFailed {
        original: String,
        #[source]
        source: Box<IndexError>,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
