use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Placeholder stored when a manually added product points at a missing file.
pub const MISSING_DATASHEET: &str = "N/A";

/// A catalogued product, one row per datasheet path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub product_id: i64,
    pub company: String,
    pub name: String,
    pub product_type: String,
    pub datasheet_path: String,
    pub directory: String,
    pub specs: String,
}

/// Product fields before the catalog assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub company: String,
    pub name: String,
    pub product_type: String,
    pub datasheet_path: String,
    pub directory: String,
    pub specs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    pub requirements: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub product_id: i64,
    pub company: String,
    pub name: String,
    pub product_type: String,
    pub datasheet_path: String,
    pub directory: String,
    /// Preview of the stored specs, never the full text.
    pub specs: String,
    pub match_score: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub products: Vec<SearchResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    Semantic,
    Keyword,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    /// Documents processed per catalog commit.
    pub document_batch_size: usize,
    /// Texts embedded per index append.
    pub index_batch_size: usize,
    /// Texts used to seed a fresh index during recovery.
    pub rebuild_seed_size: usize,
    /// Native text shorter than this triggers the OCR pass.
    pub ocr_min_chars: usize,
    pub ocr_dpi: u32,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            document_batch_size: 50,
            index_batch_size: 50,
            rebuild_seed_size: 100,
            ocr_min_chars: 50,
            ocr_dpi: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub keyword_limit: usize,
    pub keyword_score_cap: f64,
    pub preview_chars: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            keyword_limit: 10,
            keyword_score_cap: 75.0,
            preview_chars: 100,
        }
    }
}

/// Retry budget for writes that hit a busy database.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}
