use crate::catalog::Catalog;
use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{Product, SearchMode, SearchOptions, SearchQuery, SearchResponse, SearchResult};
use crate::vector_index::{similarity_score, VectorIndexManager, SENTINEL_PRODUCT_ID};
use std::sync::Arc;
use tracing::{debug, error, info};

const NO_SPECS: &str = "No specs";
const ELLIPSIS: &str = "...";

/// Result of the semantic stage, kept apart from retrieval errors so the
/// keyword fallback branches on an explicit signal.
#[derive(Debug)]
pub enum SemanticOutcome {
    Matches(Vec<SearchResult>),
    NoMatches,
    Failed(SearchError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedResults {
    pub mode: SearchMode,
    pub products: Vec<SearchResult>,
}

pub struct HybridSearchEngine {
    catalog: Arc<Catalog>,
    index: Arc<VectorIndexManager>,
    embedder: Arc<dyn Embedder>,
    options: SearchOptions,
}

impl HybridSearchEngine {
    pub fn new(
        catalog: Arc<Catalog>,
        index: Arc<VectorIndexManager>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            catalog,
            index,
            embedder,
            options: SearchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        let ranked = self.rank(query).await?;
        Ok(SearchResponse {
            products: ranked.products,
        })
    }

    /// Semantic retrieval first; keyword matching only when it yields nothing.
    /// Failures in either stage are logged and surface as fewer results.
    pub async fn rank(&self, query: &SearchQuery) -> Result<RankedResults, SearchError> {
        info!(requirements = %query.requirements, "received search query");

        match self.semantic(&query.requirements).await {
            SemanticOutcome::Matches(products) => {
                return Ok(finish(SearchMode::Semantic, products));
            }
            SemanticOutcome::NoMatches => {}
            SemanticOutcome::Failed(failure) => {
                error!(error = %failure, "semantic search failed");
            }
        }

        info!("falling back to keyword search");
        let products = match self.keyword(&query.requirements).await {
            Ok(products) => products,
            Err(failure) => {
                error!(error = %failure, "keyword search failed");
                Vec::new()
            }
        };
        info!(results = products.len(), "keyword search returned");

        Ok(finish(SearchMode::Keyword, products))
    }

    pub async fn semantic(&self, requirements: &str) -> SemanticOutcome {
        match self.semantic_matches(requirements).await {
            Ok(products) if products.is_empty() => SemanticOutcome::NoMatches,
            Ok(products) => SemanticOutcome::Matches(products),
            Err(failure) => SemanticOutcome::Failed(failure),
        }
    }

    async fn semantic_matches(&self, requirements: &str) -> Result<Vec<SearchResult>, SearchError> {
        let query_vector = self.embedder.embed(requirements).await?;
        let neighbors = self.index.search(&query_vector, self.options.top_k).await?;
        debug!(neighbors = neighbors.len(), "vector search returned");

        let mut products = Vec::with_capacity(neighbors.len());
        for neighbor in neighbors {
            if neighbor.product_id == SENTINEL_PRODUCT_ID {
                continue;
            }

            match self.catalog.product_by_id(neighbor.product_id).await? {
                Some(product) => products.push(self.to_result(
                    &product,
                    similarity_score(neighbor.distance),
                )),
                None => debug!(product_id = neighbor.product_id, "skipping orphaned index entry"),
            }
        }

        Ok(products)
    }

    pub async fn keyword(&self, requirements: &str) -> Result<Vec<SearchResult>, SearchError> {
        let tokens = tokenize(requirements);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .catalog
            .keyword_candidates(&tokens, self.options.keyword_limit)
            .await?;

        Ok(rows
            .iter()
            .map(|product| {
                let score = keyword_score(&tokens, product, self.options.keyword_score_cap);
                self.to_result(product, score)
            })
            .collect())
    }

    fn to_result(&self, product: &Product, score: f64) -> SearchResult {
        SearchResult {
            product_id: product.product_id,
            company: product.company.clone(),
            name: product.name.clone(),
            product_type: product.product_type.clone(),
            datasheet_path: product.datasheet_path.clone(),
            directory: product.directory.clone(),
            specs: specs_preview(&product.specs, self.options.preview_chars),
            match_score: round_score(score),
        }
    }
}

fn finish(mode: SearchMode, mut products: Vec<SearchResult>) -> RankedResults {
    products.sort_by(|left, right| right.match_score.total_cmp(&left.match_score));
    if products.is_empty() {
        info!("no matching products found for query");
    } else {
        info!(results = products.len(), mode = ?mode, "returning matching products");
    }
    RankedResults { mode, products }
}

pub fn tokenize(requirements: &str) -> Vec<String> {
    requirements
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Share of tokens found in any of the four searchable fields, capped.
pub fn keyword_score(tokens: &[String], product: &Product, cap: f64) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }

    let fields = [
        product.specs.to_lowercase(),
        product.name.to_lowercase(),
        product.company.to_lowercase(),
        product.product_type.to_lowercase(),
    ];
    let matched = tokens
        .iter()
        .filter(|token| fields.iter().any(|field| field.contains(token.as_str())))
        .count();

    ((matched as f64 / tokens.len() as f64) * 100.0).min(cap)
}

pub fn specs_preview(specs: &str, limit: usize) -> String {
    if specs.is_empty() {
        return NO_SPECS.to_string();
    }

    let mut chars = specs.chars();
    let preview = chars.by_ref().take(limit).collect::<String>();
    if chars.next().is_some() {
        format!("{preview}{ELLIPSIS}")
    } else {
        preview
    }
}

fn round_score(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::NewProduct;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<Catalog>,
        index: Arc<VectorIndexManager>,
        engine: HybridSearchEngine,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let embedder: Arc<dyn Embedder> = Arc::new(CharacterNgramEmbedder::default());
        let catalog = Arc::new(
            Catalog::open(&dir.path().join("catalog.sqlite"))
                .await
                .expect("catalog opens"),
        );
        let index = Arc::new(VectorIndexManager::new(dir.path().join("index"), embedder.clone()));
        let engine = HybridSearchEngine::new(catalog.clone(), index.clone(), embedder);
        Fixture {
            _dir: dir,
            catalog,
            index,
            engine,
        }
    }

    fn product(path: &str, name: &str, specs: &str) -> NewProduct {
        NewProduct {
            company: "Acme".to_string(),
            name: name.to_string(),
            product_type: "Components".to_string(),
            datasheet_path: path.to_string(),
            directory: "Acme/Components".to_string(),
            specs: specs.to_string(),
        }
    }

    fn query(requirements: &str) -> SearchQuery {
        SearchQuery {
            requirements: requirements.to_string(),
        }
    }

    async fn seed(fixture: &Fixture, products: &[NewProduct]) -> Vec<i64> {
        let ids = fixture
            .catalog
            .insert_products_if_absent(products)
            .await
            .expect("insert")
            .into_iter()
            .map(|id| id.expect("fresh path"))
            .collect::<Vec<_>>();
        let texts = products.iter().map(|product| product.specs.clone()).collect::<Vec<_>>();
        fixture.index.add_batch(&texts, &ids).await.expect("index");
        ids
    }

    #[tokio::test]
    async fn semantic_ranking_prefers_closest_product() {
        let fixture = fixture().await;
        seed(
            &fixture,
            &[
                product("/d/A.pdf", "A", "high voltage relay 24V"),
                product("/d/B.pdf", "B", "low power sensor 3V"),
            ],
        )
        .await;

        let ranked = fixture.engine.rank(&query("24V relay")).await.expect("search");

        assert_eq!(ranked.mode, SearchMode::Semantic);
        assert_eq!(ranked.products.len(), 2);
        assert_eq!(ranked.products[0].name, "A");
        assert!(ranked.products[0].match_score > ranked.products[1].match_score);
        assert!(ranked
            .products
            .iter()
            .all(|result| (0.0..=100.0).contains(&result.match_score)));
    }

    #[tokio::test]
    async fn sentinel_only_index_falls_back_to_keywords() {
        let fixture = fixture().await;
        fixture.index.ensure_initialized().await.expect("init");
        fixture
            .catalog
            .insert_product_if_absent(&product("/d/A.pdf", "A", "high voltage relay 24V"))
            .await
            .expect("insert");

        let ranked = fixture.engine.rank(&query("relay 3V")).await.expect("search");

        assert_eq!(ranked.mode, SearchMode::Keyword);
        assert_eq!(ranked.products.len(), 1);
        assert_eq!(ranked.products[0].match_score, 50.0);
    }

    #[tokio::test]
    async fn missing_index_is_absorbed() {
        let fixture = fixture().await;
        fixture
            .catalog
            .insert_product_if_absent(&product("/d/A.pdf", "A", "high voltage relay 24V"))
            .await
            .expect("insert");

        assert!(matches!(
            fixture.engine.semantic("relay").await,
            SemanticOutcome::Failed(_)
        ));

        let response = fixture.engine.search(&query("Relay 24v acme")).await.expect("search");
        assert_eq!(response.products.len(), 1);
        assert_eq!(response.products[0].match_score, 75.0);
    }

    #[tokio::test]
    async fn very_long_query_still_falls_back_to_keywords() {
        let fixture = fixture().await;
        fixture.index.ensure_initialized().await.expect("init");
        fixture
            .catalog
            .insert_product_if_absent(&product("/d/A.pdf", "A", "high voltage relay 24V"))
            .await
            .expect("insert");

        let filler = (0..1000).map(|n| format!("w{n}")).collect::<Vec<_>>().join(" ");
        let ranked = fixture
            .engine
            .rank(&query(&format!("relay {filler}")))
            .await
            .expect("search");

        assert_eq!(ranked.mode, SearchMode::Keyword);
        assert_eq!(ranked.products.len(), 1);
        assert!(ranked.products[0].match_score > 0.0);
        assert!(ranked.products[0].match_score < 1.0);
    }

    #[tokio::test]
    async fn failing_keyword_stage_yields_empty_results() {
        let fixture = fixture().await;
        let outside = sqlx::SqlitePool::connect(&format!(
            "sqlite://{}",
            fixture._dir.path().join("catalog.sqlite").display()
        ))
        .await
        .expect("second connection");
        sqlx::query("DROP TABLE products")
            .execute(&outside)
            .await
            .expect("drop");

        let response = fixture.engine.search(&query("relay")).await.expect("search");
        assert!(response.products.is_empty());
    }

    #[tokio::test]
    async fn orphaned_entries_are_skipped() {
        let fixture = fixture().await;
        fixture
            .index
            .add_batch(&["ghost relay".to_string()], &[99])
            .await
            .expect("index");

        let response = fixture.engine.search(&query("relay")).await.expect("search");
        assert!(response.products.is_empty());
    }

    #[tokio::test]
    async fn no_matches_anywhere_is_empty_not_error() {
        let fixture = fixture().await;
        fixture.index.ensure_initialized().await.expect("init");

        let response = fixture.engine.search(&query("waveguide")).await.expect("search");
        assert_eq!(response, SearchResponse::default());

        let blank = fixture.engine.search(&query("   ")).await.expect("search");
        assert!(blank.products.is_empty());
    }

    #[test]
    fn keyword_score_counts_tokens_across_fields() {
        let row = Product {
            product_id: 1,
            company: "Acme".to_string(),
            name: "HV-Relay".to_string(),
            product_type: "Relays".to_string(),
            datasheet_path: "/d/A.pdf".to_string(),
            directory: "Acme".to_string(),
            specs: "Coil 24V".to_string(),
        };

        let partial = keyword_score(&tokenize("24V acme waveguide"), &row, 75.0);
        assert!((partial - 66.666).abs() < 0.01);
        assert_eq!(round_score(partial), 66.67);

        assert_eq!(keyword_score(&tokenize("relay 24v"), &row, 75.0), 75.0);
        assert_eq!(keyword_score(&tokenize("waveguide"), &row, 75.0), 0.0);
        assert_eq!(keyword_score(&[], &row, 75.0), 0.0);
    }

    #[test]
    fn preview_is_truncated_with_marker() {
        assert_eq!(specs_preview("", 100), "No specs");
        assert_eq!(specs_preview("short", 100), "short");
        assert_eq!(specs_preview("abcdef", 3), "abc...");
        assert_eq!(specs_preview("µµµµ", 2), "µµ...");
    }
}
