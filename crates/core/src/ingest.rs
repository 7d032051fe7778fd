use crate::catalog::Catalog;
use crate::error::{CatalogError, ExtractError, IngestError};
use crate::extractor::TextExtractor;
use crate::models::{IngestionOptions, NewProduct, MISSING_DATASHEET};
use crate::scanner::{discover_documents, product_name_from_stem, DocumentDescriptor};
use crate::vector_index::VectorIndexManager;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const UPLOAD_LABEL: &str = "Uploaded";
const UNKNOWN_TYPE: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub started_at: DateTime<Utc>,
    pub discovered: usize,
    pub already_processed: usize,
    pub inserted: usize,
    pub indexed: usize,
    pub empty_text: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedPdf>,
    pub total_products: i64,
}

/// Moves datasheets from disk into the catalog and the vector index.
pub struct IngestPipeline {
    catalog: Arc<Catalog>,
    extractor: TextExtractor,
    index: Arc<VectorIndexManager>,
    options: IngestionOptions,
}

impl IngestPipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        extractor: TextExtractor,
        index: Arc<VectorIndexManager>,
    ) -> Self {
        Self {
            catalog,
            extractor,
            index,
            options: IngestionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: IngestionOptions) -> Self {
        self.options = options;
        self
    }

    /// Cache-first extraction: a cached entry wins even when it is empty,
    /// otherwise the document is extracted and the result cached durably.
    pub async fn extract_cached(&self, path: &Path) -> Result<String, IngestError> {
        let key = path.to_string_lossy().to_string();
        if let Some(text) = self.catalog.cached_text(&key).await? {
            info!(path = %path.display(), "retrieved cached text");
            return Ok(text);
        }

        let extractor = self.extractor.clone();
        let owned = path.to_path_buf();
        let extraction = tokio::task::spawn_blocking(move || extractor.extract(&owned))
            .await
            .map_err(|error| ExtractError::Task(error.to_string()))??;

        self.catalog.store_cached_text(&key, &extraction.text).await?;
        Ok(extraction.text)
    }

    /// Startup ingestion. Idempotent: paths already in the catalog are skipped.
    /// Per-document failures are recorded in the report; only a failed index
    /// rebuild (or an unusable catalog) aborts the run.
    pub async fn populate(&self, root: &Path) -> Result<IngestionReport, IngestError> {
        self.index.ensure_initialized().await?;

        let mut report = IngestionReport {
            started_at: Utc::now(),
            ..IngestionReport::default()
        };
        if !root.is_dir() {
            error!(root = %root.display(), "datasheet directory not found");
            return Ok(report);
        }

        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let documents = discover_documents(&root);
        report.discovered = documents.len();
        if documents.is_empty() {
            warn!(root = %root.display(), "no PDF files found");
            report.total_products = self.catalog.product_count().await?;
            return Ok(report);
        }

        let existing = self.catalog.existing_paths().await?;
        let mut pending = Vec::new();
        for document in documents {
            let datasheet_path = document.datasheet_path();
            if existing.contains(&datasheet_path) {
                info!(path = %datasheet_path, "skipping already processed PDF");
                report.already_processed += 1;
            } else if !document.absolute_path.exists() {
                warn!(path = %datasheet_path, "datasheet not found");
            } else {
                pending.push(document);
            }
        }
        info!(count = pending.len(), "found new PDFs to process");

        let mut texts = Vec::new();
        let mut product_ids = Vec::new();
        let batch_size = self.options.document_batch_size.max(1);

        for (batch_no, batch) in pending.chunks(batch_size).enumerate() {
            info!(batch = batch_no + 1, size = batch.len(), "processing document batch");

            let rows = self.prepare_batch(batch, &mut report).await;
            let inserted = match self.catalog.insert_products_if_absent(&rows).await {
                Ok(inserted) => inserted,
                Err(failure) => {
                    error!(batch = batch_no + 1, error = %failure, "failed to insert product batch");
                    report.skipped_files.extend(rows.iter().map(|row| SkippedPdf {
                        path: PathBuf::from(&row.datasheet_path),
                        reason: failure.to_string(),
                    }));
                    continue;
                }
            };

            for (row, product_id) in rows.into_iter().zip(inserted) {
                let Some(product_id) = product_id else {
                    continue;
                };
                info!(
                    company = %row.company,
                    product_type = %row.product_type,
                    name = %row.name,
                    product_id,
                    "inserted product"
                );
                report.inserted += 1;
                texts.push(row.specs);
                product_ids.push(product_id);
            }
        }

        if texts.is_empty() {
            info!("no new products added, vector index unchanged");
        } else {
            report.indexed = self.index.add_batch(&texts, &product_ids).await?;
        }

        report.total_products = self.catalog.product_count().await?;
        info!(
            total_products = report.total_products,
            skipped = report.skipped_files.len(),
            "database populated"
        );
        Ok(report)
    }

    async fn prepare_batch(
        &self,
        batch: &[DocumentDescriptor],
        report: &mut IngestionReport,
    ) -> Vec<NewProduct> {
        let mut rows = Vec::with_capacity(batch.len());

        for document in batch {
            let specs = match self.extract_cached(&document.absolute_path).await {
                Ok(specs) => specs,
                Err(failure) => {
                    warn!(
                        path = %document.absolute_path.display(),
                        error = %failure,
                        "failed to extract text, skipping"
                    );
                    report.skipped_files.push(SkippedPdf {
                        path: document.absolute_path.clone(),
                        reason: failure.to_string(),
                    });
                    continue;
                }
            };

            if specs.is_empty() {
                warn!(
                    path = %document.absolute_path.display(),
                    "skipping product insertion due to no text"
                );
                report.empty_text.push(document.absolute_path.clone());
                continue;
            }

            let metadata = document.metadata();
            rows.push(NewProduct {
                company: metadata.company,
                name: metadata.name,
                product_type: metadata.product_type,
                datasheet_path: document.datasheet_path(),
                directory: document.directory_label(),
                specs,
            });
        }

        rows
    }

    /// Manual add. A datasheet path that does not exist is stored as `N/A`.
    pub async fn add_product(&self, mut product: NewProduct) -> Result<i64, IngestError> {
        if !product.datasheet_path.is_empty()
            && product.datasheet_path != MISSING_DATASHEET
            && !Path::new(&product.datasheet_path).exists()
        {
            warn!(path = %product.datasheet_path, "datasheet path not found");
            product.datasheet_path = MISSING_DATASHEET.to_string();
        }

        let product_id = self.insert_new(&product).await?;
        if !product.specs.is_empty() {
            self.index
                .add_batch(std::slice::from_ref(&product.specs), &[product_id])
                .await?;
            info!(product_id, "added product to vector index");
        }
        Ok(product_id)
    }

    /// Ingests one document outside the corpus tree, e.g. a fresh upload.
    /// The path is canonicalized so it keys the same row a corpus scan would.
    pub async fn ingest_upload(&self, path: &Path) -> Result<i64, IngestError> {
        let canonical = tokio::fs::canonicalize(path).await?;
        let path = canonical.as_path();
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

        let specs = self.extract_cached(path).await?;
        if specs.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no text extracted from uploaded PDF {}",
                path.display()
            )));
        }

        let product = NewProduct {
            company: UPLOAD_LABEL.to_string(),
            name: product_name_from_stem(&stem),
            product_type: UNKNOWN_TYPE.to_string(),
            datasheet_path: path.to_string_lossy().to_string(),
            directory: UPLOAD_LABEL.to_string(),
            specs,
        };

        let product_id = self.insert_new(&product).await?;
        self.index
            .add_batch(std::slice::from_ref(&product.specs), &[product_id])
            .await?;
        info!(path = %path.display(), product_id, "uploaded and processed datasheet");
        Ok(product_id)
    }

    async fn insert_new(&self, product: &NewProduct) -> Result<i64, IngestError> {
        self.catalog
            .insert_product_if_absent(product)
            .await?
            .ok_or_else(|| CatalogError::DuplicatePath(product.datasheet_path.clone()).into())
    }
}
