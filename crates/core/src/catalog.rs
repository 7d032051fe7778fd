//! SQLite-backed catalog: the product table plus the extracted-text cache.
//!
//! Writes go through a single-connection pool so that in-process writers queue
//! instead of colliding; a busy database (another process, or a reader holding
//! a lock) is retried according to [`RetryPolicy`]. Reads use a separate pool.

use crate::error::CatalogError;
use crate::models::{NewProduct, Product, RetryPolicy, MISSING_DATASHEET};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const READER_CONNECTIONS: u32 = 4;

/// Distinct tokens placed in one keyword filter; keeps the OR chain well under
/// SQLite's expression depth limit.
const MAX_FILTER_TOKENS: usize = 64;

const PRODUCT_COLUMNS: &str =
    "product_id, company, name, product_type, datasheet_path, directory, specs";

pub struct Catalog {
    writer: SqlitePool,
    reader: SqlitePool,
    retry: RetryPolicy,
}

impl Catalog {
    pub async fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        migrate(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options)
            .await?;

        debug!(path = %path.display(), "catalog opened");

        Ok(Self {
            writer,
            reader,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Inserts a product unless its datasheet path is already catalogued.
    /// Returns the new id, or `None` when the path was a duplicate.
    pub async fn insert_product_if_absent(
        &self,
        product: &NewProduct,
    ) -> Result<Option<i64>, CatalogError> {
        let ids = self
            .insert_products_if_absent(std::slice::from_ref(product))
            .await?;
        Ok(ids.into_iter().next().flatten())
    }

    /// Inserts a batch of products in one transaction, ignoring duplicate paths.
    /// The returned ids line up with the input; duplicates map to `None`.
    pub async fn insert_products_if_absent(
        &self,
        products: &[NewProduct],
    ) -> Result<Vec<Option<i64>>, CatalogError> {
        if products.is_empty() {
            return Ok(Vec::new());
        }

        let writer = &self.writer;
        let ids = retry_transient(self.retry, "insert products", is_busy, move || async move {
            let mut tx = writer.begin().await?;
            let mut ids = Vec::with_capacity(products.len());

            for product in products {
                let result = sqlx::query(
                    "INSERT OR IGNORE INTO products \
                     (company, name, product_type, datasheet_path, directory, specs) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&product.company)
                .bind(&product.name)
                .bind(&product.product_type)
                .bind(&product.datasheet_path)
                .bind(&product.directory)
                .bind(&product.specs)
                .execute(&mut *tx)
                .await?;

                ids.push((result.rows_affected() > 0).then(|| result.last_insert_rowid()));
            }

            tx.commit().await?;
            Ok::<_, sqlx::Error>(ids)
        })
        .await?;

        Ok(ids)
    }

    pub async fn all_products(&self) -> Result<Vec<Product>, CatalogError> {
        let products = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products ORDER BY product_id"
        ))
        .fetch_all(&self.reader)
        .await?;
        Ok(products)
    }

    pub async fn product_by_id(&self, product_id: i64) -> Result<Option<Product>, CatalogError> {
        let product = sqlx::query_as::<_, Product>(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_id = ?"
        ))
        .bind(product_id)
        .fetch_optional(&self.reader)
        .await?;
        Ok(product)
    }

    /// The datasheet file behind a product, if the row exists and the file is still on disk.
    pub async fn datasheet_file(&self, product_id: i64) -> Result<Option<PathBuf>, CatalogError> {
        let path = sqlx::query_scalar::<_, String>(
            "SELECT datasheet_path FROM products WHERE product_id = ?",
        )
        .bind(product_id)
        .fetch_optional(&self.reader)
        .await?;

        Ok(path
            .filter(|path| path != MISSING_DATASHEET)
            .map(PathBuf::from)
            .filter(|path| path.is_file()))
    }

    pub async fn existing_paths(&self) -> Result<HashSet<String>, CatalogError> {
        let rows = sqlx::query("SELECT datasheet_path FROM products")
            .fetch_all(&self.reader)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("datasheet_path"))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(CatalogError::from)
    }

    pub async fn product_count(&self) -> Result<i64, CatalogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.reader)
            .await?;
        Ok(count)
    }

    /// Rows where any token occurs in specs, name, company or product type.
    /// Only the first distinct tokens (up to a fixed cap) take part in the filter.
    pub async fn keyword_candidates(
        &self,
        tokens: &[String],
        limit: usize,
    ) -> Result<Vec<Product>, CatalogError> {
        let mut seen = HashSet::new();
        let tokens = tokens
            .iter()
            .filter(|token| seen.insert(*token))
            .take(MAX_FILTER_TOKENS)
            .collect::<Vec<_>>();

        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let field_clause = ["specs", "name", "company", "product_type"]
            .iter()
            .map(|field| format!(r"{field} LIKE ? ESCAPE '\'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let conditions = vec![format!("({field_clause})"); tokens.len()].join(" OR ");
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE {conditions} LIMIT ?");

        let mut query = sqlx::query_as::<_, Product>(&sql);
        for token in tokens {
            let pattern = format!("%{}%", escape_like(token));
            for _ in 0..4 {
                query = query.bind(pattern.clone());
            }
        }

        let products = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.reader)
            .await?;
        Ok(products)
    }

    pub async fn cached_text(&self, datasheet_path: &str) -> Result<Option<String>, CatalogError> {
        let text = sqlx::query_scalar::<_, String>(
            "SELECT extracted_text FROM extracted_texts WHERE datasheet_path = ?",
        )
        .bind(datasheet_path)
        .fetch_optional(&self.reader)
        .await?;
        Ok(text)
    }

    /// Durably records extracted text, empty text included.
    pub async fn store_cached_text(
        &self,
        datasheet_path: &str,
        text: &str,
    ) -> Result<(), CatalogError> {
        let writer = &self.writer;
        retry_transient(self.retry, "store extracted text", is_busy, move || async move {
            sqlx::query(
                "INSERT OR REPLACE INTO extracted_texts (datasheet_path, extracted_text) \
                 VALUES (?, ?)",
            )
            .bind(datasheet_path)
            .bind(text)
            .execute(writer)
            .await?;
            Ok::<_, sqlx::Error>(())
        })
        .await?;
        Ok(())
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS products (
            product_id INTEGER PRIMARY KEY AUTOINCREMENT,
            company TEXT NOT NULL DEFAULT '',
            name TEXT NOT NULL DEFAULT '',
            product_type TEXT NOT NULL DEFAULT '',
            datasheet_path TEXT NOT NULL UNIQUE,
            directory TEXT NOT NULL DEFAULT '',
            specs TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extracted_texts (
            datasheet_path TEXT PRIMARY KEY,
            extracted_text TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

fn escape_like(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for ch in token.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// SQLITE_BUSY / SQLITE_LOCKED and their extended codes.
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5" | "6" | "261" | "262" | "517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

pub(crate) async fn retry_transient<T, E, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    is_transient: impl Fn(&E) -> bool,
    mut attempt_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && is_transient(&error) => {
                warn!(operation, attempt, error = %error, "database busy, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(error) => {
                if is_transient(&error) {
                    warn!(operation, attempts, error = %error, "database still busy, giving up");
                }
                return Err(error);
            }
        }
    }
}
