use crate::error::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
#[cfg(feature = "local-embeddings")]
use std::path::Path;
#[cfg(feature = "local-embeddings")]
use std::sync::Arc;
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Text to fixed-length vector. Implementations are shared read-only across
/// the index manager and the search engine.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Hashed character-trigram embedder; deterministic and fully offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_sync(text))
    }
}

/// Vector length of all-MiniLM-L6-v2.
pub const ALL_MINILM_L6_V2_DIMENSIONS: usize = 384;

/// all-MiniLM-L6-v2 sentence embeddings computed locally through fastembed.
///
/// Inference is CPU-bound, so every call runs on the blocking pool.
#[cfg(feature = "local-embeddings")]
pub struct FastEmbedEmbedder {
    model: Arc<fastembed::TextEmbedding>,
}

#[cfg(feature = "local-embeddings")]
impl FastEmbedEmbedder {
    /// Loads the model, downloading it into `cache_dir` on first use. Blocking.
    pub fn new(cache_dir: Option<&Path>) -> Result<Self, EmbeddingError> {
        let mut options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        if let Some(cache_dir) = cache_dir {
            options = options.with_cache_dir(cache_dir.to_path_buf());
        }

        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|error| EmbeddingError::Provider(format!("loading local model: {error}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for FastEmbedEmbedder {
    fn dimensions(&self) -> usize {
        ALL_MINILM_L6_V2_DIMENSIONS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::Provider("local model returned no vector".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed(texts, None))
            .await
            .map_err(|error| EmbeddingError::Provider(format!("embedding task failed: {error}")))?
            .map_err(|error| EmbeddingError::Provider(error.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for an `/api/embed` style endpoint: `{model, input}` in,
/// `{embeddings}` out.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    endpoint: Url,
    model: String,
    dimensions: usize,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let endpoint = Url::parse(base_url)?.join("api/embed")?;
        Ok(Self {
            endpoint,
            model: model.into(),
            dimensions,
            client: Client::new(),
        })
    }

    fn check_dimensions(&self, vectors: &[Vec<f32>]) -> Result<(), EmbeddingError> {
        match vectors.iter().find(|vector| vector.len() != self.dimensions) {
            Some(vector) => Err(EmbeddingError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: format!(
                    "embedding dimension {} != {}",
                    vector.len(),
                    self.dimensions
                ),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| EmbeddingError::BackendResponse {
            backend: self.endpoint.to_string(),
            details: "no embedding returned".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EmbeddingError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: response.status().to_string(),
            });
        }

        let payload: EmbedResponse = response.json().await?;
        if payload.embeddings.len() != texts.len() {
            return Err(EmbeddingError::BackendResponse {
                backend: self.endpoint.to_string(),
                details: format!(
                    "{} embeddings for {} inputs",
                    payload.embeddings.len(),
                    texts.len()
                ),
            });
        }

        self.check_dimensions(&payload.embeddings)?;
        Ok(payload.embeddings)
    }
}
