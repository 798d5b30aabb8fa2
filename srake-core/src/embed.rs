//! Text-to-vector embedding.
//!
//! The embedder is consumed as an opaque function: anything that can turn a
//! string into a fixed-dimension vector works. The HTTP provider speaks the
//! Ollama embeddings API; tests use a deterministic stub.

use crate::config::EmbeddingConfig;
use crate::error::SrakeError;
use serde::Deserialize;
use tracing::debug;

/// Characters of `title + abstract + organism` fed to the embedder.
pub const EMBED_TEXT_MAX: usize = 2000;

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> crate::Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
}

/// Concatenate the embeddable study fields, skipping empties, truncated at
/// a char boundary.
pub fn embedding_text(title: Option<&str>, abstract_text: Option<&str>, organism: Option<&str>) -> String {
    let mut text = String::new();
    for part in [title, abstract_text, organism].into_iter().flatten() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(part);
    }
    if text.len() > EMBED_TEXT_MAX {
        let mut cut = EMBED_TEXT_MAX;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Ollama-compatible HTTP embedding provider.
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> crate::Result<Self> {
        if config.endpoint.is_empty() {
            return Err(SrakeError::ConfigInvalid(
                "embedding.endpoint is not configured".to_string(),
            ));
        }
        debug!(endpoint = %config.endpoint, model = %config.model, dimensions = config.dimensions, "embedding provider ready");
        Ok(Self {
            client: reqwest::blocking::Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }

    fn embeddings_url(&self) -> String {
        format!("{}/api/embeddings", self.endpoint)
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
        let response = self
            .client
            .post(self.embeddings_url())
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .map_err(|e| SrakeError::Embedding(e.to_string()))?
            .error_for_status()
            .map_err(|e| SrakeError::Embedding(e.to_string()))?;

        let parsed: EmbeddingResponse = response
            .json()
            .map_err(|e| SrakeError::Embedding(e.to_string()))?;

        if parsed.embedding.len() != self.dimensions {
            return Err(SrakeError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.dimensions,
                parsed.embedding.len()
            )));
        }
        Ok(parsed.embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic embedder: hashes character trigrams into buckets and
    /// L2-normalizes, so similar strings get similar vectors.
    pub struct StubEmbedder {
        pub dimensions: usize,
    }

    impl Embedder for StubEmbedder {
        fn embed(&self, text: &str) -> crate::Result<Vec<f32>> {
            let mut vector = vec![0.0f32; self.dimensions];
            let lower = text.to_lowercase();
            let chars: Vec<char> = lower.chars().collect();
            for window in chars.windows(3) {
                let mut hash = 0usize;
                for c in window {
                    hash = hash.wrapping_mul(31).wrapping_add(*c as usize);
                }
                vector[hash % self.dimensions] += 1.0;
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut vector {
                    *v /= norm;
                }
            }
            Ok(vector)
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }
    }
}
