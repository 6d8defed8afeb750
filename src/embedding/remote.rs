//! OpenAI-compatible HTTP embedding provider.
//!
//! Posts `{"model", "input": [...]}` to the configured endpoint in batches of
//! `embedding.batch_size` and realigns the returned `data[].index` with the
//! input order. Uses the blocking `reqwest` client with a request timeout, so
//! a stalled upstream surfaces as an error instead of hanging the caller.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{Embedding, EmbeddingProvider};
use crate::config::EmbeddingConfig;

pub struct RemoteEmbeddingProvider {
    client: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
    batch_size: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("remote embedding provider needs an API key (set LATENTDICT_API_KEY)")?;
        anyhow::ensure!(config.batch_size > 0, "embedding.batch_size must be positive");

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        tracing::info!(url = %config.api_url, model = %config.model, "remote embedding provider ready");

        Ok(Self {
            client,
            url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            batch_size: config.batch_size,
        })
    }

    fn request(&self, words: &[&str]) -> Result<Vec<Option<Embedding>>> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: words,
            })
            .send()
            .with_context(|| format!("embedding request to {} failed", self.url))?;

        anyhow::ensure!(
            response.status().is_success(),
            "embedding API returned HTTP {}",
            response.status()
        );

        let body: EmbeddingResponse = response
            .json()
            .context("failed to decode embedding response")?;
        Ok(align_by_index(words.len(), body.data))
    }
}

impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, words: &[&str]) -> Result<Vec<Option<Embedding>>> {
        let mut results = Vec::with_capacity(words.len());
        for chunk in words.chunks(self.batch_size) {
            tracing::debug!(words = chunk.len(), "requesting remote embeddings");
            results.extend(self.request(chunk)?);
        }
        Ok(results)
    }
}

/// Place each returned vector at its `index`; slots the API skipped (or
/// returned empty) stay `None`.
fn align_by_index(len: usize, data: Vec<EmbeddingDatum>) -> Vec<Option<Embedding>> {
    let mut aligned = vec![None; len];
    for datum in data {
        if datum.index < len && !datum.embedding.is_empty() {
            aligned[datum.index] = Some(datum.embedding);
        }
    }
    aligned
}
