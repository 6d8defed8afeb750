//! Word-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait, two implementations (local ONNX
//! Runtime with all-MiniLM-L6-v2, and an OpenAI-compatible HTTP API), and the
//! caching [`store::EmbeddingStore`] that sits in front of them. Providers are
//! created via [`create_provider`] from configuration.

pub mod local;
pub mod remote;
pub mod store;

use anyhow::Result;

/// A word's embedding vector in the provider's native precision.
pub type Embedding = Vec<f32>;

/// Trait for embedding words into vectors.
///
/// Output is aligned with the input: `None` marks a word the model produced
/// nothing usable for. An `Err` means the model itself is unavailable.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of words. Implementations may chunk internally.
    fn embed_batch(&self, words: &[&str]) -> Result<Vec<Option<Embedding>>>;

    /// Embed a single word.
    fn embed(&self, word: &str) -> Result<Option<Embedding>> {
        Ok(self.embed_batch(&[word])?.into_iter().next().flatten())
    }

    /// Identifier of the underlying model. Cached vectors are only valid for
    /// the model that produced them.
    fn model_id(&self) -> &str;
}

/// Create an embedding provider from config.
///
/// `"local"` needs the model files on disk (run `latentdict model download`
/// first). `"remote"` needs an API key (config or `LATENTDICT_API_KEY`).
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        "remote" => {
            let provider = remote::RemoteEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, remote"),
    }
}
