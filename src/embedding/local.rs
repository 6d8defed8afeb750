//! Local ONNX Runtime embedding provider.
//!
//! Implements [`EmbeddingProvider`] using the all-MiniLM-L6-v2
//! model via `ort`. A word is tokenized, run through the session, mean-pooled
//! over its attended tokens and L2-normalized. A word whose pooled vector has
//! zero norm (no attended tokens) is reported as absent rather than as a zero
//! vector.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use super::{Embedding, EmbeddingProvider};
use crate::config::EmbeddingConfig;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Single words never come close to the model's 256-token window.
const MAX_SEQ_LEN: usize = 32;

/// Words per ONNX session run; bounds the padded input tensor size.
const INFERENCE_BATCH: usize = 256;

/// Output names used by common sentence-transformer exports.
const HIDDEN_OUTPUTS: [&str; 2] = ["token_embeddings", "last_hidden_state"];

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model: String,
}

// Safety: Tokenizer is Send+Sync. Session is only reached through the Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = required_file(&dir, "model.onnx", "ONNX model")?;
        let tokenizer_path = required_file(&dir, "tokenizer.json", "Tokenizer")?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let tokenizer = word_tokenizer(&tokenizer_path)?;
        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model: config.model.clone(),
        })
    }

    /// Embed at most [`INFERENCE_BATCH`] words in one session run.
    fn infer(&self, words: &[&str]) -> Result<Vec<Option<Embedding>>> {
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let batch = TokenBatch::encode(&self.tokenizer, words)?;
        let shape = vec![batch.rows as i64, batch.cols as i64];
        let ids = Tensor::from_array((shape.clone(), batch.ids.clone().into_boxed_slice()))?;
        let mask = Tensor::from_array((shape.clone(), batch.mask.clone().into_boxed_slice()))?;
        // One segment per word.
        let segments = Tensor::from_array((shape, vec![0i64; batch.len()].into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => ids,
            "attention_mask" => mask,
            "token_type_ids" => segments,
        })?;

        let hidden = HIDDEN_OUTPUTS
            .iter()
            .find_map(|name| outputs.get(*name))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, values) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;
        let dims: &[i64] = &dims;
        anyhow::ensure!(
            dims == [batch.rows as i64, batch.cols as i64, EMBEDDING_DIM as i64],
            "token embeddings have shape {dims:?}, expected [{}, {}, {EMBEDDING_DIM}]",
            batch.rows,
            batch.cols
        );

        Ok(mean_pool(values, &batch.mask, batch.cols, EMBEDDING_DIM))
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, words: &[&str]) -> Result<Vec<Option<Embedding>>> {
        words
            .chunks(INFERENCE_BATCH)
            .map(|chunk| self.infer(chunk))
            .try_fold(Vec::with_capacity(words.len()), |mut all, part| {
                all.extend(part?);
                Ok(all)
            })
    }
}

fn required_file(dir: &Path, name: &str, what: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    anyhow::ensure!(
        path.exists(),
        "{what} not found at {}. Run `latentdict model download` first.",
        path.display()
    );
    Ok(path)
}

/// Load a tokenizer that truncates to [`MAX_SEQ_LEN`] and pads to the
/// longest word in each batch.
fn word_tokenizer(path: &Path) -> Result<Tokenizer> {
    let mut tokenizer =
        Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: MAX_SEQ_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    Ok(tokenizer)
}

/// Row-major token ids and attention mask for a padded batch.
struct TokenBatch {
    ids: Vec<i64>,
    mask: Vec<i64>,
    rows: usize,
    cols: usize,
}

impl TokenBatch {
    fn encode(tokenizer: &Tokenizer, words: &[&str]) -> Result<Self> {
        let encodings = tokenizer
            .encode_batch(words.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let cols = encodings.first().map_or(0, |e| e.get_ids().len());
        let ids = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&id| i64::from(id)))
            .collect();
        let mask = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&m| i64::from(m)))
            .collect();
        Ok(Self {
            ids,
            mask,
            rows: encodings.len(),
            cols,
        })
    }

    fn len(&self) -> usize {
        self.rows * self.cols
    }
}

/// Average each row's attended token vectors and normalize the result.
///
/// `hidden` is `[rows, seq_len, dim]` and `mask` is `[rows, seq_len]`, both
/// row-major. A row with no attended tokens, or whose average is the zero
/// vector, yields `None`.
fn mean_pool(hidden: &[f32], mask: &[i64], seq_len: usize, dim: usize) -> Vec<Option<Embedding>> {
    if seq_len == 0 || dim == 0 {
        return Vec::new();
    }
    hidden
        .chunks_exact(seq_len * dim)
        .zip(mask.chunks_exact(seq_len))
        .map(|(tokens, row_mask)| {
            let mut sum = vec![0.0f32; dim];
            let mut weight = 0.0f32;
            for (token, &m) in tokens.chunks_exact(dim).zip(row_mask) {
                if m <= 0 {
                    continue;
                }
                let m = m as f32;
                sum.iter_mut().zip(token).for_each(|(acc, v)| *acc += v * m);
                weight += m;
            }
            if weight == 0.0 {
                return None;
            }
            sum.iter_mut().for_each(|v| *v /= weight);
            unit_length(sum)
        })
        .collect()
}

/// Scale `v` to unit L2 norm, or `None` when it has no direction.
fn unit_length(mut v: Vec<f32>) -> Option<Embedding> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(v)
}
