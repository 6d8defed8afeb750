#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use latentdict::embedding::store::{EmbeddingCache, EmbeddingStore, MemoryCache};
use latentdict::embedding::{Embedding, EmbeddingProvider};
use latentdict::projection::{BasisRegistry, DefaultCorpus, ProjectionService};

/// Word the fake provider has no vector for.
pub const UNEMBEDDABLE: &str = "unembeddable";

/// Deterministic provider: a word's embedding is its letter histogram plus its
/// length. Counts every word it is asked to embed.
#[derive(Default)]
pub struct LetterProvider {
    pub requested: AtomicUsize,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl LetterProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

/// The vector [`LetterProvider`] produces for `word`.
pub fn letter_embedding(word: &str) -> Embedding {
    let mut v = vec![0.0f32; 27];
    for b in word.bytes().filter(u8::is_ascii_lowercase) {
        v[(b - b'a') as usize] += 1.0;
    }
    v[26] = word.len() as f32;
    v
}

impl EmbeddingProvider for LetterProvider {
    fn embed_batch(&self, words: &[&str]) -> anyhow::Result<Vec<Option<Embedding>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("model offline");
        }
        self.requested.fetch_add(words.len(), Ordering::SeqCst);
        Ok(words
            .iter()
            .map(|w| (*w != UNEMBEDDABLE).then(|| letter_embedding(w)))
            .collect())
    }

    fn model_id(&self) -> &str {
        "letters"
    }
}

pub const CORPUS: &[&str] = &[
    "apple", "banana", "cherry", "dog", "elephant", "forest", "guitar", "house", "island",
    "jungle", "kettle", "lemon", "mountain", "night", "ocean", "pencil",
];

pub fn test_corpus() -> DefaultCorpus {
    DefaultCorpus::from_words(CORPUS.iter().copied())
}

/// Build a service over the given provider, cache and registry.
pub fn service_with(
    provider: Arc<LetterProvider>,
    cache: Arc<dyn EmbeddingCache>,
    registry: BasisRegistry,
) -> ProjectionService {
    service_over(provider, cache, registry, test_corpus())
}

/// Like [`service_with`], with an explicit default corpus.
pub fn service_over(
    provider: Arc<LetterProvider>,
    cache: Arc<dyn EmbeddingCache>,
    registry: BasisRegistry,
    corpus: DefaultCorpus,
) -> ProjectionService {
    let store = EmbeddingStore::new(provider, cache, 1000);
    ProjectionService::new(Arc::new(store), Arc::new(registry), Arc::new(corpus), 20)
}

/// Fully in-memory service with a fresh provider.
pub fn memory_service() -> (ProjectionService, Arc<LetterProvider>) {
    let provider = LetterProvider::new();
    let service = service_with(
        Arc::clone(&provider),
        Arc::new(MemoryCache::new()),
        BasisRegistry::new(16),
    );
    (service, provider)
}

pub fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

pub fn assert_close(a: &[f64; 3], b: &[f64; 3]) {
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-9, "{a:?} != {b:?}");
    }
}
