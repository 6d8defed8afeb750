//! Caching word → embedding resolution.
//!
//! [`EmbeddingStore::get_embeddings`] answers from an in-process map, then the
//! durable [`EmbeddingCache`], and only sends the remaining misses to the
//! [`EmbeddingProvider`]. A word is fetched upstream by at most one caller at a
//! time: concurrent callers that need a word already in flight wait for it to
//! land instead of requesting it again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use serde::Serialize;

use super::{Embedding, EmbeddingProvider};
use crate::projection::error::{ProjectionError, Result};

/// Times a caller waits on, then re-claims, words other callers are fetching.
const MAX_ROUNDS: usize = 4;

/// Durable word → embedding storage. Content is opaque to the store.
pub trait EmbeddingCache: Send + Sync {
    fn get(&self, word: &str) -> anyhow::Result<Option<Embedding>>;

    fn set(&self, word: &str, embedding: &[f32]) -> anyhow::Result<()>;

    /// Store several entries at once. Implementations may override to batch writes.
    fn set_many(&self, entries: &[(&str, &[f32])]) -> anyhow::Result<()> {
        for (word, embedding) in entries {
            self.set(word, embedding)?;
        }
        Ok(())
    }
}

/// Non-durable [`EmbeddingCache`] for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Embedding>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddingCache for MemoryCache {
    fn get(&self, word: &str) -> anyhow::Result<Option<Embedding>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {e}"))?;
        Ok(entries.get(word).cloned())
    }

    fn set(&self, word: &str, embedding: &[f32]) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {e}"))?;
        entries.insert(word.to_string(), embedding.to_vec());
        Ok(())
    }
}

/// Counters reported by [`EmbeddingStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmbeddingStoreStats {
    /// Words answered without calling the model.
    pub hits: u64,
    /// Words that had to be sent upstream.
    pub misses: u64,
    /// Upstream `embed_batch` calls.
    pub upstream_calls: u64,
    /// Words another caller was already fetching.
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    upstream_calls: AtomicU64,
    coalesced: AtomicU64,
}

pub struct EmbeddingStore {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<dyn EmbeddingCache>,
    hot: RwLock<HashMap<String, Embedding>>,
    in_flight: Mutex<HashSet<String>>,
    landed: Condvar,
    batch_size: usize,
    counters: Counters,
}

/// Releases claimed words and wakes waiters, including on early return.
struct FlightGuard<'a> {
    store: &'a EmbeddingStore,
    words: &'a [String],
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.store.in_flight.lock() {
            for word in self.words {
                in_flight.remove(word);
            }
        }
        self.store.landed.notify_all();
    }
}

impl EmbeddingStore {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<dyn EmbeddingCache>,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            hot: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            landed: Condvar::new(),
            batch_size: batch_size.max(1),
            counters: Counters::default(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// Resolve `words` to embeddings, same order and length as the input.
    ///
    /// Empty words and words the model returns nothing for map to `None`.
    /// Fails with [`ProjectionError::EmbeddingUnavailable`] if the model
    /// errors, or [`ProjectionError::Storage`] if the durable cache does.
    pub fn get_embeddings<S: AsRef<str>>(&self, words: &[S]) -> Result<Vec<Option<Embedding>>> {
        let mut misses = Vec::new();
        let mut seen = HashSet::new();
        for word in words {
            let word = word.as_ref();
            if word.is_empty() || !seen.insert(word) {
                continue;
            }
            if self.lookup(word)? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                misses.push(word.to_string());
            }
        }

        if !misses.is_empty() {
            self.resolve_misses(misses)?;
        }

        let hot = self.read_hot()?;
        Ok(words
            .iter()
            .map(|w| hot.get(w.as_ref()).cloned())
            .collect())
    }

    /// Snapshot of the hit/miss counters.
    pub fn stats(&self) -> EmbeddingStoreStats {
        EmbeddingStoreStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            upstream_calls: self.counters.upstream_calls.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Check the in-process map, then the durable cache (promoting a hit).
    fn lookup(&self, word: &str) -> Result<bool> {
        if self.read_hot()?.contains_key(word) {
            return Ok(true);
        }
        let cached = self
            .cache
            .get(word)
            .map_err(|e| ProjectionError::Storage(format!("{e:#}")))?;
        match cached {
            Some(embedding) => {
                self.write_hot()?.insert(word.to_string(), embedding);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fetch misses upstream, claiming each word so concurrent callers do not
    /// request it twice. A word whose in-flight fetch failed elsewhere is
    /// claimed and fetched here. Words still held by other callers after
    /// [`MAX_ROUNDS`] waits fail the request instead of coming back empty.
    fn resolve_misses(&self, mut pending: Vec<String>) -> Result<()> {
        for _round in 0..MAX_ROUNDS {
            let (mine, theirs) = self.claim(pending)?;

            if !mine.is_empty() {
                let _guard = FlightGuard {
                    store: self,
                    words: &mine,
                };
                self.fetch_upstream(&mine)?;
            }

            if theirs.is_empty() {
                return Ok(());
            }
            self.counters
                .coalesced
                .fetch_add(theirs.len() as u64, Ordering::Relaxed);
            self.wait_for(&theirs)?;

            let hot = self.read_hot()?;
            pending = theirs
                .into_iter()
                .filter(|w| !hot.contains_key(w))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
        }

        Err(ProjectionError::EmbeddingUnavailable(format!(
            "{} word(s) still unresolved after {MAX_ROUNDS} attempts",
            pending.len()
        )))
    }

    /// Split `words` into those this caller now owns and those another caller
    /// is fetching. Words that landed since the lookup are dropped.
    fn claim(&self, words: Vec<String>) -> Result<(Vec<String>, Vec<String>)> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|e| ProjectionError::Storage(format!("in-flight lock poisoned: {e}")))?;
        let hot = self.read_hot()?;
        Ok(words
            .into_iter()
            .filter(|w| !hot.contains_key(w))
            .partition(|w| in_flight.insert(w.clone())))
    }

    fn wait_for(&self, words: &[String]) -> Result<()> {
        let in_flight = self
            .in_flight
            .lock()
            .map_err(|e| ProjectionError::Storage(format!("in-flight lock poisoned: {e}")))?;
        let _released = self
            .landed
            .wait_while(in_flight, |set| words.iter().any(|w| set.contains(w)))
            .map_err(|e| ProjectionError::Storage(format!("in-flight lock poisoned: {e}")))?;
        Ok(())
    }

    fn fetch_upstream(&self, words: &[String]) -> Result<()> {
        self.counters
            .misses
            .fetch_add(words.len() as u64, Ordering::Relaxed);

        for chunk in words.chunks(self.batch_size) {
            let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
            tracing::info!(words = refs.len(), model = %self.provider.model_id(), "generating embeddings");

            self.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
            let embedded = self
                .provider
                .embed_batch(&refs)
                .map_err(|e| ProjectionError::EmbeddingUnavailable(format!("{e:#}")))?;
            if embedded.len() != refs.len() {
                return Err(ProjectionError::EmbeddingUnavailable(format!(
                    "model returned {} embeddings for {} words",
                    embedded.len(),
                    refs.len()
                )));
            }

            let fresh: Vec<(&str, Embedding)> = refs
                .iter()
                .zip(embedded)
                .filter_map(|(w, e)| e.filter(|v| !v.is_empty()).map(|v| (*w, v)))
                .collect();
            let absent = refs.len() - fresh.len();
            if absent > 0 {
                tracing::warn!(absent, "model produced no embedding for some words");
            }

            let entries: Vec<(&str, &[f32])> =
                fresh.iter().map(|(w, e)| (*w, e.as_slice())).collect();
            self.cache
                .set_many(&entries)
                .map_err(|e| ProjectionError::Storage(format!("{e:#}")))?;

            let mut hot = self.write_hot()?;
            for (word, embedding) in fresh {
                hot.insert(word.to_string(), embedding);
            }
        }
        Ok(())
    }

    fn read_hot(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Embedding>>> {
        self.hot
            .read()
            .map_err(|e| ProjectionError::Storage(format!("embedding map lock poisoned: {e}")))
    }

    fn write_hot(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Embedding>>> {
        self.hot
            .write()
            .map_err(|e| ProjectionError::Storage(format!("embedding map lock poisoned: {e}")))
    }
}
