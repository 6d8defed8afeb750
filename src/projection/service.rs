//! Projection entry point.
//!
//! [`ProjectionService::project`] validates the request, picks the basis id,
//! resolves embeddings through the [`EmbeddingStore`], gets a basis from the
//! [`BasisRegistry`] and transforms the target words. Validation rejects the
//! whole request before any cache or model work; words the model cannot embed
//! are left out of the result instead of failing it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use super::basis::Coordinate;
use super::corpus::DefaultCorpus;
use super::error::{ProjectionError, Result};
use super::registry::{BasisId, BasisRegistry};
use crate::embedding::store::EmbeddingStore;
use crate::embedding::Embedding;

/// Input to [`ProjectionService::project`].
#[derive(Debug, Clone, Default)]
pub struct ProjectionRequest {
    /// Words to place in 3D.
    pub target_words: Vec<String>,
    /// Highlight words defining a custom basis.
    pub fit_words: Option<Vec<String>>,
    /// Basis id returned by an earlier call.
    pub basis_id: Option<String>,
    /// Project through the default basis regardless of the other fields.
    pub reset: bool,
}

/// Ordered word → coordinate mapping plus the basis id that produced it.
///
/// Serializes as `{"vectors": {word: [x, y, z], ...}, "pca_id": id}` with the
/// words in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub points: Vec<(String, Coordinate)>,
    pub basis_id: BasisId,
}

impl Projection {
    pub fn get(&self, word: &str) -> Option<&Coordinate> {
        self.points
            .iter()
            .find(|(w, _)| w == word)
            .map(|(_, c)| c)
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.points.iter().map(|(w, _)| w.as_str())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

struct Vectors<'a>(&'a [(String, Coordinate)]);

impl Serialize for Vectors<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (word, coordinate) in self.0 {
            map.serialize_entry(word, coordinate)?;
        }
        map.end()
    }
}

impl Serialize for Projection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Projection", 2)?;
        state.serialize_field("vectors", &Vectors(&self.points))?;
        state.serialize_field("pca_id", &self.basis_id)?;
        state.end()
    }
}

pub struct ProjectionService {
    store: Arc<EmbeddingStore>,
    registry: Arc<BasisRegistry>,
    corpus: Arc<DefaultCorpus>,
    max_word_len: usize,
    bootstrap: Mutex<Option<Arc<Projection>>>,
}

impl ProjectionService {
    pub fn new(
        store: Arc<EmbeddingStore>,
        registry: Arc<BasisRegistry>,
        corpus: Arc<DefaultCorpus>,
        max_word_len: usize,
    ) -> Self {
        Self {
            store,
            registry,
            corpus,
            max_word_len,
            bootstrap: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn registry(&self) -> &BasisRegistry {
        &self.registry
    }

    pub fn corpus(&self) -> &DefaultCorpus {
        &self.corpus
    }

    /// Project `target_words` and report the basis id used.
    ///
    /// Basis choice: `reset` → `"default"`; else the requested id; else an id
    /// derived from non-empty `fit_words`; else `"default"`. A new basis is
    /// fit only for `"default"` or when fit words are given.
    pub fn project(&self, request: &ProjectionRequest) -> Result<Projection> {
        let targets = self.validate(&request.target_words)?;
        if targets.is_empty() {
            return Err(ProjectionError::invalid_word("", "no words to project"));
        }
        let fit_words = match &request.fit_words {
            Some(words) if !words.is_empty() => Some(self.validate(words)?),
            _ => None,
        };

        let basis_id = if request.reset {
            BasisId::default()
        } else if let Some(id) = request.basis_id.as_deref().filter(|id| !id.is_empty()) {
            BasisId::from(id)
        } else if let Some(words) = &fit_words {
            BasisId::derive(words)
        } else {
            BasisId::default()
        };

        tracing::debug!(
            targets = targets.len(),
            fit_words = fit_words.as_ref().map_or(0, Vec::len),
            basis = %basis_id,
            "project called"
        );

        self.run(&targets, fit_words.as_deref(), basis_id)
    }

    /// The whole default corpus through the default basis. Computed once and
    /// memoized until [`ProjectionService::reset_default`].
    pub fn default_projection(&self) -> Result<Arc<Projection>> {
        let mut memo = self
            .bootstrap
            .lock()
            .map_err(|e| ProjectionError::Storage(format!("bootstrap lock poisoned: {e}")))?;
        if let Some(projection) = memo.as_ref() {
            return Ok(Arc::clone(projection));
        }

        let projection = Arc::new(self.run(self.corpus.words(), None, BasisId::default())?);
        tracing::info!(words = projection.len(), "default projection computed");
        *memo = Some(Arc::clone(&projection));
        Ok(projection)
    }

    /// Re-project the default corpus together with `search_history` and
    /// `words`, through a basis fit on `words` (or the default basis when
    /// `reset`).
    pub fn rebase(&self, words: &[String], search_history: &[String], reset: bool) -> Result<Projection> {
        let words = self.validate(words)?;
        let history = self.validate(search_history)?;
        if words.is_empty() && !reset {
            return Err(ProjectionError::invalid_word("", "no highlight words to fit"));
        }

        let mut seen = HashSet::new();
        let display: Vec<String> = self
            .corpus
            .words()
            .iter()
            .chain(&history)
            .chain(&words)
            .filter(|w| seen.insert(w.as_str()))
            .cloned()
            .collect();

        if reset {
            self.run(&display, None, BasisId::default())
        } else {
            let basis_id = BasisId::derive(&words);
            self.run(&display, Some(&words), basis_id)
        }
    }

    /// Drop the default basis and the memoized default projection; the next
    /// default request refits.
    pub fn reset_default(&self) -> Result<()> {
        self.registry.reset_default()?;
        let mut memo = self
            .bootstrap
            .lock()
            .map_err(|e| ProjectionError::Storage(format!("bootstrap lock poisoned: {e}")))?;
        *memo = None;
        Ok(())
    }

    fn run(&self, targets: &[String], fit_words: Option<&[String]>, basis_id: BasisId) -> Result<Projection> {
        // An unknown id fails here, before any target reaches the model.
        let basis = if basis_id.is_default() {
            self.registry
                .resolve(&basis_id, Some(|| self.default_fit_set()), true)?
        } else {
            let source = fit_words.map(|words| move || self.fit_set(words));
            self.registry.resolve(&basis_id, source, fit_words.is_some())?
        };

        let embeddings = self.store.get_embeddings(targets)?;

        let mut points = Vec::with_capacity(targets.len());
        for (word, embedding) in targets.iter().zip(&embeddings) {
            if let Some(embedding) = embedding {
                points.push((word.clone(), basis.transform_one(embedding)?));
            }
        }

        let skipped = targets.len() - points.len();
        if skipped > 0 {
            tracing::debug!(skipped, basis = %basis_id, "words without embeddings omitted");
        }

        Ok(Projection { points, basis_id })
    }

    fn default_fit_set(&self) -> Result<Vec<Embedding>> {
        tracing::info!(words = self.corpus.len(), "fitting default basis");
        self.fit_set(self.corpus.words())
    }

    fn fit_set(&self, words: &[String]) -> Result<Vec<Embedding>> {
        Ok(self
            .store
            .get_embeddings(words)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Check every word, lowercase, and drop repeats (first occurrence wins).
    fn validate(&self, words: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(words.len());
        for word in words {
            validate_word(word, self.max_word_len)?;
            let lower = word.to_lowercase();
            if seen.insert(lower.clone()) {
                out.push(lower);
            }
        }
        Ok(out)
    }
}

/// A word must be non-empty, purely alphabetic, and at most `max_len` chars.
pub fn validate_word(word: &str, max_len: usize) -> Result<()> {
    if word.is_empty() {
        return Err(ProjectionError::invalid_word(word, "must not be empty"));
    }
    if !word.chars().all(char::is_alphabetic) {
        return Err(ProjectionError::invalid_word(word, "must be alphabetic"));
    }
    if word.chars().count() > max_len {
        return Err(ProjectionError::invalid_word(
            word,
            format!("must be at most {max_len} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_word_rules() {
        assert!(validate_word("cat", 20).is_ok());
        assert!(validate_word("café", 20).is_ok());
        assert!(validate_word("", 20).is_err());
        assert!(validate_word("ice cream", 20).is_err());
        assert!(validate_word("r2d2", 20).is_err());
        assert!(validate_word("supercalifragilistic", 20).is_ok());
        assert!(validate_word("supercalifragilistics", 20).is_err());
    }

    #[test]
    fn projection_serializes_in_order() {
        let projection = Projection {
            points: vec![
                ("zebra".into(), [1.0, 2.0, 3.0]),
                ("apple".into(), [0.5, 0.0, -1.0]),
            ],
            basis_id: BasisId::default(),
        };
        let json = serde_json::to_string(&projection).unwrap();
        assert_eq!(
            json,
            r#"{"vectors":{"zebra":[1.0,2.0,3.0],"apple":[0.5,0.0,-1.0]},"pca_id":"default"}"#
        );
        assert_eq!(projection.get("apple"), Some(&[0.5, 0.0, -1.0]));
        assert_eq!(projection.words().collect::<Vec<_>>(), ["zebra", "apple"]);
    }
}
