//! The default reference corpus (Oxford 3000 by default).

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Normalized, order-preserving, duplicate-free word list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultCorpus {
    words: Vec<String>,
}

impl DefaultCorpus {
    /// Read a newline-separated word file. See [`DefaultCorpus::parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read default corpus at {}", path.display()))?;
        let corpus = Self::parse(&text);
        anyhow::ensure!(!corpus.is_empty(), "default corpus at {} has no words", path.display());
        tracing::info!(path = %path.display(), words = corpus.len(), "default corpus loaded");
        Ok(corpus)
    }

    /// Lines are trimmed and lowercased; blank lines, `#` comments and
    /// non-alphabetic entries are skipped.
    pub fn parse(text: &str) -> Self {
        Self::from_words(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#')),
        )
    }

    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let words = words
            .into_iter()
            .map(|w| w.as_ref().to_lowercase())
            .filter(|w| !w.is_empty() && w.chars().all(char::is_alphabetic))
            .filter(|w| seen.insert(w.clone()))
            .collect();
        Self { words }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Hex SHA-256 of the normalized word list, in order. Identifies the
    /// corpus a stored default basis was fit on.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for word in &self.words {
            hasher.update(word.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}
