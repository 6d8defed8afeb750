use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub corpus: CorpusConfig,
    pub projection: ProjectionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX Runtime) or `"remote"` (OpenAI-compatible HTTP API).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub api_url: String,
    pub api_key: Option<String>,
    /// Maximum words per upstream request.
    pub batch_size: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CorpusConfig {
    /// Newline-separated word list used to fit the `"default"` basis.
    pub default_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProjectionConfig {
    pub max_word_len: usize,
    /// Ad-hoc bases kept in memory. The default basis is not counted.
    pub max_bases: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_app_dir()
            .join("cache.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_app_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            api_url: "https://api.openai.com/v1/embeddings".into(),
            api_key: None,
            batch_size: 1000,
            timeout_secs: 30,
        }
    }
}

impl Default for CorpusConfig {
    fn default() -> Self {
        let default_path = default_app_dir()
            .join("oxford_3000.txt")
            .to_string_lossy()
            .into_owned();
        Self { default_path }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_word_len: 20,
            max_bases: 256,
        }
    }
}

/// Returns `~/.latentdict/`
pub fn default_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".latentdict")
}

/// Returns the default config file path: `~/.latentdict/config.toml`
pub fn default_config_path() -> PathBuf {
    default_app_dir().join("config.toml")
}

impl AppConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            AppConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (LATENTDICT_DB, LATENTDICT_CORPUS,
    /// LATENTDICT_LOG_LEVEL, LATENTDICT_PROVIDER, LATENTDICT_API_KEY / OPENAI_API_KEY).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LATENTDICT_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("LATENTDICT_CORPUS") {
            self.corpus.default_path = val;
        }
        if let Ok(val) = std::env::var("LATENTDICT_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("LATENTDICT_PROVIDER") {
            self.embedding.provider = val;
        }
        if let Ok(val) =
            std::env::var("LATENTDICT_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            self.embedding.api_key = Some(val);
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_corpus_path(&self) -> PathBuf {
        expand_tilde(&self.corpus.default_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
