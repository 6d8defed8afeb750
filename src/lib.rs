//! Word-embedding projection service for word-relationship visualization.
//!
//! latentdict turns words into 3D coordinates. Each word is embedded by a
//! sentence-embedding model, and the embeddings are projected onto the top three
//! principal components of a reference word set. A frontend can then plot
//! related words near each other.
//!
//! | Basis | Fit on | Lifetime |
//! |-------|--------|----------|
//! | **default** | the default corpus (Oxford 3000) | pinned, fit lazily once |
//! | **fit-&lt;hash&gt;** | a user's highlight words | LRU in memory, durable in SQLite |
//!
//! # Architecture
//!
//! - **Embeddings**: local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//!   or an OpenAI-compatible HTTP API, behind a single-flight cache
//! - **Projection**: PCA by block subspace iteration on `ndarray`
//! - **Storage**: SQLite for cached embeddings and fitted bases
//! - **Transport**: JSON over HTTP (axum)
//!
//! # Modules
//!
//! - [`config`]: configuration loading from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, health checks and the
//!   durable cache
//! - [`embedding`]: word-to-vector providers and the caching embedding store
//! - [`projection`]: PCA bases, the basis registry and the projection service
//! - [`server`]: HTTP routes over the projection service

pub mod config;
pub mod db;
pub mod embedding;
pub mod projection;
pub mod server;
