//! SQLite-backed [`EmbeddingCache`] and [`BasisStore`].
//!
//! One connection behind a mutex serves both traits. Embeddings are stored as
//! little-endian `f32` blobs, bases as the [`PcaBasis::to_bytes`] blob.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::embedding::store::EmbeddingCache;
use crate::embedding::Embedding;
use crate::projection::registry::{BasisId, BasisStore, StoredBasis};
use crate::projection::PcaBasis;

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Wrap an opened connection (see [`super::open_database`]) and bind it to
    /// `model`, discarding vectors cached for a different model.
    pub fn new(mut conn: Connection, model: &str) -> Result<Self> {
        super::migrations::sync_embedding_model(&mut conn, model)
            .context("failed to check embedding model")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
    }
}

/// Convert an f32 embedding to little-endian bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`embedding_to_bytes`].
pub fn bytes_to_embedding(bytes: &[u8]) -> Result<Embedding> {
    anyhow::ensure!(
        bytes.len() % 4 == 0,
        "embedding blob length {} is not a multiple of 4",
        bytes.len()
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

impl EmbeddingCache for SqliteCache {
    fn get(&self, word: &str) -> Result<Option<Embedding>> {
        let conn = self.lock()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE word = ?1",
                params![word],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| bytes_to_embedding(&b)).transpose()
    }

    fn set(&self, word: &str, embedding: &[f32]) -> Result<()> {
        self.set_many(&[(word, embedding)])
    }

    fn set_many(&self, entries: &[(&str, &[f32])]) -> Result<()> {
        let mut conn = self.lock()?;
        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (word, dim, vector, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (word, embedding) in entries {
                stmt.execute(params![
                    word,
                    embedding.len() as i64,
                    embedding_to_bytes(embedding),
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl BasisStore for SqliteCache {
    fn load(&self, id: &BasisId) -> Result<Option<StoredBasis>> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, Option<String>)> = conn
            .query_row(
                "SELECT data, source FROM bases WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((bytes, source)) => Ok(Some(StoredBasis {
                basis: PcaBasis::from_bytes(&bytes)?,
                source,
            })),
            None => Ok(None),
        }
    }

    fn save(&self, id: &BasisId, basis: &PcaBasis, source: Option<&str>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO bases (id, dim, fitted_on, data, created_at, source) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                basis.dimensions() as i64,
                basis.fitted_on() as i64,
                basis.to_bytes(),
                chrono::Utc::now().to_rfc3339(),
                source
            ],
        )?;
        Ok(())
    }

    fn remove(&self, id: &BasisId) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM bases WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }
}
