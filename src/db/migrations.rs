//! Forward-only schema migration framework.
//!
//! Tracks the schema version in `schema_meta` and runs sequential migrations
//! to bring the database up to [`CURRENT_SCHEMA_VERSION`]. Also records which
//! embedding model produced the cached vectors.

use rusqlite::Connection;

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

/// Update the stored schema version.
fn update_schema_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE schema_meta SET value = ?1 WHERE key = 'schema_version'",
        [version.to_string()],
    )?;
    Ok(())
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Set the stored embedding model identifier.
pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [model],
    )?;
    Ok(())
}

/// Make the cache belong to `model`. Vectors (and bases fit on them) from a
/// different model are not comparable, so a mismatch clears both tables.
/// Returns `true` if anything was invalidated.
pub fn sync_embedding_model(conn: &mut Connection, model: &str) -> rusqlite::Result<bool> {
    let stored = get_embedding_model(conn)?;
    if stored.as_deref() == Some(model) {
        return Ok(false);
    }

    let tx = conn.transaction()?;
    let cleared = tx.execute("DELETE FROM embeddings", [])?;
    tx.execute("DELETE FROM bases", [])?;
    set_embedding_model(&tx, model)?;
    tx.commit()?;

    if let Some(stored) = stored {
        tracing::warn!(
            stored = %stored,
            configured = %model,
            cleared,
            "embedding model changed; cached vectors and bases discarded"
        );
        Ok(true)
    } else {
        Ok(cleared > 0)
    }
}

/// Run any pending forward-only migrations. Each migration runs in a transaction.
pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "running migration");

        match next {
            2 => migrate_v1_to_v2(conn)?,
            3 => migrate_v2_to_v3(conn)?,
            _ => {
                tracing::error!(version = next, "unknown migration target");
                break;
            }
        }

        update_schema_version(conn, next)?;
        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: durable storage for fitted PCA bases.
fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        CREATE TABLE IF NOT EXISTS bases (
            id TEXT PRIMARY KEY,
            dim INTEGER NOT NULL,
            fitted_on INTEGER NOT NULL,
            data BLOB NOT NULL,
            created_at TEXT NOT NULL
        );
        COMMIT;
        "#,
    )
}

/// Migration v2 → v3: digest of the word set each basis was fit on, so a
/// stored default basis can be told apart from one fit on an older corpus.
fn migrate_v2_to_v3(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        BEGIN;
        ALTER TABLE bases ADD COLUMN source TEXT;
        COMMIT;
        "#,
    )
}
