use latentdict::db;
use tempfile::TempDir;

#[test]
fn open_creates_new_db_at_nonexistent_path() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("subdir").join("cache.db");

    assert!(!db_path.exists());

    let conn = db::open_database(&db_path).unwrap();

    assert!(db_path.exists());
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn reopening_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("cache.db");

    drop(db::open_database(&db_path).unwrap());
    let conn = db::open_database(&db_path).unwrap();

    assert_eq!(
        db::migrations::get_schema_version(&conn).unwrap(),
        db::migrations::CURRENT_SCHEMA_VERSION
    );
}

#[test]
fn wal_mode_and_busy_timeout_are_set() {
    let tmp = TempDir::new().unwrap();
    let conn = db::open_database(tmp.path().join("cache.db")).unwrap();

    let mode: String = conn
        .pragma_query_value(None, "journal_mode", |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    let timeout: i64 = conn
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 5000);
}

#[test]
fn health_check_passes_on_fresh_db() {
    let conn = db::open_memory_database().unwrap();

    let report = db::check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, db::migrations::CURRENT_SCHEMA_VERSION);
    assert_eq!(report.embedding_model, None);
    assert_eq!(report.embedding_count, 0);
    assert_eq!(report.basis_count, 0);
}

#[test]
fn health_check_counts_cached_rows() {
    use latentdict::embedding::store::EmbeddingCache;

    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("cache.db");
    let cache =
        db::cache::SqliteCache::new(db::open_database(&db_path).unwrap(), "letters").unwrap();
    cache
        .set_many(&[("cat", &[1.0, 0.0]), ("dog", &[0.0, 1.0])])
        .unwrap();

    let conn = db::open_database(&db_path).unwrap();
    let report = db::check_database_health(&conn).unwrap();
    assert_eq!(report.embedding_count, 2);
    assert_eq!(report.embedding_model.as_deref(), Some("letters"));
}
