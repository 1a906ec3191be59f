use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub type SharedConnection = Arc<Mutex<Connection>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

impl DatabaseContext {
    pub fn into_shared(self) -> SharedConnection {
        Arc::new(Mutex::new(self.connection))
    }
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    configure(&connection, true)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "resolver database ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

pub fn open_in_memory() -> AppResult<SharedConnection> {
    let connection = Connection::open_in_memory()?;
    configure(&connection, false)?;
    run_migrations(&connection)?;
    Ok(Arc::new(Mutex::new(connection)))
}

fn configure(connection: &Connection, wal: bool) -> AppResult<()> {
    connection.busy_timeout(BUSY_TIMEOUT)?;
    if wal {
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
    }
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS resolved_locations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            raw_name TEXT NOT NULL,
            normalized_key TEXT NOT NULL UNIQUE,
            latitude REAL,
            longitude REAL,
            display_name TEXT,
            confidence REAL NOT NULL DEFAULT 0.0,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            country TEXT,
            admin1 TEXT,
            admin2 TEXT,
            alternate_names TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS gazetteer_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            admin_area TEXT,
            era_bucket TEXT NOT NULL DEFAULT 'unknown',
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            source TEXT NOT NULL,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS gazetteer_alternate_names (
            entry_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (entry_id, name),
            FOREIGN KEY (entry_id) REFERENCES gazetteer_entries(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS geocode_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            resolution_id TEXT NOT NULL,
            raw_place TEXT NOT NULL,
            normalized_name TEXT,
            admin_hint TEXT,
            era_bucket TEXT NOT NULL DEFAULT 'unknown',
            provider TEXT NOT NULL,
            is_winner INTEGER NOT NULL DEFAULT 0 CHECK (is_winner IN (0, 1)),
            latitude REAL,
            longitude REAL,
            score REAL,
            request_payload TEXT,
            response_payload TEXT,
            scoring_payload TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS geocode_cache (
            cache_key TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_gazetteer_lookup ON gazetteer_entries(name, admin_area, era_bucket);
        CREATE INDEX IF NOT EXISTS idx_gazetteer_alt_name ON gazetteer_alternate_names(name);
        CREATE INDEX IF NOT EXISTS idx_attempts_raw_created ON geocode_attempts(raw_place, created_at);
        CREATE INDEX IF NOT EXISTS idx_locations_raw_name ON resolved_locations(raw_name);
        CREATE INDEX IF NOT EXISTS idx_locations_status ON resolved_locations(status);
        "#,
    )?;

    ensure_column(connection, "resolved_locations", "display_name TEXT")?;
    ensure_column(connection, "geocode_attempts", "scoring_payload TEXT")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('resolved_locations','gazetteer_entries','gazetteer_alternate_names','geocode_attempts','geocode_cache')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 5);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn migrations_are_repeatable() {
        let dir = tempdir().unwrap();
        drop(bootstrap(dir.path(), "again.db").unwrap());
        let ctx = bootstrap(dir.path(), "again.db").unwrap();
        assert!(column_exists(&ctx.connection, "resolved_locations", "display_name").unwrap());
        assert!(!column_exists(&ctx.connection, "resolved_locations", "missing").unwrap());
    }

    #[test]
    fn normalized_key_is_unique() {
        let db = open_in_memory().unwrap();
        let conn = db.lock();
        conn.execute(
            "INSERT INTO resolved_locations (raw_name, normalized_key, source, status)
             VALUES ('Ohio', 'ohio', 'vague', 'vague')",
            [],
        )
        .unwrap();
        let duplicate = conn.execute(
            "INSERT INTO resolved_locations (raw_name, normalized_key, source, status)
             VALUES ('OHIO', 'ohio', 'vague', 'vague')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
