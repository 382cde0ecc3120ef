use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::AppResult;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the listings/cache database and applies the schema.
pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    configure(&connection)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "database context established"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

pub fn open_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS listings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_name TEXT NOT NULL,
            address TEXT NOT NULL,
            batch_date TEXT NOT NULL,
            imported_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS locations_cache (
            address_key TEXT PRIMARY KEY,
            latitude REAL NOT NULL CHECK (latitude BETWEEN -90.0 AND 90.0),
            longitude REAL NOT NULL CHECK (longitude BETWEEN -180.0 AND 180.0),
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_listings_identity
            ON listings(source_name, batch_date, address);
        CREATE INDEX IF NOT EXISTS idx_listings_source_batch
            ON listings(source_name, batch_date);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("nested").join("test.db")).unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('listings','locations_cache')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 2);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn bootstrap_is_repeatable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("again.db");
        drop(bootstrap(&path).unwrap());
        let ctx = bootstrap(&path).unwrap();
        let count: i64 = ctx
            .connection
            .query_row("SELECT COUNT(*) FROM locations_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let conn = open_in_memory().unwrap();
        let result = conn.execute(
            "INSERT INTO locations_cache (address_key, latitude, longitude, updated_at)
             VALUES ('BAD', 91.0, 0.0, ?1)",
            [Utc::now().to_rfc3339()],
        );
        assert!(result.is_err());
    }
}
