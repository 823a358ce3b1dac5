use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};

/// Schema steps, applied in order and tracked through `PRAGMA user_version`.
const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
    );
"#];

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub recovered: bool,
}

/// Opens (or creates) the key-value store backing the geocode cache.
///
/// A file that SQLite refuses to read is discarded and recreated empty; a
/// lost cache only costs extra geocoding requests.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(database_file);

    let (connection, recovered) = match open_store(&path) {
        Ok(connection) => (connection, false),
        Err(AppError::Database(err)) if is_unreadable_store(&err) && path.exists() => {
            warn!(
                target: "database_bootstrap",
                path = %path.display(),
                error = %err,
                "cache store unreadable; recreating it empty"
            );
            discard_store_files(&path)?;
            (open_store(&path)?, true)
        }
        Err(err) => return Err(err),
    };
    info!(target: "database_bootstrap", path = %path.display(), recovered, "cache store ready");

    Ok(DatabaseBootstrap {
        context: DatabaseContext { connection, path },
        recovered,
    })
}

fn open_store(path: &Path) -> AppResult<Connection> {
    let connection = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )?;
    connection.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
    migrate(&connection)?;
    Ok(connection)
}

fn migrate(connection: &Connection) -> AppResult<()> {
    let applied: i64 = connection.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (index, step) in MIGRATIONS.iter().enumerate().skip(applied.max(0) as usize) {
        let version = index as i64 + 1;
        connection.execute_batch(step)?;
        connection.pragma_update(None, "user_version", version)?;
        debug!(target: "database_bootstrap", version, "applied cache store migration");
    }
    Ok(())
}

fn is_unreadable_store(err: &rusqlite::Error) -> bool {
    let rusqlite::Error::SqliteFailure(failure, message) = err else {
        return false;
    };
    matches!(
        failure.code,
        ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
    ) || message
        .as_deref()
        .is_some_and(|msg| msg.contains("malformed"))
}

/// Removes the database together with its WAL and shared-memory files.
fn discard_store_files(path: &Path) -> AppResult<()> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    for suffix in ["", "-wal", "-shm"] {
        match fs::remove_file(path.with_file_name(format!("{name}{suffix}"))) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

pub fn kv_get(connection: &Connection, key: &str) -> AppResult<Option<String>> {
    Ok(connection
        .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

pub fn kv_put(connection: &Connection, key: &str, value: &str) -> AppResult<()> {
    connection.execute(
        "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = DATETIME('now')",
        (key, value),
    )?;
    Ok(())
}
