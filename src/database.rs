use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log::{debug, info};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::IndexerError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "onesearch.db";
const POOL_SIZE: u32 = 8;

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Durable store for sources and fingerprints. Cheap to clone: clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    /// Open the database at its default location inside the app's data directory
    pub fn open_default(project_dirs: &ProjectDirs) -> Result<Self, IndexerError> {
        Self::open(&project_dirs.data_local_dir().join(DB_FILENAME))
    }

    pub fn open(db_path: &Path) -> Result<Self, IndexerError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|c| {
            c.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });

        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let db = Database {
            pool,
            path: db_path.to_path_buf(),
        };

        let conn = db.get_connection()?;
        Self::ensure_schema(&conn)?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_connection(&self) -> Result<PooledConn, IndexerError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), IndexerError> {
        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)?;

        if !table_exists {
            debug!("Creating schema version {}", SCHEMA_VERSION);
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version = Self::get_meta_value(conn, "schema_version")?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(IndexerError::Error(format!(
                "Schema version mismatch: database has {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(IndexerError::Error("Schema version missing".to_string())),
        }
    }

    pub fn get_meta_value(conn: &Connection, key: &str) -> Result<Option<String>, IndexerError> {
        conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| row.get(0))
            .optional()
            .map_err(IndexerError::DatabaseError)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on success and
    /// rolling back on any error.
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, IndexerError>
    where
        F: FnOnce(&Connection) -> Result<T, IndexerError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;

        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                // Rollback failure is ignored in favour of the closure error
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}
