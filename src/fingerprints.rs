use std::collections::HashMap;

use log::warn;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::IndexerError;

const STATUS_FAILED_FILES_LIMIT: usize = 50;

#[repr(i64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success = 0,
    Failed = 1,
    Skipped = 2,
}

impl Outcome {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Outcome::Success,
            1 => Outcome::Failed,
            2 => Outcome::Skipped,
            _ => {
                warn!(
                    "Invalid Outcome value in database: {}, defaulting to Failed",
                    value
                );
                Outcome::Failed
            }
        }
    }
}

/// A file path with the reason it could not be indexed
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

/// Last-processed snapshot of one file under one source
#[derive(Clone, Debug, PartialEq)]
pub struct Fingerprint {
    pub source_id: String,
    pub path: String,
    pub path_hash: String,
    pub size_bytes: u64,
    pub modified_at: i64,
    pub outcome: Outcome,
    pub error_message: Option<String>,
    pub processed_at: i64,
}

/// Aggregate view of a source's fingerprint rows
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FingerprintSummary {
    pub total_files: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub last_processed_at: Option<i64>,
    pub failed_files: Vec<FailedFile>,
}

impl Fingerprint {
    pub fn new(
        source_id: &str,
        path: &str,
        size_bytes: u64,
        modified_at: i64,
        outcome: Outcome,
        error_message: Option<String>,
        processed_at: i64,
    ) -> Self {
        Fingerprint {
            source_id: source_id.to_owned(),
            path: path.to_owned(),
            path_hash: Self::path_hash(path),
            size_bytes,
            modified_at,
            outcome,
            error_message,
            processed_at,
        }
    }

    /// SHA-256 of the absolute path, lowercase hex
    pub fn path_hash(path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Stable identifier of the document this path produces in the external index
    pub fn document_id(source_id: &str, path: &str) -> String {
        format!("{}_{}", source_id, Self::path_hash(path))
    }

    pub fn load_for_source(
        conn: &Connection,
        source_id: &str,
    ) -> Result<HashMap<String, Fingerprint>, IndexerError> {
        let mut stmt = conn.prepare(
            "SELECT source_id, path, path_hash, size_bytes, modified_at, outcome, error_message, processed_at
             FROM fingerprints
             WHERE source_id = ?",
        )?;

        let rows = stmt.query_map([source_id], |row| {
            Ok(Fingerprint {
                source_id: row.get(0)?,
                path: row.get(1)?,
                path_hash: row.get(2)?,
                size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
                modified_at: row.get(4)?,
                outcome: Outcome::from_i64(row.get(5)?),
                error_message: row.get(6)?,
                processed_at: row.get(7)?,
            })
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let fingerprint = row?;
            map.insert(fingerprint.path.clone(), fingerprint);
        }

        Ok(map)
    }

    pub fn get(
        conn: &Connection,
        source_id: &str,
        path: &str,
    ) -> Result<Option<Fingerprint>, IndexerError> {
        conn.query_row(
            "SELECT source_id, path, path_hash, size_bytes, modified_at, outcome, error_message, processed_at
             FROM fingerprints
             WHERE source_id = ? AND path = ?",
            params![source_id, path],
            |row| {
                Ok(Fingerprint {
                    source_id: row.get(0)?,
                    path: row.get(1)?,
                    path_hash: row.get(2)?,
                    size_bytes: row.get::<_, i64>(3)?.max(0) as u64,
                    modified_at: row.get(4)?,
                    outcome: Outcome::from_i64(row.get(5)?),
                    error_message: row.get(6)?,
                    processed_at: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(IndexerError::DatabaseError)
    }

    /// Insert or replace the record for (source, path)
    pub fn upsert(&self, conn: &Connection) -> Result<(), IndexerError> {
        conn.execute(
            "INSERT INTO fingerprints
                (source_id, path, path_hash, size_bytes, modified_at, outcome, error_message, processed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_id, path) DO UPDATE SET
                path_hash = excluded.path_hash,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                outcome = excluded.outcome,
                error_message = excluded.error_message,
                processed_at = excluded.processed_at",
            params![
                self.source_id,
                self.path,
                self.path_hash,
                self.size_bytes as i64,
                self.modified_at,
                self.outcome.as_i64(),
                self.error_message,
                self.processed_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_paths(
        conn: &Connection,
        source_id: &str,
        paths: &[String],
    ) -> Result<usize, IndexerError> {
        let mut stmt = conn.prepare("DELETE FROM fingerprints WHERE source_id = ? AND path = ?")?;
        let mut deleted = 0;
        for path in paths {
            deleted += stmt.execute(params![source_id, path])?;
        }
        Ok(deleted)
    }

    pub fn delete_for_source(conn: &Connection, source_id: &str) -> Result<usize, IndexerError> {
        let deleted = conn.execute("DELETE FROM fingerprints WHERE source_id = ?", [source_id])?;
        Ok(deleted)
    }

    pub fn summary(conn: &Connection, source_id: &str) -> Result<FingerprintSummary, IndexerError> {
        let (total, successful, failed, skipped, last_processed_at) = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN outcome = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN outcome = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN outcome = 2 THEN 1 ELSE 0 END), 0),
                MAX(processed_at)
             FROM fingerprints
             WHERE source_id = ?",
            [source_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT path, error_message
             FROM fingerprints
             WHERE source_id = ? AND outcome = ?
             ORDER BY path
             LIMIT ?",
        )?;
        let failed_files = stmt
            .query_map(
                params![
                    source_id,
                    Outcome::Failed.as_i64(),
                    STATUS_FAILED_FILES_LIMIT as i64
                ],
                |row| {
                    Ok(FailedFile {
                        path: row.get(0)?,
                        error: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(FingerprintSummary {
            total_files: total as u64,
            successful: successful as u64,
            failed: failed as u64,
            skipped: skipped as u64,
            last_processed_at,
            failed_files,
        })
    }
}
