use std::path::{Path, PathBuf};
use std::{env, fs};

use chrono_tz::Tz;
use log::{info, warn};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::cron::{self, CronSchedule};
use crate::database::Database;
use crate::error::IndexerError;
use crate::fingerprints::Fingerprint;
use crate::patterns::{default_exclude_patterns, PatternSet};

const SOURCE_COLUMNS: &str = "source_id, name, root_path, include_patterns, exclude_patterns, schedule, timezone, last_scan_at, next_scan_at, created_at, updated_at";

/// A configured filesystem root with its filters and optional schedule
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Source {
    pub source_id: String,
    pub name: String,
    pub root_path: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub schedule: Option<String>,
    pub timezone: String,
    pub last_scan_at: Option<i64>,
    pub next_scan_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct NewSource {
    /// Derived from `name` when absent
    pub source_id: Option<String>,
    pub name: String,
    pub root_path: String,
    pub include_patterns: Vec<String>,
    /// `None` applies the default exclude list
    pub exclude_patterns: Option<Vec<String>>,
    pub schedule: Option<String>,
    pub timezone: Option<String>,
    pub skip_path_check: bool,
}

/// Partial update; `None` leaves a field untouched. `schedule: Some(None)`
/// clears the schedule.
#[derive(Clone, Debug, Default)]
pub struct SourceUpdate {
    pub name: Option<String>,
    pub root_path: Option<String>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub schedule: Option<Option<String>>,
    pub timezone: Option<String>,
    pub skip_path_check: bool,
}

/// URL-safe identifier derived from a display name
pub fn generate_source_id(name: &str) -> String {
    let mut id = String::new();
    let mut in_space = false;
    for c in name.trim().to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                id.push('-');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            id.push(c);
        }
    }

    let id = id.trim_start_matches('-');
    if id.is_empty() {
        "source".to_owned()
    } else {
        id.to_owned()
    }
}

fn validate_source_id(id: &str) -> Result<(), IndexerError> {
    let mut chars = id.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(IndexerError::InvalidSource(format!(
            "Source id '{}' must start with a lowercase letter or digit and contain only [a-z0-9_-]",
            id
        )))
    }
}

pub fn validate_and_canonicalize_path(path_arg: &str) -> Result<PathBuf, IndexerError> {
    let path_arg = path_arg.trim();
    if path_arg.is_empty() {
        return Err(IndexerError::InvalidSource("Root path is empty".into()));
    }

    let path = Path::new(path_arg);
    let absolute_path = if path.is_absolute() {
        path.to_owned()
    } else {
        env::current_dir()?.join(path)
    };

    let metadata = fs::metadata(&absolute_path).map_err(|_| {
        IndexerError::InvalidSource(format!(
            "Root path '{}' does not exist",
            absolute_path.display()
        ))
    })?;

    if !metadata.is_dir() {
        return Err(IndexerError::InvalidSource(format!(
            "Root path '{}' is not a directory",
            absolute_path.display()
        )));
    }

    if let Err(e) = fs::read_dir(&absolute_path) {
        return Err(IndexerError::InvalidSource(format!(
            "Root path '{}' is not readable: {}",
            absolute_path.display(),
            e
        )));
    }

    // Dunce strips the UNC prefix (\\?\C:) on Windows
    let canonical_path = dunce::canonicalize(absolute_path)?;

    Ok(canonical_path)
}

fn normalize_schedule(schedule: Option<String>) -> Option<String> {
    schedule
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn resolve_root(root_path: &str, skip_path_check: bool) -> Result<String, IndexerError> {
    if skip_path_check {
        let trimmed = root_path.trim();
        if trimmed.is_empty() {
            return Err(IndexerError::InvalidSource("Root path is empty".into()));
        }
        warn!("Path validation bypassed for root '{}'", trimmed);
        return Ok(trimmed.to_owned());
    }
    let canonical = validate_and_canonicalize_path(root_path)?;
    Ok(canonical.to_string_lossy().into_owned())
}

fn json_list(row: &Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(Vec::new()),
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

impl Source {
    fn from_row(row: &Row) -> rusqlite::Result<Source> {
        Ok(Source {
            source_id: row.get(0)?,
            name: row.get(1)?,
            root_path: row.get(2)?,
            include_patterns: json_list(row, 3)?,
            exclude_patterns: json_list(row, 4)?,
            schedule: row.get(5)?,
            timezone: row.get(6)?,
            last_scan_at: row.get(7)?,
            next_scan_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn root(&self) -> &Path {
        Path::new(&self.root_path)
    }

    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn patterns(&self) -> Result<PatternSet, IndexerError> {
        PatternSet::compile(&self.include_patterns, &self.exclude_patterns)
    }

    pub fn tz(&self) -> Result<Tz, IndexerError> {
        cron::parse_timezone(&self.timezone)
    }

    /// Next scheduled fire after `after`, or `None` for manual-only sources
    pub fn next_scan_after(&self, after: i64) -> Result<Option<i64>, IndexerError> {
        match &self.schedule {
            Some(schedule) => Ok(Some(cron::next_run_timestamp(
                schedule,
                &self.timezone,
                after,
            )?)),
            None => Ok(None),
        }
    }

    /// Everything a run or a timer relies on must hold before the row is written
    fn validate(&self) -> Result<(), IndexerError> {
        validate_source_id(&self.source_id)?;
        if self.name.trim().is_empty() {
            return Err(IndexerError::InvalidSource("Source name is empty".into()));
        }
        self.patterns()?;
        self.tz()?;
        if let Some(schedule) = &self.schedule {
            CronSchedule::parse(schedule)?;
        }
        Ok(())
    }

    pub fn create(
        conn: &Connection,
        new_source: NewSource,
        default_timezone: &str,
        now: i64,
    ) -> Result<Source, IndexerError> {
        let source_id = new_source
            .source_id
            .map(|id| id.trim().to_owned())
            .unwrap_or_else(|| generate_source_id(&new_source.name));

        let mut source = Source {
            source_id,
            name: new_source.name.trim().to_owned(),
            root_path: resolve_root(&new_source.root_path, new_source.skip_path_check)?,
            include_patterns: new_source.include_patterns,
            exclude_patterns: new_source
                .exclude_patterns
                .unwrap_or_else(default_exclude_patterns),
            schedule: normalize_schedule(new_source.schedule),
            timezone: new_source
                .timezone
                .map(|tz| tz.trim().to_owned())
                .filter(|tz| !tz.is_empty())
                .unwrap_or_else(|| default_timezone.to_owned()),
            last_scan_at: None,
            next_scan_at: None,
            created_at: now,
            updated_at: now,
        };
        source.validate()?;
        source.next_scan_at = source.next_scan_after(now)?;

        Database::immediate_transaction(conn, |c| {
            if Self::get_by_id(c, &source.source_id)?.is_some() {
                return Err(IndexerError::SourceExists(source.source_id.clone()));
            }
            c.execute(
                &format!(
                    "INSERT INTO sources ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    SOURCE_COLUMNS
                ),
                params![
                    source.source_id,
                    source.name,
                    source.root_path,
                    serde_json::to_string(&source.include_patterns)?,
                    serde_json::to_string(&source.exclude_patterns)?,
                    source.schedule,
                    source.timezone,
                    source.last_scan_at,
                    source.next_scan_at,
                    source.created_at,
                    source.updated_at,
                ],
            )?;
            Ok(())
        })?;

        info!(
            "Created source '{}' at '{}'",
            source.source_id, source.root_path
        );
        Ok(source)
    }

    pub fn get_by_id(conn: &Connection, source_id: &str) -> Result<Option<Source>, IndexerError> {
        conn.query_row(
            &format!("SELECT {} FROM sources WHERE source_id = ?", SOURCE_COLUMNS),
            [source_id],
            Self::from_row,
        )
        .optional()
        .map_err(IndexerError::DatabaseError)
    }

    /// Like `get_by_id`, but a missing source is an error
    pub fn require(conn: &Connection, source_id: &str) -> Result<Source, IndexerError> {
        Self::get_by_id(conn, source_id)?
            .ok_or_else(|| IndexerError::SourceNotFound(source_id.to_owned()))
    }

    /// All sources, newest first
    pub fn list(conn: &Connection) -> Result<Vec<Source>, IndexerError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sources ORDER BY created_at DESC, source_id ASC",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    pub fn list_scheduled(conn: &Connection) -> Result<Vec<Source>, IndexerError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sources WHERE schedule IS NOT NULL ORDER BY source_id ASC",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map([], Self::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Apply `update` and persist it. A changed schedule or timezone
    /// recomputes `next_scan_at` from `now`.
    pub fn update(
        conn: &Connection,
        source_id: &str,
        update: SourceUpdate,
        now: i64,
    ) -> Result<Source, IndexerError> {
        let mut source = Self::require(conn, source_id)?;
        let mut reschedule = false;

        if let Some(name) = update.name {
            source.name = name.trim().to_owned();
        }
        if let Some(root_path) = update.root_path {
            source.root_path = resolve_root(&root_path, update.skip_path_check)?;
        }
        if let Some(include) = update.include_patterns {
            source.include_patterns = include;
        }
        if let Some(exclude) = update.exclude_patterns {
            source.exclude_patterns = exclude;
        }
        if let Some(schedule) = update.schedule {
            source.schedule = normalize_schedule(schedule);
            reschedule = true;
        }
        if let Some(timezone) = update.timezone {
            source.timezone = timezone.trim().to_owned();
            reschedule = true;
        }
        source.validate()?;

        if reschedule {
            source.next_scan_at = source.next_scan_after(now)?;
        }
        source.updated_at = now;

        conn.execute(
            "UPDATE sources SET
                name = ?, root_path = ?, include_patterns = ?, exclude_patterns = ?,
                schedule = ?, timezone = ?, next_scan_at = ?, updated_at = ?
             WHERE source_id = ?",
            params![
                source.name,
                source.root_path,
                serde_json::to_string(&source.include_patterns)?,
                serde_json::to_string(&source.exclude_patterns)?,
                source.schedule,
                source.timezone,
                source.next_scan_at,
                source.updated_at,
                source.source_id,
            ],
        )?;

        info!("Updated source '{}'", source.source_id);
        Ok(source)
    }

    /// Remove the source row together with its fingerprints. Returns false
    /// when no such source exists.
    pub fn delete(conn: &Connection, source_id: &str) -> Result<bool, IndexerError> {
        let deleted = Database::immediate_transaction(conn, |c| {
            let fingerprints = Fingerprint::delete_for_source(c, source_id)?;
            let rows = c.execute("DELETE FROM sources WHERE source_id = ?", [source_id])?;
            if rows > 0 {
                info!(
                    "Deleted source '{}' and {} fingerprint records",
                    source_id, fingerprints
                );
            }
            Ok(rows > 0)
        })?;
        Ok(deleted)
    }

    pub fn set_scan_times(
        conn: &Connection,
        source_id: &str,
        last_scan_at: i64,
        next_scan_at: Option<i64>,
    ) -> Result<(), IndexerError> {
        conn.execute(
            "UPDATE sources SET last_scan_at = ?, next_scan_at = ? WHERE source_id = ?",
            params![last_scan_at, next_scan_at, source_id],
        )?;
        Ok(())
    }

    pub fn set_next_scan(
        conn: &Connection,
        source_id: &str,
        next_scan_at: Option<i64>,
    ) -> Result<(), IndexerError> {
        conn.execute(
            "UPDATE sources SET next_scan_at = ? WHERE source_id = ?",
            params![next_scan_at, source_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprints::Outcome;
    use pretty_assertions::assert_eq;

    // 2026-02-05T10:00:00Z
    const NOW: i64 = 1_770_285_600;

    fn setup() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("sources.db")).unwrap();
        (dir, db)
    }

    fn new_source(name: &str, root: &Path) -> NewSource {
        NewSource {
            name: name.to_owned(),
            root_path: root.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_source_id() {
        assert_eq!(generate_source_id("My Documents"), "my-documents");
        assert_eq!(generate_source_id("  Team   Wiki (2024) "), "team-wiki-2024");
        assert_eq!(generate_source_id("!!!"), "source");
        assert_eq!(generate_source_id("- x"), "x");
    }

    #[test]
    fn test_create_and_get() {
        let (dir, db) = setup();
        let conn = db.get_connection().unwrap();

        let mut input = new_source("Project Docs", dir.path());
        input.include_patterns = vec!["**/*.md".to_owned()];
        input.schedule = Some("@daily".to_owned());
        let created = Source::create(&conn, input, "UTC", NOW).unwrap();

        assert_eq!(created.source_id, "project-docs");
        assert_eq!(created.exclude_patterns, default_exclude_patterns());
        assert_eq!(created.timezone, "UTC");
        assert_eq!(created.next_scan_at, Some(NOW + 16 * 3600));

        let loaded = Source::get_by_id(&conn, "project-docs").unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(Source::list_scheduled(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_create_rejects_bad_configuration() {
        let (dir, db) = setup();
        let conn = db.get_connection().unwrap();

        let mut bad_schedule = new_source("a", dir.path());
        bad_schedule.schedule = Some("every tuesday".to_owned());
        assert!(matches!(
            Source::create(&conn, bad_schedule, "UTC", NOW),
            Err(IndexerError::InvalidSchedule { .. })
        ));

        let mut bad_pattern = new_source("b", dir.path());
        bad_pattern.include_patterns = vec!["/etc/*.conf".to_owned()];
        assert!(matches!(
            Source::create(&conn, bad_pattern, "UTC", NOW),
            Err(IndexerError::InvalidPattern { .. })
        ));

        let missing = new_source("c", &dir.path().join("nope"));
        assert!(matches!(
            Source::create(&conn, missing, "UTC", NOW),
            Err(IndexerError::InvalidSource(_))
        ));

        let mut bad_id = new_source("d", dir.path());
        bad_id.source_id = Some("Bad Id".to_owned());
        assert!(matches!(
            Source::create(&conn, bad_id, "UTC", NOW),
            Err(IndexerError::InvalidSource(_))
        ));

        let mut bad_tz = new_source("e", dir.path());
        bad_tz.timezone = Some("Mars/Olympus".to_owned());
        assert!(Source::create(&conn, bad_tz, "UTC", NOW).is_err());

        assert!(Source::list(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_skip_path_check_and_duplicates() {
        let (_dir, db) = setup();
        let conn = db.get_connection().unwrap();

        let mut input = new_source("Remote", Path::new("/mnt/not-mounted-yet"));
        input.skip_path_check = true;
        Source::create(&conn, input.clone(), "UTC", NOW).unwrap();

        assert!(matches!(
            Source::create(&conn, input, "UTC", NOW),
            Err(IndexerError::SourceExists(id)) if id == "remote"
        ));
    }

    #[test]
    fn test_update_schedule_recomputes_next_scan() {
        let (dir, db) = setup();
        let conn = db.get_connection().unwrap();

        let mut input = new_source("docs", dir.path());
        input.schedule = Some("@daily".to_owned());
        Source::create(&conn, input, "UTC", NOW).unwrap();

        let update = SourceUpdate {
            schedule: Some(Some("@hourly".to_owned())),
            ..Default::default()
        };
        let updated = Source::update(&conn, "docs", update, NOW + 60).unwrap();
        assert_eq!(updated.next_scan_at, Some(NOW + 3600));

        let cleared = SourceUpdate {
            schedule: Some(None),
            ..Default::default()
        };
        let updated = Source::update(&conn, "docs", cleared, NOW + 120).unwrap();
        assert_eq!(updated.schedule, None);
        assert_eq!(updated.next_scan_at, None);
        assert_eq!(
            Source::get_by_id(&conn, "docs").unwrap().unwrap().updated_at,
            NOW + 120
        );

        assert!(matches!(
            Source::update(&conn, "ghost", SourceUpdate::default(), NOW),
            Err(IndexerError::SourceNotFound(_))
        ));
    }

    #[test]
    fn test_delete_purges_fingerprints() {
        let (dir, db) = setup();
        let conn = db.get_connection().unwrap();
        Source::create(&conn, new_source("docs", dir.path()), "UTC", NOW).unwrap();
        Fingerprint::new("docs", "/x/a.txt", 1, 1, Outcome::Success, None, NOW)
            .upsert(&conn)
            .unwrap();

        assert!(Source::delete(&conn, "docs").unwrap());
        assert!(!Source::delete(&conn, "docs").unwrap());
        assert!(Fingerprint::load_for_source(&conn, "docs")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_set_scan_times() {
        let (dir, db) = setup();
        let conn = db.get_connection().unwrap();
        Source::create(&conn, new_source("docs", dir.path()), "UTC", NOW).unwrap();

        Source::set_scan_times(&conn, "docs", NOW, Some(NOW + 10)).unwrap();
        let source = Source::require(&conn, "docs").unwrap();
        assert_eq!(source.last_scan_at, Some(NOW));
        assert_eq!(source.next_scan_at, Some(NOW + 10));

        Source::set_next_scan(&conn, "docs", None).unwrap();
        assert_eq!(Source::require(&conn, "docs").unwrap().next_scan_at, None);
    }
}
