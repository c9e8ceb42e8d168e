use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::changes::{self, ChangeSet};
use crate::database::Database;
use crate::error::IndexerError;
use crate::extract::{Document, ExtractOutcome, Extractor};
use crate::fingerprints::{FailedFile, Fingerprint, Outcome};
use crate::index::SearchIndex;
use crate::scanner::{ScanOutput, Scanner};
use crate::sources::Source;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Only new and modified files are extracted
    Incremental,
    /// Every matched file is extracted regardless of its fingerprint
    Full,
}

impl RunMode {
    pub fn is_full(self) -> bool {
        self == RunMode::Full
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Locked,
    Scanning,
    Extracting,
    Publishing,
    Updating,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunStatistics {
    pub total_scanned: u64,
    pub new: u64,
    pub modified: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Number of failures, including those beyond the reported list
    pub error_count: u64,
    pub failed_files: Vec<FailedFile>,
    pub full: bool,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

impl RunStatistics {
    fn record_failure(&mut self, path: &str, reason: &str, cap: usize) {
        self.failed += 1;
        self.error_count += 1;
        if self.failed_files.len() < cap {
            self.failed_files.push(FailedFile {
                path: path.to_owned(),
                error: reason.to_owned(),
            });
        }
    }
}

/// What the trigger layer sees for one source
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub source_id: String,
    pub phase: RunPhase,
    pub running: bool,
    /// Statistics of the run in progress, if any
    pub current: Option<RunStatistics>,
    /// Statistics of the last run that completed
    pub last_run: Option<RunStatistics>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

#[derive(Clone, Debug)]
struct SourceRunState {
    phase: RunPhase,
    current: Option<RunStatistics>,
    last_run: Option<RunStatistics>,
    last_error: Option<String>,
    last_error_at: Option<i64>,
}

impl Default for SourceRunState {
    fn default() -> Self {
        SourceRunState {
            phase: RunPhase::Idle,
            current: None,
            last_run: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunSettings {
    pub batch_size: usize,
    pub max_reported_failures: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            batch_size: 100,
            max_reported_failures: 100,
        }
    }
}

struct Inner {
    db: Database,
    index: Arc<dyn SearchIndex>,
    extractor: Extractor,
    settings: RunSettings,
    active: Mutex<HashSet<String>>,
    states: Mutex<HashMap<String, SourceRunState>>,
}

impl Inner {
    fn set_phase(&self, source_id: &str, phase: RunPhase, stats: Option<&RunStatistics>) {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(source_id.to_owned()).or_default();
        state.phase = phase;
        if let Some(stats) = stats {
            state.current = Some(stats.clone());
        }
    }
}

/// Holds the exclusive run slot for one source. Releasing happens on drop,
/// so a run that errors or panics still frees its source.
pub struct RunGuard {
    inner: Arc<Inner>,
    source_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Settle state before the slot can go to a new run
        {
            let mut states = self.inner.states.lock().unwrap();
            if let Some(state) = states.get_mut(&self.source_id) {
                state.current = None;
                if !matches!(state.phase, RunPhase::Idle | RunPhase::Failed) {
                    state.phase = RunPhase::Failed;
                }
            }
        }
        self.inner.active.lock().unwrap().remove(&self.source_id);
        debug!("Released run lock for source '{}'", self.source_id);
    }
}

pub struct RunHandle {
    source_id: String,
    handle: JoinHandle<Result<RunStatistics, IndexerError>>,
}

impl RunHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn wait(self) -> Result<RunStatistics, IndexerError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(IndexerError::Error(format!("Indexing run aborted: {}", e))),
        }
    }
}

pub enum RunStart {
    Accepted(RunHandle),
    Conflict,
}

/// Owns per-source mutual exclusion and drives the
/// scan → extract → publish → update pipeline for one source at a time.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<Inner>,
}

impl RunCoordinator {
    pub fn new(
        db: Database,
        index: Arc<dyn SearchIndex>,
        extractor: Extractor,
        settings: RunSettings,
    ) -> Self {
        let settings = RunSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        RunCoordinator {
            inner: Arc::new(Inner {
                db,
                index,
                extractor,
                settings,
                active: Mutex::new(HashSet::new()),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.inner.index
    }

    pub fn batch_size(&self) -> usize {
        self.inner.settings.batch_size
    }

    /// Non-blocking: `None` when the source already has an active run
    pub fn try_acquire(&self, source_id: &str) -> Option<RunGuard> {
        let mut active = self.inner.active.lock().unwrap();
        if !active.insert(source_id.to_owned()) {
            return None;
        }
        Some(RunGuard {
            inner: Arc::clone(&self.inner),
            source_id: source_id.to_owned(),
        })
    }

    pub fn is_running(&self, source_id: &str) -> bool {
        self.inner.active.lock().unwrap().contains(source_id)
    }

    /// Start a run on its own task. Rejects immediately with `Conflict` when
    /// the source is already being indexed.
    pub fn start_run(&self, source_id: &str, mode: RunMode) -> Result<RunStart, IndexerError> {
        let source = {
            let conn = self.inner.db.get_connection()?;
            Source::require(&conn, source_id)?
        };

        let Some(guard) = self.try_acquire(source_id) else {
            info!("Run for source '{}' rejected: already running", source_id);
            return Ok(RunStart::Conflict);
        };
        self.inner.set_phase(source_id, RunPhase::Locked, None);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let result = Self::execute(&inner, &source, mode).await;
            Self::finish(&inner, &source.source_id, &result);
            drop(guard);
            result
        });

        Ok(RunStart::Accepted(RunHandle {
            source_id: source_id.to_owned(),
            handle,
        }))
    }

    /// Start a run and wait for it. A conflict becomes `RunConflict`.
    pub async fn run_now(
        &self,
        source_id: &str,
        mode: RunMode,
    ) -> Result<RunStatistics, IndexerError> {
        match self.start_run(source_id, mode)? {
            RunStart::Accepted(handle) => handle.wait().await,
            RunStart::Conflict => Err(IndexerError::RunConflict(source_id.to_owned())),
        }
    }

    pub fn run_statistics(&self, source_id: &str) -> RunReport {
        let running = self.is_running(source_id);
        let states = self.inner.states.lock().unwrap();
        let state = states.get(source_id).cloned().unwrap_or_default();

        RunReport {
            source_id: source_id.to_owned(),
            phase: state.phase,
            running,
            current: state.current,
            last_run: state.last_run,
            last_error: state.last_error,
            last_error_at: state.last_error_at,
        }
    }

    /// Drop in-memory state for a removed source
    pub fn forget(&self, source_id: &str) {
        self.inner.states.lock().unwrap().remove(source_id);
    }

    fn finish(inner: &Inner, source_id: &str, result: &Result<RunStatistics, IndexerError>) {
        let mut states = inner.states.lock().unwrap();
        let state = states.entry(source_id.to_owned()).or_default();
        state.current = None;

        match result {
            Ok(stats) => {
                state.phase = RunPhase::Idle;
                state.last_run = Some(stats.clone());
                state.last_error = None;
                state.last_error_at = None;
            }
            Err(e) => {
                // Previous statistics stay visible
                state.phase = RunPhase::Failed;
                state.last_error = Some(Self::public_message(e).to_owned());
                state.last_error_at = Some(Utc::now().timestamp());
            }
        }
    }

    fn public_message(e: &IndexerError) -> &'static str {
        match e {
            IndexerError::RootUnavailable(_) => "Source root path is missing or unreadable",
            IndexerError::IndexUnavailable(_) => "Search index is unavailable",
            _ => "Indexing run failed",
        }
    }

    async fn execute(
        inner: &Arc<Inner>,
        source: &Source,
        mode: RunMode,
    ) -> Result<RunStatistics, IndexerError> {
        let source_id = source.source_id.as_str();
        let mut stats = RunStatistics {
            full: mode.is_full(),
            started_at: Utc::now().timestamp(),
            ..Default::default()
        };
        info!(
            "Starting {} run for source '{}' at '{}'",
            if mode.is_full() { "full" } else { "incremental" },
            source_id,
            source.root_path
        );

        match Self::run_pipeline(inner, source, mode, &mut stats).await {
            Ok(()) => {
                stats.finished_at = Some(Utc::now().timestamp());
                info!(
                    "Finished run for source '{}': {} scanned, {} new, {} modified, {} unchanged, {} deleted, {} ok, {} failed, {} skipped",
                    source_id,
                    stats.total_scanned,
                    stats.new,
                    stats.modified,
                    stats.unchanged,
                    stats.deleted,
                    stats.successful,
                    stats.failed,
                    stats.skipped
                );
                Ok(stats)
            }
            Err(e) => {
                error!("Run for source '{}' failed: {}", source_id, e);
                inner.set_phase(source_id, RunPhase::Failed, None);
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        inner: &Arc<Inner>,
        source: &Source,
        mode: RunMode,
        stats: &mut RunStatistics,
    ) -> Result<(), IndexerError> {
        let source_id = source.source_id.as_str();

        // Scanning
        inner.set_phase(source_id, RunPhase::Scanning, Some(stats));
        let (scan, known) = Self::scan_source(inner, source).await?;

        // Extracting
        let changes = changes::detect(&scan, &known, mode.is_full());
        stats.total_scanned = scan.files.len() as u64;
        stats.new = changes.new;
        stats.modified = changes.modified;
        stats.unchanged = changes.unchanged;
        inner.set_phase(source_id, RunPhase::Extracting, Some(stats));

        Self::apply_deletions(inner, source_id, &changes, stats).await?;
        Self::process_worklist(inner, source, changes, stats).await?;

        // Updating
        inner.set_phase(source_id, RunPhase::Updating, Some(stats));
        let now = Utc::now().timestamp();
        let conn = inner.db.get_connection()?;
        // Re-read so a schedule edited during the run is honoured
        let current = Source::get_by_id(&conn, source_id)?;
        let next_scan_at = match current.as_ref().map(|s| s.next_scan_after(now)) {
            Some(Ok(next)) => next,
            Some(Err(e)) => {
                warn!("Cannot compute next scan for '{}': {}", source_id, e);
                None
            }
            None => None,
        };
        Source::set_scan_times(&conn, source_id, now, next_scan_at)?;
        inner.set_phase(source_id, RunPhase::Idle, None);

        Ok(())
    }

    async fn scan_source(
        inner: &Arc<Inner>,
        source: &Source,
    ) -> Result<(ScanOutput, HashMap<String, Fingerprint>), IndexerError> {
        let known = {
            let conn = inner.db.get_connection()?;
            Fingerprint::load_for_source(&conn, &source.source_id)?
        };
        let patterns = source.patterns()?;
        let root = source.root().to_path_buf();

        let (scan, known) = tokio::task::spawn_blocking(move || {
            let scan = Scanner::scan(&root, &patterns, &known);
            (scan, known)
        })
        .await
        .map_err(|e| IndexerError::Error(format!("Scan task aborted: {}", e)))?;

        Ok((scan?, known))
    }

    /// Index removals first, then the matching fingerprint rows
    async fn apply_deletions(
        inner: &Arc<Inner>,
        source_id: &str,
        changes: &ChangeSet,
        stats: &mut RunStatistics,
    ) -> Result<(), IndexerError> {
        if changes.deleted.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = changes
            .deleted
            .iter()
            .map(|path| Fingerprint::document_id(source_id, path))
            .collect();
        for chunk in ids.chunks(inner.settings.batch_size) {
            inner.index.delete_documents(chunk).await?;
        }

        let conn = inner.db.get_connection()?;
        let removed = Database::immediate_transaction(&conn, |c| {
            Fingerprint::delete_paths(c, source_id, &changes.deleted)
        })?;

        stats.deleted = changes.deleted.len() as u64;
        debug!(
            "Removed {} deleted files from source '{}' ({} fingerprint rows)",
            stats.deleted, source_id, removed
        );
        Ok(())
    }

    async fn process_worklist(
        inner: &Arc<Inner>,
        source: &Source,
        changes: ChangeSet,
        stats: &mut RunStatistics,
    ) -> Result<(), IndexerError> {
        let source_id = source.source_id.as_str();
        let cap = inner.settings.max_reported_failures;
        let mut batch: Vec<Document> = Vec::with_capacity(inner.settings.batch_size);
        let mut pending: Vec<Fingerprint> = Vec::new();

        for item in changes.work {
            let file = item.file;
            let outcome = inner
                .extractor
                .extract(Path::new(&file.path), source_id, &source.name)
                .await;
            let now = Utc::now().timestamp();

            let (result, reason) = match outcome {
                ExtractOutcome::Extracted(document) => {
                    stats.successful += 1;
                    batch.push(*document);
                    (Outcome::Success, None)
                }
                ExtractOutcome::Failed(reason) => {
                    stats.record_failure(&file.path, &reason, cap);
                    (Outcome::Failed, Some(reason))
                }
                ExtractOutcome::Skipped(reason) => {
                    debug!("Skipped '{}': {}", file.path, reason);
                    stats.skipped += 1;
                    (Outcome::Skipped, Some(reason))
                }
            };
            pending.push(Fingerprint::new(
                source_id,
                &file.path,
                file.size,
                file.modified_at,
                result,
                reason,
                now,
            ));

            // Every file adds a fingerprint, so this also bounds the batch
            if pending.len() >= inner.settings.batch_size {
                Self::flush(inner, source_id, &mut batch, &mut pending, stats).await?;
            }
        }

        Self::flush(inner, source_id, &mut batch, &mut pending, stats).await
    }

    /// Publish the batch, then commit every fingerprint gathered since the
    /// previous flush. Nothing is written when the publish fails.
    async fn flush(
        inner: &Arc<Inner>,
        source_id: &str,
        batch: &mut Vec<Document>,
        pending: &mut Vec<Fingerprint>,
        stats: &RunStatistics,
    ) -> Result<(), IndexerError> {
        if batch.is_empty() && pending.is_empty() {
            return Ok(());
        }
        let _tmr = timer!(Level::Trace; "RunCoordinator::flush", "{} docs, {} fingerprints", batch.len(), pending.len());

        if !batch.is_empty() {
            inner.set_phase(source_id, RunPhase::Publishing, Some(stats));
            inner.index.add_documents(batch).await?;
        }

        let conn = inner.db.get_connection()?;
        Database::immediate_transaction(&conn, |c| {
            for fingerprint in pending.iter() {
                fingerprint.upsert(c)?;
            }
            Ok(())
        })?;

        batch.clear();
        pending.clear();
        inner.set_phase(source_id, RunPhase::Extracting, Some(stats));
        Ok(())
    }
}
