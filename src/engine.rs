use std::sync::Arc;

use chrono::Utc;
use directories::ProjectDirs;
use log::{info, warn};
use serde::Serialize;

use crate::config::Config;
use crate::coordinator::{RunCoordinator, RunMode, RunReport, RunSettings, RunStart, RunStatistics};
use crate::database::Database;
use crate::error::IndexerError;
use crate::extract::Extractor;
use crate::fingerprints::{Fingerprint, FingerprintSummary};
use crate::index::{MeiliIndex, SearchIndex};
use crate::scheduler::Scheduler;
use crate::sources::{NewSource, Source, SourceUpdate};

/// Stored state of one source, its file outcomes and its run state
#[derive(Clone, Debug, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub files: FingerprintSummary,
    pub run: RunReport,
}

/// Entry point for the trigger layer. Source mutations go through here so the
/// scheduler is always reconciled with the stored configuration.
pub struct Engine {
    db: Database,
    coordinator: RunCoordinator,
    scheduler: Scheduler,
    default_timezone: String,
}

impl Engine {
    pub fn new(db: Database, index: Arc<dyn SearchIndex>, config: &Config) -> Self {
        let coordinator = RunCoordinator::new(
            db.clone(),
            index,
            Extractor::new(config.extraction.clone()),
            RunSettings {
                batch_size: config.index.batch_size,
                max_reported_failures: config.runs.max_reported_failures,
            },
        );
        let scheduler = Scheduler::new(db.clone(), coordinator.clone(), config.scheduler.enabled);

        Engine {
            db,
            coordinator,
            scheduler,
            default_timezone: config.scheduler.default_timezone.clone(),
        }
    }

    /// Open the engine and rebuild the scheduler's timers from the store
    pub async fn start(config: &Config, project_dirs: &ProjectDirs) -> Result<Engine, IndexerError> {
        let engine = Self::open(config, project_dirs).await?;
        engine.scheduler.rebuild_from_store()?;
        Ok(engine)
    }

    /// Open the database and the search index named by `config`. No timers
    /// are installed.
    pub async fn open(config: &Config, project_dirs: &ProjectDirs) -> Result<Engine, IndexerError> {
        let db = match &config.database.path {
            Some(path) => Database::open(path)?,
            None => Database::open_default(project_dirs)?,
        };
        info!("Using database at '{}'", db.path().display());

        let index = MeiliIndex::new(&config.index)?;
        if let Err(e) = index.health().await {
            warn!(
                "Search index at '{}' is not reachable yet: {}",
                config.index.url, e
            );
        }

        Ok(Engine::new(db, Arc::new(index), config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn add_source(&self, new_source: NewSource) -> Result<Source, IndexerError> {
        let mut source = {
            let conn = self.db.get_connection()?;
            Source::create(
                &conn,
                new_source,
                &self.default_timezone,
                Utc::now().timestamp(),
            )?
        };
        source.next_scan_at = self.scheduler.on_source_changed(&source)?;
        Ok(source)
    }

    pub fn update_source(
        &self,
        source_id: &str,
        update: SourceUpdate,
    ) -> Result<Source, IndexerError> {
        let mut source = {
            let conn = self.db.get_connection()?;
            Source::update(&conn, source_id, update, Utc::now().timestamp())?
        };
        source.next_scan_at = self.scheduler.on_source_changed(&source)?;
        Ok(source)
    }

    /// Remove a source, its documents, its fingerprints and its timer. A
    /// source that is being indexed cannot be removed.
    pub async fn remove_source(&self, source_id: &str) -> Result<(), IndexerError> {
        let Some(_guard) = self.coordinator.try_acquire(source_id) else {
            return Err(IndexerError::RunConflict(source_id.to_owned()));
        };

        let ids: Vec<String> = {
            let conn = self.db.get_connection()?;
            Source::require(&conn, source_id)?;
            Fingerprint::load_for_source(&conn, source_id)?
                .into_keys()
                .map(|path| Fingerprint::document_id(source_id, &path))
                .collect()
        };

        let index = self.coordinator.index();
        for chunk in ids.chunks(self.coordinator.batch_size()) {
            index.delete_documents(chunk).await?;
        }

        {
            let conn = self.db.get_connection()?;
            Source::delete(&conn, source_id)?;
        }
        self.scheduler.on_source_deleted(source_id);
        self.coordinator.forget(source_id);

        info!(
            "Removed source '{}' and {} indexed documents",
            source_id,
            ids.len()
        );
        Ok(())
    }

    pub fn list_sources(&self) -> Result<Vec<Source>, IndexerError> {
        let conn = self.db.get_connection()?;
        Source::list(&conn)
    }

    pub fn get_source(&self, source_id: &str) -> Result<Source, IndexerError> {
        let conn = self.db.get_connection()?;
        Source::require(&conn, source_id)
    }

    pub fn start_run(&self, source_id: &str, mode: RunMode) -> Result<RunStart, IndexerError> {
        self.coordinator.start_run(source_id, mode)
    }

    pub async fn run_now(
        &self,
        source_id: &str,
        mode: RunMode,
    ) -> Result<RunStatistics, IndexerError> {
        self.coordinator.run_now(source_id, mode).await
    }

    pub fn run_statistics(&self, source_id: &str) -> Result<RunReport, IndexerError> {
        self.get_source(source_id)?;
        Ok(self.coordinator.run_statistics(source_id))
    }

    pub fn source_status(&self, source_id: &str) -> Result<SourceStatus, IndexerError> {
        let conn = self.db.get_connection()?;
        let source = Source::require(&conn, source_id)?;
        let files = Fingerprint::summary(&conn, source_id)?;

        Ok(SourceStatus {
            source,
            files,
            run: self.coordinator.run_statistics(source_id),
        })
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use pretty_assertions::assert_eq;
    use std::fs;

    struct Fixture {
        dir: tempfile::TempDir,
        index: Arc<MemoryIndex>,
        engine: Engine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("engine.db")).unwrap();
        let index = Arc::new(MemoryIndex::new());
        let engine = Engine::new(db, index.clone(), &Config::default());
        Fixture { dir, index, engine }
    }

    fn docs_source(fx: &Fixture, schedule: Option<&str>) -> NewSource {
        let root = fx.dir.path().join("docs");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("readme.md"), "# Read me\n\nHello").unwrap();
        fs::write(root.join("notes.txt"), "first line\nsecond").unwrap();
        NewSource {
            name: "Docs".to_owned(),
            root_path: root.to_string_lossy().into_owned(),
            schedule: schedule.map(str::to_owned),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_update_and_status() {
        let fx = fixture();
        let source = fx.engine.add_source(docs_source(&fx, Some("@daily"))).unwrap();
        assert_eq!(source.source_id, "docs");
        assert_eq!(fx.engine.scheduler().next_fire("docs"), source.next_scan_at);

        let updated = fx
            .engine
            .update_source(
                "docs",
                SourceUpdate {
                    schedule: Some(Some("@hourly".to_owned())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(fx.engine.scheduler().next_fire("docs"), updated.next_scan_at);
        assert_eq!(fx.engine.scheduler().timer_count(), 1);

        let stats = fx.engine.run_now("docs", RunMode::Incremental).await.unwrap();
        assert_eq!(stats.new, 2);

        let status = fx.engine.source_status("docs").unwrap();
        assert_eq!(status.files.total_files, 2);
        assert_eq!(status.files.successful, 2);
        assert_eq!(status.run.last_run, Some(stats));
        assert!(status.source.last_scan_at.is_some());
        assert_eq!(fx.engine.list_sources().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_source_purges_everything() {
        let fx = fixture();
        fx.engine.add_source(docs_source(&fx, Some("@weekly"))).unwrap();
        fx.engine.run_now("docs", RunMode::Incremental).await.unwrap();
        assert_eq!(fx.index.len(), 2);

        let guard = fx.engine.coordinator().try_acquire("docs").unwrap();
        assert!(matches!(
            fx.engine.remove_source("docs").await,
            Err(IndexerError::RunConflict(_))
        ));
        drop(guard);

        fx.engine.remove_source("docs").await.unwrap();
        assert!(fx.index.is_empty());
        assert_eq!(fx.engine.scheduler().timer_count(), 0);
        assert!(matches!(
            fx.engine.get_source("docs"),
            Err(IndexerError::SourceNotFound(_))
        ));
        assert!(matches!(
            fx.engine.remove_source("docs").await,
            Err(IndexerError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_source_needs_the_index() {
        let fx = fixture();
        fx.engine.add_source(docs_source(&fx, None)).unwrap();
        fx.engine.run_now("docs", RunMode::Incremental).await.unwrap();

        fx.index.set_available(false);
        assert!(matches!(
            fx.engine.remove_source("docs").await,
            Err(IndexerError::IndexUnavailable(_))
        ));
        assert!(fx.engine.get_source("docs").is_ok());
    }

    #[tokio::test]
    async fn test_statistics_for_unknown_source() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.run_statistics("ghost"),
            Err(IndexerError::SourceNotFound(_))
        ));
        assert!(matches!(
            fx.engine.start_run("ghost", RunMode::Full),
            Err(IndexerError::SourceNotFound(_))
        ));
    }
}
