use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{RunCoordinator, RunMode, RunStart};
use crate::database::Database;
use crate::error::IndexerError;
use crate::sources::Source;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
    next_fire: i64,
}

struct SchedulerInner {
    db: Database,
    coordinator: RunCoordinator,
    enabled: bool,
    timers: Mutex<HashMap<String, TimerEntry>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl SchedulerInner {
    fn is_current(&self, source_id: &str, generation: u64) -> bool {
        self.timers
            .lock()
            .unwrap()
            .get(source_id)
            .is_some_and(|entry| entry.generation == generation)
    }
}

/// One timer per scheduled source. Holds no persisted state of its own: the
/// timer set is rebuilt from the sources table and `next_scan_at` is kept in
/// step with each timer.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(db: Database, coordinator: RunCoordinator, enabled: bool) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                db,
                coordinator,
                enabled,
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Install a timer for every scheduled source and drop timers whose
    /// source no longer has a schedule. Returns the number of live timers.
    pub fn rebuild_from_store(&self) -> Result<usize, IndexerError> {
        let scheduled = {
            let conn = self.inner.db.get_connection()?;
            Source::list_scheduled(&conn)?
        };

        let wanted: HashSet<&str> = scheduled.iter().map(|s| s.source_id.as_str()).collect();
        {
            let mut timers = self.inner.timers.lock().unwrap();
            timers.retain(|source_id, entry| {
                let keep = wanted.contains(source_id.as_str());
                if !keep {
                    entry.handle.abort();
                }
                keep
            });
        }

        for source in &scheduled {
            if let Err(e) = self.on_source_changed(source) {
                error!(
                    "Cannot schedule source '{}' ({}): {}",
                    source.source_id,
                    source.schedule.as_deref().unwrap_or_default(),
                    e
                );
            }
        }

        let count = self.inner.timers.lock().unwrap().len();
        info!("Scheduler rebuilt: {} active timers", count);
        Ok(count)
    }

    /// Reconcile after a source was created or updated. The old timer is
    /// cancelled and its replacement installed under one lock. Returns the
    /// persisted `next_scan_at`.
    pub fn on_source_changed(&self, source: &Source) -> Result<Option<i64>, IndexerError> {
        let now = Utc::now().timestamp();
        let next = source.next_scan_after(now)?;

        if !self.inner.enabled {
            let conn = self.inner.db.get_connection()?;
            Source::set_next_scan(&conn, &source.source_id, next)?;
            return Ok(next);
        }

        let conn = self.inner.db.get_connection()?;
        let mut timers = self.inner.timers.lock().unwrap();
        if let Some(old) = timers.remove(&source.source_id) {
            old.handle.abort();
        }
        if let Some(fire_at) = next {
            let entry = self.spawn_timer(&source.source_id, fire_at);
            timers.insert(source.source_id.clone(), entry);
            debug!(
                "Timer for source '{}' set to fire at {}",
                source.source_id, fire_at
            );
        }

        Source::set_next_scan(&conn, &source.source_id, next)?;
        Ok(next)
    }

    pub fn on_source_deleted(&self, source_id: &str) {
        if let Some(old) = self.inner.timers.lock().unwrap().remove(source_id) {
            old.handle.abort();
            debug!("Timer for source '{}' cancelled", source_id);
        }
    }

    pub fn next_fire(&self, source_id: &str) -> Option<i64> {
        self.inner
            .timers
            .lock()
            .unwrap()
            .get(source_id)
            .map(|entry| entry.next_fire)
    }

    pub fn timer_count(&self) -> usize {
        self.inner.timers.lock().unwrap().len()
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut timers = self.inner.timers.lock().unwrap();
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
        info!("Scheduler stopped");
    }

    /// Replace the source's timer with one firing at `fire_at`
    pub(crate) fn install_timer(&self, source_id: &str, fire_at: i64) {
        let mut timers = self.inner.timers.lock().unwrap();
        if let Some(old) = timers.remove(source_id) {
            old.handle.abort();
        }
        let entry = self.spawn_timer(source_id, fire_at);
        timers.insert(source_id.to_owned(), entry);
    }

    fn spawn_timer(&self, source_id: &str, fire_at: i64) -> TimerEntry {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(Self::timer_loop(
            Arc::clone(&self.inner),
            source_id.to_owned(),
            generation,
            fire_at,
        ));
        TimerEntry {
            generation,
            handle,
            next_fire: fire_at,
        }
    }

    async fn timer_loop(
        inner: Arc<SchedulerInner>,
        source_id: String,
        generation: u64,
        mut fire_at: i64,
    ) {
        loop {
            let delay = (fire_at - Utc::now().timestamp()).max(0) as u64;
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
            }

            if !inner.is_current(&source_id, generation) {
                return;
            }

            match inner.coordinator.start_run(&source_id, RunMode::Incremental) {
                Ok(RunStart::Accepted(handle)) => {
                    info!("Scheduled run started for source '{}'", source_id);
                    if let Err(e) = handle.wait().await {
                        warn!("Scheduled run for source '{}' failed: {}", source_id, e);
                    }
                }
                Ok(RunStart::Conflict) => {
                    info!(
                        "Scheduled run for source '{}' dropped: a run is already active",
                        source_id
                    );
                }
                Err(IndexerError::SourceNotFound(_)) => {
                    debug!("Source '{}' is gone; timer exits", source_id);
                    return;
                }
                Err(e) => {
                    error!("Cannot start scheduled run for '{}': {}", source_id, e);
                }
            }

            match Self::advance(&inner, &source_id, generation) {
                Ok(Some(next)) => fire_at = next,
                Ok(None) => return,
                Err(e) => {
                    error!("Cannot reschedule source '{}': {}", source_id, e);
                    return;
                }
            }
        }
    }

    /// Compute and persist the next fire time after a fire. `None` when the
    /// timer has been superseded or the source lost its schedule.
    fn advance(
        inner: &SchedulerInner,
        source_id: &str,
        generation: u64,
    ) -> Result<Option<i64>, IndexerError> {
        let conn = inner.db.get_connection()?;
        let Some(source) = Source::get_by_id(&conn, source_id)? else {
            return Ok(None);
        };
        let next = source.next_scan_after(Utc::now().timestamp())?;

        let mut timers = inner.timers.lock().unwrap();
        match timers.get_mut(source_id) {
            Some(entry) if entry.generation == generation => {
                Source::set_next_scan(&conn, source_id, next)?;
                match next {
                    Some(next_fire) => {
                        entry.next_fire = next_fire;
                        Ok(Some(next_fire))
                    }
                    None => {
                        timers.remove(source_id);
                        Ok(None)
                    }
                }
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::coordinator::RunSettings;
    use crate::cron::next_run_timestamp;
    use crate::extract::Extractor;
    use crate::index::MemoryIndex;
    use crate::sources::{NewSource, SourceUpdate};
    use std::fs;
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
        db: Database,
        coordinator: RunCoordinator,
        scheduler: Scheduler,
    }

    fn fixture(enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("sched.db")).unwrap();
        let coordinator = RunCoordinator::new(
            db.clone(),
            Arc::new(MemoryIndex::new()),
            Extractor::new(ExtractionConfig::default()),
            RunSettings::default(),
        );
        let scheduler = Scheduler::new(db.clone(), coordinator.clone(), enabled);
        Fixture {
            dir,
            db,
            coordinator,
            scheduler,
        }
    }

    fn create(fx: &Fixture, id: &str, schedule: Option<&str>) -> Source {
        let root = fx.dir.path().join(id);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("note.txt"), "scheduled content").unwrap();
        let conn = fx.db.get_connection().unwrap();
        Source::create(
            &conn,
            NewSource {
                source_id: Some(id.to_owned()),
                name: id.to_owned(),
                root_path: root.to_string_lossy().into_owned(),
                schedule: schedule.map(str::to_owned),
                ..Default::default()
            },
            "UTC",
            Utc::now().timestamp(),
        )
        .unwrap()
    }

    fn stored_next_scan(fx: &Fixture, id: &str) -> Option<i64> {
        let conn = fx.db.get_connection().unwrap();
        Source::require(&conn, id).unwrap().next_scan_at
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_schedule_change_replaces_timer() {
        let fx = fixture(true);
        let source = create(&fx, "docs", Some("@daily"));
        let daily = fx.scheduler.on_source_changed(&source).unwrap().unwrap();
        assert_eq!(fx.scheduler.next_fire("docs"), Some(daily));

        let conn = fx.db.get_connection().unwrap();
        let now = Utc::now().timestamp();
        let updated = Source::update(
            &conn,
            "docs",
            SourceUpdate {
                schedule: Some(Some("@hourly".to_owned())),
                ..Default::default()
            },
            now,
        )
        .unwrap();
        let hourly = fx.scheduler.on_source_changed(&updated).unwrap().unwrap();

        assert_eq!(hourly, next_run_timestamp("@hourly", "UTC", now).unwrap());
        assert_eq!(fx.scheduler.next_fire("docs"), Some(hourly));
        assert_eq!(stored_next_scan(&fx, "docs"), Some(hourly));
        assert_eq!(fx.scheduler.timer_count(), 1);
    }

    #[tokio::test]
    async fn test_clearing_schedule_and_deleting_cancel_timers() {
        let fx = fixture(true);
        let a = create(&fx, "a", Some("@hourly"));
        let b = create(&fx, "b", Some("@weekly"));
        fx.scheduler.on_source_changed(&a).unwrap();
        fx.scheduler.on_source_changed(&b).unwrap();
        assert_eq!(fx.scheduler.timer_count(), 2);

        let conn = fx.db.get_connection().unwrap();
        let cleared = Source::update(
            &conn,
            "a",
            SourceUpdate {
                schedule: Some(None),
                ..Default::default()
            },
            Utc::now().timestamp(),
        )
        .unwrap();
        assert_eq!(fx.scheduler.on_source_changed(&cleared).unwrap(), None);
        assert_eq!(fx.scheduler.next_fire("a"), None);
        assert_eq!(stored_next_scan(&fx, "a"), None);

        fx.scheduler.on_source_deleted("b");
        assert_eq!(fx.scheduler.timer_count(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_from_store() {
        let fx = fixture(true);
        create(&fx, "hourly", Some("@hourly"));
        create(&fx, "weekly", Some("0 3 * * mon"));
        create(&fx, "manual", None);

        assert_eq!(fx.scheduler.rebuild_from_store().unwrap(), 2);
        assert!(fx.scheduler.next_fire("manual").is_none());

        let conn = fx.db.get_connection().unwrap();
        Source::update(
            &conn,
            "weekly",
            SourceUpdate {
                schedule: Some(None),
                ..Default::default()
            },
            Utc::now().timestamp(),
        )
        .unwrap();
        assert_eq!(fx.scheduler.rebuild_from_store().unwrap(), 1);

        fx.scheduler.shutdown();
        assert_eq!(fx.scheduler.timer_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_fires_incremental_run_and_reschedules() {
        let fx = fixture(true);
        create(&fx, "docs", Some("@hourly"));
        fx.scheduler.install_timer("docs", Utc::now().timestamp());

        let coordinator = fx.coordinator.clone();
        assert!(wait_for(|| coordinator.run_statistics("docs").last_run.is_some()).await);

        let stats = fx.coordinator.run_statistics("docs").last_run.unwrap();
        assert!(!stats.full);
        assert_eq!(stats.new, 1);

        let scheduler = fx.scheduler.clone();
        let now = Utc::now().timestamp();
        assert!(wait_for(|| scheduler.next_fire("docs").is_some_and(|t| t > now)).await);
        let next = fx.scheduler.next_fire("docs").unwrap();
        assert_eq!(next % 3600, 0);
        assert_eq!(stored_next_scan(&fx, "docs"), Some(next));
    }

    #[tokio::test]
    async fn test_conflicting_fire_is_dropped() {
        let fx = fixture(true);
        create(&fx, "docs", Some("@hourly"));
        let guard = fx.coordinator.try_acquire("docs").unwrap();

        let now = Utc::now().timestamp();
        fx.scheduler.install_timer("docs", now);

        let scheduler = fx.scheduler.clone();
        assert!(wait_for(|| scheduler.next_fire("docs").is_some_and(|t| t > now)).await);
        assert!(fx.coordinator.run_statistics("docs").last_run.is_none());
        drop(guard);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_only_updates_next_scan() {
        let fx = fixture(false);
        let source = create(&fx, "docs", Some("@hourly"));
        {
            let conn = fx.db.get_connection().unwrap();
            Source::set_next_scan(&conn, "docs", None).unwrap();
        }

        let next = fx.scheduler.on_source_changed(&source).unwrap();
        assert!(next.is_some());
        assert_eq!(stored_next_scan(&fx, "docs"), next);
        assert_eq!(fx.scheduler.timer_count(), 0);
        assert!(!fx.scheduler.is_enabled());
        assert!(Path::new(&source.root_path).is_dir());
    }
}
