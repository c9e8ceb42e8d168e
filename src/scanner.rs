use std::collections::{HashMap, HashSet};
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, error, trace, warn, Level};
use logging_timer::timer;

use crate::error::IndexerError;
use crate::fingerprints::Fingerprint;
use crate::patterns::PatternSet;

/// A regular file found by the walk that passed the pattern filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: String,
    pub rel_path: String,
    pub size: u64,
    pub modified_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ScanOutput {
    /// Matched files, sorted by absolute path
    pub files: Vec<ScannedFile>,
    /// Fingerprinted paths that the walk no longer produced
    pub missing: Vec<String>,
    pub dirs_scanned: u64,
    pub dirs_unreadable: u64,
    pub excluded: u64,
}

/// Modification time in whole seconds since the epoch
pub fn modified_secs(metadata: &Metadata) -> i64 {
    match metadata.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

struct ScanContext<'a> {
    patterns: &'a PatternSet,
    files: Vec<ScannedFile>,
    dirs_scanned: u64,
    dirs_unreadable: u64,
    excluded: u64,
}

impl<'a> ScanContext<'a> {
    fn new(patterns: &'a PatternSet) -> Self {
        Self {
            patterns,
            files: Vec::new(),
            dirs_scanned: 0,
            dirs_unreadable: 0,
            excluded: 0,
        }
    }
}

pub struct Scanner {}

impl Scanner {
    /// Walk `root`, keeping files accepted by `patterns`. Any path in `known`
    /// that the walk does not produce (gone, or now excluded) lands in `missing`.
    pub fn scan(
        root: &Path,
        patterns: &PatternSet,
        known: &HashMap<String, Fingerprint>,
    ) -> Result<ScanOutput, IndexerError> {
        let _tmr = timer!(Level::Trace; "Scanner::scan", "{}", root.display());

        match fs::metadata(root) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                error!("Root path is not a directory: '{}'", root.display());
                return Err(IndexerError::RootUnavailable(root.to_path_buf()));
            }
            Err(e) => {
                error!("Root path unavailable: '{}': {}", root.display(), e);
                return Err(IndexerError::RootUnavailable(root.to_path_buf()));
            }
        }

        let mut ctx = ScanContext::new(patterns);

        match Scanner::scan_directory_recursive(&mut ctx, root, "") {
            Ok(()) => {}
            Err(IndexerError::DirectoryUnreadable(p)) => {
                error!("Cannot read root directory '{}'", p.display());
                return Err(IndexerError::RootUnavailable(root.to_path_buf()));
            }
            Err(e) => return Err(e),
        }

        // A root that vanished mid-walk must not be mistaken for "every file deleted"
        if !root.is_dir() {
            error!("Root path disappeared during scan: '{}'", root.display());
            return Err(IndexerError::RootUnavailable(root.to_path_buf()));
        }

        let ScanContext {
            mut files,
            dirs_scanned,
            dirs_unreadable,
            excluded,
            ..
        } = ctx;

        files.sort_by(|a, b| a.path.cmp(&b.path));

        let present: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let mut missing: Vec<String> = known
            .keys()
            .filter(|path| !present.contains(path.as_str()))
            .cloned()
            .collect();
        missing.sort();

        debug!(
            "Scanned '{}': {} files, {} missing, {} dirs ({} unreadable), {} excluded",
            root.display(),
            files.len(),
            missing.len(),
            dirs_scanned,
            dirs_unreadable,
            excluded
        );

        Ok(ScanOutput {
            files,
            missing,
            dirs_scanned,
            dirs_unreadable,
            excluded,
        })
    }

    fn join_rel(rel_dir: &str, name: &str) -> String {
        if rel_dir.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", rel_dir, name)
        }
    }

    fn scan_directory_recursive(
        ctx: &mut ScanContext,
        path: &Path,
        rel_dir: &str,
    ) -> Result<(), IndexerError> {
        let _tmr = timer!(Level::Trace; "scan_directory_recursive", "{}", path.display());

        ctx.dirs_scanned += 1;

        let items = match fs::read_dir(path) {
            Ok(items) => items,
            Err(e) => match e.kind() {
                ErrorKind::PermissionDenied => {
                    return Err(IndexerError::DirectoryUnreadable(path.to_path_buf()));
                }
                ErrorKind::NotFound => {
                    trace!("Directory disappeared during scan: '{}'", path.display());
                    return Ok(());
                }
                _ => {
                    error!(
                        "Unexpected error reading directory '{}': {} (kind: {:?})",
                        path.display(),
                        e,
                        e.kind()
                    );
                    return Err(IndexerError::DirectoryUnreadable(path.to_path_buf()));
                }
            },
        };

        for item in items {
            let item = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "Error reading directory entry in '{}': {}",
                        path.display(),
                        e
                    );
                    continue;
                }
            };

            let item_path: PathBuf = item.path();
            let name = item.file_name().to_string_lossy().into_owned();
            let rel_path = Scanner::join_rel(rel_dir, &name);

            let metadata = match fs::symlink_metadata(&item_path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    match e.kind() {
                        ErrorKind::NotFound => {
                            trace!("File disappeared during scan: '{}'", item_path.display());
                        }
                        _ => {
                            warn!(
                                "Cannot access metadata for '{}': {}",
                                item_path.display(),
                                e
                            );
                        }
                    }
                    continue;
                }
            };

            if metadata.is_symlink() {
                trace!("Skipping symlink: '{}'", item_path.display());
                continue;
            }

            if metadata.is_dir() {
                if ctx.patterns.is_excluded_dir(&rel_path) {
                    trace!("Pruning excluded directory: '{}'", item_path.display());
                    ctx.excluded += 1;
                    continue;
                }

                match Scanner::scan_directory_recursive(ctx, &item_path, &rel_path) {
                    Ok(()) => {}
                    Err(IndexerError::DirectoryUnreadable(ref p)) => {
                        warn!("Cannot read directory contents for '{}'", p.display());
                        ctx.dirs_unreadable += 1;
                    }
                    Err(e) => return Err(e),
                }
            } else if metadata.is_file() {
                if !ctx.patterns.is_match(&rel_path) {
                    ctx.excluded += 1;
                    continue;
                }

                ctx.files.push(ScannedFile {
                    path: item_path.to_string_lossy().into_owned(),
                    rel_path,
                    size: metadata.len(),
                    modified_at: modified_secs(&metadata),
                });
            }
        }

        Ok(())
    }
}
