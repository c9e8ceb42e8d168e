use std::collections::HashMap;

use log::trace;

use crate::fingerprints::Fingerprint;
use crate::scanner::{ScanOutput, ScannedFile};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Modified,
    Unchanged,
    Deleted,
}

impl ChangeKind {
    /// Compare what the walk found at a path with its stored fingerprint.
    /// Size and whole-second mtime are the only change signal. No content
    /// hash. `None` when the path is neither on disk nor known.
    pub fn classify(file: Option<&ScannedFile>, known: Option<&Fingerprint>) -> Option<ChangeKind> {
        match (file, known) {
            (Some(_), None) => Some(ChangeKind::New),
            (Some(file), Some(fp))
                if fp.size_bytes != file.size || fp.modified_at != file.modified_at =>
            {
                Some(ChangeKind::Modified)
            }
            (Some(_), Some(_)) => Some(ChangeKind::Unchanged),
            (None, Some(_)) => Some(ChangeKind::Deleted),
            (None, None) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub file: ScannedFile,
    pub kind: ChangeKind,
}

#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    /// Files that need extraction, in scan order
    pub work: Vec<WorkItem>,
    /// Paths to drop from the index and the fingerprint store
    pub deleted: Vec<String>,
    pub new: u64,
    pub modified: u64,
    pub unchanged: u64,
}

/// Classify every scanned file against its fingerprint. In full mode every
/// matched file is queued; unchanged files are still counted as unchanged.
pub fn detect(scan: &ScanOutput, known: &HashMap<String, Fingerprint>, full: bool) -> ChangeSet {
    let mut changes = ChangeSet::default();

    let scanned = scan.files.iter().map(|file| (file.path.as_str(), Some(file)));
    let missing = scan.missing.iter().map(|path| (path.as_str(), None));

    for (path, file) in scanned.chain(missing) {
        let Some(kind) = ChangeKind::classify(file, known.get(path)) else {
            continue;
        };
        trace!("{:?}: '{}'", kind, path);

        match kind {
            ChangeKind::New => changes.new += 1,
            ChangeKind::Modified => changes.modified += 1,
            ChangeKind::Unchanged => changes.unchanged += 1,
            ChangeKind::Deleted => {
                changes.deleted.push(path.to_owned());
                continue;
            }
        }

        if let Some(file) = file {
            if kind != ChangeKind::Unchanged || full {
                changes.work.push(WorkItem {
                    file: file.clone(),
                    kind,
                });
            }
        }
    }

    changes
}
