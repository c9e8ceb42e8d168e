use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};

use crate::config::ExtractionConfig;
use crate::extract::document::{Document, Extracted};
use crate::extract::{markdown, office, pdf, spreadsheet, text};
use crate::fingerprints::Fingerprint;
use crate::scanner::modified_secs;

/// A format-specific extraction routine. `Err` carries the reason the file
/// could not be extracted.
pub type Routine = fn(&Path, &ExtractionConfig) -> Result<Extracted, String>;

#[macro_export]
macro_rules! try_failed {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return Err(e.to_string()),
        }
    };
    ($expr:expr, $context:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => return Err(format!("{}: {}", $context, e)),
        }
    };
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    PlainText,
    Markdown,
    Pdf,
    Word,
    Excel,
    PowerPoint,
    Unsupported,
}

/// The one place that maps extensions to formats. Adding a format means one
/// variant and its rows here.
const EXTENSION_TABLE: &[(&str, FileType)] = &[
    // Plain text, logs and config
    ("txt", FileType::PlainText),
    ("text", FileType::PlainText),
    ("log", FileType::PlainText),
    ("conf", FileType::PlainText),
    ("cfg", FileType::PlainText),
    ("config", FileType::PlainText),
    ("ini", FileType::PlainText),
    ("toml", FileType::PlainText),
    // Scripts and source code
    ("sh", FileType::PlainText),
    ("bash", FileType::PlainText),
    ("zsh", FileType::PlainText),
    ("py", FileType::PlainText),
    ("pyw", FileType::PlainText),
    ("js", FileType::PlainText),
    ("jsx", FileType::PlainText),
    ("ts", FileType::PlainText),
    ("tsx", FileType::PlainText),
    ("java", FileType::PlainText),
    ("c", FileType::PlainText),
    ("cpp", FileType::PlainText),
    ("cc", FileType::PlainText),
    ("h", FileType::PlainText),
    ("hpp", FileType::PlainText),
    ("go", FileType::PlainText),
    ("rs", FileType::PlainText),
    ("rb", FileType::PlainText),
    ("php", FileType::PlainText),
    ("sql", FileType::PlainText),
    ("r", FileType::PlainText),
    // Web and data
    ("css", FileType::PlainText),
    ("scss", FileType::PlainText),
    ("sass", FileType::PlainText),
    ("less", FileType::PlainText),
    ("html", FileType::PlainText),
    ("htm", FileType::PlainText),
    ("xml", FileType::PlainText),
    ("json", FileType::PlainText),
    ("yaml", FileType::PlainText),
    ("yml", FileType::PlainText),
    // Markdown
    ("md", FileType::Markdown),
    ("markdown", FileType::Markdown),
    ("mdown", FileType::Markdown),
    ("mkd", FileType::Markdown),
    // Documents
    ("pdf", FileType::Pdf),
    ("docx", FileType::Word),
    ("xlsx", FileType::Excel),
    ("xlsm", FileType::Excel),
    ("xls", FileType::Excel),
    ("ods", FileType::Excel),
    ("pptx", FileType::PowerPoint),
];

impl FileType {
    pub fn from_extension<S>(ext: S) -> FileType
    where
        S: AsRef<OsStr>,
    {
        let Some(ext) = ext.as_ref().to_str() else {
            return FileType::Unsupported;
        };
        let ext = ext.to_ascii_lowercase();

        EXTENSION_TABLE
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, file_type)| *file_type)
            .unwrap_or(FileType::Unsupported)
    }

    pub fn from_path<P>(path: P) -> FileType
    where
        P: AsRef<Path>,
    {
        path.as_ref()
            .extension()
            .map(FileType::from_extension)
            .unwrap_or(FileType::Unsupported)
    }

    /// Value of the document's `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::PlainText => "text",
            FileType::Markdown => "markdown",
            FileType::Pdf => "pdf",
            FileType::Word => "docx",
            FileType::Excel => "xlsx",
            FileType::PowerPoint => "pptx",
            FileType::Unsupported => "unsupported",
        }
    }

    fn routine(&self) -> Option<Routine> {
        match self {
            FileType::PlainText => Some(text::extract),
            FileType::Markdown => Some(markdown::extract),
            FileType::Pdf => Some(pdf::extract),
            FileType::Word => Some(office::extract_docx),
            FileType::Excel => Some(spreadsheet::extract),
            FileType::PowerPoint => Some(office::extract_pptx),
            FileType::Unsupported => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExtractOutcome {
    Extracted(Box<Document>),
    Failed(String),
    Skipped(String),
}

/// Routes files to their extraction routine and enforces the size ceiling
/// and per-file deadline for each format.
#[derive(Clone)]
pub struct Extractor {
    config: Arc<ExtractionConfig>,
    routines: HashMap<FileType, Routine>,
}

impl Extractor {
    pub fn new(config: ExtractionConfig) -> Self {
        let routines = EXTENSION_TABLE
            .iter()
            .filter_map(|(_, file_type)| file_type.routine().map(|r| (*file_type, r)))
            .collect();

        Extractor {
            config: Arc::new(config),
            routines,
        }
    }

    /// Replace the routine used for `file_type`. Size and deadline limits
    /// still apply to the replacement.
    pub fn with_routine(mut self, file_type: FileType, routine: Routine) -> Self {
        if file_type != FileType::Unsupported {
            self.routines.insert(file_type, routine);
        }
        self
    }

    pub fn classify(path: &Path) -> FileType {
        FileType::from_path(path)
    }

    pub fn limits(&self, file_type: FileType) -> Limits {
        let c = &self.config;
        match file_type {
            FileType::PlainText | FileType::Markdown | FileType::Unsupported => Limits {
                max_bytes: c.max_text_bytes(),
                timeout: c.text_timeout(),
            },
            FileType::Pdf => Limits {
                max_bytes: c.max_pdf_bytes(),
                timeout: c.pdf_timeout(),
            },
            FileType::Word | FileType::Excel | FileType::PowerPoint => Limits {
                max_bytes: c.max_office_bytes(),
                timeout: c.office_timeout(),
            },
        }
    }

    /// Extract one file. Never returns an error: every problem with the file
    /// itself becomes `Failed` or `Skipped` with a readable reason.
    pub async fn extract(&self, path: &Path, source_id: &str, source_name: &str) -> ExtractOutcome {
        let file_type = Self::classify(path);
        let Some(routine) = self.routines.get(&file_type).copied() else {
            debug!("No extractor for file: '{}'", path.display());
            return ExtractOutcome::Skipped("Unsupported file type".to_owned());
        };

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::NotFound => ExtractOutcome::Failed("File not found".to_owned()),
                    ErrorKind::PermissionDenied => {
                        ExtractOutcome::Skipped("File is unreadable: permission denied".to_owned())
                    }
                    _ => ExtractOutcome::Failed(format!("Cannot access file: {}", e)),
                };
            }
        };

        if !metadata.is_file() {
            return ExtractOutcome::Skipped("Not a regular file".to_owned());
        }
        if metadata.len() == 0 {
            return ExtractOutcome::Skipped("Empty file".to_owned());
        }

        let limits = self.limits(file_type);
        if metadata.len() > limits.max_bytes {
            let mb = 1024.0 * 1024.0;
            return ExtractOutcome::Failed(format!(
                "File too large: {:.2}MB (max: {:.2}MB)",
                metadata.len() as f64 / mb,
                limits.max_bytes as f64 / mb
            ));
        }

        if let Err(e) = File::open(path) {
            if e.kind() == ErrorKind::PermissionDenied {
                return ExtractOutcome::Skipped("File is unreadable: permission denied".to_owned());
            }
        }

        let extracted = match run_bounded(
            routine,
            path.to_path_buf(),
            Arc::clone(&self.config),
            limits.timeout,
        )
        .await
        {
            Ok(extracted) => extracted,
            Err(reason) => {
                warn!("Extraction failed for '{}': {}", path.display(), reason);
                return ExtractOutcome::Failed(reason);
            }
        };

        let path_str = path.to_string_lossy().into_owned();
        let title = extracted.title.or_else(|| file_stem(path));

        ExtractOutcome::Extracted(Box::new(Document {
            id: Fingerprint::document_id(source_id, &path_str),
            source_id: source_id.to_owned(),
            source_name: source_name.to_owned(),
            basename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default(),
            doc_type: file_type.as_str().to_owned(),
            size_bytes: metadata.len(),
            modified_at: modified_secs(&metadata),
            indexed_at: Utc::now().timestamp(),
            content: extracted.content,
            title,
            metadata: extracted.metadata,
            path: path_str,
        }))
    }
}

pub(crate) fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Run `routine` on a blocking thread under its own deadline. The deadline
/// belongs to this file alone.
pub(crate) async fn run_bounded(
    routine: Routine,
    path: PathBuf,
    config: Arc<ExtractionConfig>,
    timeout: Duration,
) -> Result<Extracted, String> {
    let task = tokio::task::spawn_blocking(move || routine(&path, &config));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(format!("Extraction aborted: {}", join_err)),
        Err(_) => Err(format!(
            "Extraction timed out after {}s",
            timeout.as_secs_f32()
        )),
    }
}
