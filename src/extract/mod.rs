mod document;
mod extractor;
pub mod markdown;
pub mod office;
pub mod pdf;
pub mod spreadsheet;
pub mod text;

pub use document::{Document, Extracted};
pub use extractor::{ExtractOutcome, Extractor, FileType, Limits, Routine};
