use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use log::warn;

use crate::error::IndexerError;

/// Directories and files nobody wants in a search index. Applied to a source
/// that is created without an explicit exclude list.
const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    "**/.git/**",
    "**/.svn/**",
    "**/.hg/**",
    // Dependencies
    "**/node_modules/**",
    "**/venv/**",
    "**/.venv/**",
    "**/env/**",
    "**/virtualenv/**",
    "**/__pycache__/**",
    "**/vendor/**",
    // Build outputs
    "**/dist/**",
    "**/build/**",
    "**/target/**",
    "**/.next/**",
    "**/.nuxt/**",
    // IDE
    "**/.vscode/**",
    "**/.idea/**",
    "**/.vs/**",
    // OS
    "**/.DS_Store",
    "**/Thumbs.db",
    "**/desktop.ini",
    // Temporary files
    "**/*.tmp",
    "**/*.temp",
    "**/.cache/**",
];

pub fn default_exclude_patterns() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|p| p.to_string()).collect()
}

/// Split a comma-separated pattern list. Commas inside `{...}` belong to the
/// alternation and do not split.
pub fn split_pattern_list(list: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in list.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                patterns.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    patterns.push(current);

    patterns
        .into_iter()
        .map(|p| p.trim().to_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

fn invalid(pattern: &str, reason: impl Into<String>) -> IndexerError {
    IndexerError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason: reason.into(),
    }
}

fn is_absolute_pattern(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    pattern.starts_with('/')
        || pattern.starts_with('\\')
        || (bytes.len() > 1 && bytes[1] == b':')
}

fn build_glob(pattern: &str) -> Result<Glob, IndexerError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| invalid(pattern, e.kind().to_string()))
}

/// Exclude patterns without a `/` match a file name at any depth, so `*.log`
/// also excludes `logs/app.log`.
fn exclude_glob(pattern: &str) -> Result<Glob, IndexerError> {
    if pattern.contains('/') {
        build_glob(pattern)
    } else {
        build_glob(&format!("**/{}", pattern))
    }
}

/// Check a single pattern the way a source is validated: it must be
/// non-empty, relative and parse as a glob.
pub fn validate_pattern(pattern: &str) -> Result<(), IndexerError> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(invalid(pattern, "empty pattern"));
    }
    if is_absolute_pattern(trimmed) {
        return Err(invalid(pattern, "pattern must be relative, not an absolute path"));
    }
    if !trimmed.contains(['*', '?', '[', '{']) {
        warn!("Pattern '{}' has no wildcards and matches a single path", trimmed);
    }
    build_glob(trimmed).map(|_| ())
}

/// A compiled include/exclude filter over `/`-separated paths relative to a
/// source root.
#[derive(Debug, Clone)]
pub struct PatternSet {
    include: Vec<String>,
    exclude: Vec<String>,
    // None when the include list is empty: everything not excluded matches
    include_set: Option<GlobSet>,
    exclude_set: GlobSet,
    dir_exclude_set: GlobSet,
}

impl PatternSet {
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self, IndexerError> {
        let include: Vec<String> = include.iter().map(|p| p.trim().to_owned()).collect();
        let exclude: Vec<String> = exclude.iter().map(|p| p.trim().to_owned()).collect();

        let include_set = if include.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &include {
                validate_pattern(pattern)?;
                builder.add(build_glob(pattern)?);
            }
            Some(builder.build().map_err(|e| invalid(&include.join(","), e.to_string()))?)
        };

        let mut exclude_builder = GlobSetBuilder::new();
        let mut dir_builder = GlobSetBuilder::new();
        for pattern in &exclude {
            validate_pattern(pattern)?;
            exclude_builder.add(exclude_glob(pattern)?);

            // "x/**" excludes the whole directory "x", so the walk can skip it
            if let Some(dir_pattern) = pattern.strip_suffix("/**") {
                if !dir_pattern.is_empty() {
                    dir_builder.add(build_glob(dir_pattern)?);
                }
            }
        }

        Ok(PatternSet {
            include,
            exclude: exclude.clone(),
            include_set,
            exclude_set: exclude_builder
                .build()
                .map_err(|e| invalid(&exclude.join(","), e.to_string()))?,
            dir_exclude_set: dir_builder
                .build()
                .map_err(|e| invalid(&exclude.join(","), e.to_string()))?,
        })
    }

    /// Compile from the comma-separated form used at the trigger boundary
    pub fn from_lists(include: &str, exclude: &str) -> Result<Self, IndexerError> {
        Self::compile(&split_pattern_list(include), &split_pattern_list(exclude))
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude
    }

    pub fn is_excluded(&self, rel_path: &str) -> bool {
        self.exclude_set.is_match(rel_path)
    }

    /// True when an entire directory can be pruned from the walk
    pub fn is_excluded_dir(&self, rel_dir: &str) -> bool {
        self.dir_exclude_set.is_match(rel_dir)
    }

    /// Exclude wins over include; an empty include list admits everything.
    pub fn is_match(&self, rel_path: &str) -> bool {
        if self.is_excluded(rel_path) {
            return false;
        }
        match &self.include_set {
            Some(set) => set.is_match(rel_path),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(include: &str, exclude: &str) -> PatternSet {
        PatternSet::from_lists(include, exclude).unwrap()
    }

    #[test]
    fn test_split_respects_braces() {
        assert_eq!(
            split_pattern_list(" **/*.{md,txt} , docs/**,, *.pdf "),
            vec!["**/*.{md,txt}", "docs/**", "*.pdf"]
        );
        assert!(split_pattern_list("  ").is_empty());
    }

    #[test]
    fn test_empty_include_matches_everything_not_excluded() {
        let patterns = set("", "**/node_modules/**");
        assert!(patterns.is_match("README.md"));
        assert!(patterns.is_match("deep/nested/file.rs"));
        assert!(!patterns.is_match("web/node_modules/pkg/index.js"));
    }

    #[test]
    fn test_exclude_takes_precedence() {
        let patterns = set("**/*.md", "drafts/**");
        assert!(patterns.is_match("README.md"));
        assert!(patterns.is_match("docs/guide.md"));
        assert!(!patterns.is_match("drafts/idea.md"));
        assert!(!patterns.is_match("code/main.py"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let patterns = set("docs/*.md", "");
        assert!(patterns.is_match("docs/a.md"));
        assert!(!patterns.is_match("docs/sub/a.md"));
    }

    #[test]
    fn test_bare_exclude_matches_at_any_depth() {
        let patterns = set("", "*.log,Thumbs.db");
        assert!(!patterns.is_match("app.log"));
        assert!(!patterns.is_match("logs/app.log"));
        assert!(!patterns.is_match("a/b/c/debug.log"));
        assert!(!patterns.is_match("photos/Thumbs.db"));
        assert!(patterns.is_match("logs/app.txt"));
        assert_eq!(patterns.exclude_patterns(), ["*.log", "Thumbs.db"]);

        // A pattern with a directory part stays anchored at the root
        let anchored = set("", "logs/*.log");
        assert!(!anchored.is_match("logs/app.log"));
        assert!(anchored.is_match("old/logs/app.log"));
        assert!(anchored.is_match("app.log"));
    }

    #[test]
    fn test_brace_alternation() {
        let patterns = set("**/*.{md,txt}", "");
        assert!(patterns.is_match("a/b.txt"));
        assert!(patterns.is_match("c.md"));
        assert!(!patterns.is_match("c.pdf"));
    }

    #[test]
    fn test_directory_pruning_rules() {
        let patterns = PatternSet::compile(&[], &default_exclude_patterns()).unwrap();
        assert!(patterns.is_excluded_dir(".git"));
        assert!(patterns.is_excluded_dir("project/node_modules"));
        assert!(!patterns.is_excluded_dir("docs"));
        assert!(!patterns.is_match("tmp/scratch.tmp"));
        assert!(!patterns.is_match("photos/Thumbs.db"));
        assert!(patterns.is_match("notes/todo.txt"));
    }

    #[test]
    fn test_rejects_malformed_patterns() {
        assert!(matches!(
            validate_pattern(""),
            Err(IndexerError::InvalidPattern { .. })
        ));
        assert!(matches!(
            validate_pattern("/absolute/path/**"),
            Err(IndexerError::InvalidPattern { .. })
        ));
        assert!(matches!(
            validate_pattern("C:\\docs\\*"),
            Err(IndexerError::InvalidPattern { .. })
        ));
        assert!(matches!(
            validate_pattern("**/*.{md,txt"),
            Err(IndexerError::InvalidPattern { .. })
        ));
        assert!(PatternSet::from_lists("**/*.md,[z-a]", "").is_err());
        assert!(validate_pattern("README.md").is_ok());
    }
}
