use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const MB: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub onesearch: String,
    pub lopdf: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const ONESEARCH_LEVEL: &str = "info";
    const LOPDF_LEVEL: &str = "error";

    /// Log specification string understood by flexi_logger
    pub fn log_spec(&self) -> String {
        format!("onesearch={},lopdf={}", self.onesearch, self.lopdf)
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level(&mut self.onesearch, "onesearch", Self::ONESEARCH_LEVEL);
        Self::ensure_level(&mut self.lopdf, "lopdf", Self::LOPDF_LEVEL);
    }

    fn ensure_level(level: &mut String, name: &str, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, original, default
            );
            *level = default.to_owned();
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            onesearch: Self::ONESEARCH_LEVEL.to_string(),
            lopdf: Self::LOPDF_LEVEL.to_string(),
        }
    }
}

/// Size ceilings and wall-clock budgets for the extractors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExtractionConfig {
    pub max_text_file_size_mb: u64,
    pub max_pdf_file_size_mb: u64,
    pub max_office_file_size_mb: u64,
    pub text_timeout_secs: u64,
    pub pdf_timeout_secs: u64,
    pub office_timeout_secs: u64,
    pub max_spreadsheet_rows: usize,
    pub max_spreadsheet_cols: usize,
}

impl ExtractionConfig {
    pub fn max_text_bytes(&self) -> u64 {
        self.max_text_file_size_mb * MB
    }

    pub fn max_pdf_bytes(&self) -> u64 {
        self.max_pdf_file_size_mb * MB
    }

    pub fn max_office_bytes(&self) -> u64 {
        self.max_office_file_size_mb * MB
    }

    pub fn text_timeout(&self) -> Duration {
        Duration::from_secs(self.text_timeout_secs)
    }

    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs)
    }

    pub fn office_timeout(&self) -> Duration {
        Duration::from_secs(self.office_timeout_secs)
    }

    fn ensure_valid(&mut self) {
        let defaults = Self::default();
        let checks: [(&str, &mut u64, u64); 6] = [
            ("max_text_file_size_mb", &mut self.max_text_file_size_mb, defaults.max_text_file_size_mb),
            ("max_pdf_file_size_mb", &mut self.max_pdf_file_size_mb, defaults.max_pdf_file_size_mb),
            ("max_office_file_size_mb", &mut self.max_office_file_size_mb, defaults.max_office_file_size_mb),
            ("text_timeout_secs", &mut self.text_timeout_secs, defaults.text_timeout_secs),
            ("pdf_timeout_secs", &mut self.pdf_timeout_secs, defaults.pdf_timeout_secs),
            ("office_timeout_secs", &mut self.office_timeout_secs, defaults.office_timeout_secs),
        ];
        for (name, value, default) in checks {
            if *value == 0 {
                eprintln!(
                    "Config error: extraction.{} must be positive - using default of {}",
                    name, default
                );
                *value = default;
            }
        }
        if self.max_spreadsheet_rows == 0 {
            self.max_spreadsheet_rows = defaults.max_spreadsheet_rows;
        }
        if self.max_spreadsheet_cols == 0 {
            self.max_spreadsheet_cols = defaults.max_spreadsheet_cols;
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            max_text_file_size_mb: 10,
            max_pdf_file_size_mb: 50,
            max_office_file_size_mb: 50,
            text_timeout_secs: 5,
            pdf_timeout_secs: 30,
            office_timeout_secs: 30,
            max_spreadsheet_rows: 10_000,
            max_spreadsheet_cols: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IndexConfig {
    pub url: String,
    pub api_key: String,
    pub index_name: String,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
}

impl IndexConfig {
    const BATCH_SIZE: usize = 100;

    fn ensure_valid(&mut self) {
        if self.batch_size == 0 {
            eprintln!(
                "Config error: index.batch_size must be positive - using default of {}",
                Self::BATCH_SIZE
            );
            self.batch_size = Self::BATCH_SIZE;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = 30;
        }
        self.url = self.url.trim_end_matches('/').to_owned();
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            url: "http://localhost:7700".to_owned(),
            api_key: String::new(),
            index_name: "documents".to_owned(),
            batch_size: Self::BATCH_SIZE,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub default_timezone: String,
}

impl SchedulerConfig {
    fn ensure_valid(&mut self) {
        if self.default_timezone.trim().parse::<chrono_tz::Tz>().is_err() {
            eprintln!(
                "Config error: scheduler timezone '{}' is invalid - using default of 'UTC'",
                self.default_timezone
            );
            self.default_timezone = "UTC".to_owned();
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enabled: true,
            default_timezone: "UTC".to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunsConfig {
    pub max_reported_failures: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        RunsConfig {
            max_reported_failures: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub extraction: ExtractionConfig,
    pub index: IndexConfig,
    pub scheduler: SchedulerConfig,
    pub runs: RunsConfig,
    pub database: DatabaseConfig,
}

impl Config {
    const ENV_PREFIX: &str = "ONESEARCH_";

    /// Loads the configuration from a TOML file located in the app's data directory,
    /// overlaid with `ONESEARCH_*` environment variables.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(_) => eprintln!("Failed to serialize default config."),
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// The globally installed configuration, or defaults when none was installed
    pub fn get() -> Config {
        CONFIG.get().cloned().unwrap_or_default()
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.extraction.ensure_valid();
        self.index.ensure_valid();
        self.scheduler.ensure_valid();
        if self.runs.max_reported_failures == 0 {
            self.runs.max_reported_failures = RunsConfig::default().max_reported_failures;
        }
    }
}
