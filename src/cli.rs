use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use flexi_logger::{
    detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::info;
use serde::Serialize;

use onesearch::config::{Config, CONFIG};
use onesearch::coordinator::RunMode;
use onesearch::engine::Engine;
use onesearch::error::IndexerError;
use onesearch::patterns::split_pattern_list;
use onesearch::sources::NewSource;

#[derive(Parser)]
#[command(
    name = "onesearch",
    version,
    about = "OneSearch: incremental indexing and scheduling engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler until interrupted (default if no command specified)
    Serve,

    /// Index one source now and print the run statistics
    Index {
        /// Source id
        source: String,

        /// Re-extract every matched file, not only new and modified ones
        #[arg(long, default_value_t = false)]
        full: bool,
    },

    /// Show stored status for a source
    Status {
        /// Source id
        source: String,
    },

    /// Add a source
    Add {
        /// Display name (the id is derived from it unless --id is given)
        name: String,

        /// Root directory to index
        path: String,

        #[arg(long)]
        id: Option<String>,

        /// Comma-separated include globs (default: everything)
        #[arg(long)]
        include: Option<String>,

        /// Comma-separated exclude globs (default: common junk directories)
        #[arg(long)]
        exclude: Option<String>,

        /// Cron expression or @hourly, @daily, @weekly
        #[arg(long)]
        schedule: Option<String>,

        /// IANA timezone used to evaluate the schedule
        #[arg(long)]
        timezone: Option<String>,
    },

    /// List configured sources
    List,

    /// Remove a source and its indexed documents
    Remove {
        /// Source id
        source: String,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), IndexerError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "onesearch").ok_or_else(|| {
            IndexerError::Error("Could not determine the application data directory".into())
        })?;

        let config = Config::load_config(&project_dirs);
        let _logger = Self::setup_logging(&config, &project_dirs)?;
        let config = CONFIG.get_or_init(|| config);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| IndexerError::Error(format!("Failed to create runtime: {}", e)))?;

        // Default to Serve if no command specified
        let command = args.command.unwrap_or(Command::Serve);
        rt.block_on(Self::dispatch(command, config, &project_dirs))
    }

    async fn dispatch(
        command: Command,
        config: &Config,
        project_dirs: &ProjectDirs,
    ) -> Result<(), IndexerError> {
        match command {
            Command::Serve => Self::serve(config, project_dirs).await,
            Command::Index { source, full } => {
                let engine = Engine::open(config, project_dirs).await?;
                let mode = if full { RunMode::Full } else { RunMode::Incremental };
                let stats = engine.run_now(&source, mode).await?;
                Self::print_json(&stats)
            }
            Command::Status { source } => {
                let engine = Engine::open(config, project_dirs).await?;
                Self::print_json(&engine.source_status(&source)?)
            }
            Command::Add {
                name,
                path,
                id,
                include,
                exclude,
                schedule,
                timezone,
            } => {
                let engine = Engine::open(config, project_dirs).await?;
                let source = engine.add_source(NewSource {
                    source_id: id,
                    name,
                    root_path: path,
                    include_patterns: include
                        .as_deref()
                        .map(split_pattern_list)
                        .unwrap_or_default(),
                    exclude_patterns: exclude.as_deref().map(split_pattern_list),
                    schedule,
                    timezone,
                    skip_path_check: false,
                })?;
                engine.shutdown();
                Self::print_json(&source)
            }
            Command::List => {
                let engine = Engine::open(config, project_dirs).await?;
                Self::print_json(&engine.list_sources()?)
            }
            Command::Remove { source } => {
                let engine = Engine::open(config, project_dirs).await?;
                engine.remove_source(&source).await?;
                println!("Removed source '{}'", source);
                Ok(())
            }
        }
    }

    fn setup_logging(
        config: &Config,
        project_dirs: &ProjectDirs,
    ) -> Result<LoggerHandle, IndexerError> {
        let log_dir = project_dirs.data_local_dir().join("logs");

        Logger::try_with_str(config.logging.log_spec())
            .and_then(|logger| {
                logger
                    .log_to_file(FileSpec::default().directory(log_dir).basename("onesearch"))
                    .rotate(
                        Criterion::Size(10 * 1024 * 1024),
                        Naming::Timestamps,
                        Cleanup::KeepLogFiles(7),
                    )
                    .format_for_files(detailed_format)
                    .duplicate_to_stderr(Duplicate::Warn)
                    .start()
            })
            .map_err(|e| IndexerError::Error(format!("Failed to start logging: {}", e)))
    }

    async fn serve(config: &Config, project_dirs: &ProjectDirs) -> Result<(), IndexerError> {
        let engine = Engine::start(config, project_dirs).await?;
        info!(
            "Serving {} sources; scheduler {}",
            engine.list_sources()?.len(),
            if engine.scheduler().is_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        tokio::signal::ctrl_c().await?;
        info!("Shutdown requested");
        engine.shutdown();
        Ok(())
    }

    fn print_json<T: Serialize>(value: &T) -> Result<(), IndexerError> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let cli = Cli::try_parse_from(["onesearch"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_index_with_full() {
        let cli = Cli::try_parse_from(["onesearch", "index", "docs", "--full"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Index { ref source, full: true }) if source == "docs"
        ));

        let cli = Cli::try_parse_from(["onesearch", "index", "docs"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Index { full: false, .. })));
    }

    #[test]
    fn test_cli_parsing_add() {
        let cli = Cli::try_parse_from([
            "onesearch",
            "add",
            "Team Wiki",
            "/srv/wiki",
            "--include",
            "**/*.{md,txt},docs/**",
            "--schedule",
            "@daily",
        ])
        .unwrap();

        match cli.command {
            Some(Command::Add {
                name,
                include,
                schedule,
                exclude,
                ..
            }) => {
                assert_eq!(name, "Team Wiki");
                assert_eq!(
                    split_pattern_list(&include.unwrap()),
                    vec!["**/*.{md,txt}", "docs/**"]
                );
                assert_eq!(schedule.as_deref(), Some("@daily"));
                assert!(exclude.is_none());
            }
            _ => panic!("expected add command"),
        }
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        assert!(Cli::try_parse_from(["onesearch", "nonexistent-command"]).is_err());
        assert!(Cli::try_parse_from(["onesearch", "index"]).is_err());
        assert!(Cli::try_parse_from(["onesearch", "serve", "--invalid-flag"]).is_err());
    }
}
