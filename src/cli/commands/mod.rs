//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod acquire;
mod check;
mod init;
mod stage;
mod status;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};
use crate::models::{PartitionKey, Stage};
use crate::scrapers::PartitionErrorPolicy;
use crate::work_queue::RunMode;

#[derive(Parser)]
#[command(name = "readingroom")]
#[command(about = "Resumable acquisition, OCR and correction of declassified archive documents")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, short = 't', global = true)]
    target: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Start at this partition (year), resuming its saved page
    #[arg(short, long, conflicts_with = "url")]
    pub partition: Option<PartitionKey>,

    /// Start at an explicit search results URL
    #[arg(short, long)]
    pub url: Option<String>,

    /// Stop after the given year instead of following the present
    #[arg(long)]
    pub last_partition: Option<PartitionKey>,

    /// Stop after fetching this many search pages
    #[arg(short = 'n', long)]
    pub max_pages: Option<u32>,

    /// What to do when a search page keeps failing
    #[arg(long, value_enum)]
    pub on_partition_error: Option<PartitionErrorPolicy>,

    /// Download previously failed documents again instead of walking search pages
    #[arg(long, conflicts_with_all = ["partition", "url", "max_pages"])]
    pub retry_failed: bool,

    /// With --retry-failed, retry only this document
    #[arg(short, long, requires = "retry_failed")]
    pub doc: Option<String>,
}

#[derive(Args, Debug)]
pub struct StageArgs {
    /// normal processes pending documents, progress only reports, retry requeues failures
    #[arg(short, long, value_enum, default_value = "normal")]
    pub mode: RunMode,

    /// Process a single document
    #[arg(short, long)]
    pub doc: Option<String>,

    /// With --doc, reprocess even if already done
    #[arg(short, long, requires = "doc")]
    pub force: bool,

    /// Limit number of documents to process (0 = unlimited)
    #[arg(short, long, default_value = "0")]
    pub limit: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data and state directories
    Init,

    /// Walk the archive search results and download new documents
    Acquire(AcquireArgs),

    /// Show per-partition acquisition progress and unavailable documents
    AcquireStatus,

    /// Extract text from downloaded documents
    Ocr(StageArgs),

    /// Correct OCR text with the language model and extract fields
    Correct(StageArgs),

    /// Show progress of every stage
    Status,

    /// List failed documents for a stage
    Failed {
        #[arg(value_enum)]
        stage: Stage,
    },

    /// Check that OCR tools and the configured model are available
    Check {
        /// Pull the configured model if the endpoint does not have it
        #[arg(long)]
        pull: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
        data: cli.target,
    };
    let (settings, config) = load_settings_with_options(options).await?;

    match cli.command {
        Commands::Init => init::cmd_init(&settings, &config).await,
        Commands::Acquire(args) => acquire::cmd_acquire(&settings, &config, args).await,
        Commands::AcquireStatus => acquire::cmd_acquire_status(&settings).await,
        Commands::Ocr(args) => stage::cmd_stage(&settings, &config, Stage::Ocr, args).await,
        Commands::Correct(args) => {
            stage::cmd_stage(&settings, &config, Stage::Correction, args).await
        }
        Commands::Status => status::cmd_status(&settings).await,
        Commands::Failed { stage } => status::cmd_failed(&settings, stage).await,
        Commands::Check { pull } => check::cmd_check(&config, pull).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stage_args() {
        let cli = Cli::try_parse_from([
            "readingroom", "-t", "/tmp/rr", "correct", "--mode", "retry", "--limit", "5",
        ])
        .unwrap();
        assert_eq!(cli.target, Some(PathBuf::from("/tmp/rr")));
        match cli.command {
            Commands::Correct(args) => {
                assert_eq!(args.mode, RunMode::RetryFailed);
                assert_eq!(args.limit, 5);
                assert!(args.doc.is_none());
            }
            _ => panic!("expected correct"),
        }

        assert!(Cli::try_parse_from(["readingroom", "ocr", "--force"]).is_err());
    }

    #[test]
    fn test_parse_acquire_args() {
        let cli = Cli::try_parse_from(["readingroom", "acquire", "--partition", "1995", "-n", "3"]).unwrap();
        match cli.command {
            Commands::Acquire(args) => {
                assert_eq!(args.partition, Some(PartitionKey(1995)));
                assert_eq!(args.max_pages, Some(3));
            }
            _ => panic!("expected acquire"),
        }
        assert!(Cli::try_parse_from([
            "readingroom", "acquire", "--partition", "1995", "--url", "https://x/?page=2"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["readingroom", "acquire", "--retry-failed", "--doc", "CIA-RDP1"]).unwrap();
        match cli.command {
            Commands::Acquire(args) => {
                assert!(args.retry_failed);
                assert_eq!(args.doc.as_deref(), Some("CIA-RDP1"));
            }
            _ => panic!("expected acquire"),
        }
        assert!(Cli::try_parse_from(["readingroom", "acquire", "--doc", "CIA-RDP1"]).is_err());
        assert!(Cli::try_parse_from(["readingroom", "acquire", "--retry-failed", "-p", "1995"]).is_err());
    }

    #[test]
    fn test_parse_check_pull() {
        let cli = Cli::try_parse_from(["readingroom", "check", "--pull"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { pull: true }));
        let cli = Cli::try_parse_from(["readingroom", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { pull: false }));
    }
}
