#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
//! `GhostDB` CLI - inspection and maintenance of transaction logs
//!
//! Usage:
//!   `ghostdb inspect ./data/data.glog`
//!   `ghostdb copy ./data/data.glog ./backup.glog`
//!   `ghostdb pack ./data/data.glog ./packed.glog --before 0005f1c2a9b3d000`
//!   `ghostdb config --file ./ghostdb.toml`

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use ghostdb_core::GhostConfig;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "ghostdb")]
#[command(author, version, about = "GhostDB CLI - object database log tools")]
#[command(propagate_version = true)]
struct Cli {
    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for `inspect`
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List transactions and data records of a log
    Inspect {
        /// Path to the log file
        log: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Restore every transaction of a log into a new log
    Copy {
        /// Source log
        src: PathBuf,

        /// Destination log (replaced if it exists)
        dst: PathBuf,
    },

    /// Write a packed copy of a log
    Pack {
        /// Source log
        log: PathBuf,

        /// Destination log (replaced if it exists)
        dst: PathBuf,

        /// Pack time as a hex tid; defaults to the last transaction
        #[arg(long, value_parser = commands::parse_tid)]
        before: Option<ghostdb_core::Tid>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (defaults to ./ghostdb.toml)
        #[arg(long, env = "GHOSTDB_CONFIG")]
        file: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    // Logging setup must not fail on a broken config; `config` reports that.
    let logging = GhostConfig::load().map(|c| c.logging).unwrap_or_default();
    let level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or(logging.level)
    };

    let registry = tracing_subscriber::registry().with(EnvFilter::new(level));
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut out = std::io::stdout().lock();
    match cli.command {
        Commands::Inspect { log, format } => commands::inspect(&log, format, &mut out)?,
        Commands::Copy { src, dst } => commands::copy(&src, &dst, &mut out)?,
        Commands::Pack { log, dst, before } => commands::pack(&log, &dst, before, &mut out)?,
        Commands::Config { file } => commands::config(file.as_deref(), &mut out)?,
    }
    Ok(())
}
