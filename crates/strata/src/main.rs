//! Strata CLI - hierarchical code search from the command line.
//!
//! Strata indexes a source tree into per-directory databases and searches
//! them with full-text ranking, symbol lookup and cascade retrieval.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

mod cli;

/// Strata: hierarchical per-directory code index with cascade search.
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory holding the registry and all indexes
    /// (defaults to $STRATA_INDEX_ROOT, then ~/.strata/indexes)
    #[arg(long, global = true)]
    index_root: Option<PathBuf>,

    /// YAML configuration file for search and cascade settings
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index (or refresh) a source tree
    Index {
        /// Project root to index
        path: PathBuf,

        /// Reparse every file, ignoring the previous snapshot
        #[arg(long)]
        force: bool,
    },

    /// Full-text search from a directory downward
    Search {
        /// Search query
        query: String,

        /// Directory to search from (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Print matching file paths only
        #[arg(long)]
        files_only: bool,
    },

    /// Look up symbols by name prefix
    Symbols {
        /// Symbol name or prefix
        name: String,

        /// Directory to search from (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Filter by symbol kind (function, method, struct, class, enum, trait, ...)
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Multi-stage cascade search
    Cascade {
        /// Search query
        query: String,

        /// Directory to search from (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Pipeline: binary, binary-rerank, dense-rerank or staged
        #[arg(short, long, default_value = "staged")]
        mode: String,

        /// Results to return (defaults to cascade.target_count)
        #[arg(short = 'k', long)]
        limit: Option<usize>,
    },

    /// Show registered projects and their indexes
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let context = match cli::Context::load(cli.index_root, cli.config.as_deref()) {
        Ok(context) => context,
        Err(e) => return report(&e),
    };

    let result = match cli.command {
        Commands::Index { path, force } => cli::index::run(&context, &path, force),
        Commands::Search {
            query,
            path,
            limit,
            files_only,
        } => cli::search::run(&context, &query, path.as_deref(), limit, files_only),
        Commands::Symbols {
            name,
            path,
            kind,
            limit,
        } => cli::symbols::run(&context, &name, path.as_deref(), kind.as_deref(), limit),
        Commands::Cascade {
            query,
            path,
            mode,
            limit,
        } => cli::cascade::run(&context, &query, path.as_deref(), &mode, limit),
        Commands::Status => cli::status::run(&context),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

fn report(e: &strata::Error) -> ExitCode {
    eprintln!("{}: {e}", "error".red().bold());
    // Show cause chain for nested errors
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        eprintln!("  {}: {cause}", "caused by".dimmed());
        source = std::error::Error::source(cause);
    }
    ExitCode::FAILURE
}
