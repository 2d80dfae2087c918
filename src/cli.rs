//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Batch acquisition of academic paper PDFs.
#[derive(Debug, Parser)]
#[command(name = "paperfetch", version, about)]
pub struct Cli {
    /// Path to a JSON config file (default: ./paperfetch.json, then
    /// ~/.config/paperfetch/config.json).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download PDFs for a list of identifiers (DOIs, arXiv IDs, URLs).
    Fetch {
        /// Identifiers given directly on the command line.
        identifiers: Vec<String>,

        /// Read identifiers from a file, one per line (# comments allowed).
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Output directory for PDFs (overrides config).
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Parallel workers (1 = fully sequential; overrides config).
        #[arg(long)]
        workers: Option<usize>,

        /// Attempt cap per identifier (overrides config).
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Re-download even identifiers already marked successful.
        #[arg(long)]
        force: bool,

        /// Disable rate limiting entirely.
        #[arg(long)]
        no_rate_limit: bool,

        /// Suppress the progress bar.
        #[arg(long)]
        quiet: bool,
    },

    /// Re-check that every recorded download still exists on disk.
    Verify,

    /// Print aggregate download statistics.
    Stats,

    /// Merge another project's state store and PDF directory into this one.
    Merge {
        /// Source state store to merge from.
        #[arg(long)]
        source_db: PathBuf,

        /// Source PDF directory.
        #[arg(long)]
        source_dir: PathBuf,

        /// Copy files instead of moving them.
        #[arg(long)]
        copy: bool,

        /// Decide everything, change nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect or clear the shared postponement store.
    Postponed {
        #[command(subcommand)]
        action: PostponedAction,
    },
}

/// Operations on the postponement store.
#[derive(Debug, Subcommand)]
pub enum PostponedAction {
    /// List blocked domains and DOI prefixes.
    List,
    /// Remove one blocked domain or prefix.
    Remove {
        /// The domain or DOI prefix to unblock.
        key: String,
    },
    /// Clear every entry.
    Clear,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_parses_identifiers_and_flags() {
        let cli = Cli::try_parse_from([
            "paperfetch",
            "fetch",
            "10.1234/a",
            "2301.12345",
            "--workers",
            "1",
            "--force",
        ])
        .expect("fetch command parses");

        match cli.command {
            Command::Fetch {
                identifiers,
                workers,
                force,
                ..
            } => {
                assert_eq!(identifiers.len(), 2);
                assert_eq!(workers, Some(1));
                assert!(force);
            }
            other => panic!("expected Fetch, got {other:?}"),
        }
    }

    #[test]
    fn test_postponed_subcommands_parse() {
        let cli = Cli::try_parse_from(["paperfetch", "postponed", "remove", "10.1016"])
            .expect("postponed remove parses");
        match cli.command {
            Command::Postponed {
                action: PostponedAction::Remove { key },
            } => assert_eq!(key, "10.1016"),
            other => panic!("expected Postponed Remove, got {other:?}"),
        }
    }
}
