//! Command line interface.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

/// Lead scoring, qualification and outreach automation.
#[derive(Debug, Parser)]
#[command(name = "leadflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "leadflow.toml")]
    pub config: PathBuf,

    /// Print results as JSON instead of styled text.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Score a single lead read from a JSON file.
    Score {
        /// JSON file holding one lead.
        lead: PathBuf,
    },

    /// Run the BANT qualification over leads from a fixture file.
    Qualify {
        /// JSON or TOML fixture file.
        fixtures: PathBuf,

        #[command(flatten)]
        target: QualifyTarget,

        /// Maximum leads for `--all`.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Qualify leads, fire `lead_qualified` triggers and drive sequences.
    Run {
        /// JSON or TOML fixture file.
        fixtures: PathBuf,

        /// Run a single scheduler tick and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Show where a sequence's delivery window moves a send time.
    Window {
        /// JSON or TOML fixture file.
        fixtures: PathBuf,

        #[arg(long)]
        sequence: Uuid,

        /// Requested send time (RFC 3339).
        #[arg(long)]
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct QualifyTarget {
    /// Qualify one lead.
    #[arg(long)]
    pub lead: Option<Uuid>,

    /// Qualify every unscored lead, newest first.
    #[arg(long)]
    pub all: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_score() {
        let cli = Cli::parse_from(["leadflow", "score", "lead.json"]);
        match cli.command {
            Command::Score { lead } => assert_eq!(lead, PathBuf::from("lead.json")),
            _ => panic!("expected Score command"),
        }
        assert_eq!(cli.config, PathBuf::from("leadflow.toml"));
    }

    #[test]
    fn cli_parses_qualify_targets() {
        let id = "6f1c1c44-95a2-4c7e-9a0b-3f1e2d9c0a11";
        let cli = Cli::parse_from(["leadflow", "qualify", "f.json", "--lead", id]);
        match cli.command {
            Command::Qualify { target, limit, .. } => {
                assert_eq!(target.lead.unwrap().to_string(), id);
                assert!(!target.all);
                assert_eq!(limit, 50);
            }
            _ => panic!("expected Qualify command"),
        }

        let cli = Cli::parse_from(["leadflow", "qualify", "f.json", "--all", "--limit", "5"]);
        assert!(matches!(
            cli.command,
            Command::Qualify { target: QualifyTarget { all: true, .. }, limit: 5, .. }
        ));
    }

    #[test]
    fn qualify_needs_exactly_one_target() {
        assert!(Cli::try_parse_from(["leadflow", "qualify", "f.json"]).is_err());
        assert!(
            Cli::try_parse_from([
                "leadflow",
                "qualify",
                "f.json",
                "--all",
                "--lead",
                "6f1c1c44-95a2-4c7e-9a0b-3f1e2d9c0a11"
            ])
            .is_err()
        );
    }

    #[test]
    fn cli_parses_window_and_global_flags() {
        let cli = Cli::parse_from([
            "leadflow",
            "--config",
            "custom.toml",
            "--verbose",
            "window",
            "f.json",
            "--sequence",
            "0b7f5a5e-7d3f-4b3a-9d59-1d8e6a2c4f00",
            "--at",
            "2026-10-17T10:00:00Z",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        match cli.command {
            Command::Window { at, .. } => assert_eq!(at.to_rfc3339(), "2026-10-17T10:00:00+00:00"),
            _ => panic!("expected Window command"),
        }
    }

    #[test]
    fn cli_parses_run_once() {
        let cli = Cli::parse_from(["leadflow", "run", "f.json", "--once"]);
        assert!(matches!(cli.command, Command::Run { once: true, .. }));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
