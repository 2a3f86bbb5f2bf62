use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CliStrategy {
    #[value(name = "keep-local")]
    KeepLocal,
    #[value(name = "keep-remote")]
    KeepRemote,
    #[value(name = "smart-merge")]
    SmartMerge,
}

impl FromStr for CliStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-local" => Ok(CliStrategy::KeepLocal),
            "keep-remote" => Ok(CliStrategy::KeepRemote),
            "smart-merge" => Ok(CliStrategy::SmartMerge),
            _ => Err(anyhow!(
                "Invalid strategy: {}. Valid values are 'keep-local', 'keep-remote' or 'smart-merge'",
                s
            )),
        }
    }
}

#[derive(Parser)]
#[command(version, name = "ogresync")]
pub struct Cli {
    /// Increase verbosity level (can be specified multiple times.) The first level sets level
    /// "info", second sets level "debug", and third sets level "trace" for the logger.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Use this config file instead of the platform default location
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args)]
pub struct CliBackupRetention {
    /// Delete every backup regardless of age and per-reason retention limits
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a full sync session: pre-editor sync, editor, post-editor sync
    Sync {
        /// Skip launching the editor and only reconcile with the remote
        #[arg(long)]
        no_editor: bool,

        /// Resolve any divergence with this strategy instead of prompting
        #[arg(long)]
        strategy: Option<CliStrategy>,
    },

    /// Run the one-time setup wizard (editor, vault, SSH keys, remote)
    Setup {},

    /// Inspect or prune local safety backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Show the local/remote repository state without modifying anything
    Status {},
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List all registered backups, newest first
    List {},

    /// Delete expired backups (older than 30 days, at most 10 kept per reason)
    Cleanup {
        #[command(flatten)]
        retention: CliBackupRetention,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "keep-local".parse::<CliStrategy>().unwrap(),
            CliStrategy::KeepLocal
        );
        assert_eq!(
            "smart-merge".parse::<CliStrategy>().unwrap(),
            CliStrategy::SmartMerge
        );
        assert!("merge".parse::<CliStrategy>().is_err());
    }
}
