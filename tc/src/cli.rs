//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tc - task claim coordination
#[derive(Parser)]
#[command(
    name = "tc",
    about = "Distributed task claiming over a watchable key-value store",
    version,
    after_help = "Logs are written to: ~/.local/share/taskcoord/logs/taskcoord.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run a fleet of coordinators in-process and work through a batch of tasks
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Number of tasks to publish
        #[arg(short, long, default_value_t = 12)]
        tasks: usize,

        /// Claim TTL in milliseconds (overrides the config file)
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Simulated processing time per task in milliseconds
        #[arg(long, default_value_t = 20)]
        work_ms: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::parse_from(["tc", "-v", "simulate", "--nodes", "5", "--ttl-ms", "900"]);
        assert!(cli.verbose);
        match cli.command {
            Some(Command::Simulate {
                nodes,
                tasks,
                ttl_ms,
                work_ms,
                ..
            }) => {
                assert_eq!(nodes, 5);
                assert_eq!(tasks, 12);
                assert_eq!(ttl_ms, Some(900));
                assert_eq!(work_ms, 20);
            }
            _ => panic!("Expected simulate"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["tc", "config", "--config", "/tmp/tc.yml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tc.yml")));
        assert!(matches!(cli.command, Some(Command::Config)));
    }
}
