//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: the planning/dispatch control loop
//! - watchdog: supervise a controller and sweep after it
//! - plan: preview the schedule without touching the device
//! - status / cleanup: inspect and manually clear device state

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Spotheat - spot-price heating control for smart relays
#[derive(Parser, Debug)]
#[command(name = "spotheat")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the control loop in the foreground
    Run,

    /// Supervise the controller and sweep its schedule when it stops
    Watchdog,

    /// Fetch prices and print the plan without installing it
    Plan,

    /// Show persisted state and the device's installed schedule entries
    Status,

    /// Delete every schedule entry the controller has installed
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_run_command() {
        let cli = Cli::try_parse_from(["spotheat", "run"]).unwrap();
        assert_eq!(cli.command, Commands::Run);
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["spotheat"]).is_err());
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["spotheat", "run", "-v"]).unwrap();
        assert!(cli.is_verbose());
    }

    #[test]
    fn test_cli_config_option() {
        let cli = Cli::try_parse_from(["spotheat", "-c", "/etc/spotheat.yml", "plan"]).unwrap();
        assert_eq!(cli.config.as_ref(), Some(&PathBuf::from("/etc/spotheat.yml")));
        assert_eq!(cli.command, Commands::Plan);
    }

    #[test]
    fn test_watchdog_command() {
        let cli = Cli::try_parse_from(["spotheat", "watchdog"]).unwrap();
        assert_eq!(cli.command, Commands::Watchdog);
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["spotheat", "status"]).unwrap();
        assert_eq!(cli.command, Commands::Status);
    }

    #[test]
    fn test_cleanup_command() {
        let cli = Cli::try_parse_from(["spotheat", "cleanup"]).unwrap();
        assert_eq!(cli.command, Commands::Cleanup);
    }

    #[test]
    fn test_help_works() {
        // Verify help doesn't panic
        Cli::command().debug_assert();
    }

    #[test]
    fn test_version_flag() {
        let result = Cli::try_parse_from(["spotheat", "--version"]);
        // Version flag causes early exit with error (expected)
        assert!(result.is_err());
    }
}
