//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::commands::{config::ConfigArgs, migrate::MigrateArgs, serve::ServeArgs};

#[derive(Parser)]
#[command(name = "callhook")]
#[command(about = "callhook - voice platform webhook service", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file to load instead of .callhook/config.yaml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook HTTP server
    Serve(ServeArgs),

    /// Apply pending database migrations
    Migrate(MigrateArgs),

    /// Print the effective configuration
    Config(ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from(["callhook", "serve", "--port", "9000", "--memory"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, Some(9000));
                assert!(args.memory);
                assert!(args.host.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["callhook", "config", "--json", "--config", "x.yaml"]);
        assert!(cli.json);
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
    }
}
