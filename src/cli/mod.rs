//! Command-line interface.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;

#[derive(Parser, Debug)]
#[command(name = "agent-dispatch", version, about = "Agent lifecycle and task dispatch engine")]
pub struct Cli {
    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .agent-dispatch/config.yaml + local.yaml)
    #[arg(long, short, global = true, env = "AGENT_DISPATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine and the monitoring server
    Serve(commands::serve::ServeArgs),
    /// Inspect configuration
    Config(commands::config::ConfigArgs),
}

/// Resolve configuration from an explicit file or the default hierarchy.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({ "success": false, "error": format!("{err:#}") });
        eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_with_demo() {
        let cli = Cli::try_parse_from(["agent-dispatch", "serve", "--demo", "--config", "x.yaml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.yaml")));
        match cli.command {
            Commands::Serve(args) => assert!(args.demo),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_config_show() {
        let cli = Cli::try_parse_from(["agent-dispatch", "--json", "config", "show"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Config(_)));
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["agent-dispatch", "launch"]).is_err());
    }
}
