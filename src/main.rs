//! agent-dispatch CLI entry point.

use clap::Parser;

use agent_dispatch::cli::commands;
use agent_dispatch::cli::{handle_error, load_config, Cli, Commands};
use agent_dispatch::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Serve(args) => {
            let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
                Ok(logger) => logger,
                Err(err) => handle_error(err, cli.json),
            };
            commands::serve::execute(args, config).await
        }
        Commands::Config(args) => commands::config::execute(args, config, cli.json),
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
