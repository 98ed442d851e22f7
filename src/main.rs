//! Chatflow - streaming chat client
//!
#![doc = "Chatflow - streaming chat client"]
#![doc = "Main entry point for the Chatflow CLI."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chatflow::cli::{Cli, Commands};
use chatflow::commands;
use chatflow::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Chat {
            resume,
            model,
            prompt,
        } => {
            tracing::info!("Starting chat");
            if let Some(r) = &resume {
                tracing::debug!("Resuming session: {}", r);
            }
            commands::chat::run_chat(config, resume, model, prompt).await?;
            Ok(())
        }
        Commands::History { command } => {
            tracing::info!("Starting history command");
            commands::history::handle_history(config, command).await?;
            Ok(())
        }
        Commands::Quota { command } => {
            tracing::info!("Starting quota command");
            commands::quota::handle_quota(config, command).await?;
            Ok(())
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr so streamed replies on stdout stay clean.
fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "chatflow=debug"
    } else {
        "chatflow=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
