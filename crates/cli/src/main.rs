//! Loopwright CLI: operator entry point.
//!
//! Commands:
//! - `config`: Create, show and validate the configuration file
//! - `history`: Inspect, compact and reset stored session history

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "loopwright",
    about = "Loopwright: agent turn loop, context and approval runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Inspect and maintain session history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,

    /// Check the configuration for errors
    Validate,

    /// Print the config file location
    Path,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List sessions with stored messages
    Sessions,

    /// Print a session's messages
    Show {
        #[arg(short, long)]
        session: String,

        /// Print the stored log instead of the model's view
        #[arg(long)]
        raw: bool,
    },

    /// Message counts and token estimate for a session
    Stats {
        #[arg(short, long)]
        session: String,
    },

    /// Hide the oldest messages behind an eviction marker
    Compact {
        #[arg(short, long)]
        session: String,
    },

    /// Delete a session's history
    Reset {
        #[arg(short, long)]
        session: String,

        /// Required to actually delete
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
        Commands::History { action } => match action {
            HistoryAction::Sessions => commands::history::sessions().await?,
            HistoryAction::Show { session, raw } => commands::history::show(&session, raw).await?,
            HistoryAction::Stats { session } => commands::history::stats(&session).await?,
            HistoryAction::Compact { session } => commands::history::compact(&session).await?,
            HistoryAction::Reset { session, confirm } => {
                commands::history::reset(&session, confirm).await?
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_history_compact() {
        let cli = Cli::try_parse_from(["loopwright", "history", "compact", "--session", "s1"])
            .unwrap();
        match cli.command {
            Commands::History {
                action: HistoryAction::Compact { session },
            } => assert_eq!(session, "s1"),
            _ => panic!("expected history compact"),
        }
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::try_parse_from(["loopwright", "config", "show", "-v"]).unwrap();
        assert!(cli.verbose);
    }
}
