//! pigeon - keeps a mailbox OAuth2 token alive and watches the inbox
//!
//! Signs in through the browser, stores the credential on disk and renews
//! it silently before it expires.

mod api;
mod auth;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::Session;
use config::Settings;

#[derive(Parser)]
#[command(name = "pigeon")]
#[command(about = "Mailbox sign-in and inbox watcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser
    Login {
        /// Discard the stored credential and sign in again
        #[arg(short, long)]
        force: bool,
    },

    /// Log out and clear stored credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Print a valid access token (never opens the browser)
    Token,

    /// Poll the inbox and report new messages until Ctrl+C
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = Settings::load()?;
    let session = Session::open(&settings)?;

    match cli.command {
        Commands::Login { force } => {
            tracing::info!("Starting authentication flow...");
            auth::login(&session, force).await?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout(&session)?;
        }
        Commands::Status => {
            auth::status(&session)?;
        }
        Commands::Token => {
            auth::print_token(&session).await?;
        }
        Commands::Watch => {
            api::watch(&settings, &session).await?;
        }
    }

    Ok(())
}
