//! help-chat - storefront support chat client
//!
//! Customer widget and admin support console over the shop's realtime socket.

mod api;
mod auth;
mod config;
mod error;
mod interactive;
mod models;
mod session;
mod socket;
mod store;
#[cfg(test)]
mod test_helpers;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "help-chat")]
#[command(about = "Support chat client for the storefront", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the identity chat sessions register with
    Login {
        /// Customer or admin user id
        user_id: String,

        /// Log in as a support admin
        #[arg(long)]
        admin: bool,

        /// Bearer token issued by the storefront backend
        #[arg(short, long)]
        token: Option<String>,

        /// Token lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Forget the stored identity
    Logout,

    /// Show the stored identity
    Status,

    /// List customers with support conversations (admin)
    Roster,

    /// Print a conversation's history
    History {
        /// Customer id (defaults to the logged-in customer)
        participant: Option<String>,
    },

    /// Open the customer support chat
    Chat,

    /// Open the admin support console
    Console,
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

    match cli.command {
        Commands::Login {
            user_id,
            admin,
            token,
            expires_in,
        } => {
            auth::login(&user_id, admin, token, expires_in)?;
        }
        Commands::Logout => {
            tracing::info!("Logging out...");
            auth::logout()?;
        }
        Commands::Status => {
            auth::status()?;
        }
        Commands::Roster => {
            tracing::info!("Fetching roster...");
            api::show_roster().await?;
        }
        Commands::History { participant } => {
            api::show_history(participant).await?;
        }
        Commands::Chat => {
            interactive::run_customer_chat().await?;
        }
        Commands::Console => {
            interactive::run_admin_console().await?;
        }
    }

    Ok(())
}
