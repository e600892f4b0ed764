//! API client module for the storefront backend

mod chat;
pub mod client;

use anyhow::Result;

pub use chat::ChatBackend;
use client::ShopClient;

use crate::config::Config;
use crate::models::{ChatMessage, ParticipantId, Sender};

/// One message as a terminal line: `[time] who: body`.
pub fn format_line(msg: &ChatMessage) -> String {
    let who = match msg.sender {
        Sender::Customer => "customer",
        Sender::Support => "support",
    };
    format!(
        "[{}] {}: {}",
        msg.sent_at.format("%Y-%m-%d %H:%M:%S"),
        who,
        msg.body
    )
}

/// Print a conversation's history
pub async fn show_history(participant: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let client = ShopClient::new(&config)?;
    let participant = match participant {
        Some(id) => ParticipantId::new(id),
        None => crate::auth::require_session(&config)?.participant_id(),
    };
    chat::print_history(&client, &participant).await
}

/// Print the admin roster
pub async fn show_roster() -> Result<()> {
    let config = Config::load()?;
    let client = ShopClient::new(&config)?;
    chat::print_roster(&client).await
}
