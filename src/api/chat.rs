//! Support chat REST endpoints
//!
//! History, roster and message persistence. Sessions reach these through
//! the `ChatBackend` trait so they can run against an in-memory backend.

use std::future::Future;

use anyhow::{Context, Result};

use super::client::ShopClient;
use crate::config::SessionRole;
use crate::models::{ChatMessage, ParticipantId, RosterEntry, WireMessage};

/// Backend operations the chat components consume.
pub trait ChatBackend: Send + Sync + 'static {
    /// Prior messages of one conversation, oldest first.
    fn history(
        &self,
        participant: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<ChatMessage>>> + Send;

    /// Customers the admin can talk to.
    fn roster(&self) -> impl Future<Output = Result<Vec<RosterEntry>>> + Send;

    /// Save a support reply, returning it with its durable id.
    fn persist_message(
        &self,
        draft: &ChatMessage,
    ) -> impl Future<Output = Result<ChatMessage>> + Send;
}

/// Coerce a history page, skipping entries that fail validation.
fn coerce_page(page: Vec<WireMessage>) -> Vec<ChatMessage> {
    let total = page.len();
    let mut messages: Vec<ChatMessage> = page
        .into_iter()
        .filter_map(|wire| match ChatMessage::try_from(wire) {
            Ok(m) => Some(m),
            Err(e) => {
                tracing::debug!("Skipping history entry: {}", e);
                None
            }
        })
        .collect();
    if messages.len() != total {
        tracing::warn!("Dropped {} malformed history entries", total - messages.len());
    }
    messages.sort_by_key(|m| m.sent_at);
    messages
}

impl ChatBackend for ShopClient {
    async fn history(&self, participant: &ParticipantId) -> Result<Vec<ChatMessage>> {
        let path = match self.role() {
            SessionRole::Admin => format!("/api/admin/chat/{}", participant),
            SessionRole::Customer => format!("/api/chat/admin/chat/{}", participant),
        };
        let page: Vec<WireMessage> = self
            .get(&path)
            .await?
            .json()
            .await
            .context("Failed to parse chat history response")?;
        Ok(coerce_page(page))
    }

    async fn roster(&self) -> Result<Vec<RosterEntry>> {
        self.get("/api/admin/chat/users")
            .await?
            .json()
            .await
            .context("Failed to parse chat roster response")
    }

    async fn persist_message(&self, draft: &ChatMessage) -> Result<ChatMessage> {
        let body = serde_json::json!({
            "userId": draft.participant_id.as_str(),
            "sender": draft.sender.as_str(),
            "message": draft.body,
        });
        let mut saved: WireMessage = self
            .post("/api/admin/chat", &body)
            .await?
            .json()
            .await
            .context("Failed to parse saved message")?;

        anyhow::ensure!(
            saved.id.as_deref().is_some_and(|id| !id.is_empty()),
            "Saved message has no id"
        );

        // The save endpoint may echo a partial document; fill from the draft.
        saved.user_id.get_or_insert_with(|| draft.participant_id.as_str().to_string());
        saved.sender.get_or_insert_with(|| draft.sender.as_str().to_string());
        saved.message.get_or_insert_with(|| draft.body.clone());
        saved.timestamp.get_or_insert_with(|| draft.sent_at.to_rfc3339());

        ChatMessage::try_from(saved).context("Saved message failed validation")
    }
}

/// Print one conversation's history (stdout).
pub async fn print_history(client: &ShopClient, participant: &ParticipantId) -> Result<()> {
    let messages = client.history(participant).await?;

    if messages.is_empty() {
        println!("(no messages)");
        return Ok(());
    }

    for msg in &messages {
        println!("{}", super::format_line(msg));
    }

    Ok(())
}

/// Print the admin roster (stdout).
pub async fn print_roster(client: &ShopClient) -> Result<()> {
    let roster = client.roster().await?;

    println!("\nCustomers:");
    println!("{:-<60}", "");

    if roster.is_empty() {
        println!("  (no customers found)");
        return Ok(());
    }

    for entry in &roster {
        println!("{}", entry.label());
        println!("  ID: {}", entry.id);
    }

    Ok(())
}
