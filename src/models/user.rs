//! Identity and roster models

use serde::{Deserialize, Serialize};

use super::ParticipantId;

/// What a connection represents to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Customer(ParticipantId),
    Admin,
}

/// Customer entry in the admin roster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "_id")]
    pub id: ParticipantId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl RosterEntry {
    /// Display label, e.g. `Jane (jane@example.com)`.
    pub fn label(&self) -> String {
        match (&self.name, &self.email) {
            (Some(name), Some(email)) => format!("{} ({})", name, email),
            (Some(name), None) => name.clone(),
            (None, Some(email)) => email.clone(),
            (None, None) => self.id.to_string(),
        }
    }
}
