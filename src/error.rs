//! Chat error taxonomy
//!
//! Every variant is recovered at the component boundary. None of them is
//! fatal to the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("connection not established")]
    TransportUnavailable,

    #[error("failed to save message: {0}")]
    PersistFailed(String),

    #[error("failed to load conversation history: {0}")]
    HistoryFetchFailed(String),

    #[error("failed to load customer roster: {0}")]
    RosterFetchFailed(String),

    #[error("message body is empty")]
    EmptyBody,

    #[error("no conversation selected")]
    NoActiveConversation,

    #[error("chat session is not active")]
    NotActive,

    #[error("invalid message payload: {0}")]
    InvalidMessage(String),
}
