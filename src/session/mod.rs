//! Chat sessions: the customer widget and the admin console.
//!
//! Both bridge the connection's callback world into an `mpsc` channel that
//! the owning task drains, so all store mutation happens in one place.

mod admin;
mod customer;

pub use admin::{AdminConsole, ConsoleEvent};
pub use customer::CustomerSession;

use crate::models::ChatMessage;
use crate::store::Merge;

/// A message routed into the store, with how it landed.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub merge: Merge,
    pub message: ChatMessage,
}
