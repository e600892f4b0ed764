//! Data models for chat entities

mod message;
mod user;

pub use message::*;
pub use user::*;
