//! Session identity management
//!
//! The storefront backend issues the bearer token; this module only keeps
//! it next to the user id and role the chat registers with.

pub mod tokens;

use anyhow::{bail, Result};

use crate::config::{Config, SessionRole, StoredSession};
pub use tokens::StoredToken;

/// Store the identity used for chat sessions.
pub fn login(
    user_id: &str,
    admin: bool,
    token: Option<String>,
    expires_in: Option<u64>,
) -> Result<()> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        bail!("User id must not be empty");
    }
    if admin && token.is_none() {
        bail!("Admin sessions need a bearer token (--token)");
    }

    let role = if admin {
        SessionRole::Admin
    } else {
        SessionRole::Customer
    };

    let mut config = Config::load()?;
    config.set_session(StoredSession {
        user_id: user_id.to_string(),
        role,
        token: token.map(|t| StoredToken::new(t, expires_in)),
    });
    config.save()?;

    tracing::info!("Stored {:?} session for {}", role, user_id);
    println!("Logged in as {} ({:?}).", user_id, role);
    Ok(())
}

/// Forget the stored identity
pub fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_session();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current session status
pub fn status() -> Result<()> {
    let config = Config::load()?;

    println!("API base:    {}", config.api_base_url());

    match config.session {
        Some(ref session) => {
            println!("User:        {}", session.user_id);
            println!("Role:        {:?}", session.role);
            match session.token {
                Some(ref token) if !token.is_expired() => {
                    println!("Token:       valid");
                    if let Some(exp) = token.expires_at {
                        println!("  expires_at: {}", exp);
                    }
                }
                Some(_) => println!("Token:       expired"),
                None => println!("Token:       none"),
            }
        }
        None => println!("User:        not logged in"),
    }

    Ok(())
}

/// Load the stored session or explain how to create one.
pub fn require_session(config: &Config) -> Result<StoredSession> {
    match config.session {
        Some(ref session) => Ok(session.clone()),
        None => bail!("Not logged in. Run 'help-chat login <user-id>' first."),
    }
}
