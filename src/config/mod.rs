//! Configuration and session storage

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::auth::StoredToken;
use crate::models::{ParticipantId, Role};

/// Environment override for the storefront API origin.
pub const API_BASE_ENV: &str = "SHOP_API_BASE_URL";
const DEFAULT_API_BASE: &str = "http://localhost:5000";

/// Which side of the support chat the stored session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Customer,
    Admin,
}

/// Logged-in identity, as the storefront keeps it in local storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub user_id: String,
    pub role: SessionRole,
    pub token: Option<StoredToken>,
}

impl StoredSession {
    pub fn participant_id(&self) -> ParticipantId {
        ParticipantId::new(self.user_id.clone())
    }

    pub fn chat_role(&self) -> Role {
        match self.role {
            SessionRole::Customer => Role::Customer(self.participant_id()),
            SessionRole::Admin => Role::Admin,
        }
    }
}

/// Chat behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Give up on a history fetch after this long and open empty.
    pub history_timeout_secs: u64,
    /// Keep inbound messages for customers the admin is not looking at.
    pub buffer_inactive: bool,
    /// Outbound events held while the socket is not connected.
    pub outbound_queue_limit: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_timeout_secs: 10,
            buffer_inactive: true,
            outbound_queue_limit: 64,
        }
    }
}

impl ChatSettings {
    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }
}

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storefront API origin (REST and socket.io share it)
    pub api_base_url: Option<String>,
    /// Current login, if any
    pub session: Option<StoredSession>,
    #[serde(default)]
    pub chat: ChatSettings,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "help-chat", "help-chat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// API origin: environment, then config file, then the dev default.
    pub fn api_base_url(&self) -> String {
        std::env::var(API_BASE_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    /// socket.io WebSocket endpoint on the API origin.
    pub fn socket_url(&self) -> Result<String> {
        socket_url_for(&self.api_base_url())
    }

    pub fn set_session(&mut self, session: StoredSession) {
        self.session = Some(session);
    }

    pub fn clear_session(&mut self) {
        self.session = None;
    }
}

fn socket_url_for(base: &str) -> Result<String> {
    let mut url = url::Url::parse(base).with_context(|| format!("Invalid API base URL {}", base))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => anyhow::bail!("Unsupported API URL scheme {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use {} scheme for {}", scheme, base))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url.to_string())
}
