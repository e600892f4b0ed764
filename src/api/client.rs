//! Authenticated HTTP client for the storefront API
//!
//! Wraps reqwest::Client with bearer token injection.

use anyhow::{bail, Context, Result};

use crate::config::{Config, SessionRole};

/// Client for the storefront REST API.
pub struct ShopClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    role: SessionRole,
}

impl ShopClient {
    /// Build a client from the stored session.
    pub fn new(config: &Config) -> Result<Self> {
        let session = crate::auth::require_session(config)?;

        let token = match session.token {
            Some(ref t) if t.is_expired() => {
                bail!("Session token expired. Run 'help-chat login' again.");
            }
            Some(t) => Some(t.token),
            None => None,
        };

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.api_base_url(),
            token,
            role: session.role,
        })
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// GET request against the API origin.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        tracing::debug!("GET {}", url);

        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        check_response(resp, &url).await
    }

    /// POST a JSON body against the API origin.
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = self.url(path);
        tracing::debug!("POST {}", url);

        let resp = self
            .authorize(self.http.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, &url).await
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'help-chat login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
