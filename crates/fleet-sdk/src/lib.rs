//! Shared records and store contracts for fleet agents.
//!
//! The agent binary, tests and any tooling talking to the control plane
//! consume this crate. It owns the wire protocol, the session/lease/command
//! record shapes and the store traits the agent depends on, plus in-memory
//! adapters for each store.

pub mod command;
pub mod identity;
pub mod lease;
pub mod protocol;
pub mod session;

use reqwest::Client;
use thiserror::Error;

use crate::protocol::{RegistrationRequest, RegistrationResponse};

/// Header carrying the pre-shared agent credential on every control-plane request.
pub const API_KEY_HEADER: &str = "X-Agent-API-Key";

pub const REGISTER_PATH: &str = "/api/v1/agents/register";
pub const CONNECT_PATH: &str = "/api/v1/agents/connect";

/// HTTP side of the control plane: agent registration ahead of the channel upgrade.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl ControlPlaneClient {
    /// `base_url` is the `http(s)://host[:port]` form of the control-plane address.
    pub fn new(http: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register_agent(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse, ControlPlaneError> {
        let url = format!("{}{}", self.base_url, REGISTER_PATH);
        let res = self
            .http
            .post(url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await?;

        if res.status().is_success() {
            Ok(res.json::<RegistrationResponse>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ControlPlaneError::UnexpectedStatus { status, body })
        }
    }
}

/// Converts a channel URL (`ws://`/`wss://`) into its HTTP counterpart.
///
/// `wss://control.example.com` becomes `https://control.example.com`; anything
/// that is not a websocket scheme is returned unchanged.
pub fn http_base_from_ws(ws_url: &str) -> String {
    let trimmed = ws_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}
