//! Runtime configuration: CLI flags with environment fallbacks.

use std::env;
use std::fmt;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Realtime chat client for the HuddleSpace backend")]
pub struct Cli {
    /// Base URL of the REST API, e.g. https://chat.example.com
    #[arg(long)]
    pub api_url: Option<String>,

    /// Base URL of the push endpoint; derived from --api-url when omitted
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Bearer token for both REST and push authentication
    #[arg(long)]
    pub token: Option<String>,

    /// User id the session acts as
    #[arg(long)]
    pub user: Option<String>,

    /// Conversation to open immediately after connecting: a user id, or
    /// group:<id> for a group
    #[arg(long)]
    pub chat_with: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(what) => write!(f, "missing required setting: {what}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub token: String,
    pub user: String,
    pub chat_with: Option<String>,
}

impl Config {
    /// Resolve settings from CLI flags, falling back to HUDDLE_* environment
    /// variables. api_url, token and user are required; ws_url defaults to
    /// the api_url with its scheme swapped to ws/wss.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let api_url = cli
            .api_url
            .or_else(|| env::var("HUDDLE_API_URL").ok())
            .ok_or(ConfigError::Missing("api url (--api-url or HUDDLE_API_URL)"))?;
        let token = cli
            .token
            .or_else(|| env::var("HUDDLE_TOKEN").ok())
            .ok_or(ConfigError::Missing("token (--token or HUDDLE_TOKEN)"))?;
        let user = cli
            .user
            .or_else(|| env::var("HUDDLE_USER").ok())
            .ok_or(ConfigError::Missing("user (--user or HUDDLE_USER)"))?;
        let ws_url = cli
            .ws_url
            .or_else(|| env::var("HUDDLE_WS_URL").ok())
            .unwrap_or_else(|| derive_ws_url(&api_url));
        let chat_with = cli.chat_with.or_else(|| env::var("HUDDLE_CHAT_WITH").ok());
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
            token,
            user,
            chat_with,
        })
    }
}

fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derived_from_api_url() {
        assert_eq!(derive_ws_url("https://chat.example.com"), "wss://chat.example.com");
        assert_eq!(derive_ws_url("http://localhost:8080"), "ws://localhost:8080");
    }
}
