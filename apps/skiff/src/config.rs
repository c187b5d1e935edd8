//! Bridge configuration. Required settings fail closed: the bridge refuses
//! to start rather than guessing at a backend or an identity source.

use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::identity::AuthMode;

#[derive(Debug, Clone)]
pub struct Config {
    /// Display id the bridge announces as `self_id`.
    pub bot_id: String,
    /// Display name answered to `get_login_info`.
    pub bot_name: String,
    /// WebSocket endpoint of the chat backend.
    pub ws_url: Url,
    /// Identity strategy: auth service or static admin pair.
    pub auth: AuthMode,
    /// Override for the persisted session file (defaults to the home dir).
    pub session_file: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid websocket url {url:?}: {reason}")]
    InvalidSocketUrl { url: String, reason: String },
    #[error("invalid auth service url {url:?}: {reason}")]
    InvalidAuthUrl { url: String, reason: String },
    #[error("configure either an auth service url or an admin id/secret pair, not both")]
    ConflictingAuth,
    #[error("admin id and admin secret must be configured together")]
    PartialAdminPair,
}

impl Config {
    /// Assemble and validate a configuration from raw settings.
    pub fn resolve(
        bot_id: String,
        bot_name: String,
        ws_url: String,
        auth_url: Option<String>,
        admin_id: Option<String>,
        admin_secret: Option<String>,
        session_file: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let bot_id = non_empty(bot_id).ok_or(ConfigError::Missing("bot id"))?;
        let bot_name = non_empty(bot_name).ok_or(ConfigError::Missing("bot name"))?;
        let ws_raw = non_empty(ws_url).ok_or(ConfigError::Missing("websocket url"))?;

        let ws_url = Url::parse(&ws_raw).map_err(|err| ConfigError::InvalidSocketUrl {
            url: ws_raw.clone(),
            reason: err.to_string(),
        })?;
        if ws_url.scheme() != "ws" && ws_url.scheme() != "wss" {
            return Err(ConfigError::InvalidSocketUrl {
                url: ws_raw,
                reason: "scheme must be ws or wss".into(),
            });
        }

        let auth_url = auth_url.and_then(non_empty);
        let admin_id = admin_id.and_then(non_empty);
        let admin_secret = admin_secret.and_then(non_empty);

        let auth = match (auth_url, admin_id, admin_secret) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(ConfigError::ConflictingAuth);
            }
            (Some(raw), None, None) => {
                let base_url = Url::parse(&raw).map_err(|err| ConfigError::InvalidAuthUrl {
                    url: raw,
                    reason: err.to_string(),
                })?;
                AuthMode::Service { base_url }
            }
            (None, Some(account), Some(secret)) => AuthMode::StaticAdmin { account, secret },
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(ConfigError::PartialAdminPair);
            }
            (None, None, None) => return Err(ConfigError::Missing("auth url or admin pair")),
        };

        Ok(Self {
            bot_id,
            bot_name,
            ws_url,
            auth,
            session_file,
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
