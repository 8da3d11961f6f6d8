use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client name announced in the `identify` handshake.
pub const CLIENT_NAME: &str = "harvester";

/// Captured request metadata believed sufficient to replay an authenticated
/// call. Headers are the request's explicit headers plus ambient ones
/// (cookie string, user agent, origin, referer) added only as extra keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialEnvelope {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Messages exchanged with the backend peer, tagged by `type` on the wire.
/// Inbound kinds this agent does not recognize deserialize to `Unknown` and
/// are ignored; that is distinct from a parse failure, which is logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Identify { client: String },
    CredentialsHarvested { data: CredentialEnvelope },
    TokenRefreshed { token: String },
    RefreshComplete,
    RefreshToken,
    #[serde(other)]
    Unknown,
}

impl ChannelMessage {
    pub fn identify() -> Self {
        Self::Identify {
            client: CLIENT_NAME.to_string(),
        }
    }

    /// Kind as it appears on the wire, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::CredentialsHarvested { .. } => "credentials_harvested",
            Self::TokenRefreshed { .. } => "token_refreshed",
            Self::RefreshComplete => "refresh_complete",
            Self::RefreshToken => "refresh_token",
            Self::Unknown => "unknown",
        }
    }
}
