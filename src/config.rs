//! Join configuration and URL helpers.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::sfu::{IceServerConfig, KEEPALIVE_INTERVAL, NEGOTIATION_TIMEOUT};

/// Timing of the media-server signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuOptions {
    pub keepalive_interval_secs: u64,
    pub negotiation_timeout_secs: u64,
}

impl Default for SfuOptions {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: KEEPALIVE_INTERVAL.as_secs(),
            negotiation_timeout_secs: NEGOTIATION_TIMEOUT.as_secs(),
        }
    }
}

impl SfuOptions {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }
}

/// Credentials passed to `validateAuthToken`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub meeting_id: String,
    pub internal_user_id: String,
    pub auth_token: String,
    pub extern_user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunServer {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Relay discovery response as served by the meeting web application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceDiscovery {
    #[serde(rename = "stunServers", default)]
    pub stun_servers: Vec<StunServer>,
    #[serde(rename = "turnServers", default)]
    pub turn_servers: Vec<TurnServer>,
}

impl IceDiscovery {
    /// STUN servers first, then TURN, each in response order.
    pub fn into_ice_servers(self) -> Vec<IceServerConfig> {
        let stun = self
            .stun_servers
            .into_iter()
            .map(|s| IceServerConfig::new(s.url));
        let turn = self
            .turn_servers
            .into_iter()
            .map(|t| IceServerConfig::with_credentials(t.url, t.username, t.password));
        stun.chain(turn).collect()
    }
}

/// Everything needed to join a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub ddp_url: String,
    pub sfu_url: String,
    pub session_token: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub ice: IceDiscovery,
    #[serde(default = "default_listen_only")]
    pub listen_only: bool,
    #[serde(default)]
    pub sfu: SfuOptions,
}

fn default_listen_only() -> bool {
    true
}

impl JoinConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn ddp_websocket_url(&self) -> Result<String> {
        ddp_websocket_url(&self.ddp_url)
    }

    pub fn sfu_websocket_url(&self) -> Result<String> {
        sfu_websocket_url(&self.sfu_url, &self.session_token)
    }

    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice.clone().into_ice_servers()
    }
}

/// WebSocket endpoint of the pub/sub server behind a meeting URL.
///
/// `http(s)://host/path` maps to `wss://host/path/websocket`; a `ws(s)` URL
/// already ending in `/websocket` is returned unchanged.
pub fn ddp_websocket_url(url: &str) -> Result<String> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "ws" | "wss" if parsed.path().ends_with("/websocket") => return Ok(parsed.into()),
        "http" | "https" | "ws" | "wss" => {}
        other => {
            return Err(Error::InvalidState(format!(
                "unsupported url scheme {:?}",
                other
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidState(format!("url without host: {}", url)))?;
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path = parsed.path().trim_end_matches('/');

    let ws = Url::parse(&format!("wss://{}{}/websocket", authority, path))?;
    Ok(ws.into())
}

/// Signaling URL with the session token appended to its query.
pub fn sfu_websocket_url(url: &str, session_token: &str) -> Result<String> {
    let mut parsed = Url::parse(url)?;
    parsed
        .query_pairs_mut()
        .append_pair("sessionToken", session_token);
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddp_url_from_meeting_url() {
        assert_eq!(
            ddp_websocket_url("https://meet.example.com/html5client/sockjs").unwrap(),
            "wss://meet.example.com/html5client/sockjs/websocket"
        );
        assert_eq!(
            ddp_websocket_url("https://meet.example.com:8443/html5client/").unwrap(),
            "wss://meet.example.com:8443/html5client/websocket"
        );
    }

    #[test]
    fn ddp_websocket_url_is_kept() {
        let url = "ws://127.0.0.1:3000/websocket";
        assert_eq!(ddp_websocket_url(url).unwrap(), url);
    }

    #[test]
    fn ddp_url_rejects_other_schemes() {
        assert!(matches!(
            ddp_websocket_url("ftp://meet.example.com/x"),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(ddp_websocket_url("not a url"), Err(Error::Url(_))));
    }

    #[test]
    fn sfu_url_gets_session_token() {
        assert_eq!(
            sfu_websocket_url("wss://meet.example.com/bbb-webrtc-sfu", "abc123").unwrap(),
            "wss://meet.example.com/bbb-webrtc-sfu?sessionToken=abc123"
        );
        assert_eq!(
            sfu_websocket_url("wss://meet.example.com/sfu?a=1", "t").unwrap(),
            "wss://meet.example.com/sfu?a=1&sessionToken=t"
        );
    }

    #[test]
    fn ice_discovery_lists_stun_first() {
        let discovery: IceDiscovery = serde_json::from_str(
            r#"{
                "turnServers": [{"url": "turn:turn.example.com:3478", "username": "u", "password": "p"}],
                "stunServers": [{"url": "stun:stun1.example.com"}, {"url": "stun:stun2.example.com"}]
            }"#,
        )
        .unwrap();

        assert_eq!(
            discovery.into_ice_servers(),
            vec![
                IceServerConfig::new("stun:stun1.example.com"),
                IceServerConfig::new("stun:stun2.example.com"),
                IceServerConfig::with_credentials(
                    "turn:turn.example.com:3478",
                    Some("u".to_string()),
                    Some("p".to_string())
                ),
            ]
        );
    }

    #[test]
    fn join_config_defaults() {
        let config: JoinConfig = serde_json::from_str(
            r#"{
                "ddp_url": "https://meet.example.com/html5client/sockjs",
                "sfu_url": "wss://meet.example.com/bbb-webrtc-sfu",
                "session_token": "tok",
                "auth": {
                    "meeting_id": "m",
                    "internal_user_id": "w_1",
                    "auth_token": "a",
                    "extern_user_id": "e"
                }
            }"#,
        )
        .unwrap();

        assert!(config.listen_only);
        assert_eq!(config.sfu, SfuOptions::default());
        assert_eq!(config.sfu.keepalive_interval(), Duration::from_secs(10));
        assert_eq!(config.sfu.negotiation_timeout(), Duration::from_secs(30));
        assert!(config.ice_servers().is_empty());
        assert_eq!(
            config.sfu_websocket_url().unwrap(),
            "wss://meet.example.com/bbb-webrtc-sfu?sessionToken=tok"
        );
    }

    #[test]
    fn partial_sfu_options() {
        let options: SfuOptions =
            serde_json::from_str(r#"{"negotiation_timeout_secs": 5}"#).unwrap();
        assert_eq!(options.negotiation_timeout(), Duration::from_secs(5));
        assert_eq!(options.keepalive_interval(), Duration::from_secs(10));
    }
}
