use std::fmt;

use serde::{Deserialize, Serialize};

/// A STUN or TURN server handed to the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        url: impl Into<String>,
        username: Option<String>,
        credential: Option<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username,
            credential,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Screenshare,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Screenshare => "screenshare",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction requested from the media server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Recv,
    Send,
    SendRecv,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Recv => "recv",
            Role::Send => "send",
            Role::SendRecv => "sendrecv",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation progress of one session.
///
/// Moves forward only: `New -> Starting -> Accepted -> Connected | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    Starting,
    Accepted,
    Connected,
    Failed,
}

impl NegotiationState {
    pub fn can_advance_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        matches!(
            (self, next),
            (New, Starting) | (Starting, Accepted) | (Accepted, Connected) | (Accepted, Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NegotiationState::*;

    #[test]
    fn transitions_follow_the_graph() {
        assert!(New.can_advance_to(Starting));
        assert!(Starting.can_advance_to(Accepted));
        assert!(Accepted.can_advance_to(Connected));
        assert!(Accepted.can_advance_to(Failed));
    }

    #[test]
    fn transitions_never_skip_or_reverse() {
        let all = [New, Starting, Accepted, Connected, Failed];
        let allowed = [
            (New, Starting),
            (Starting, Accepted),
            (Accepted, Connected),
            (Accepted, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_advance_to(to),
                    allowed.contains(&(from, to)),
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn role_serialization() {
        assert_eq!(serde_json::to_string(&Role::SendRecv).unwrap(), "\"sendrecv\"");
        assert_eq!(serde_json::to_string(&Role::Recv).unwrap(), "\"recv\"");
        assert_eq!(Role::SendRecv.to_string(), "sendrecv");
    }

    #[test]
    fn media_type_serialization() {
        assert_eq!(serde_json::to_string(&MediaType::Audio).unwrap(), "\"audio\"");
        let parsed: MediaType = serde_json::from_str("\"screenshare\"").unwrap();
        assert_eq!(parsed, MediaType::Screenshare);
    }

    #[test]
    fn ice_server_deserializes_without_credentials() {
        let server: IceServerConfig =
            serde_json::from_str(r#"{"url": "stun:stun.example.com:3478"}"#).unwrap();
        assert_eq!(server, IceServerConfig::new("stun:stun.example.com:3478"));
    }
}
