use serde::{Deserialize, Serialize};

use super::types::{MediaType, Role};

/// Messages sent from client to media server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,

    /// Ask the media server to open a session.
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "type")]
        media_type: MediaType,
        role: Role,
        #[serde(rename = "clientSessionNumber")]
        client_session_number: u32,
        extension: Option<String>,
        #[serde(rename = "transparentListenOnly")]
        transparent_listen_only: bool,
    },

    /// Locally generated description finishing the negotiation.
    #[serde(rename = "subscriberAnswer")]
    SubscriberAnswer {
        #[serde(rename = "type")]
        media_type: MediaType,
        role: Role,
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },
}

/// Reply to a `start` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    #[serde(rename = "type", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(rename = "sdpAnswer", default)]
    pub sdp_answer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StartResponse {
    pub fn is_accepted(&self) -> bool {
        self.response.as_deref() == Some("accepted")
    }
}

/// Messages sent from media server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum ServerMessage {
    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "startResponse")]
    StartResponse(StartResponse),

    #[serde(other)]
    Unknown,
}
