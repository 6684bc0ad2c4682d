use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A mirrored document: field name to value.
pub type Document = Map<String, Value>;

/// Protocol version requested during the handshake.
pub const DDP_VERSION: &str = "1";

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        version: String,
        support: Vec<String>,
    },

    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    Method {
        id: String,
        method: String,
        params: Vec<Value>,
    },

    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    Unsub { id: String },
}

impl ClientMessage {
    pub fn connect() -> Self {
        ClientMessage::Connect {
            version: DDP_VERSION.to_string(),
            support: vec![DDP_VERSION.to_string()],
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { session: String },

    /// Handshake rejected; `version` is the one the server would accept.
    #[serde(rename = "failed")]
    Failed {
        #[serde(default)]
        version: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        id: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },

    /// Methods whose writes have been reflected in the mirrored collections.
    #[serde(rename = "updated")]
    Updated {
        #[serde(default)]
        methods: Vec<String>,
    },

    #[serde(rename = "nosub")]
    NoSub {
        id: String,
        #[serde(default)]
        error: Option<Value>,
    },

    #[serde(rename = "added")]
    Added {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Option<Document>,
    },

    #[serde(rename = "addedBefore")]
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Option<Document>,
        #[serde(default)]
        before: Option<String>,
    },

    #[serde(rename = "changed")]
    Changed {
        collection: String,
        id: String,
        #[serde(default)]
        fields: Option<Document>,
        #[serde(default)]
        cleared: Option<Vec<String>>,
    },

    #[serde(rename = "removed")]
    Removed { collection: String, id: String },

    #[serde(rename = "movedBefore")]
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },

    #[serde(rename = "ready")]
    Ready {
        #[serde(default)]
        subs: Vec<String>,
    },

    /// Any `msg` kind this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Outcome of decoding one inbound frame.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    /// Valid JSON object without a `msg` field, e.g. the `server_id` greeting.
    Untagged,
}

/// Decode one inbound frame.
pub fn decode(frame: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(frame)?;
    if value.get("msg").is_none() && value.is_object() {
        return Ok(Inbound::Untagged);
    }
    serde_json::from_value(value).map(Inbound::Message)
}
