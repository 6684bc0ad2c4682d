//! Media-server signaling and per-session negotiation.

mod channel;
mod messages;
mod session;
mod types;

pub use channel::{KEEPALIVE_INTERVAL, NEGOTIATION_TIMEOUT, SignalingChannel};
pub use messages::{ClientMessage, ServerMessage, StartResponse};
pub use session::RtcSession;
pub use types::{IceServerConfig, MediaType, NegotiationState, Role};
