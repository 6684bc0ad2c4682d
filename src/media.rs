//! Boundary to the external real-time media engine.
//!
//! The negotiation state machine only exchanges session descriptions and
//! listens to a fixed set of peer events; transport, ICE and codecs are the
//! engine's business.

#[cfg(feature = "webrtc")]
pub mod webrtc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MediaError;
use crate::sfu::IceServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a peer connection reports back.
#[derive(Debug)]
pub enum PeerEvent<T> {
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    Track(T),
}

pub type PeerEventSender<T> = mpsc::UnboundedSender<PeerEvent<T>>;

/// Factory for peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Inbound media track handed to the caller.
    type Track: Send + 'static;
    type Peer: PeerConnection;

    /// Create a peer; all of its events are delivered on `events`.
    async fn create_peer(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender<Self::Track>,
    ) -> Result<Self::Peer, MediaError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// The applied local description, including gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<(), MediaError>;
}
