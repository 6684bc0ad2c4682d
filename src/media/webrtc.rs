//! [`MediaEngine`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use super::{
    IceConnectionState, MediaEngine, PeerConnection, PeerConnectionState, PeerEvent,
    PeerEventSender, SdpType, SessionDescription,
};
use crate::error::MediaError;
use crate::sfu::IceServerConfig;

fn media_err(context: &str, e: webrtc::Error) -> MediaError {
    MediaError::new(format!("{}: {}", context, e))
}

/// Receives audio from the media server.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, MediaError> {
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| media_err("register codecs", e))?;

        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(|e| media_err("register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    type Track = Arc<TrackRemote>;
    type Peer = WebRtcPeer;

    async fn create_peer(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSender<Self::Track>,
    ) -> Result<WebRtcPeer, MediaError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: vec![s.url.clone()],
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| media_err("create peer connection", e))?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| media_err("add audio transceiver", e))?;

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = match state {
                RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                _ => PeerConnectionState::New,
            };
            let _ = tx.send(PeerEvent::ConnectionState(mapped));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let mapped = match state {
                RTCIceConnectionState::Checking => IceConnectionState::Checking,
                RTCIceConnectionState::Connected => IceConnectionState::Connected,
                RTCIceConnectionState::Completed => IceConnectionState::Completed,
                RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                RTCIceConnectionState::Failed => IceConnectionState::Failed,
                RTCIceConnectionState::Closed => IceConnectionState::Closed,
                _ => IceConnectionState::New,
            };
            let _ = tx.send(PeerEvent::IceConnectionState(mapped));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                debug!(target: "meetbot.media", kind = %track.kind(), codec = %track.codec().capability.mime_type, "remote track");
                let _ = tx.send(PeerEvent::Track(track));
                Box::pin(async {})
            },
        ));

        Ok(WebRtcPeer { pc })
    }
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| media_err("parse session description", e))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(MediaError::new(format!("unsupported sdp type {}", other))),
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| media_err("set remote description", e))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| media_err("create answer", e))?;
        from_rtc(answer)
    }

    /// Applies the description and waits for candidate gathering, so the
    /// next [`local_description`](PeerConnection::local_description) carries
    /// every candidate.
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| media_err("set local description", e))?;
        let _ = gathered.recv().await;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc(description).ok()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc
            .close()
            .await
            .map_err(|e| media_err("close peer connection", e))
    }
}
