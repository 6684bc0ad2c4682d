use std::sync::Arc;

use meetbot::media::webrtc::WebRtcEngine;
use meetbot::{JoinConfig, MeetingClient};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: meetbot <join-config.json>")?;
    let config = JoinConfig::load(&path)?;
    let listen_only = config.listen_only;

    println!("   Meeting bot");
    println!("   Config {}", path);
    println!("   Press Ctrl+C to leave\n");

    let engine = Arc::new(WebRtcEngine::new()?);
    let client = MeetingClient::join(config, engine).await?;

    let session = client.with_audio(listen_only).await?;
    if let Some(mut tracks) = session.take_tracks() {
        tokio::spawn(async move {
            while let Some(track) = tracks.recv().await {
                info!(target: "meetbot", kind = %track.kind(), ssrc = track.ssrc(), "receiving track");
                tokio::spawn(async move {
                    let mut packets: u64 = 0;
                    while let Ok((packet, _)) = track.read_rtp().await {
                        packets += 1;
                        if packets % 500 == 0 {
                            info!(target: "meetbot", ssrc = track.ssrc(), packets, seq = packet.header.sequence_number, "audio flowing");
                        }
                    }
                    info!(target: "meetbot", ssrc = track.ssrc(), packets, "track ended");
                });
            }
        });
    }

    if let Err(e) = session.connect().await {
        error!(target: "meetbot", "audio negotiation failed: {}", e);
        client.close().await;
        return Err(e.into());
    }
    info!(target: "meetbot", "joined with audio");

    tokio::select! {
        _ = client.wait() => info!(target: "meetbot", "meeting closed"),
        _ = tokio::signal::ctrl_c() => {
            info!(target: "meetbot", "leaving");
            client.close().await;
        }
    }
    Ok(())
}
