//! Headless meeting participant: pub/sub state sync over DDP and media
//! negotiation with a selective forwarding unit.

pub mod client;
pub mod config;
pub mod ddp;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod sfu;
pub mod transport;

pub use client::MeetingClient;
pub use config::JoinConfig;
pub use error::{Error, MediaError, Result};
