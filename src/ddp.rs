//! Pub/sub + RPC client for meeting state synchronisation

mod client;
mod collection;
mod correlator;
mod messages;

pub use client::{DdpClient, SessionState};
pub use collection::{ChangeEvent, Collection, merge};
pub use messages::{ClientMessage, DDP_VERSION, Document, Inbound, ServerMessage, decode};
