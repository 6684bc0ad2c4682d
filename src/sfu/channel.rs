use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::session::{RtcSession, SessionInner};
use super::types::{IceServerConfig, MediaType, Role};
use crate::config::SfuOptions;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::media::MediaEngine;
use crate::transport::{Connection, FrameSender, FrameStream};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// State shared between the channel and its sessions.
pub(crate) struct ChannelShared<E: MediaEngine> {
    sender: FrameSender,
    /// Sessions that sent `start` and still wait for `startResponse`, oldest first.
    awaiting: Mutex<VecDeque<Arc<SessionInner<E>>>>,
}

impl<E: MediaEngine> ChannelShared<E> {
    pub(crate) fn send(&self, msg: &ClientMessage) -> Result<()> {
        send(&self.sender, msg)
    }

    pub(crate) fn enqueue(&self, session: Arc<SessionInner<E>>) {
        lock(&self.awaiting).push_back(session);
    }

    pub(crate) fn dequeue(&self, session: *const SessionInner<E>) {
        lock(&self.awaiting).retain(|s| !std::ptr::eq(Arc::as_ptr(s), session));
    }

    fn fail_awaiting(&self, reason: fn() -> Error) {
        let sessions: Vec<_> = lock(&self.awaiting).drain(..).collect();
        for session in sessions {
            session.fail(reason());
        }
    }

    async fn handle_frame(&self, frame: &str) {
        debug!(target: "meetbot.sfu", "SFU <<< {}", frame);

        let value: Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "meetbot.sfu", "{}", Error::UnexpectedFrame(e.to_string()));
                return;
            }
        };
        let is_start_response = value.get("id").and_then(Value::as_str) == Some("startResponse");

        let msg: ServerMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(e) if is_start_response => {
                // The reply cannot be used, but it still answers the oldest request.
                let session = lock(&self.awaiting).pop_front();
                match session {
                    Some(session) => session.fail(Error::UnexpectedFrame(e.to_string())),
                    None => warn!(target: "meetbot.sfu", "malformed startResponse with no negotiation awaiting: {}", e),
                }
                return;
            }
            Err(e) => {
                warn!(target: "meetbot.sfu", "{}", Error::UnexpectedFrame(e.to_string()));
                return;
            }
        };

        match msg {
            ServerMessage::Pong => {}
            ServerMessage::StartResponse(response) => {
                // The protocol does not echo a session number, so responses
                // are matched to requests in the order they were sent.
                let session = lock(&self.awaiting).pop_front();
                match session {
                    Some(session) => session.handle_start_response(response).await,
                    None => {
                        warn!(target: "meetbot.sfu", "startResponse with no negotiation awaiting, dropping")
                    }
                }
            }
            ServerMessage::Unknown => {
                debug!(target: "meetbot.sfu", "ignoring unknown message");
            }
        }
    }
}

/// Signaling connection to the media server.
pub struct SignalingChannel<E: MediaEngine> {
    shared: Arc<ChannelShared<E>>,
    engine: Arc<E>,
    ice_servers: Vec<IceServerConfig>,
    options: SfuOptions,
    next_session_id: AtomicU32,
    lifecycle: Lifecycle,
}

impl<E: MediaEngine> SignalingChannel<E> {
    pub async fn connect(
        url: &str,
        engine: Arc<E>,
        ice_servers: Vec<IceServerConfig>,
        options: SfuOptions,
    ) -> Result<Self> {
        info!(target: "meetbot.sfu", "Connecting to SFU socket ...");
        let connection = Connection::connect(url).await?;
        let channel = Self::connect_with(connection, engine, ice_servers, options)?;
        info!(target: "meetbot.sfu", "SFU connected");
        Ok(channel)
    }

    /// Start the dispatch and keepalive loops over an open connection.
    pub fn connect_with(
        connection: Connection,
        engine: Arc<E>,
        ice_servers: Vec<IceServerConfig>,
        options: SfuOptions,
    ) -> Result<Self> {
        let frames = connection
            .frames()
            .ok_or_else(|| Error::InvalidState("connection frames already taken".to_string()))?;

        let shared = Arc::new(ChannelShared {
            sender: connection.sender(),
            awaiting: Mutex::new(VecDeque::new()),
        });
        let lifecycle = Lifecycle::new("sfu");

        {
            let sender = connection.sender();
            lifecycle.register("connection", move || async move {
                sender.close();
                Ok::<_, Infallible>(())
            });
        }
        {
            let shared = shared.clone();
            lifecycle.register("negotiations", move || async move {
                shared.fail_awaiting(|| Error::Closed);
                Ok::<_, Infallible>(())
            });
        }

        let keepalive = tokio::spawn(keepalive_loop(
            connection.sender(),
            options.keepalive_interval(),
        ));
        lifecycle.register_task("keepalive", keepalive);

        let dispatch = tokio::spawn(dispatch_loop(shared.clone(), frames, lifecycle.clone()));
        lifecycle.register_task("dispatch", dispatch);

        Ok(Self {
            shared,
            engine,
            ice_servers,
            options,
            next_session_id: AtomicU32::new(0),
            lifecycle,
        })
    }

    pub fn ice_servers(&self) -> &[IceServerConfig] {
        &self.ice_servers
    }

    /// Create a negotiation session; call [`RtcSession::connect`] to start it.
    pub async fn new_session(&self, media_type: MediaType, role: Role) -> Result<RtcSession<E>> {
        if self.lifecycle.is_closing() {
            return Err(Error::Closed);
        }

        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = self.engine.create_peer(&self.ice_servers, events_tx).await?;

        let session = RtcSession::new(
            id,
            media_type,
            role,
            peer,
            self.shared.clone(),
            events_rx,
            self.options.negotiation_timeout(),
        );
        self.lifecycle.register_child(session.lifecycle());
        debug!(target: "meetbot.sfu", session = id, %media_type, %role, teardowns = self.lifecycle.pending_teardowns(), "session created");
        Ok(session)
    }

    /// Number of sessions still waiting for a `startResponse`.
    pub fn awaiting_responses(&self) -> usize {
        lock(&self.shared.awaiting).len()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    pub async fn wait_closed(&self) {
        self.lifecycle.wait_closed().await;
    }
}

fn send(sender: &FrameSender, msg: &ClientMessage) -> Result<()> {
    let frame = serde_json::to_string(msg)?;
    debug!(target: "meetbot.sfu", "SFU >>> {}", frame);
    sender.send(frame)
}

async fn keepalive_loop(sender: FrameSender, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = sender.closed() => break,

            _ = interval.tick() => {
                if let Err(e) = send(&sender, &ClientMessage::Ping) {
                    debug!(target: "meetbot.sfu", "keepalive stopped: {}", e);
                    break;
                }
            }
        }
    }
}

async fn dispatch_loop<E: MediaEngine>(
    shared: Arc<ChannelShared<E>>,
    mut frames: FrameStream,
    lifecycle: Lifecycle,
) {
    while let Some(frame) = frames.next().await {
        shared.handle_frame(&frame).await;
    }

    if lifecycle.is_closing() {
        shared.fail_awaiting(|| Error::Closed);
        return;
    }

    info!(target: "meetbot.sfu", "SFU connection lost");
    shared.fail_awaiting(|| Error::ConnectionLost);
    lifecycle.close_in_background();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{Behavior, MockEngine};
    use crate::sfu::NegotiationState;
    use serde_json::{Value, json};

    struct Harness {
        channel: SignalingChannel<MockEngine>,
        engine: Arc<MockEngine>,
        outbound: mpsc::UnboundedReceiver<String>,
        inbound: mpsc::UnboundedSender<String>,
    }

    impl Harness {
        fn new(behavior: Behavior) -> Self {
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let (inbound, in_rx) = mpsc::unbounded_channel();
            let engine = Arc::new(MockEngine::new(behavior));
            let channel = SignalingChannel::connect_with(
                Connection::from_channels(out_tx, in_rx),
                engine.clone(),
                vec![IceServerConfig::new("stun:stun.example.com")],
                SfuOptions::default(),
            )
            .unwrap();
            Self {
                channel,
                engine,
                outbound,
                inbound,
            }
        }

        fn send(&self, value: Value) {
            self.inbound.send(value.to_string()).unwrap();
        }

        /// Next non-ping frame sent by the client.
        async fn recv(&mut self) -> Value {
            loop {
                let frame = self.outbound.recv().await.expect("client hung up");
                let value: Value = serde_json::from_str(&frame).unwrap();
                if value["id"] != "ping" {
                    return value;
                }
            }
        }

        fn drain_pings(&mut self) -> usize {
            let mut pings = 0;
            while let Ok(frame) = self.outbound.try_recv() {
                let value: Value = serde_json::from_str(&frame).unwrap();
                assert_eq!(value["id"], "ping");
                pings += 1;
            }
            pings
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn accepted(sdp: &str) -> Value {
        json!({"id": "startResponse", "type": "audio", "role": "recv", "response": "accepted", "sdpAnswer": sdp})
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_sends_one_ping_per_interval_and_stops_on_close() {
        let mut harness = Harness::new(Behavior::default());

        settle().await;
        assert_eq!(harness.drain_pings(), 1);

        tokio::time::advance(KEEPALIVE_INTERVAL).await;
        settle().await;
        assert_eq!(harness.drain_pings(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(harness.drain_pings(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(harness.drain_pings(), 1);

        harness.channel.close().await;
        tokio::time::advance(KEEPALIVE_INTERVAL * 3).await;
        settle().await;
        assert_eq!(harness.drain_pings(), 0);
    }

    #[tokio::test]
    async fn session_ids_are_sequential() {
        let harness = Harness::new(Behavior::default());
        let a = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();
        let b = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }

    #[tokio::test]
    async fn start_response_goes_to_oldest_awaiting_session() {
        let mut harness = Harness::new(Behavior::default());
        let first = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();
        let second = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();

        let first_connect = {
            let first = first.clone();
            tokio::spawn(async move { first.connect().await })
        };
        assert_eq!(harness.recv().await["clientSessionNumber"], 1);

        let second_connect = {
            let second = second.clone();
            tokio::spawn(async move { second.connect().await })
        };
        assert_eq!(harness.recv().await["clientSessionNumber"], 2);
        assert_eq!(harness.channel.awaiting_responses(), 2);

        harness.send(accepted("offer-1"));
        let answer = harness.recv().await;
        assert_eq!(answer["id"], "subscriberAnswer");
        assert_eq!(answer["sdpOffer"], "answer-to:offer-1");

        assert_eq!(first.state(), NegotiationState::Accepted);
        assert_eq!(second.state(), NegotiationState::Starting);
        assert_eq!(
            harness.engine.peer(0).remote.lock().unwrap().as_ref().map(|d| d.sdp.clone()),
            Some("offer-1".to_string())
        );
        assert!(harness.engine.peer(1).remote.lock().unwrap().is_none());

        harness.channel.close().await;
        assert!(first_connect.await.unwrap().is_err());
        assert!(second_connect.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn stray_start_response_is_dropped() {
        let harness = Harness::new(Behavior::default());
        harness.send(accepted("orphan"));
        harness.send(json!({"id": "pong"}));
        harness.send(json!({"id": "somethingElse"}));
        settle().await;
        assert!(!harness.channel.lifecycle().is_closing());
    }

    #[tokio::test]
    async fn connection_loss_fails_awaiting_negotiations() {
        let mut harness = Harness::new(Behavior::default());
        let session = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();
        let connect = {
            let session = session.clone();
            tokio::spawn(async move { session.connect().await })
        };
        harness.recv().await;

        drop(harness.inbound);

        assert!(matches!(connect.await.unwrap(), Err(Error::ConnectionLost)));
        tokio::time::timeout(Duration::from_secs(1), harness.channel.wait_closed())
            .await
            .unwrap();
        session.wait_closed().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn closing_channel_closes_sessions() {
        let harness = Harness::new(Behavior::default());
        let session = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();

        harness.channel.close().await;

        assert!(session.is_closed());
        assert!(harness.engine.peer(0).is_closed());
        assert!(matches!(
            harness.channel.new_session(MediaType::Audio, Role::Recv).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn closed_sessions_are_released_by_the_channel() {
        let harness = Harness::new(Behavior::default());
        let base = harness.channel.lifecycle().pending_teardowns();

        for _ in 0..5 {
            let session = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();
            session.close().await;
        }
        let live = harness.channel.new_session(MediaType::Audio, Role::Recv).await.unwrap();

        assert_eq!(harness.channel.lifecycle().pending_teardowns(), base + 1);

        harness.channel.close().await;
        assert!(live.is_closed());
    }
}
