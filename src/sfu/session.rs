use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::channel::ChannelShared;
use super::messages::{ClientMessage, StartResponse};
use super::types::{MediaType, NegotiationState, Role};
use crate::error::{Error, MediaError, Result};
use crate::lifecycle::Lifecycle;
use crate::media::{MediaEngine, PeerConnection, PeerConnectionState, PeerEvent, SessionDescription};

pub(crate) struct SessionInner<E: MediaEngine> {
    id: u32,
    media_type: MediaType,
    role: Role,
    peer: E::Peer,
    channel: Arc<ChannelShared<E>>,
    state: watch::Sender<NegotiationState>,
    result: Mutex<Option<oneshot::Sender<Result<()>>>>,
    tracks: Mutex<Option<mpsc::UnboundedReceiver<E::Track>>>,
    timeout: Duration,
    lifecycle: Lifecycle,
}

/// One real-time media session negotiated over the signaling channel.
pub struct RtcSession<E: MediaEngine> {
    inner: Arc<SessionInner<E>>,
}

impl<E: MediaEngine> Clone for RtcSession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: MediaEngine> RtcSession<E> {
    pub(crate) fn new(
        id: u32,
        media_type: MediaType,
        role: Role,
        peer: E::Peer,
        channel: Arc<ChannelShared<E>>,
        events: mpsc::UnboundedReceiver<PeerEvent<E::Track>>,
        timeout: Duration,
    ) -> Self {
        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        let lifecycle = Lifecycle::new(format!("sfu session {}", id));
        let inner = Arc::new(SessionInner {
            id,
            media_type,
            role,
            peer,
            channel,
            state: watch::Sender::new(NegotiationState::New),
            result: Mutex::new(None),
            tracks: Mutex::new(Some(tracks_rx)),
            timeout,
            lifecycle: lifecycle.clone(),
        });

        {
            let weak = Arc::downgrade(&inner);
            let channel = inner.channel.clone();
            lifecycle.register("negotiation", move || async move {
                channel.dequeue(weak.as_ptr());
                if let Some(inner) = weak.upgrade() {
                    inner.resolve(Err(Error::Closed));
                }
                Ok::<_, Infallible>(())
            });
        }

        let events = tokio::spawn(event_loop(Arc::downgrade(&inner), events, tracks_tx));
        lifecycle.register_task("peer events", events);

        {
            let weak = Arc::downgrade(&inner);
            lifecycle.register("peer", move || async move {
                match weak.upgrade() {
                    Some(inner) => inner.peer.close().await,
                    None => Ok::<_, MediaError>(()),
                }
            });
        }

        Self { inner }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn media_type(&self) -> MediaType {
        self.inner.media_type
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.inner.state.subscribe()
    }

    /// The media engine's peer behind this session.
    pub fn peer(&self) -> &E::Peer {
        &self.inner.peer
    }

    /// Inbound tracks, in arrival order. Only the first call returns the receiver.
    pub fn take_tracks(&self) -> Option<mpsc::UnboundedReceiver<E::Track>> {
        lock(&self.inner.tracks).take()
    }

    /// Run the negotiation and wait until the media connection is up.
    ///
    /// Fails with [`Error::NegotiationTimeout`] if no terminal state is
    /// reached in time; the session is closed on every failure.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.lifecycle.is_closing() {
            return Err(Error::Closed);
        }
        if !inner.advance(NegotiationState::Starting) {
            return Err(Error::InvalidState(format!(
                "connect called in state {:?}",
                self.state()
            )));
        }

        let (tx, rx) = oneshot::channel();
        *lock(&inner.result) = Some(tx);
        inner.channel.enqueue(inner.clone());

        let start = ClientMessage::Start {
            media_type: inner.media_type,
            role: inner.role,
            client_session_number: inner.id,
            extension: None,
            transparent_listen_only: false,
        };
        if let Err(e) = inner.channel.send(&start) {
            self.shut().await;
            return Err(e);
        }

        let outcome = match tokio::time::timeout(inner.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                warn!(target: "meetbot.sfu", session = inner.id, "negotiation timed out after {:?}", inner.timeout);
                Err(Error::NegotiationTimeout(inner.timeout))
            }
        };

        if outcome.is_err() {
            self.shut().await;
        }
        outcome
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub async fn close(&self) {
        self.inner.lifecycle.close().await;
    }

    pub async fn wait_closed(&self) {
        self.inner.lifecycle.wait_closed().await;
    }

    /// Close and wait, even if another task already started closing.
    async fn shut(&self) {
        self.inner.lifecycle.close().await;
        self.inner.lifecycle.wait_closed().await;
    }
}

impl<E: MediaEngine> SessionInner<E> {
    fn advance(&self, next: NegotiationState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_advance_to(next) {
                debug!(target: "meetbot.sfu", session = self.id, from = ?*state, to = ?next, "negotiation state");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn current(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn resolve(&self, outcome: Result<()>) {
        if let Some(tx) = lock(&self.result).take() {
            let _ = tx.send(outcome);
        }
    }

    /// Fail the negotiation and close the session.
    pub(crate) fn fail(&self, error: Error) {
        warn!(target: "meetbot.sfu", session = self.id, "negotiation failed: {}", error);
        self.advance(NegotiationState::Failed);
        self.resolve(Err(error));
        self.lifecycle.close_in_background();
    }

    pub(crate) async fn handle_start_response(&self, response: StartResponse) {
        if self.current() != NegotiationState::Starting {
            warn!(target: "meetbot.sfu", session = self.id, state = ?self.current(), "startResponse outside of negotiation, dropping");
            return;
        }
        if let Err(e) = self.accept(response).await {
            self.fail(e);
        }
    }

    async fn accept(&self, response: StartResponse) -> Result<()> {
        if !response.is_accepted() {
            let reason = response
                .message
                .or(response.response)
                .unwrap_or_else(|| "no response".to_string());
            return Err(Error::NegotiationFailed(format!("start rejected: {}", reason)));
        }
        if response.media_type.as_deref() != Some(self.media_type.as_str()) {
            return Err(Error::NegotiationFailed(format!(
                "startResponse type {:?} does not match {}",
                response.media_type, self.media_type
            )));
        }

        info!(target: "meetbot.sfu", session = self.id, "SFU accepted connection request");
        self.advance(NegotiationState::Accepted);

        let remote = response.sdp_answer.ok_or_else(|| {
            Error::NegotiationFailed("startResponse without sdpAnswer".to_string())
        })?;

        debug!(target: "meetbot.sfu", session = self.id, "Setting RTC remote description ...");
        self.peer
            .set_remote_description(SessionDescription::offer(remote))
            .await?;

        debug!(target: "meetbot.sfu", session = self.id, "Generating RTC answer ...");
        let answer = self.peer.create_answer().await?;

        debug!(target: "meetbot.sfu", session = self.id, "Setting RTC local description ...");
        self.peer.set_local_description(answer.clone()).await?;
        let local = self.peer.local_description().await.unwrap_or(answer);

        debug!(target: "meetbot.sfu", session = self.id, "Finishing SFU handshake ...");
        self.channel.send(&ClientMessage::SubscriberAnswer {
            media_type: self.media_type,
            role: self.role,
            sdp_offer: local.sdp,
        })
    }

    fn handle_peer_event(&self, event: PeerEvent<E::Track>, tracks: &mpsc::UnboundedSender<E::Track>) {
        match event {
            PeerEvent::Track(track) => {
                debug!(target: "meetbot.sfu", session = self.id, "New track");
                let _ = tracks.send(track);
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(target: "meetbot.sfu", session = self.id, ?state, "ICE connection state");
            }
            PeerEvent::ConnectionState(state) => {
                debug!(target: "meetbot.sfu", session = self.id, ?state, "RTC connection state");
                match state {
                    PeerConnectionState::Connected => {
                        if self.advance(NegotiationState::Connected) {
                            info!(target: "meetbot.sfu", session = self.id, "RTC connected");
                            self.resolve(Ok(()));
                        }
                    }
                    PeerConnectionState::Failed => {
                        if self.current() == NegotiationState::Accepted {
                            self.fail(Error::NegotiationFailed("RTC connection failed".to_string()));
                        } else {
                            warn!(target: "meetbot.sfu", session = self.id, "RTC connection failed, closing session");
                            self.lifecycle.close_in_background();
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn event_loop<E: MediaEngine>(
    session: Weak<SessionInner<E>>,
    mut events: mpsc::UnboundedReceiver<PeerEvent<E::Track>>,
    tracks: mpsc::UnboundedSender<E::Track>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_peer_event(event, &tracks);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
