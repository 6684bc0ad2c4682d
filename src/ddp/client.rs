use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::collection::Collection;
use super::correlator::{Correlator, Shutdown};
use super::messages::{self, ClientMessage, Inbound, ServerMessage};
use crate::error::{Error, RemoteError, Result};
use crate::lifecycle::Lifecycle;
use crate::transport::{Connection, FrameSender, FrameStream};

/// Session lifecycle: `Disconnected -> Handshaking -> Ready -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    Ready,
    Closed,
}

struct Shared {
    sender: FrameSender,
    correlator: Correlator,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
    state: watch::Sender<SessionState>,
    session_id: Mutex<Option<String>>,
    handshake: Mutex<Option<oneshot::Sender<Result<String>>>>,
}

/// Pub/sub + RPC session over one persistent connection.
#[derive(Clone)]
pub struct DdpClient {
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
}

impl DdpClient {
    /// Open a WebSocket to `url` and complete the handshake.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(target: "meetbot.ddp", "Connecting to DDP at {}", url);
        let connection = Connection::connect(url).await?;
        Self::connect_with(connection).await
    }

    /// Complete the handshake over an already open connection.
    pub async fn connect_with(connection: Connection) -> Result<Self> {
        let frames = connection
            .frames()
            .ok_or_else(|| Error::InvalidState("connection frames already taken".to_string()))?;

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            sender: connection.sender(),
            correlator: Correlator::new(),
            collections: Mutex::new(HashMap::new()),
            state: watch::Sender::new(SessionState::Disconnected),
            session_id: Mutex::new(None),
            handshake: Mutex::new(Some(handshake_tx)),
        });
        let lifecycle = Lifecycle::new("ddp");

        {
            let shared = shared.clone();
            lifecycle.register("pending calls", move || async move {
                shared.shutdown(Shutdown::Closed);
                Ok::<_, Infallible>(())
            });
        }
        {
            let sender = connection.sender();
            lifecycle.register("connection", move || async move {
                sender.close();
                Ok::<_, Infallible>(())
            });
        }

        shared.state.send_replace(SessionState::Handshaking);
        let dispatch = tokio::spawn(dispatch_loop(shared.clone(), frames, lifecycle.clone()));
        lifecycle.register_task("dispatch", dispatch);

        let client = DdpClient { shared, lifecycle };

        info!(target: "meetbot.ddp", "Starting DDP session...");
        if let Err(e) = client.shared.send(&ClientMessage::connect()) {
            client.close().await;
            return Err(e);
        }

        let outcome = handshake_rx.await.unwrap_or(Err(Error::ConnectionLost));
        match outcome {
            Ok(session) => {
                info!(target: "meetbot.ddp", session = %session, "DDP session ready");
                Ok(client)
            }
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Invoke a server method and wait for its result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let call = self.shared.correlator.register()?;
        let msg = ClientMessage::Method {
            id: call.id.clone(),
            method: method.to_string(),
            params,
        };
        self.shared.send(&msg)?;
        call.wait().await
    }

    /// The mirror for `name`, created on first use.
    pub fn collection(&self, name: &str) -> Arc<Collection> {
        self.shared.collection(name)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Server-assigned session id from the handshake.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.shared.session_id).clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.correlator.pending()
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

impl Shared {
    fn send(&self, msg: &ClientMessage) -> Result<()> {
        let frame = serde_json::to_string(msg)?;
        debug!(target: "meetbot.ddp", "DDP >>> {}", frame);
        self.sender.send(frame)
    }

    fn collection(&self, name: &str) -> Arc<Collection> {
        lock(&self.collections)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new(name, self.sender.clone())))
            .clone()
    }

    fn collection_by_subscription(&self, subscription_id: &str) -> Option<Arc<Collection>> {
        lock(&self.collections)
            .values()
            .find(|c| c.subscription_id() == subscription_id)
            .cloned()
    }

    fn finish_handshake(&self, outcome: Result<String>) {
        if let Some(tx) = lock(&self.handshake).take() {
            let _ = tx.send(outcome);
        }
    }

    fn shutdown(&self, reason: Shutdown) {
        self.correlator.shutdown(reason);
        self.finish_handshake(Err(match reason {
            Shutdown::ConnectionLost => Error::ConnectionLost,
            Shutdown::Closed => Error::Closed,
        }));
        self.state.send_replace(SessionState::Closed);
    }

    async fn handle_frame(&self, frame: &str) {
        debug!(target: "meetbot.ddp", "DDP <<< {}", frame);

        let msg = match messages::decode(frame) {
            Ok(Inbound::Message(msg)) => msg,
            Ok(Inbound::Untagged) => {
                debug!(target: "meetbot.ddp", "ignoring frame without msg");
                return;
            }
            Err(e) => {
                let error = Error::UnexpectedFrame(e.to_string());
                if *self.state.borrow() == SessionState::Handshaking && is_handshake_reply(frame) {
                    error!(target: "meetbot.ddp", "malformed handshake reply: {}", error);
                    self.finish_handshake(Err(error));
                } else {
                    warn!(target: "meetbot.ddp", "{}", error);
                }
                return;
            }
        };

        match msg {
            ServerMessage::Connected { session } => {
                if *self.state.borrow() != SessionState::Handshaking {
                    warn!(target: "meetbot.ddp", "connected outside of handshake, ignoring");
                    return;
                }
                *lock(&self.session_id) = Some(session.clone());
                self.state.send_replace(SessionState::Ready);
                self.finish_handshake(Ok(session));
            }

            ServerMessage::Failed { version } => {
                if *self.state.borrow() != SessionState::Handshaking {
                    warn!(target: "meetbot.ddp", "failed outside of handshake, ignoring");
                    return;
                }
                error!(target: "meetbot.ddp", "DDP handshake failed!");
                let reason = match version {
                    Some(version) => format!("server requires protocol version {}", version),
                    None => "server rejected protocol version".to_string(),
                };
                self.finish_handshake(Err(Error::HandshakeFailed(reason)));
            }

            ServerMessage::Ping { id } => {
                if let Err(e) = self.send(&ClientMessage::Pong { id }) {
                    debug!(target: "meetbot.ddp", "pong not sent: {}", e);
                }
            }

            ServerMessage::Pong { .. } => {}

            ServerMessage::Result { id, result, error } => {
                if !self.correlator.resolve(&id, result, error) {
                    debug!(target: "meetbot.ddp", id = %id, "result for unknown call, dropping");
                }
            }

            ServerMessage::Updated { methods } => {
                debug!(target: "meetbot.ddp", ?methods, "methods updated");
            }

            ServerMessage::NoSub { id, error } => {
                let Some(collection) = self.collection_by_subscription(&id) else {
                    debug!(target: "meetbot.ddp", id = %id, "nosub for unknown subscription");
                    return;
                };
                if let Some(error) = error {
                    warn!(
                        target: "meetbot.ddp",
                        collection = %collection.name(),
                        "subscription ended with error: {}",
                        RemoteError::from_value(error)
                    );
                }
                collection.reset();
            }

            ServerMessage::Added {
                collection,
                id,
                fields,
            } => {
                self.collection(&collection).apply_added(id, fields).await;
            }

            ServerMessage::AddedBefore {
                collection,
                id,
                fields,
                ..
            } => {
                self.collection(&collection).apply_added(id, fields).await;
            }

            ServerMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => {
                self.collection(&collection)
                    .apply_changed(id, fields, cleared)
                    .await;
            }

            ServerMessage::Removed { collection, id } => {
                self.collection(&collection).apply_removed(id).await;
            }

            ServerMessage::MovedBefore {
                collection,
                id,
                before,
            } => {
                self.collection(&collection)
                    .apply_moved(&id, before.as_deref());
            }

            ServerMessage::Ready { subs } => {
                for id in subs {
                    if let Some(collection) = self.collection_by_subscription(&id) {
                        collection.mark_subscribed();
                    }
                }
            }

            ServerMessage::Unknown => {
                debug!(target: "meetbot.ddp", "ignoring unknown message kind");
            }
        }
    }
}

/// Whether a frame claims to be `connected` or `failed`.
fn is_handshake_reply(frame: &str) -> bool {
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|value| value.get("msg")?.as_str().map(str::to_owned))
        .is_some_and(|msg| msg == "connected" || msg == "failed")
}

async fn dispatch_loop(shared: Arc<Shared>, mut frames: FrameStream, lifecycle: Lifecycle) {
    while let Some(frame) = frames.next().await {
        shared.handle_frame(&frame).await;
    }

    if lifecycle.is_closing() {
        shared.shutdown(Shutdown::Closed);
        return;
    }

    info!(target: "meetbot.ddp", "DDP connection lost");
    shared.shutdown(Shutdown::ConnectionLost);
    lifecycle.close_in_background();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
