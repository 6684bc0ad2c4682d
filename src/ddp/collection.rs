use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::messages::{ClientMessage, Document};
use crate::error::Result;
use crate::lifecycle::BoxError;
use crate::transport::FrameSender;

const SUBSCRIPTION_ID_CHARS: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTWXYZabcdefghijkmnopqrstuvwxyz";
const SUBSCRIPTION_ID_LEN: usize = 17;

/// One document-level change, as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub old: Option<Document>,
    pub new: Option<Document>,
}

type ChangeListener = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Apply a `changed` diff to a document.
pub fn merge(doc: &mut Document, fields: Option<Document>, cleared: &[String]) {
    if let Some(fields) = fields {
        doc.extend(fields);
    }
    for key in cleared {
        doc.remove(key);
    }
}

pub(crate) fn generate_subscription_id() -> String {
    let mut rng = rand::rng();
    (0..SUBSCRIPTION_ID_LEN)
        .map(|_| SUBSCRIPTION_ID_CHARS[rng.random_range(0..SUBSCRIPTION_ID_CHARS.len())] as char)
        .collect()
}

/// Client-side mirror of one named server collection.
///
/// Documents are only written by the owning session's dispatch loop.
pub struct Collection {
    name: String,
    subscription_id: String,
    sender: FrameSender,
    documents: Mutex<HashMap<String, Document>>,
    listeners: Mutex<Vec<ChangeListener>>,
    subscribed: watch::Sender<bool>,
}

impl Collection {
    pub(crate) fn new(name: impl Into<String>, sender: FrameSender) -> Self {
        Self {
            name: name.into(),
            subscription_id: generate_subscription_id(),
            sender,
            documents: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            subscribed: watch::Sender::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Ask the server to publish this collection.
    pub fn subscribe(&self, params: Vec<Value>) -> Result<String> {
        self.send(ClientMessage::Sub {
            id: self.subscription_id.clone(),
            name: self.name.clone(),
            params,
        })?;
        Ok(self.subscription_id.clone())
    }

    pub fn unsubscribe(&self) -> Result<()> {
        self.send(ClientMessage::Unsub {
            id: self.subscription_id.clone(),
        })
    }

    /// Register a listener invoked inline, in order, for every change.
    pub fn on_change<F, Fut>(&self, listener: F)
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener: ChangeListener = Arc::new(move |event| listener(event).boxed());
        lock(&self.listeners).push(listener);
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        lock(&self.documents).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.documents).is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Wait until the server has sent data or `ready` for this collection.
    pub async fn wait_subscribed(&self) {
        let mut rx = self.subscribed.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|subscribed| *subscribed).await;
    }

    pub(crate) async fn apply_added(&self, id: String, fields: Option<Document>) {
        self.mark_subscribed();
        let fields = fields.unwrap_or_default();
        let old = lock(&self.documents).insert(id.clone(), fields.clone());
        if old.is_some() {
            debug!(target: "meetbot.ddp", collection = %self.name, id = %id, "added replaced an existing document");
        }
        self.notify(ChangeEvent {
            id,
            old,
            new: Some(fields),
        })
        .await;
    }

    pub(crate) async fn apply_changed(
        &self,
        id: String,
        fields: Option<Document>,
        cleared: Option<Vec<String>>,
    ) {
        self.mark_subscribed();
        let change = {
            let mut documents = lock(&self.documents);
            documents.get_mut(&id).map(|doc| {
                let old = doc.clone();
                merge(doc, fields, cleared.as_deref().unwrap_or_default());
                (old, doc.clone())
            })
        };

        match change {
            Some((old, new)) => {
                self.notify(ChangeEvent {
                    id,
                    old: Some(old),
                    new: Some(new),
                })
                .await
            }
            None => warn!(target: "meetbot.ddp", collection = %self.name, id = %id, "changed for unknown document, dropping"),
        }
    }

    pub(crate) async fn apply_removed(&self, id: String) {
        self.mark_subscribed();
        let old = lock(&self.documents).remove(&id);
        match old {
            Some(old) => {
                self.notify(ChangeEvent {
                    id,
                    old: Some(old),
                    new: None,
                })
                .await
            }
            None => warn!(target: "meetbot.ddp", collection = %self.name, id = %id, "removed for unknown document, dropping"),
        }
    }

    /// Ordering is not tracked; a move only confirms the subscription.
    pub(crate) fn apply_moved(&self, id: &str, before: Option<&str>) {
        self.mark_subscribed();
        debug!(target: "meetbot.ddp", collection = %self.name, id = %id, before = ?before, "ignoring move");
    }

    /// Wipe all documents without per-document notifications.
    pub(crate) fn reset(&self) {
        lock(&self.documents).clear();
        self.subscribed.send_replace(false);
    }

    pub(crate) fn mark_subscribed(&self) {
        self.subscribed.send_replace(true);
    }

    async fn notify(&self, event: ChangeEvent) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            if let Err(e) = listener(event.clone()).await {
                warn!(target: "meetbot.ddp", collection = %self.name, id = %event.id, "change listener failed: {}", e);
            }
        }
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        let frame = serde_json::to_string(&msg)?;
        debug!(target: "meetbot.ddp", "DDP >>> {}", frame);
        self.sender.send(frame)
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("subscription_id", &self.subscription_id)
            .field("documents", &self.len())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
