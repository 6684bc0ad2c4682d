//! Teardown aggregation shared by every long-lived component.
//!
//! A [`Lifecycle`] collects teardown actions and runs them once, in
//! registration order, when the owning component closes. Failures are
//! logged and never abort the rest of the cascade.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

struct Entry {
    label: String,
    /// Set for chained groups, so closed ones can be dropped early.
    child: Option<Lifecycle>,
    action: Teardown,
}

#[derive(Default)]
struct Teardowns {
    closing: bool,
    actions: Vec<Entry>,
}

struct Inner {
    name: String,
    teardowns: Mutex<Teardowns>,
    closed: CancellationToken,
}

/// Cloneable handle to a group of teardown actions.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                teardowns: Mutex::new(Teardowns::default()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a teardown action.
    ///
    /// Registering on a group that is already closing runs the action
    /// right away on a separate task.
    pub fn register<F, Fut, E>(&self, label: impl Into<String>, teardown: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let action: Teardown =
            Box::new(move || async move { teardown().await.map_err(Into::into) }.boxed());
        self.push(Entry {
            label: label.into(),
            child: None,
            action,
        });
    }

    /// Abort a background task when the group closes.
    pub fn register_task(&self, label: impl Into<String>, task: JoinHandle<()>) {
        self.register(label, move || async move {
            task.abort();
            Ok::<_, std::convert::Infallible>(())
        });
    }

    /// Chain another group so that closing this one closes it too.
    ///
    /// Children that have already closed are released on the next
    /// registration.
    pub fn register_child(&self, child: &Lifecycle) {
        let closing = child.clone();
        let action: Teardown = Box::new(move || {
            async move {
                closing.close().await;
                Ok(())
            }
            .boxed()
        });
        self.push(Entry {
            label: child.inner.name.clone(),
            child: Some(child.clone()),
            action,
        });
    }

    fn push(&self, entry: Entry) {
        let mut teardowns = self.lock();
        if !teardowns.closing {
            teardowns
                .actions
                .retain(|e| !e.child.as_ref().is_some_and(Lifecycle::is_closed));
            teardowns.actions.push(entry);
            return;
        }
        drop(teardowns);

        let Entry { label, action, .. } = entry;
        debug!(target: "meetbot.lifecycle", group = %self.inner.name, teardown = %label, "group already closing, running teardown now");
        let group = self.inner.name.clone();
        tokio::spawn(async move {
            if let Err(e) = action().await {
                warn!(target: "meetbot.lifecycle", group = %group, teardown = %label, "teardown failed: {}", e);
            }
        });
    }

    /// Number of teardowns still waiting for `close`.
    pub fn pending_teardowns(&self) -> usize {
        self.lock().actions.len()
    }

    /// Run every registered teardown in order, then mark the group closed.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) {
        let actions = {
            let mut teardowns = self.lock();
            if teardowns.closing {
                return;
            }
            teardowns.closing = true;
            std::mem::take(&mut teardowns.actions)
        };

        debug!(target: "meetbot.lifecycle", group = %self.inner.name, count = actions.len(), "closing");
        for Entry { label, action, .. } in actions {
            if let Err(e) = action().await {
                warn!(target: "meetbot.lifecycle", group = %self.inner.name, teardown = %label, "teardown failed: {}", e);
            }
        }
        self.inner.closed.cancel();
    }

    /// Close from a task that may itself be aborted by one of the teardowns.
    pub fn close_in_background(&self) {
        let lifecycle = self.clone();
        tokio::spawn(async move { lifecycle.close().await });
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Suspend until [`close`](Self::close) has completed.
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Teardowns> {
        self.inner
            .teardowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
