//! Meeting client: one pub/sub session plus a lazily opened media channel.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::JoinConfig;
use crate::ddp::DdpClient;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::media::MediaEngine;
use crate::sfu::{MediaType, Role, RtcSession, SignalingChannel};
use crate::transport::Connection;

type Connector = Box<dyn Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync>;

pub struct MeetingClient<E: MediaEngine> {
    config: JoinConfig,
    engine: Arc<E>,
    ddp: DdpClient,
    sfu: Mutex<Option<Arc<SignalingChannel<E>>>>,
    sfu_connector: Connector,
    lifecycle: Lifecycle,
}

impl<E: MediaEngine> MeetingClient<E> {
    /// Connect to the meeting and authenticate the session.
    pub async fn join(config: JoinConfig, engine: Arc<E>) -> Result<Self> {
        let ddp_url = config.ddp_websocket_url()?;
        let sfu_url = config.sfu_websocket_url()?;

        info!(target: "meetbot.client", "Connecting to DDP...");
        let ddp = DdpClient::connect(&ddp_url).await?;

        let connector: Connector = Box::new(move || {
            let url = sfu_url.clone();
            async move { Connection::connect(&url).await }.boxed()
        });
        Self::authenticate(config, engine, ddp, connector).await
    }

    /// Join over already established transports.
    ///
    /// `sfu_connector` is invoked at most once, the first time media is
    /// requested.
    pub async fn join_with<F>(
        config: JoinConfig,
        engine: Arc<E>,
        ddp: Connection,
        sfu_connector: F,
    ) -> Result<Self>
    where
        F: Fn() -> BoxFuture<'static, Result<Connection>> + Send + Sync + 'static,
    {
        let ddp = DdpClient::connect_with(ddp).await?;
        Self::authenticate(config, engine, ddp, Box::new(sfu_connector)).await
    }

    async fn authenticate(
        config: JoinConfig,
        engine: Arc<E>,
        ddp: DdpClient,
        sfu_connector: Connector,
    ) -> Result<Self> {
        let lifecycle = Lifecycle::new("meeting");
        lifecycle.register_child(ddp.lifecycle());

        let client = Self {
            config,
            engine,
            ddp,
            sfu: Mutex::new(None),
            sfu_connector,
            lifecycle,
        };

        info!(target: "meetbot.client", "Authenticating Session ...");
        let auth = &client.config.auth;
        let params = vec![
            Value::from(auth.meeting_id.as_str()),
            Value::from(auth.internal_user_id.as_str()),
            Value::from(auth.auth_token.as_str()),
            Value::from(auth.extern_user_id.as_str()),
        ];
        if let Err(e) = client.ddp.call("validateAuthToken", params).await {
            client.close().await;
            return Err(e);
        }

        // Losing the pub/sub session ends the meeting.
        {
            let ddp = client.ddp.clone();
            let lifecycle = client.lifecycle.clone();
            let watcher = tokio::spawn(async move {
                ddp.wait_closed().await;
                lifecycle.close_in_background();
            });
            client.lifecycle.register_task("ddp watcher", watcher);
        }

        Ok(client)
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn ddp(&self) -> &DdpClient {
        &self.ddp
    }

    /// The media channel, opened on first use.
    pub async fn sfu(&self) -> Result<Arc<SignalingChannel<E>>> {
        let mut slot = self.sfu.lock().await;
        if let Some(sfu) = slot.as_ref() {
            return Ok(sfu.clone());
        }
        if self.lifecycle.is_closing() {
            return Err(Error::Closed);
        }

        info!(target: "meetbot.client", "Initializing SFU signaling ...");
        let connection = (self.sfu_connector)().await?;
        let sfu = Arc::new(SignalingChannel::connect_with(
            connection,
            self.engine.clone(),
            self.config.ice_servers(),
            self.config.sfu.clone(),
        )?);
        self.lifecycle.register_child(sfu.lifecycle());
        *slot = Some(sfu.clone());
        Ok(sfu)
    }

    /// Create an audio session; `listen_only` selects the receive-only role.
    ///
    /// The session is returned unstarted so tracks can be taken before
    /// [`RtcSession::connect`] is called.
    pub async fn with_audio(&self, listen_only: bool) -> Result<RtcSession<E>> {
        let role = if listen_only { Role::Recv } else { Role::SendRecv };
        self.sfu().await?.new_session(MediaType::Audio, role).await
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    /// Block until the meeting is closed.
    pub async fn wait(&self) {
        self.lifecycle.wait_closed().await;
    }
}
