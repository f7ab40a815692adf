//! # SignalFlow Client
//!
//! One client owns one WebSocket connection and multiplexes any number of
//! computations over it, one channel each.
//!
//! ## Task layout:
//!
//! - **Connection manager**: dials, authenticates, reconnects and is the only
//!   writer on the socket.
//! - **Dispatcher**: decodes inbound frames and hands each message to the
//!   channel it names.
//! - **Watch loop** (one per computation): folds its channel's messages into
//!   the computation's state.
//!
//! Every task hangs off the client's cancellation token, so [`Client::close`]
//! or dropping the last handle tears everything down.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::computation::Computation;
use crate::core::{
    ChannelSequence, CloseReason, ConnectionConfig, ConnectionHandle, ConnectionHooks, ConnectionManager, Dispatcher,
    Registry,
};
use crate::error::ClientError;
use crate::messages::requests::Request;
use crate::messages::{AuthenticateRequest, DetachRequest, ExecuteRequest, StopRequest};
use crate::options::ClientOptions;

/// Connection hooks of a client. Authentication goes first on every
/// connection. Channels are closed by the dispatcher when it reaches the
/// disconnect marker, not here.
struct ClientHooks {
    registry: Arc<Registry>,
    handshake: Option<String>,
}

impl ConnectionHooks for ClientHooks {
    fn post_connect(&self) -> Option<String> {
        self.handshake.clone()
    }

    fn post_disconnect(&self) {
        log::debug!("SignalFlow connection down; {} channel(s) registered", self.registry.len());
    }
}

struct ClientInner {
    registry: Arc<Registry>,
    connection: ConnectionHandle,
    sequence: ChannelSequence,
    metadata_timeout: Duration,
    token: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.token.cancel();
        self.registry.close_all(CloseReason::ClientClosed);
    }
}

/// Handle to a SignalFlow connection. Clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Validates `options` and starts the connection in the background.
    ///
    /// Must be called from within a Tokio runtime. The first connection
    /// attempt is made right away; requests issued before it is up wait in
    /// the outbound queue.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let url = options.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClientError::NoRuntime);
        }

        let handshake = if options.access_token.is_empty() {
            log::warn!("No access token configured; connecting without authenticating");
            None
        } else {
            let auth = AuthenticateRequest {
                token: options.access_token.clone(),
                user_agent: Some(options.user_agent.clone()).filter(|ua| !ua.is_empty()),
            };
            Some(Request::Authenticate(&auth).to_json()?)
        };

        let token = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let hooks = Arc::new(ClientHooks { registry: Arc::clone(&registry), handshake });
        let config = ConnectionConfig {
            url: url.to_string(),
            reconnect_delay: options.reconnect_delay,
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        };

        let (connection, frames, _manager) = ConnectionManager::spawn(config, hooks, token.clone());
        tokio::spawn(Dispatcher::new(Arc::clone(&registry), token.clone()).run(frames));
        log::debug!("SignalFlow client started for {}", url);

        Ok(Self {
            inner: Arc::new(ClientInner {
                registry,
                connection,
                sequence: ChannelSequence::default(),
                metadata_timeout: options.metadata_timeout,
                token,
            }),
        })
    }

    /// Starts a computation.
    ///
    /// A channel name is generated when the request carries none. The channel
    /// is registered before the request is written, so no early message can
    /// miss it; it is released again if the write fails. Once written, the
    /// channel lives as long as the connection that carried the request.
    pub async fn execute(&self, mut request: ExecuteRequest) -> Result<Computation, ClientError> {
        self.ensure_open()?;

        let name = match &request.channel {
            Some(name) => name.clone(),
            None => {
                let name = self.inner.sequence.next_name();
                request.channel = Some(name.clone());
                name
            }
        };
        let (channel, messages) = self
            .inner
            .registry
            .register(&name, &self.inner.token)
            .ok_or_else(|| ClientError::ChannelInUse(name.clone()))?;

        let generation = match self.send(Request::Execute(&request)).await {
            Ok(generation) => generation,
            Err(e) => {
                self.inner.registry.unregister(&channel, CloseReason::Finished);
                return Err(e);
            }
        };
        if self.inner.registry.bind(&channel, generation) {
            log::info!("Started computation on channel '{}'", name);
        } else {
            log::warn!("Connection lost right after starting computation on channel '{}'", name);
        }

        Ok(Computation::start(
            self.clone(),
            Arc::clone(&self.inner.registry),
            channel,
            messages,
            &self.inner.token,
            self.inner.metadata_timeout,
        ))
    }

    /// Asks SignalFlow to stop a job. Returns once the request is written.
    pub async fn stop(&self, request: StopRequest) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.send(Request::Stop(&request)).await?;
        log::info!("Requested stop of job {}", request.handle);
        Ok(())
    }

    /// Stops routing a channel's messages. The job itself keeps running.
    pub async fn detach(&self, request: DetachRequest) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.send(Request::Detach(&request)).await?;
        if let Some(channel) = self.inner.registry.get(&request.channel) {
            self.inner.registry.unregister(&channel, CloseReason::Detached);
        }
        log::info!("Detached from channel '{}'", request.channel);
        Ok(())
    }

    /// Shuts the client down. Every computation ends and all later requests
    /// fail with [`ClientError::Closed`]. Does not wait for the socket to close.
    pub fn close(&self) {
        if self.inner.token.is_cancelled() {
            return;
        }
        self.inner.token.cancel();
        let closed = self.inner.registry.close_all(CloseReason::ClientClosed);
        log::info!("SignalFlow client closed ({} channel(s) released)", closed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Writes `request` and returns the connection generation it went out on.
    async fn send(&self, request: Request<'_>) -> Result<u64, ClientError> {
        let payload = request.to_json()?;
        tokio::select! {
            _ = self.inner.token.cancelled() => Err(ClientError::Closed),
            sent = self.inner.connection.send_text(payload) => sent.map_err(ClientError::from),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("channels", &self.inner.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_outside_a_runtime_fails_cleanly() {
        assert!(matches!(Client::new(ClientOptions::new()), Err(ClientError::NoRuntime)));
    }

    #[test]
    fn bad_options_fail_before_anything_starts() {
        let options = ClientOptions::new().with_stream_url("http://localhost:1");
        assert!(matches!(Client::new(options), Err(ClientError::Options(_))));
    }

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        // Nothing listens here; the manager just keeps retrying in the background.
        let options = ClientOptions::new()
            .with_stream_url("ws://127.0.0.1:9")
            .with_reconnect_delay(Duration::from_millis(10));
        let client = Client::new(options).unwrap();
        let other = client.clone();

        client.close();
        assert!(other.is_closed());
        assert!(matches!(other.execute(ExecuteRequest::new("data('x').publish()")).await, Err(ClientError::Closed)));
        assert!(matches!(other.stop(StopRequest::new("h")).await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn explicit_channel_names_are_exclusive() {
        let options = ClientOptions::new().with_stream_url("ws://127.0.0.1:9");
        let client = Client::new(options).unwrap();
        let _held = client.inner.registry.register("mine", &client.inner.token).unwrap();

        let result = client.execute(ExecuteRequest::new("data('x').publish()").with_channel("mine")).await;
        assert!(matches!(result, Err(ClientError::ChannelInUse(name)) if name == "mine"));
        client.close();
    }
}
