//! # Connection Manager
//!
//! Owns the one WebSocket the client talks through and keeps it alive. The
//! manager runs as a single task that cycles through
//! `Disconnected -> Connecting -> Connected -> Disconnected` until its
//! cancellation token fires.
//!
//! ## Responsibilities:
//!
//! - **Reconnect**: any read or write failure discards the socket. The
//!   post-disconnect hook runs, the reconnect delay elapses, and a fresh
//!   connection is dialled. The hook also runs once before the first dial.
//! - **Generations**: every successful connection is numbered from 1. When
//!   one ends, a [`Frame::Disconnected`] marker is queued behind the last
//!   frame its reader forwarded, so the consumer learns about the loss in
//!   socket order. Writes report the generation they went out on.
//! - **Handshake**: right after connecting, the post-connect hook may hand back
//!   a text payload (the authenticate request) which is written first.
//! - **Single writer**: outbound frames are queued as [`OutgoingFrame`]s and
//!   written by the control loop only, each with the write timeout applied and
//!   its outcome reported through a oneshot responder.
//! - **Reader per generation**: a spawned read task forwards text and binary
//!   frames, in arrival order, to one [`Frame`] stream. The read timeout is
//!   re-armed before every read; the task's exit ends the generation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Capacity of the inbound frame queue between the read task and its consumer.
const FRAME_QUEUE_CAPACITY: usize = 1024;

/// Failures of the transport. The manager recovers from all of them by
/// reconnecting; they only reach callers as the outcome of a write.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("connection manager is shut down")]
    Shutdown,
}

/// One entry of the inbound frame stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    /// Connection generation `n` is gone. Every frame read on it came before.
    Disconnected(u64),
}

/// Lifecycle callbacks invoked by the connection manager.
pub trait ConnectionHooks: Send + Sync + 'static {
    /// Called right after a connection is established. A returned payload is
    /// written to the socket before anything else.
    fn post_connect(&self) -> Option<String>;

    /// Called on the manager task before every connection attempt, including
    /// the first. Frames of the lost generation may still be queued.
    fn post_disconnect(&self);
}

/// Tunables of the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// A queued text frame and the channel its write outcome is reported on.
/// A successful write reports the generation it went out on.
pub struct OutgoingFrame {
    pub payload: String,
    pub responder: oneshot::Sender<Result<u64, ConnectionError>>,
}

/// Cloneable handle used to queue outbound frames.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<OutgoingFrame>,
}

impl ConnectionHandle {
    /// Queues a text frame and waits until it has been written or has failed.
    /// Returns the generation of the connection that carried it.
    ///
    /// While the manager is between connections the frame waits in the queue
    /// and is written once the next connection is up.
    pub async fn send_text(&self, payload: String) -> Result<u64, ConnectionError> {
        let (responder, outcome) = oneshot::channel();
        self.tx
            .send(OutgoingFrame { payload, responder })
            .map_err(|_| ConnectionError::Shutdown)?;
        outcome.await.map_err(|_| ConnectionError::Shutdown)?
    }
}

/// # Connection Manager
pub struct ConnectionManager {
    config: ConnectionConfig,
    hooks: Arc<dyn ConnectionHooks>,
    outgoing: mpsc::UnboundedReceiver<OutgoingFrame>,
    frames: mpsc::Sender<Frame>,
    generation: u64,
    token: CancellationToken,
}

impl ConnectionManager {
    /// Spawns the manager task.
    ///
    /// Returns the handle for outbound frames, the inbound frame stream and
    /// the task handle. The task ends when `token` is cancelled.
    pub fn spawn(
        config: ConnectionConfig,
        hooks: Arc<dyn ConnectionHooks>,
        token: CancellationToken,
    ) -> (ConnectionHandle, mpsc::Receiver<Frame>, JoinHandle<()>) {
        let (tx, outgoing) = mpsc::unbounded_channel();
        let (frames, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let manager = Self { config, hooks, outgoing, frames, generation: 0, token };
        let task = tokio::spawn(manager.run());
        (ConnectionHandle { tx }, frame_rx, task)
    }

    /// The connect / serve / reconnect loop.
    async fn run(mut self) {
        let mut first_attempt = true;

        loop {
            self.hooks.post_disconnect();

            if !first_attempt {
                log::debug!("Reconnecting in {}ms", self.config.reconnect_delay.as_millis());
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    _ = sleep(self.config.reconnect_delay) => {}
                }
            }
            first_attempt = false;

            log::info!("Connecting to SignalFlow: {}", self.config.url);
            let connected = tokio::select! {
                _ = self.token.cancelled() => break,
                res = connect_async(self.config.url.as_str()) => res,
            };

            let ws_stream = match connected {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    log::error!("Failed to connect to SignalFlow: {}", e);
                    continue;
                }
            };
            self.generation += 1;
            let generation = self.generation;
            log::info!("Connected to SignalFlow (generation {})", generation);

            let (mut write, read) = ws_stream.split();
            let reader = tokio::spawn(read_frames(read, self.frames.clone(), self.config.read_timeout));

            if self.serve(&mut write, reader, generation).await {
                break;
            }
            if !self.end_generation(generation).await {
                break;
            }
        }

        log::info!("Connection manager shut down");
    }

    /// Serves one connection generation. Returns `true` when the manager has
    /// been cancelled and must not reconnect.
    /// The reader has finished once this returns.
    async fn serve(&mut self, write: &mut WsWriter, mut reader: JoinHandle<ConnectionError>, generation: u64) -> bool {
        if let Some(handshake) = self.hooks.post_connect() {
            if let Err(e) = write_text(write, handshake, self.config.write_timeout).await {
                log::error!("Failed to send handshake: {}", e);
                stop_reader(reader).await;
                return false;
            }
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = timeout(self.config.write_timeout, write.close()).await;
                    reader.abort();
                    return true;
                }
                ended = &mut reader => {
                    match ended {
                        Ok(e) => log::warn!("SignalFlow connection lost: {}", e),
                        Err(e) => log::error!("SignalFlow read task failed: {}", e),
                    }
                    return false;
                }
                Some(frame) = self.outgoing.recv() => {
                    log::trace!("Sending upstream: {}", frame.payload);
                    match write_text(write, frame.payload, self.config.write_timeout).await {
                        Ok(()) => {
                            let _ = frame.responder.send(Ok(generation));
                        }
                        Err(e) => {
                            log::error!("Failed to write to SignalFlow: {}", e);
                            let _ = frame.responder.send(Err(e));
                            stop_reader(reader).await;
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Queues the marker for `generation` behind the frames its reader
    /// forwarded. Returns `false` if nobody consumes frames any more.
    async fn end_generation(&self, generation: u64) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = self.frames.send(Frame::Disconnected(generation)) => sent.is_ok(),
        }
    }
}

async fn write_text(write: &mut WsWriter, payload: String, limit: Duration) -> Result<(), ConnectionError> {
    match timeout(limit, write.send(WsMessage::Text(payload.into()))).await {
        Ok(res) => res.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::WriteTimeout(limit)),
    }
}

/// Force-closes the read side and waits for its task to unwind, so that two
/// generations never overlap.
async fn stop_reader(reader: JoinHandle<ConnectionError>) {
    reader.abort();
    let _ = reader.await;
}

/// Read task of one connection generation. Returns the reason it stopped.
async fn read_frames(mut read: WsReader, frames: mpsc::Sender<Frame>, read_timeout: Duration) -> ConnectionError {
    loop {
        let msg = match timeout(read_timeout, read.next()).await {
            Err(_) => return ConnectionError::ReadTimeout(read_timeout),
            Ok(None) => return ConnectionError::ClosedByPeer,
            Ok(Some(Err(e))) => return ConnectionError::WebSocket(e),
            Ok(Some(Ok(msg))) => msg,
        };

        let frame = match msg {
            WsMessage::Text(text) => {
                log::trace!("Received text frame: {} bytes", text.len());
                Frame::Text(Bytes::copy_from_slice(text.as_bytes()))
            }
            WsMessage::Binary(data) => {
                log::trace!("Received binary frame: {} bytes", data.len());
                Frame::Binary(data)
            }
            WsMessage::Close(_) => return ConnectionError::ClosedByPeer,
            // Pings are answered by tungstenite; any traffic re-arms the timeout.
            _ => continue,
        };

        if frames.send(frame).await.is_err() {
            return ConnectionError::Shutdown;
        }
    }
}
