//! # Mock SignalFlow Server
//!
//! An in-process WebSocket server speaking just enough of the SignalFlow
//! protocol for end-to-end tests of `lib_signalflow`. It records every request
//! the client sends and lets the test push arbitrary frames to the currently
//! connected client, or drop that connection to force a reconnect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::protocol::Message as WsMessage};

use lib_signalflow::messages::binary::encode_data_frame;
use lib_signalflow::{DataPayload, DataValue, Tsid};

/// How long helpers wait for the client before failing the test.
pub const WAIT: Duration = Duration::from_secs(5);

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Drop,
}

pub struct MockServer {
    url: String,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    connections: watch::Receiver<usize>,
    requests: mpsc::UnboundedReceiver<Value>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Binds to an ephemeral localhost port and starts accepting connections.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/v2/signalflow/connect", listener.local_addr()?);
        let current = Arc::new(Mutex::new(None));
        let (connections_tx, connections) = watch::channel(0usize);
        let (requests_tx, requests) = mpsc::unbounded_channel();

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&current), connections_tx, requests_tx));

        Ok(Self { url, current, connections, requests, task })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Waits until at least `count` connections have been accepted in total.
    pub async fn wait_for_connections(&mut self, count: usize) -> Result<()> {
        timeout(WAIT, self.connections.wait_for(|n| *n >= count))
            .await
            .context("timed out waiting for a client connection")?
            .map_err(|_| anyhow!("server stopped"))?;
        Ok(())
    }

    /// Next JSON request received from the client, on any connection.
    pub async fn next_request(&mut self) -> Result<Value> {
        timeout(WAIT, self.requests.recv())
            .await
            .context("timed out waiting for a client request")?
            .context("server stopped")
    }

    /// Next request whose `type` is `kind`, skipping others.
    pub async fn next_request_of(&mut self, kind: &str) -> Result<Value> {
        loop {
            let request = self.next_request().await?;
            if request["type"] == kind {
                return Ok(request);
            }
        }
    }

    /// Asserts that no request shows up within `quiet`.
    pub async fn expect_no_request(&mut self, quiet: Duration) -> Result<()> {
        match timeout(quiet, self.requests.recv()).await {
            Ok(Some(request)) => Err(anyhow!("unexpected request: {}", request)),
            _ => Ok(()),
        }
    }

    pub fn send_json(&self, value: Value) -> Result<()> {
        self.push(Outbound::Text(value.to_string()))
    }

    pub fn send_binary(&self, frame: Vec<u8>) -> Result<()> {
        self.push(Outbound::Binary(frame))
    }

    /// Drops the current connection without a close handshake.
    pub fn drop_connection(&self) -> Result<()> {
        self.push(Outbound::Drop)?;
        self.lock_current().take();
        Ok(())
    }

    fn push(&self, frame: Outbound) -> Result<()> {
        self.lock_current()
            .as_ref()
            .context("no client connected")?
            .send(frame)
            .map_err(|_| anyhow!("client connection already gone"))
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Outbound>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    connections: watch::Sender<usize>,
    requests: mpsc::UnboundedSender<Value>,
) {
    let mut handlers = Vec::new();
    while let Ok((stream, _)) = listener.accept().await {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("Mock server handshake failed: {}", e);
                continue;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        *current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        connections.send_modify(|n| *n += 1);
        handlers.push(tokio::spawn(serve_connection(ws, rx, requests.clone())));
    }
    for handler in handlers {
        handler.abort();
    }
}

async fn serve_connection(
    ws: WebSocketStream<TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    requests: mpsc::UnboundedSender<Value>,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<Value>(text.as_str()) {
                        Ok(request) => {
                            let _ = requests.send(request);
                        }
                        Err(e) => log::warn!("Mock server got non-JSON text: {}", e),
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            frame = outbound.recv() => {
                let sent = match frame {
                    Some(Outbound::Text(text)) => write.send(WsMessage::Text(text.into())).await,
                    Some(Outbound::Binary(data)) => write.send(WsMessage::Binary(data.into())).await,
                    Some(Outbound::Drop) | None => break,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

// --- Message builders ---

pub fn authenticated() -> Value {
    json!({ "type": "authenticated", "orgId": "org-1", "userId": "user-1" })
}

pub fn job_start(channel: &str, handle: &str) -> Value {
    json!({ "type": "control-message", "channel": channel, "event": "JOB_START", "handle": handle, "timestampMs": 1_700_000_000_000i64 })
}

pub fn end_of_channel(channel: &str) -> Value {
    json!({ "type": "control-message", "channel": channel, "event": "END_OF_CHANNEL", "timestampMs": 1_700_000_060_000i64 })
}

pub fn info(channel: &str, code: &str, contents: Value) -> Value {
    json!({
        "type": "message",
        "channel": channel,
        "logicalTimestampMs": 1_700_000_000_000i64,
        "message": { "messageCode": code, "messageLevel": "INFO", "timestampMs": 1_700_000_000_000i64, "contents": contents }
    })
}

pub fn metadata(channel: &str, tsid: Tsid, metric: &str, host: &str) -> Value {
    json!({
        "type": "metadata",
        "channel": channel,
        "tsId": tsid.to_string(),
        "properties": { "sf_metric": metric, "host": host, "sf_type": "MetricTimeSeries" }
    })
}

pub fn expired(channel: &str, tsid: Tsid) -> Value {
    json!({ "type": "expired-tsid", "channel": channel, "tsId": tsid.to_string() })
}

pub fn job_error(channel: &str, code: i64, message: &str, error_type: &str) -> Value {
    json!({ "type": "error", "channel": channel, "error": code, "message": message, "errorType": error_type })
}

pub fn event(channel: &str, tsid: Tsid, timestamp_ms: i64, properties: Value) -> Value {
    json!({
        "type": "event",
        "channel": channel,
        "tsId": tsid.to_string(),
        "timestampMs": timestamp_ms,
        "metadata": { "sf_eventType": "deploy" },
        "properties": properties
    })
}

/// A binary data frame with one float value per series.
pub fn float_batch(channel: &str, timestamp_ms: i64, points: &[(Tsid, f64)], compress: bool) -> Result<Vec<u8>> {
    let payloads: Vec<DataPayload> = points
        .iter()
        .map(|(tsid, value)| DataPayload::new(DataValue::Float64(*value), *tsid))
        .collect();
    encode_data_frame(channel, timestamp_ms, &payloads, compress).context("encoding a data frame")
}

/// Installs `env_logger` once for a test binary; `RUST_LOG` controls output.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
