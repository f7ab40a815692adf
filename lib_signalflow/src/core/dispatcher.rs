//! # Message Dispatcher
//!
//! The single place where inbound frames are decoded and routed. Because one
//! task does all of it, messages for a channel reach that channel in the exact
//! order they came off the socket.
//!
//! ## Routing rules:
//!
//! 1.  **Decode**: frames that fail to decode are logged and dropped; the
//!     connection and every other computation carry on.
//! 2.  **Global messages** (empty channel name) are handled inline:
//!     authentication acknowledgements are logged, keep-alives ignored, and
//!     anything else is logged as a protocol error.
//! 3.  **Channel messages** go to the registered [`Channel`](crate::core::channel::Channel)
//!     of that name. Messages for unknown names are dropped silently; they are
//!     expected right after a reconnect or a detach.
//! 4.  **Lost connections** arrive as a marker behind the last frame read on
//!     them. Channels whose job ran on that connection are closed only then,
//!     after everything the server sent them has been delivered.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::connection::Frame;
use crate::core::registry::Registry;
use crate::messages::{parse_message, Message};

pub struct Dispatcher {
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, token: CancellationToken) -> Self {
        Self { registry, token }
    }

    /// Routes frames until the token is cancelled or the frame stream ends.
    pub async fn run(self, mut frames: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            self.handle_frame(&frame).await;
        }
        log::debug!("Dispatcher stopped");
    }

    pub async fn handle_frame(&self, frame: &Frame) {
        let decoded = match frame {
            Frame::Text(text) => parse_message(text, true),
            Frame::Binary(data) => parse_message(data, false),
            Frame::Disconnected(generation) => {
                self.connection_lost(*generation);
                return;
            }
        };
        match decoded {
            Ok(message) => self.route(message).await,
            Err(e) => log::warn!("Dropping undecodable SignalFlow frame: {}", e),
        }
    }

    fn connection_lost(&self, generation: u64) {
        let closed = self.registry.close_generation(generation);
        if closed > 0 {
            log::warn!("Connection {} lost; closed {} channel(s) started on it", generation, closed);
        }
    }

    async fn route(&self, message: Message) {
        if message.channel().is_empty() {
            self.accept_global(message);
            return;
        }

        let Some(channel) = self.registry.get(message.channel()) else {
            log::trace!("No channel '{}' registered; dropping {} message", message.channel(), message.kind());
            return;
        };

        if !channel.accept(message).await {
            log::debug!("Channel '{}' closed while delivering", channel.name());
        }
    }

    fn accept_global(&self, message: Message) {
        match message {
            Message::Authenticated(auth) => {
                log::info!("Authenticated with SignalFlow (org {:?})", auth.org_id.unwrap_or_default());
            }
            Message::KeepAlive(_) => {}
            Message::Error(err) => {
                log::error!("SignalFlow reported a connection-level error: {:?}", err.raw);
            }
            other => {
                log::warn!("Unexpected global SignalFlow message: {:?}", other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::CloseReason;
    use bytes::Bytes;
    use serde_json::json;

    fn text(value: serde_json::Value) -> Frame {
        Frame::Text(Bytes::from(value.to_string()))
    }

    #[tokio::test]
    async fn routes_by_channel_and_drops_the_rest() {
        let token = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let (_channel, mut rx) = registry.register("ch-1", &token).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), token.clone());

        dispatcher
            .handle_frame(&text(json!({ "type": "control-message", "channel": "ch-1", "event": "JOB_START", "handle": "h1" })))
            .await;
        dispatcher
            .handle_frame(&text(json!({ "type": "control-message", "channel": "ch-7", "event": "JOB_START", "handle": "h7" })))
            .await;
        dispatcher.handle_frame(&text(json!({ "type": "authenticated", "orgId": "o" }))).await;
        dispatcher.handle_frame(&text(json!({ "type": "control-message", "event": "KEEP_ALIVE" }))).await;
        dispatcher.handle_frame(&Frame::Binary(Bytes::from_static(&[0, 1]))).await;
        dispatcher
            .handle_frame(&text(json!({ "type": "control-message", "channel": "ch-1", "event": "END_OF_CHANNEL" })))
            .await;

        assert!(matches!(rx.recv().await, Some(Message::JobStart(ref m)) if m.handle == "h1"));
        assert!(matches!(rx.recv().await, Some(Message::EndOfChannel(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_loss_is_applied_after_earlier_frames() {
        let token = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let (running, mut rx) = registry.register("ch-1", &token).unwrap();
        let (waiting, _waiting_rx) = registry.register("ch-2", &token).unwrap();
        assert!(registry.bind(&running, 1));

        let (frames_tx, frames) = mpsc::channel(8);
        frames_tx
            .send(text(json!({ "type": "control-message", "channel": "ch-1", "event": "END_OF_CHANNEL" })))
            .await
            .unwrap();
        frames_tx.send(Frame::Disconnected(1)).await.unwrap();
        drop(frames_tx);
        Dispatcher::new(Arc::clone(&registry), token.clone()).run(frames).await;

        assert!(matches!(rx.recv().await, Some(Message::EndOfChannel(_))));
        assert!(rx.recv().await.is_none());
        assert_eq!(running.close_reason(), Some(CloseReason::Disconnected));
        assert!(!waiting.is_closed());
        assert!(registry.get("ch-2").is_some());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let token = CancellationToken::new();
        let (_tx, frames) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()), token.clone());
        let task = tokio::spawn(dispatcher.run(frames));
        token.cancel();
        task.await.unwrap();
    }
}
