//! # Channel
//!
//! A named delivery queue carrying the messages of one computation from the
//! dispatch loop to that computation's watch loop.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::Message;

/// Messages buffered per channel before `accept` starts waiting on the consumer.
const CHANNEL_CAPACITY: usize = 256;

/// Why a channel stopped accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection dropped; the server-side job is gone with it.
    Disconnected,
    /// The caller detached from the computation.
    Detached,
    /// The computation ended and released its channel.
    Finished,
    /// The client was closed.
    ClientClosed,
}

enum State {
    Open(mpsc::Sender<Message>),
    Closed(CloseReason),
}

pub struct Channel {
    name: String,
    state: Mutex<State>,
    token: CancellationToken,
}

impl Channel {
    /// Creates an open channel. The receiver is the one and only consumer side.
    ///
    /// `parent` bounds every pending `accept`: once it is cancelled, deliveries
    /// are abandoned.
    pub fn new(name: impl Into<String>, parent: &CancellationToken) -> (Arc<Channel>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel = Channel {
            name: name.into(),
            state: Mutex::new(State::Open(tx)),
            token: parent.child_token(),
        };
        (Arc::new(channel), rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers a message, waiting while the consumer is behind.
    ///
    /// Returns `false` when the message was dropped because the channel is
    /// closed or its owner is shutting down.
    pub async fn accept(&self, message: Message) -> bool {
        let sender = match &*self.state() {
            State::Open(sender) => sender.clone(),
            State::Closed(_) => return false,
        };

        tokio::select! {
            _ = self.token.cancelled() => false,
            sent = sender.send(message) => sent.is_ok(),
        }
    }

    /// Closes the channel. The consumer drains what is already queued and then
    /// sees the end of the stream. Only the first close records its reason.
    pub fn close(&self, reason: CloseReason) {
        let mut state = self.state();
        if let State::Open(_) = *state {
            *state = State::Closed(reason);
            self.token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match *self.state() {
            State::Open(_) => None,
            State::Closed(reason) => Some(reason),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ControlMessage;

    fn keep_alive(channel: &str) -> Message {
        Message::KeepAlive(ControlMessage {
            channel: channel.to_string(),
            event: "KEEP_ALIVE".to_string(),
            timestamp_ms: None,
        })
    }

    #[tokio::test]
    async fn delivers_in_order_then_ends_after_close() {
        let token = CancellationToken::new();
        let (channel, mut rx) = Channel::new("ch-1", &token);

        assert!(channel.accept(keep_alive("a")).await);
        assert!(channel.accept(keep_alive("b")).await);
        channel.close(CloseReason::Finished);
        channel.close(CloseReason::Disconnected);

        assert_eq!(channel.close_reason(), Some(CloseReason::Finished));
        assert_eq!(rx.recv().await.map(|m| m.channel().to_string()), Some("a".to_string()));
        assert_eq!(rx.recv().await.map(|m| m.channel().to_string()), Some("b".to_string()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn accept_after_close_is_a_no_op() {
        let token = CancellationToken::new();
        let (channel, mut rx) = Channel::new("ch-1", &token);
        channel.close(CloseReason::Disconnected);

        assert!(!channel.accept(keep_alive("late")).await);
        assert!(channel.is_closed());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocked_accept_gives_up_when_the_owner_shuts_down() {
        let token = CancellationToken::new();
        let (channel, _rx) = Channel::new("ch-1", &token);
        for _ in 0..CHANNEL_CAPACITY {
            assert!(channel.accept(keep_alive("fill")).await);
        }

        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.accept(keep_alive("stuck")).await })
        };
        token.cancel();
        assert!(!pending.await.unwrap());
    }
}
