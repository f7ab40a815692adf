use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// Receiving end of an unbounded hand-off from a computation's watch loop.
///
/// The producer never waits, so items pile up here until the consumer reads
/// them. The stream ends once the computation has finished and every buffered
/// item has been taken.
#[derive(Debug)]
pub struct Relay<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Relay<T> {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<T>, Relay<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Relay { rx })
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes the next buffered item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Number of items waiting to be read.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

impl<T> Stream for Relay<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
