//! # Channel Registry
//!
//! Maps channel names to the open [`Channel`] of the computation that owns
//! them. A name is held by at most one live channel at a time.
//!
//! A channel is bound to the connection generation its execute request was
//! written on. Losing that generation closes it; channels whose request has
//! not gone out yet are left alone, since it will be written on a later
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::channel::{Channel, CloseReason};
use crate::messages::Message;

/// Hands out channel names unique to one client: `ch-1`, `ch-2`, ...
#[derive(Debug, Default)]
pub struct ChannelSequence {
    last: AtomicU64,
}

impl ChannelSequence {
    pub fn next_name(&self) -> String {
        format!("ch-{}", self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Debug)]
struct Entry {
    channel: Arc<Channel>,
    generation: Option<u64>,
}

#[derive(Debug, Default)]
struct Channels {
    by_name: HashMap<String, Entry>,
    /// Highest connection generation known to be lost.
    lost_through: u64,
}

impl Channels {
    fn owns(&self, channel: &Arc<Channel>) -> bool {
        self.by_name
            .get(channel.name())
            .is_some_and(|entry| Arc::ptr_eq(&entry.channel, channel))
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    channels: Mutex<Channels>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens and registers a channel under `name`.
    ///
    /// Returns `None` if the name is already held by an open channel.
    pub fn register(&self, name: &str, parent: &CancellationToken) -> Option<(Arc<Channel>, mpsc::Receiver<Message>)> {
        let mut channels = self.lock();
        if channels.by_name.contains_key(name) {
            return None;
        }
        let (channel, rx) = Channel::new(name, parent);
        let entry = Entry { channel: Arc::clone(&channel), generation: None };
        channels.by_name.insert(name.to_string(), entry);
        log::debug!("Channel '{}' registered", name);
        Some((channel, rx))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.lock().by_name.get(name).map(|entry| Arc::clone(&entry.channel))
    }

    /// Records that `channel`'s execute request went out on connection
    /// `generation`.
    ///
    /// Returns `false`, closing the channel as disconnected, when that
    /// generation has already been lost.
    pub fn bind(&self, channel: &Arc<Channel>, generation: u64) -> bool {
        let mut channels = self.lock();
        if generation <= channels.lost_through {
            if channels.owns(channel) {
                channels.by_name.remove(channel.name());
            }
            drop(channels);
            channel.close(CloseReason::Disconnected);
            return false;
        }
        if let Some(entry) = channels.by_name.get_mut(channel.name()) {
            if Arc::ptr_eq(&entry.channel, channel) {
                entry.generation = Some(generation);
            }
        }
        true
    }

    /// Closes `channel` and removes it, unless its name has since been taken
    /// by another channel.
    pub fn unregister(&self, channel: &Arc<Channel>, reason: CloseReason) {
        let mut channels = self.lock();
        if channels.owns(channel) {
            channels.by_name.remove(channel.name());
            log::debug!("Channel '{}' unregistered", channel.name());
        }
        drop(channels);
        channel.close(reason);
    }

    /// Closes, as disconnected, every channel bound to `generation` or an
    /// earlier one. Returns how many were closed.
    pub fn close_generation(&self, generation: u64) -> usize {
        let lost: Vec<Arc<Channel>> = {
            let mut channels = self.lock();
            channels.lost_through = channels.lost_through.max(generation);
            let names: Vec<String> = channels
                .by_name
                .iter()
                .filter(|(_, entry)| entry.generation.is_some_and(|g| g <= generation))
                .map(|(name, _)| name.clone())
                .collect();
            let removed: Vec<Arc<Channel>> = names
                .iter()
                .filter_map(|name| channels.by_name.remove(name))
                .map(|entry| entry.channel)
                .collect();
            removed
        };
        for channel in &lost {
            channel.close(CloseReason::Disconnected);
        }
        lost.len()
    }

    /// Closes every channel and empties the registry. Returns how many were open.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<Arc<Channel>> = self.lock().by_name.drain().map(|(_, entry)| entry.channel).collect();
        for channel in &drained {
            channel.close(reason);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_name.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_per_instance() {
        let a = ChannelSequence::default();
        let b = ChannelSequence::default();
        assert_eq!(a.next_name(), "ch-1");
        assert_eq!(a.next_name(), "ch-2");
        assert_eq!(b.next_name(), "ch-1");
    }

    #[tokio::test]
    async fn names_are_exclusive_while_registered() {
        let token = CancellationToken::new();
        let registry = Registry::new();

        let (first, _rx) = registry.register("ch-1", &token).unwrap();
        assert!(registry.register("ch-1", &token).is_none());

        registry.unregister(&first, CloseReason::Finished);
        assert_eq!(first.close_reason(), Some(CloseReason::Finished));
        assert!(registry.register("ch-1", &token).is_some());
    }

    #[tokio::test]
    async fn stale_unregister_leaves_the_new_owner_alone() {
        let token = CancellationToken::new();
        let registry = Registry::new();

        let (old, _old_rx) = registry.register("ch-1", &token).unwrap();
        registry.close_all(CloseReason::Disconnected);
        let (new, _new_rx) = registry.register("ch-1", &token).unwrap();

        registry.unregister(&old, CloseReason::Finished);
        assert!(!new.is_closed());
        assert_eq!(old.close_reason(), Some(CloseReason::Disconnected));
        assert!(Arc::ptr_eq(&registry.get("ch-1").unwrap(), &new));
    }

    #[tokio::test]
    async fn losing_a_connection_closes_only_channels_started_on_it() {
        let token = CancellationToken::new();
        let registry = Registry::new();
        let (sent, _sent_rx) = registry.register("sent", &token).unwrap();
        let (queued, _queued_rx) = registry.register("queued", &token).unwrap();
        assert!(registry.bind(&sent, 1));

        assert_eq!(registry.close_generation(1), 1);
        assert_eq!(sent.close_reason(), Some(CloseReason::Disconnected));
        assert!(!queued.is_closed());

        // The queued request went out on the next connection.
        assert!(registry.bind(&queued, 2));
        assert_eq!(registry.close_generation(1), 0);
        assert!(!queued.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn binding_to_a_lost_connection_closes_the_channel() {
        let token = CancellationToken::new();
        let registry = Registry::new();
        let (late, _rx) = registry.register("late", &token).unwrap();

        registry.close_generation(3);
        assert!(!registry.bind(&late, 3));
        assert_eq!(late.close_reason(), Some(CloseReason::Disconnected));
        assert!(registry.get("late").is_none());
    }

    #[tokio::test]
    async fn close_all_closes_each_channel_once_and_empties() {
        let token = CancellationToken::new();
        let registry = Registry::new();
        let (a, _a_rx) = registry.register("a", &token).unwrap();
        let (b, _b_rx) = registry.register("b", &token).unwrap();

        assert_eq!(registry.close_all(CloseReason::Disconnected), 2);
        assert!(a.is_closed() && b.is_closed());
        assert!(registry.is_empty());
        assert_eq!(registry.close_all(CloseReason::ClientClosed), 0);
    }
}
