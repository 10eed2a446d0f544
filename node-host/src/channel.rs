//! ChannelHub - named publish/subscribe channels
//!
//! A channel is only a name. Publishing delivers a clone of the message to
//! every listener registered on that name at that instant; with no listener
//! the message is dropped. Nothing is buffered for late subscribers.
//!
//! Subscriptions are handles. `unsubscribe()` is idempotent and also runs on
//! drop, so a listener can never leak past the scope that owns it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use shared_types::ChannelMessage;
use tokio::sync::mpsc;

type Listener = (u64, mpsc::UnboundedSender<ChannelMessage>);

#[derive(Default)]
struct HubInner {
    channels: DashMap<String, Vec<Listener>>,
    next_id: AtomicU64,
}

/// Cheap to clone; all clones share the same listener table.
#[derive(Clone, Default)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on `channel`.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));
        tracing::trace!(channel, id, "channel listener registered");

        Subscription {
            channel: channel.to_string(),
            id,
            hub: Arc::downgrade(&self.inner),
            rx,
            active: true,
        }
    }

    /// Deliver `message` to every current listener on `channel`.
    /// Returns how many listeners received it.
    pub fn publish(&self, channel: &str, message: ChannelMessage) -> usize {
        let Some(mut listeners) = self.inner.channels.get_mut(channel) else {
            tracing::trace!(channel, kind = message.kind(), "no listener; message dropped");
            return 0;
        };
        listeners.retain(|(_, tx)| !tx.is_closed());
        let mut delivered = 0;
        for (_, tx) in listeners.iter() {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }
}

fn remove_listener(inner: &HubInner, channel: &str, id: u64) {
    if let Some(mut listeners) = inner.channels.get_mut(channel) {
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }
    inner
        .channels
        .remove_if(channel, |_, listeners| listeners.is_empty());
}

/// One registered listener. Dropping it unregisters it.
pub struct Subscription {
    channel: String,
    id: u64,
    hub: Weak<HubInner>,
    rx: mpsc::UnboundedReceiver<ChannelMessage>,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        self.rx.try_recv().ok()
    }

    /// Remove this listener. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.rx.close();
        if let Some(inner) = self.hub.upgrade() {
            remove_listener(&inner, &self.channel, self.id);
        }
        tracing::trace!(channel = %self.channel, id = self.id, "channel listener removed");
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
