use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use roost_session::Subscription;
use roost_types::events::{PushEnvelope, PushEvent};

/// Broadcast buffer. A receiver that falls this far behind skips ahead.
const BROADCAST_CAPACITY: usize = 1024;

/// Fans push events out to per-channel subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every event goes here; subscriptions filter by channel.
    broadcast_tx: broadcast::Sender<PushEnvelope>,

    /// Live subscriptions: subscription id -> (user_id, channel_id)
    subscriptions: RwLock<HashMap<Uuid, (Uuid, Uuid)>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                subscriptions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Stamp `event` with a fresh id and send it to every subscriber of its
    /// channel. Returns the envelope so callers can redeliver it.
    pub fn publish(&self, event: PushEvent) -> PushEnvelope {
        let envelope = PushEnvelope::new(event);
        self.redeliver(envelope.clone());
        envelope
    }

    /// Send an already stamped envelope again, as an at-least-once transport
    /// may.
    pub fn redeliver(&self, envelope: PushEnvelope) {
        debug!("Publishing {} {}", envelope.event.kind(), envelope.event_id);
        // no receivers is fine
        let _ = self.inner.broadcast_tx.send(envelope);
    }

    /// Subscribe `user_id` to one channel. Must be called inside a tokio
    /// runtime; a forwarding task runs until the subscription is dropped.
    pub fn subscribe(&self, user_id: Uuid, channel_id: Uuid) -> Subscription {
        let sub_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut broadcast_rx = self.inner.broadcast_tx.subscribe();

        self.inner
            .subscriptions
            .write()
            .insert(sub_id, (user_id, channel_id));
        debug!("{} subscribed to channel {} ({})", user_id, channel_id, sub_id);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = broadcast_rx.recv() => {
                        let envelope = match result {
                            Ok(envelope) => envelope,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Subscription {} lagged by {} events", sub_id, n);
                                continue;
                            }
                            Err(_) => break,
                        };

                        if envelope.event.channel_id() != channel_id {
                            continue;
                        }
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        let inner = self.inner.clone();
        Subscription::new(channel_id, rx, move || {
            inner.subscriptions.write().remove(&sub_id);
            debug!("Subscription {} released", sub_id);
        })
    }

    /// Number of live subscriptions, across all users and channels.
    pub fn live_subscriptions(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Channels `user_id` is currently subscribed to.
    pub fn channels_of(&self, user_id: Uuid) -> Vec<Uuid> {
        self.inner
            .subscriptions
            .read()
            .values()
            .filter(|(uid, _)| *uid == user_id)
            .map(|(_, channel_id)| *channel_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use roost_types::models::{Message, ReactionRow};

    use super::*;

    fn message(channel_id: Uuid) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id,
            author_id: Uuid::new_v4(),
            author: None,
            kind: Default::default(),
            content: "hi".into(),
            metadata: Default::default(),
            reply_to: None,
            nonce: None,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_subscription_filters_by_channel() {
        let dispatcher = Dispatcher::new();
        let (here, elsewhere) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = dispatcher.subscribe(Uuid::new_v4(), here);

        dispatcher.publish(PushEvent::MessageInserted {
            message: message(elsewhere),
        });
        let wanted = dispatcher.publish(PushEvent::ReactionInserted {
            channel_id: here,
            reaction: ReactionRow::new(Uuid::new_v4(), Uuid::new_v4(), "👍"),
        });

        let got = sub.recv().await.unwrap();
        assert_eq!(got.event_id, wanted.event_id);
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();

        let sub = dispatcher.subscribe(user, channel);
        assert_eq!(dispatcher.live_subscriptions(), 1);
        assert_eq!(dispatcher.channels_of(user), vec![channel]);

        drop(sub);
        assert_eq!(dispatcher.live_subscriptions(), 0);
        assert!(dispatcher.channels_of(user).is_empty());
    }
}
