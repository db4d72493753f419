use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use bazaar_types::events::ChangeEvent;

use crate::subscription::{ChangeFilter, Subscription};

pub(crate) type SubscriberMap = HashMap<Uuid, (ChangeFilter, mpsc::UnboundedSender<ChangeEvent>)>;

/// Fans row changes out to every subscription whose filter matches.
#[derive(Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

#[derive(Default)]
pub(crate) struct FeedInner {
    /// Live subscriptions: sub_id -> (filter, sender)
    pub(crate) subscribers: RwLock<SubscriberMap>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filtered subscription. Events published after this call
    /// that match `filter` are queued on the returned handle.
    pub fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        trace!("subscribe {} on {}", id, filter);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (filter.clone(), tx));
        Subscription::new(id, filter, rx, Arc::downgrade(&self.inner))
    }

    /// Publish a change to all matching subscriptions. Returns how many
    /// subscriptions it was queued on.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let mut delivered = 0;
        for (filter, tx) in subscribers.values() {
            if filter.matches(&event) && tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!("{:?} on {} delivered to {} subscribers", event.kind, event.table, delivered);
        delivered
    }

    /// Number of live subscriptions. Used to verify teardown.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
