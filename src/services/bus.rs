//! In-process event bus with one topic per order.
//!
//! Publishers fire and forget; the database is the source of truth and a
//! dropped message is recovered by backfill on the next subscribe. Topics
//! are refcounted: the broadcast channel lives while at least one
//! subscription holds it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::order::OrderEvent;

const TOPIC_CAPACITY: usize = 256;

struct Topic {
    tx: broadcast::Sender<OrderEvent>,
    refs: usize,
}

#[derive(Default)]
pub struct OrderEventBus {
    topics: RwLock<HashMap<Uuid, Topic>>,
}

impl OrderEventBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to the order's topic. No-op when nobody is subscribed.
    pub fn publish(&self, event: OrderEvent) {
        let topics = self.topics.read();
        if let Some(topic) = topics.get(&event.order_id) {
            // Ignore errors if all receivers lagged away
            let _ = topic.tx.send(event);
        }
    }

    /// Subscribe to an order's topic, creating it on first use.
    ///
    /// The returned subscription unregisters itself on drop; the last drop
    /// removes the topic.
    pub fn subscribe(self: &Arc<Self>, order_id: Uuid) -> TopicSubscription {
        let mut topics = self.topics.write();
        let topic = topics.entry(order_id).or_insert_with(|| {
            let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
            Topic { tx, refs: 0 }
        });
        topic.refs += 1;
        let receiver = topic.tx.subscribe();
        debug!(order_id = %order_id, refs = topic.refs, "Bus topic subscribed");
        TopicSubscription {
            bus: self.clone(),
            order_id,
            receiver,
        }
    }

    /// Number of live topics, for observability.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    fn unsubscribe(&self, order_id: Uuid) {
        let mut topics = self.topics.write();
        if let Some(topic) = topics.get_mut(&order_id) {
            topic.refs -= 1;
            if topic.refs == 0 {
                topics.remove(&order_id);
                debug!(order_id = %order_id, "Bus topic removed");
            }
        }
    }
}

/// A refcounted handle on an order topic.
pub struct TopicSubscription {
    bus: Arc<OrderEventBus>,
    order_id: Uuid,
    pub receiver: broadcast::Receiver<OrderEvent>,
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.order_id);
    }
}
