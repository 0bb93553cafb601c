//! Publish/subscribe for newly established connections.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{SubscriberFault, TagHandle};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Callback = dyn Fn(&TagHandle) -> Result<(), BoxError> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
enum Delivery {
    Callback(Arc<Callback>),
    Channel(mpsc::UnboundedSender<TagHandle>),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    delivery: Delivery,
}

/// Subscribers run on the publishing task, in subscription order, and must not
/// block. The list is copy-on-write: publishing iterates a snapshot and never
/// holds the lock while a callback runs.
#[derive(Default)]
pub struct ConnectionEventBus {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl ConnectionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TagHandle) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.add(Delivery::Callback(Arc::new(callback)))
    }

    /// Subscribes a channel receiving every published handle. The subscription
    /// ends by itself once the receiver is dropped.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TagHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.add(Delivery::Channel(tx)), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.remove(&[id]) > 0;
        if removed {
            debug!(subscription = %id, "Unsubscribed from connection events");
        }
        removed
    }

    fn add(&self, delivery: Delivery) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write();
        let mut next = Vec::with_capacity(subscribers.len() + 1);
        next.extend(subscribers.iter().cloned());
        next.push(Subscriber { id, delivery });
        *subscribers = Arc::new(next);
        debug!(subscription = %id, "Subscribed to connection events");
        id
    }

    fn remove(&self, ids: &[SubscriptionId]) -> usize {
        let mut subscribers = self.subscribers.write();
        let next: Vec<Subscriber> = subscribers
            .iter()
            .filter(|subscriber| !ids.contains(&subscriber.id))
            .cloned()
            .collect();
        let removed = subscribers.len() - next.len();
        if removed > 0 {
            *subscribers = Arc::new(next);
        }
        removed
    }

    /// Delivers `handle` to every subscriber and returns how many accepted it.
    /// Failing subscribers are logged and skipped; channels whose receiver is
    /// gone are dropped.
    pub fn publish(&self, handle: &TagHandle) -> usize {
        let snapshot = self.subscribers.read().clone();
        let mut delivered = 0;
        let mut closed = Vec::new();

        for subscriber in snapshot.iter() {
            let callback = match &subscriber.delivery {
                Delivery::Callback(callback) => callback,
                Delivery::Channel(tx) => {
                    if tx.send(handle.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        closed.push(subscriber.id);
                    }
                    continue;
                }
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (**callback)(handle)));
            let fault = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(source)) => SubscriberFault::Failed {
                    subscriber: subscriber.id,
                    source,
                },
                Err(payload) => SubscriberFault::Panicked {
                    subscriber: subscriber.id,
                    message: panic_message(&*payload),
                },
            };
            error!(session_id = %handle.session_id(), error = %fault, "Connection event not delivered");
        }

        if !closed.is_empty() {
            let removed = self.remove(&closed);
            debug!(removed, "Dropped closed event channels");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl fmt::Debug for ConnectionEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
