//! Host-side fan-out of sandbox output with pre-subscription buffering.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{StreamExt, future};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    HostEvent,
    subscribers::{SubscriberRegistry, SubscriptionId},
};

/// Default backlog size, in events.
const DEFAULT_BACKLOG: usize = 1024;

type Callback = Arc<dyn Fn(&HostEvent) + Send + Sync>;

struct Inner {
    subscribers: SubscriberRegistry<Callback>,
    backlog: VecDeque<HostEvent>,
    backlog_limit: usize,
}

/// Fan-out hub for host events.
///
/// Events pushed while nobody is subscribed are kept (oldest dropped past the
/// limit) and flushed to the first subscriber, so a consumer that attaches
/// late still sees the start of a run.
pub struct OutputHub {
    inner: Mutex<Inner>,
}

impl Default for OutputHub {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputHub {
    /// Create a hub with the default backlog.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backlog_limit(DEFAULT_BACKLOG)
    }

    /// Create a hub keeping at most `limit` undelivered events.
    #[must_use]
    pub fn with_backlog_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: SubscriberRegistry::new(),
                backlog: VecDeque::with_capacity(limit.min(32)),
                backlog_limit: limit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver an event to every subscriber, or buffer it.
    pub fn push(&self, event: HostEvent) {
        let targets = {
            let mut inner = self.lock();
            if inner.subscribers.is_empty() {
                if inner.backlog_limit == 0 {
                    return;
                }
                while inner.backlog.len() >= inner.backlog_limit {
                    inner.backlog.pop_front();
                }
                inner.backlog.push_back(event);
                return;
            }
            inner.subscribers.snapshot()
        };

        for callback in targets {
            callback(&event);
        }
    }

    /// Register a subscriber.
    ///
    /// The first subscriber receives the backlog before this returns.
    /// Callbacks must not call back into the hub.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HostEvent) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let mut inner = self.lock();
        let id = inner.subscribers.subscribe(Arc::clone(&callback));
        if !inner.backlog.is_empty() {
            tracing::debug!(buffered = inner.backlog.len(), %id, "flushing hub backlog");
            for event in inner.backlog.drain(..) {
                callback(&event);
            }
        }
        id
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().subscribers.unsubscribe(id).is_some()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Snapshot of buffered, undelivered events.
    #[must_use]
    pub fn backlog(&self) -> Vec<HostEvent> {
        self.lock().backlog.iter().cloned().collect()
    }

    /// Adapt the hub into a host controller callback.
    #[must_use]
    pub fn sink(self: &Arc<Self>) -> impl Fn(HostEvent) + Send + Sync + 'static {
        let hub = Arc::clone(self);
        move |event| hub.push(event)
    }

    /// Subscribe and receive events as a stream.
    #[must_use]
    pub fn stream(&self) -> (SubscriptionId, futures::stream::BoxStream<'static, HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, UnboundedReceiverStream::new(rx).boxed())
    }

    /// Stream of module payloads, ending at the next `finished`.
    #[must_use]
    pub fn messages_until_finished(
        &self,
    ) -> (SubscriptionId, futures::stream::BoxStream<'static, Value>) {
        let (id, events) = self.stream();
        let messages = events
            .take_while(|event| future::ready(!matches!(event, HostEvent::Finished)))
            .filter_map(|event| async move {
                match event {
                    HostEvent::Message { message } => Some(message),
                    _ => None,
                }
            })
            .boxed();
        (id, messages)
    }
}
