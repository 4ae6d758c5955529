//! In-process publish/subscribe event bus.
//!
//! The bus is the only channel between components. Subscribers register an
//! [`EventFilter`] plus an async handler; [`EventBus::publish`] invokes every
//! matching handler once and waits for all of them to settle. A failing or
//! panicking handler is logged and never affects its siblings or the
//! publisher. [`EventBus::request`] layers a reply-with-timeout pattern on top.
//!
//! The bus is an explicitly constructed value (cheap to clone, shared state);
//! there is no process-wide instance.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::BusError;
use crate::event::{Event, Topic};

/// What a handler reports back. Errors are logged by the bus, never propagated.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Selects which events a subscription receives.
///
/// Every present criterion must hold. An empty topic set matches every topic.
/// A present agent id criterion is never satisfied by an event that lacks that
/// field.
#[derive(Clone, Default)]
pub struct EventFilter {
    pub topics: Vec<Topic>,
    pub source_agent_id: Option<String>,
    pub target_agent_id: Option<String>,
    pub predicate: Option<Predicate>,
}

impl EventFilter {
    /// Matches every event.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: Topic) -> Self {
        self.topics.push(topic);
        self
    }

    pub fn topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics.extend(topics);
        self
    }

    pub fn from_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.source_agent_id = Some(agent_id.into());
        self
    }

    pub fn to_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    pub fn with_predicate(mut self, predicate: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.topics.is_empty() && !self.topics.contains(&event.topic()) {
            return false;
        }
        if let Some(source) = &self.source_agent_id {
            if event.source_agent_id.as_ref() != Some(source) {
                return false;
            }
        }
        if let Some(target) = &self.target_agent_id {
            if event.target_agent_id.as_ref() != Some(target) {
                return false;
            }
        }
        self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("topics", &self.topics)
            .field("source_agent_id", &self.source_agent_id)
            .field("target_agent_id", &self.target_agent_id)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

struct Subscription {
    id: u64,
    filter: EventFilter,
    handler: Handler,
    active: AtomicBool,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<BTreeMap<u64, Arc<Subscription>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, id: u64) {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        if let Some(sub) = removed {
            sub.active.store(false, Ordering::SeqCst);
            debug!(subscription_id = id, "Subscription removed");
        }
    }
}

/// Caller-side handle to a subscription. Holds only a weak reference to the bus.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving events. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| {
            bus.subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains_key(&self.id)
        })
    }
}

/// Releases a temporary subscription however the owning future ends.
struct UnsubscribeOnDrop(SubscriptionHandle);

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// A single-process publish/subscribe broker.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every future event matching `filter`.
    pub fn subscribe<F, Fut>(&self, filter: EventFilter, handler: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(subscription_id = id, filter = ?filter, "Subscription added");
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        let subscription = Arc::new(Subscription {
            id,
            filter,
            handler,
            active: AtomicBool::new(true),
        });

        if self.inner.closed.load(Ordering::SeqCst) {
            warn!(subscription_id = id, "Subscribe on a closed bus; handler will never run");
        } else {
            self.inner
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(id, subscription);
        }

        SubscriptionHandle {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every matching subscription and wait for the handlers to settle.
    ///
    /// The subscriber set is snapshotted first, so subscribing or unsubscribing
    /// from inside a handler is safe. A subscription removed before its turn in
    /// the snapshot is skipped.
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let event = Arc::new(event);
        let snapshot: Vec<Arc<Subscription>> = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|s| s.filter.matches(&event))
            .cloned()
            .collect();

        debug!(
            event_id = %event.id,
            topic = %event.topic(),
            trace_id = %event.trace.trace_id,
            subscribers = snapshot.len(),
            "Publishing event"
        );

        let mut pending = Vec::with_capacity(snapshot.len());
        for sub in snapshot {
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(event.clone())));
            match invoked {
                Ok(future) => pending.push(Self::settle(sub.id, event.clone(), future)),
                Err(_) => error!(
                    subscription_id = sub.id,
                    event_id = %event.id,
                    topic = %event.topic(),
                    "Event handler panicked"
                ),
            }
        }

        join_all(pending).await;
        Ok(())
    }

    async fn settle(id: u64, event: Arc<Event>, future: BoxFuture<'static, HandlerResult>) {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                subscription_id = id,
                event_id = %event.id,
                topic = %event.topic(),
                error = %e,
                "Event handler failed"
            ),
            Err(_) => error!(
                subscription_id = id,
                event_id = %event.id,
                topic = %event.topic(),
                "Event handler panicked"
            ),
        }
    }

    /// Publish `event` and wait for the first later event matching `reply_filter`.
    ///
    /// The reply subscription is registered before publishing, consumes at most
    /// one event, and is released on reply, timeout, publish failure, or when
    /// the returned future is dropped.
    pub async fn request(
        &self,
        event: Event,
        reply_filter: EventFilter,
        timeout: Duration,
    ) -> Result<Arc<Event>, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let (tx, mut rx) = oneshot::channel::<Arc<Event>>();
        let slot = Mutex::new(Some(tx));
        let handle = self.subscribe(reply_filter, move |reply| {
            let sender = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(reply);
            }
            async { Ok(()) }
        });
        let _guard = UnsubscribeOnDrop(handle);

        // Publish on its own task: the handler that eventually replies may run
        // for a long time and must not be cancelled by our deadline.
        let bus = self.clone();
        let mut publish = tokio::spawn(async move { bus.publish(event).await });

        let wait = async {
            tokio::select! {
                biased;
                reply = &mut rx => return reply.map_err(|_| BusError::Closed),
                joined = &mut publish => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(BusError::PublishFailed(e.to_string())),
                },
            }
            rx.await.map_err(|_| BusError::Closed)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(BusError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drop every subscription and refuse further publishes.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for sub in drained.values() {
            sub.active.store(false, Ordering::SeqCst);
        }
        debug!(dropped = drained.len(), "Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
