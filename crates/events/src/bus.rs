//! Typed in-process publish/subscribe.
//!
//! This module provides the **event bus** services use to announce that
//! something happened (an asset was created, a user logged in, a job settled)
//! without knowing who reacts to it.
//!
//! ## Design Philosophy
//!
//! - **Typed**: subscribers select events by their concrete Rust type; an
//!   `AssetEvent` subscriber never sees a `LoginEvent`.
//! - **Synchronous fan-out**: `publish()` invokes every matching subscriber
//!   before it returns, in registration order.
//! - **Fire-and-forget**: no queuing, persistence or retry. Work that must
//!   survive a crash belongs on the job queue, not on the bus.
//! - **Process-local**: there is no cross-process delivery.
//!
//! ## Subscriber isolation
//!
//! By default a subscriber that returns an error (or panics) is logged and
//! skipped; the remaining subscribers still run and the publisher sees `Ok`.
//! A bus built with [`SubscriberErrorPolicy::Propagate`] still runs every
//! subscriber but reports the failures to the publisher afterwards.
//!
//! ## Transactions
//!
//! `publish()` is usually called from inside a service operation, possibly
//! before the surrounding database transaction commits. Subscribers that
//! persist follow-up changes must not assume the triggering change is durable.

use std::any::{Any, TypeId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, error};

use crate::Event;

/// Error type subscribers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How failing subscribers affect the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriberErrorPolicy {
    /// Log the failure and carry on; `publish()` returns `Ok`.
    #[default]
    Isolate,
    /// Run all subscribers, then return [`PublishError::Subscribers`].
    Propagate,
}

/// A single subscriber failure, as reported under [`SubscriberErrorPolicy::Propagate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberFailure {
    pub subscription_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("{} subscriber(s) failed while handling {event_type}", failures.len())]
    Subscribers {
        event_type: &'static str,
        failures: Vec<SubscriberFailure>,
    },
}

enum Delivery {
    Delivered,
    Failed(String),
    /// The receiving side is gone; the registration can be pruned.
    Closed,
}

type SharedEvent = Arc<dyn Any + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(&SharedEvent) -> Delivery + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    type_id: TypeId,
    handler: ErasedHandler,
}

struct Inner {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    policy: SubscriberErrorPolicy,
}

impl Inner {
    fn register(&self, type_id: TypeId, handler: ErasedHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // A poisoned lock only means a writer panicked mid-push/retain; the
        // Vec itself is still consistent.
        let mut regs = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regs.push(Registration {
            id,
            type_id,
            handler,
        });
        id
    }

    fn remove(&self, ids: &[u64]) {
        let mut regs = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regs.retain(|r| !ids.contains(&r.id));
    }

    fn snapshot(&self, type_id: TypeId) -> Vec<Registration> {
        let regs = self
            .registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        regs.iter().filter(|r| r.type_id == type_id).cloned().collect()
    }
}

/// Typed, synchronous, in-process event bus.
///
/// Cheap to clone; clones share the same subscriber list.
///
/// ```ignore
/// let bus = EventBus::new();
/// let sub = bus.subscribe(|event: &LoginEvent| {
///     audit_log.record(&event.user);
///     Ok(())
/// });
///
/// bus.publish(LoginEvent::new(ctx, user))?;
/// sub.unsubscribe();
/// ```
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("policy", &self.inner.policy)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus that isolates subscriber failures.
    pub fn new() -> Self {
        Self::with_policy(SubscriberErrorPolicy::Isolate)
    }

    pub fn with_policy(policy: SubscriberErrorPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrations: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> SubscriberErrorPolicy {
        self.inner.policy
    }

    /// Number of live registrations (handlers and streams, all event types).
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .registrations
            .read()
            .map(|regs| regs.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Publish an event to every subscriber of its concrete type.
    ///
    /// Subscribers run on the caller's thread, in the order they registered.
    /// The subscriber list is snapshotted first, so handlers may publish or
    /// subscribe themselves; subscriptions added during a publish only see
    /// later events.
    pub fn publish<E: Event>(&self, event: E) -> Result<(), PublishError> {
        let event_type = event.event_type();
        let targets = self.inner.snapshot(TypeId::of::<E>());
        if targets.is_empty() {
            debug!(event_type, "event published with no subscribers");
            return Ok(());
        }

        let shared: SharedEvent = Arc::new(event);
        let mut failures = Vec::new();
        let mut closed = Vec::new();

        for registration in &targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.handler)(&shared)))
                .unwrap_or_else(|panic| Delivery::Failed(panic_message(panic.as_ref())));

            match outcome {
                Delivery::Delivered => {}
                Delivery::Closed => closed.push(registration.id),
                Delivery::Failed(message) => {
                    error!(
                        event_type,
                        subscription_id = registration.id,
                        error = %message,
                        "event subscriber failed"
                    );
                    failures.push(SubscriberFailure {
                        subscription_id: registration.id,
                        message,
                    });
                }
            }
        }

        if !closed.is_empty() {
            self.inner.remove(&closed);
        }

        match self.inner.policy {
            SubscriberErrorPolicy::Propagate if !failures.is_empty() => {
                Err(PublishError::Subscribers {
                    event_type,
                    failures,
                })
            }
            _ => Ok(()),
        }
    }

    /// Register a handler for events of type `E`.
    ///
    /// The handler stays registered until [`Subscription::unsubscribe`] is
    /// called; dropping the `Subscription` handle does not unsubscribe.
    pub fn subscribe<E, F>(&self, handler: F) -> Subscription
    where
        E: Event,
        F: Fn(&E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |event: &SharedEvent| {
            match event.downcast_ref::<E>() {
                Some(event) => match handler(event) {
                    Ok(()) => Delivery::Delivered,
                    Err(err) => Delivery::Failed(err.to_string()),
                },
                // Registrations are keyed by TypeId, so this is unreachable in practice.
                None => Delivery::Delivered,
            }
        });

        let id = self.inner.register(TypeId::of::<E>(), erased);
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// A live stream of events of type `E`.
    ///
    /// The stream takes its place in registration order like any handler.
    /// It buffers without bound; dropping it unsubscribes.
    pub fn of_type<E: Event>(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel::<Arc<E>>();

        let erased: ErasedHandler = Arc::new(move |event: &SharedEvent| {
            match Arc::clone(event).downcast::<E>() {
                Ok(event) => match tx.send(event) {
                    Ok(()) => Delivery::Delivered,
                    Err(_) => Delivery::Closed,
                },
                Err(_) => Delivery::Delivered,
            }
        });

        let id = self.inner.register(TypeId::of::<E>(), erased);
        EventStream {
            rx,
            subscription: Subscription {
                id,
                bus: Arc::downgrade(&self.inner),
            },
        }
    }
}

/// Handle to a registered subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the subscriber is still registered on a live bus.
    pub fn is_active(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner
                .registrations
                .read()
                .map(|regs| regs.iter().any(|r| r.id == self.id))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Remove the subscriber. No events are delivered to it afterwards.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&[self.id]);
        }
    }
}

impl core::fmt::Debug for Inner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inner").field("policy", &self.policy).finish()
    }
}

/// Filtered live view of the bus, yielding only events of type `E`.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<Arc<E>>,
    subscription: Subscription,
}

impl<E> EventStream<E> {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<E>> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<E>> {
        self.rx.try_recv().ok()
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription.id
    }

    /// Unsubscribe now; events still buffered in the stream are discarded.
    pub fn close(self) {}
}

impl<E> Drop for EventStream<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.subscription.bus.upgrade() {
            inner.remove(&[self.subscription.id]);
        }
    }
}

impl<E> Stream for EventStream<E> {
    type Item = Arc<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("subscriber panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("subscriber panicked: {s}")
    } else {
        "subscriber panicked".to_string()
    }
}
