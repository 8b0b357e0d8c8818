//! Typed in-process events.
//!
//! - [`Event`]: the trait every event implements.
//! - [`EntityEvent`]: created/updated/deleted events for persisted entities.
//! - [`domain`]: the concrete marketplace events (login, assets, job posts, ...).
//! - [`EventBus`]: synchronous, typed publish/subscribe.

pub mod bus;
pub mod domain;
pub mod entity_event;
pub mod event;

pub use bus::{
    BoxError, EventBus, EventStream, PublishError, SubscriberErrorPolicy, SubscriberFailure,
    Subscription,
};
pub use entity_event::{EntityEvent, EntityEventType, EntityInput, EventEntity};
pub use event::Event;
