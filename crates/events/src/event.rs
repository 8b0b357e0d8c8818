use std::any::Any;

use chrono::{DateTime, Utc};

use firelancer_core::RequestContext;

/// An in-process event.
///
/// Events are:
/// - **immutable** (treat them as facts about something that already happened)
/// - **typed** (subscribers select events by their concrete Rust type)
/// - **transient** (never persisted; owned by the publishing call)
pub trait Event: Any + Send + Sync + core::fmt::Debug {
    /// Stable event name, used for logging (e.g. `"login"`, `"job-post.entity"`).
    fn event_type(&self) -> &'static str;

    /// Snapshot of the request that caused the event.
    fn ctx(&self) -> &RequestContext;

    /// When the event was created.
    fn created_at(&self) -> DateTime<Utc>;
}

/// Implements [`Event`] for a struct with `ctx` and `created_at` fields.
#[macro_export]
macro_rules! impl_event {
    ($t:ty, $name:literal) => {
        impl $crate::Event for $t {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn ctx(&self) -> &firelancer_core::RequestContext {
                &self.ctx
            }

            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.created_at
            }
        }
    };
}
