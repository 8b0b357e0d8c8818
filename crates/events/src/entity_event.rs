//! Events describing a create/update/delete of a persisted entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firelancer_core::{EntityId, RequestContext};

use crate::Event;

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityEventType {
    Created,
    Updated,
    Deleted,
}

/// Input that caused an entity change.
///
/// Create/update operations carry the (already validated) input payload,
/// deletes carry only the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityInput {
    Payload(serde_json::Value),
    Id(EntityId),
}

/// An entity type that can be the subject of an [`EntityEvent`].
pub trait EventEntity: core::fmt::Debug + Send + Sync + 'static {
    /// Event name used for `EntityEvent<Self, _>`.
    const EVENT_TYPE: &'static str;

    fn entity_id(&self) -> EntityId;
}

/// Fired whenever an entity is created, updated or deleted.
#[derive(Debug, Clone)]
pub struct EntityEvent<T, I = EntityInput> {
    pub ctx: RequestContext,
    pub entity: T,
    pub kind: EntityEventType,
    pub input: Option<I>,
    pub created_at: DateTime<Utc>,
}

impl<T, I> EntityEvent<T, I> {
    pub fn new(ctx: RequestContext, entity: T, kind: EntityEventType, input: Option<I>) -> Self {
        Self {
            ctx,
            entity,
            kind,
            input,
            created_at: Utc::now(),
        }
    }

    pub fn created(ctx: RequestContext, entity: T, input: I) -> Self {
        Self::new(ctx, entity, EntityEventType::Created, Some(input))
    }

    pub fn updated(ctx: RequestContext, entity: T, input: I) -> Self {
        Self::new(ctx, entity, EntityEventType::Updated, Some(input))
    }

    pub fn deleted(ctx: RequestContext, entity: T, input: Option<I>) -> Self {
        Self::new(ctx, entity, EntityEventType::Deleted, input)
    }
}

impl<T, I> Event for EntityEvent<T, I>
where
    T: EventEntity,
    I: core::fmt::Debug + Send + Sync + 'static,
{
    fn event_type(&self) -> &'static str {
        T::EVENT_TYPE
    }

    fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
