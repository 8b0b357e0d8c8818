//! Concrete marketplace events.
//!
//! Entity snapshots here are deliberately small: subscribers get the fields
//! they typically react to (ids, names, emails), not the full persisted row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firelancer_core::{EntityId, RequestContext, UserId};

use crate::entity_event::{EntityEvent, EventEntity};
use crate::impl_event;

macro_rules! event_entity {
    ($t:ty, $name:literal) => {
        impl EventEntity for $t {
            const EVENT_TYPE: &'static str = $name;

            fn entity_id(&self) -> EntityId {
                self.id
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
    pub user_id: UserId,
    pub identifier: String,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Administrator {
    pub id: EntityId,
    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: EntityId,
    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: EntityId,
    pub name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub source: String,
    /// Location of the generated preview, once the asset has been processed.
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: EntityId,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub id: EntityId,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetValue {
    pub id: EntityId,
    pub facet_id: EntityId,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetValueCategory {
    pub id: EntityId,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPost {
    pub id: EntityId,
    pub customer_id: EntityId,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: EntityId,
    pub code: String,
    pub permissions: Vec<String>,
}

event_entity!(Administrator, "administrator.entity");
event_entity!(Asset, "asset.entity");
event_entity!(Collection, "collection.entity");
event_entity!(Customer, "customer.entity");
event_entity!(Facet, "facet.entity");
event_entity!(FacetValue, "facet-value.entity");
event_entity!(FacetValueCategory, "facet-value-category.entity");
event_entity!(JobPost, "job-post.entity");
event_entity!(Role, "role.entity");

pub type AdministratorEvent = EntityEvent<Administrator>;
pub type AssetEvent = EntityEvent<Asset>;
pub type CollectionEvent = EntityEvent<Collection>;
pub type CustomerEvent = EntityEvent<Customer>;
pub type FacetEvent = EntityEvent<Facet>;
pub type FacetValueEvent = EntityEvent<FacetValue>;
pub type FacetValueCategoryEvent = EntityEvent<FacetValueCategory>;
pub type JobPostEvent = EntityEvent<JobPost>;
pub type RoleEvent = EntityEvent<Role>;

/// Fired before credentials are checked, whether or not the login succeeds.
#[derive(Debug, Clone)]
pub struct AttemptedLoginEvent {
    pub ctx: RequestContext,
    pub strategy: String,
    /// Username, only known for the native strategy.
    pub identifier: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AttemptedLoginEvent {
    pub fn new(ctx: RequestContext, strategy: impl Into<String>, identifier: Option<String>) -> Self {
        Self {
            ctx,
            strategy: strategy.into(),
            identifier,
            created_at: Utc::now(),
        }
    }
}

/// Fired after a session has been created for a user.
#[derive(Debug, Clone)]
pub struct LoginEvent {
    pub ctx: RequestContext,
    pub user: User,
    pub created_at: DateTime<Utc>,
}

impl LoginEvent {
    pub fn new(ctx: RequestContext, user: User) -> Self {
        Self {
            ctx,
            user,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogoutEvent {
    pub ctx: RequestContext,
    pub created_at: DateTime<Utc>,
}

impl LogoutEvent {
    pub fn new(ctx: RequestContext) -> Self {
        Self {
            ctx,
            created_at: Utc::now(),
        }
    }
}

/// Fired when a new user registers an account.
#[derive(Debug, Clone)]
pub struct AccountRegistrationEvent {
    pub ctx: RequestContext,
    pub user: User,
    pub created_at: DateTime<Utc>,
}

impl AccountRegistrationEvent {
    pub fn new(ctx: RequestContext, user: User) -> Self {
        Self {
            ctx,
            user,
            created_at: Utc::now(),
        }
    }
}

/// Fired when a customer verifies their email address.
#[derive(Debug, Clone)]
pub struct AccountVerifiedEvent {
    pub ctx: RequestContext,
    pub customer: Customer,
    pub created_at: DateTime<Utc>,
}

impl AccountVerifiedEvent {
    pub fn new(ctx: RequestContext, customer: Customer) -> Self {
        Self {
            ctx,
            customer,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleChangeType {
    Assigned,
    Removed,
}

/// Fired when roles are assigned to or removed from an administrator.
///
/// `role_ids` only contains the roles that changed.
#[derive(Debug, Clone)]
pub struct RoleChangeEvent {
    pub ctx: RequestContext,
    pub admin: Administrator,
    pub role_ids: Vec<EntityId>,
    pub kind: RoleChangeType,
    pub created_at: DateTime<Utc>,
}

impl RoleChangeEvent {
    pub fn new(
        ctx: RequestContext,
        admin: Administrator,
        role_ids: Vec<EntityId>,
        kind: RoleChangeType,
    ) -> Self {
        Self {
            ctx,
            admin,
            role_ids,
            kind,
            created_at: Utc::now(),
        }
    }
}

impl_event!(AttemptedLoginEvent, "attempted-login");
impl_event!(LoginEvent, "login");
impl_event!(LogoutEvent, "logout");
impl_event!(AccountRegistrationEvent, "account-registration");
impl_event!(AccountVerifiedEvent, "account-verified");
impl_event!(RoleChangeEvent, "role-change");
