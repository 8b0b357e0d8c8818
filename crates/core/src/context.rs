//! Request context passed through services and attached to events.

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Which API surface a request arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    Admin,
    Shop,
    /// Requests that did not come through the HTTP API (workers, scripts).
    Custom,
}

/// Immutable snapshot of the request that triggered some work.
///
/// Services attach it to every event they publish; the job queue and event bus
/// carry it around without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    api_type: ApiType,
    language_code: Option<String>,
    currency_code: Option<String>,
    active_user_id: Option<UserId>,
    is_authorized: bool,
    authorized_as_owner_only: bool,
}

impl RequestContext {
    pub fn new(api_type: ApiType) -> Self {
        Self {
            api_type,
            language_code: None,
            currency_code: None,
            active_user_id: None,
            is_authorized: false,
            authorized_as_owner_only: false,
        }
    }

    /// Context for system-initiated work outside the request/response cycle.
    ///
    /// Authorized, anonymous, custom API type.
    pub fn empty() -> Self {
        Self {
            is_authorized: true,
            ..Self::new(ApiType::Custom)
        }
    }

    pub fn with_language_code(mut self, code: impl Into<String>) -> Self {
        self.language_code = Some(code.into());
        self
    }

    pub fn with_currency_code(mut self, code: impl Into<String>) -> Self {
        self.currency_code = Some(code.into());
        self
    }

    pub fn with_active_user(mut self, user_id: UserId) -> Self {
        self.active_user_id = Some(user_id);
        self
    }

    pub fn authorized(mut self, owner_only: bool) -> Self {
        self.is_authorized = !owner_only;
        self.authorized_as_owner_only = owner_only;
        self
    }

    pub fn api_type(&self) -> ApiType {
        self.api_type
    }

    pub fn language_code(&self) -> Option<&str> {
        self.language_code.as_deref()
    }

    pub fn currency_code(&self) -> Option<&str> {
        self.currency_code.as_deref()
    }

    pub fn active_user_id(&self) -> Option<UserId> {
        self.active_user_id
    }

    pub fn is_authorized(&self) -> bool {
        self.is_authorized
    }

    pub fn authorized_as_owner_only(&self) -> bool {
        self.authorized_as_owner_only
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::empty()
    }
}
