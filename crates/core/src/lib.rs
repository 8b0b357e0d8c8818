//! `firelancer-core` — shared building blocks.
//!
//! This crate contains pure primitives (no IO): identifiers, the request
//! context that travels with events and jobs, and the domain error model.

pub mod context;
pub mod error;
pub mod id;

pub use context::{ApiType, RequestContext};
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, JobId, UserId};
