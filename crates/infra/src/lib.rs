//! Infrastructure layer: job persistence, the queue engine, DB wiring and config.

pub mod config;
pub mod db;
pub mod jobs;

pub use config::{ConfigError, JobQueueConfig, QueueOptions};
