//! The Firelancer background worker: runs queued jobs and exposes a health check.

pub mod config;
pub mod health;
pub mod processors;
pub mod worker;

pub use config::{HealthCheckConfig, WorkerConfig, WorkerConfigError};
pub use health::{HealthCheckServer, HealthProbe};
pub use processors::{
    register_builtin_processors, AssetPreviewJob, AssetPreviewProcessor, AssetPreviewStrategy,
    NoopAssetPreviewStrategy, ASSET_PREVIEW_QUEUE,
};
pub use worker::{bootstrap_worker, FirelancerWorker, WorkerError};
