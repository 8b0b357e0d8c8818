//! Processors the worker registers out of the box.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use firelancer_core::RequestContext;
use firelancer_events::domain::{Asset, AssetEvent};
use firelancer_events::{BoxError, EntityInput, EventBus};
use firelancer_infra::jobs::{JobContext, JobError, JobProcessor, JobQueueService, JobStorage, QueueError};

pub const ASSET_PREVIEW_QUEUE: &str = "asset-preview";

/// Payload of an `asset-preview` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPreviewJob {
    pub asset: Asset,
}

/// Produces the preview file for an asset and returns where it was stored.
#[async_trait]
pub trait AssetPreviewStrategy: Send + Sync + 'static {
    async fn generate_preview(&self, asset: &Asset) -> Result<String, BoxError>;
}

/// Uses the source file as its own preview.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAssetPreviewStrategy;

#[async_trait]
impl AssetPreviewStrategy for NoopAssetPreviewStrategy {
    async fn generate_preview(&self, asset: &Asset) -> Result<String, BoxError> {
        Ok(asset.source.clone())
    }
}

pub struct AssetPreviewProcessor {
    strategy: Arc<dyn AssetPreviewStrategy>,
    bus: EventBus,
}

impl AssetPreviewProcessor {
    pub fn new(strategy: Arc<dyn AssetPreviewStrategy>, bus: EventBus) -> Self {
        Self { strategy, bus }
    }
}

#[async_trait]
impl JobProcessor for AssetPreviewProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let AssetPreviewJob { mut asset } = ctx.data_as()?;
        ctx.set_progress(10).await;

        let preview = tokio::select! {
            result = self.strategy.generate_preview(&asset) => {
                result.map_err(|e| JobError::failed(format!("preview generation failed: {e}")))?
            }
            _ = ctx.cancelled() => return Err(JobError::Cancelled),
        };
        ctx.set_progress(90).await;

        asset.preview = Some(preview.clone());
        debug!(job_id = %ctx.id(), asset_id = %asset.id, preview = %preview, "asset preview generated");

        let input = EntityInput::Payload(json!({ "preview": preview }));
        let asset_id = asset.id;
        // The preview exists either way; a failing subscriber does not fail the job.
        if let Err(err) = self.bus.publish(AssetEvent::updated(RequestContext::empty(), asset, input)) {
            warn!(job_id = %ctx.id(), asset_id = %asset_id, error = %err, "asset event subscribers failed");
        }

        Ok(json!({ "assetId": asset_id, "preview": preview }))
    }
}

/// Register every built-in processor on `queue`.
pub fn register_builtin_processors<S: JobStorage>(
    queue: &JobQueueService<S>,
    bus: &EventBus,
    preview_strategy: Arc<dyn AssetPreviewStrategy>,
) -> Result<(), QueueError> {
    queue.register_processor(
        ASSET_PREVIEW_QUEUE,
        AssetPreviewProcessor::new(preview_strategy, bus.clone()),
    )
}
