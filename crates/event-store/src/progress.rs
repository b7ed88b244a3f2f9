use async_trait::async_trait;

use crate::{AggregateId, Result, Version};

/// Tracks the last stream version delivered downstream per aggregate.
#[async_trait]
pub trait PublishProgressStore: Send + Sync {
    /// Returns the highest published version, `Version::initial()` if none.
    async fn published_version(&self, aggregate_id: &AggregateId) -> Result<Version>;

    /// Records that `version` was published. A lower version than the one
    /// already recorded is ignored.
    async fn record_published(&self, aggregate_id: &AggregateId, version: Version) -> Result<()>;
}
