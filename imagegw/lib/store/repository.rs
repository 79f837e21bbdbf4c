use async_trait::async_trait;

use crate::GatewayResult;

use super::{ImageRecord, Metric, RecordQuery, RecordUpdate};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Repository access to image records and lookup metrics.
///
/// Implementations must make `insert` and a guarded `update` atomic per record. The pull state
/// machine relies on nothing else for coordination between orchestrators.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Returns the first record matching `query`, ordered by storage key.
    async fn find_one(&self, query: &RecordQuery) -> GatewayResult<Option<ImageRecord>>;

    /// Returns every record matching `query`, ordered by storage key.
    async fn find(&self, query: &RecordQuery) -> GatewayResult<Vec<ImageRecord>>;

    /// Stores a new record and returns its key.
    ///
    /// Returns `None` when another in-flight record already exists for the same system, image
    /// type and pull tag.
    async fn insert(&self, record: &ImageRecord) -> GatewayResult<Option<i64>>;

    /// Applies `update` to the record with `key`. Returns false if no record changed, either
    /// because it does not exist or because `update.when_status` no longer holds.
    async fn update(&self, key: i64, update: &RecordUpdate) -> GatewayResult<bool>;

    /// Removes the record with `key`. Returns false if it did not exist.
    async fn remove(&self, key: i64) -> GatewayResult<bool>;

    /// Appends a lookup metric.
    async fn insert_metric(&self, metric: &Metric) -> GatewayResult<()>;

    /// Returns up to `limit` of the most recent metrics for `system`, newest first.
    async fn metrics(&self, system: &str, limit: usize) -> GatewayResult<Vec<Metric>>;
}
