use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{AuctionItem, CachedEstimate, ItemKey, ItemStatus, PriceSnapshot, RunRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or could not complete the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// The operation targets an item that was never written.
    #[error("item {0} not found")]
    NotFound(ItemKey),
    /// A persisted row could not be mapped back into the domain model.
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Range/filter read over stored items. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub source_id: Option<String>,
    pub status: Option<ItemStatus>,
    pub ending_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn matches(&self, item: &AuctionItem) -> bool {
        if let Some(source_id) = &self.source_id {
            if &item.key.source_id != source_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if item.status != status {
                return false;
            }
        }
        if let Some(cutoff) = self.ending_before {
            if !item.end_time.is_some_and(|end| end < cutoff) {
                return false;
            }
        }
        true
    }
}

/// Durable store for auction items, price snapshots and run records.
///
/// Every method is an independent atomic operation; callers never hold a
/// store-wide lock across a batch.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<AuctionItem>, StoreError>;

    /// Create-if-absent, replace-if-present against `item.key`.
    ///
    /// A stored estimate is never overwritten by an upsert; only
    /// `set_estimate` changes it once the item exists.
    async fn upsert_item(&self, item: &AuctionItem) -> Result<(), StoreError>;

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<AuctionItem>, StoreError>;

    async fn live_items_for_source(&self, source_id: &str) -> Result<Vec<AuctionItem>, StoreError> {
        self.list_items(&ItemFilter {
            source_id: Some(source_id.to_string()),
            status: Some(ItemStatus::Live),
            ..Default::default()
        })
        .await
    }

    /// Marks every live item whose end time is strictly before `now` as ended
    /// and returns the keys it transitioned.
    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<Vec<ItemKey>, StoreError>;

    async fn set_estimate(&self, key: &ItemKey, estimate: &CachedEstimate) -> Result<(), StoreError>;

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError>;

    async fn latest_snapshot(&self, key: &ItemKey) -> Result<Option<PriceSnapshot>, StoreError>;

    /// Snapshots captured at or after `since`, oldest first.
    async fn snapshots_since(
        &self,
        key: &ItemKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSnapshot>, StoreError>;

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    async fn recent_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}
