use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lotwatch_core::{ItemKey, ItemStatus, PriceSnapshot, RunCounts};
use lotwatch_storage::{ItemFilter, ItemStore, StoreError};
use tracing::info;

use crate::scheduler::{JobError, JobTask};

/// Daily housekeeping: closes items past their end time across all sources
/// and gives every live item at least one snapshot per UTC day.
pub struct MaintenanceJob {
    store: Arc<dyn ItemStore>,
}

impl MaintenanceJob {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunCounts, StoreError> {
        let mut counts = RunCounts {
            ended: self.store.expire_ended(now).await?.len(),
            ..Default::default()
        };

        let live = self
            .store
            .list_items(&ItemFilter {
                status: Some(ItemStatus::Live),
                ..Default::default()
            })
            .await?;
        let today = now.date_naive();
        for item in live {
            let latest = self.store.latest_snapshot(&item.key).await?;
            if latest.is_some_and(|s| s.captured_at.date_naive() >= today) {
                counts.unchanged += 1;
                continue;
            }
            self.store.append_snapshot(&item.snapshot(now)).await?;
            counts.snapshots += 1;
        }

        info!(ended = counts.ended, snapshots = counts.snapshots, "maintenance pass complete");
        Ok(counts)
    }
}

#[async_trait]
impl JobTask for MaintenanceJob {
    async fn run(&self) -> Result<RunCounts, JobError> {
        Ok(self.run_at(Utc::now()).await?)
    }
}

/// Snapshots for one item over the trailing `days`, oldest first.
pub async fn price_history(
    store: &dyn ItemStore,
    key: &ItemKey,
    days: i64,
    now: DateTime<Utc>,
) -> Result<Vec<PriceSnapshot>, StoreError> {
    store.snapshots_since(key, now - Duration::days(days)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lotwatch_core::{AuctionItem, ListingDraft};
    use lotwatch_storage::MemoryItemStore;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    async fn seed(store: &MemoryItemStore, id: &str, end: Option<DateTime<Utc>>) -> AuctionItem {
        let draft = ListingDraft {
            external_id: id.into(),
            title: format!("Lot {id}"),
            current_bid: Some(50.0),
            end_time: end,
            ..Default::default()
        };
        let item = AuctionItem::from_draft("gregmorris", draft, at(1, 9));
        store.upsert_item(&item).await.unwrap();
        store.append_snapshot(&item.snapshot(at(1, 9))).await.unwrap();
        item
    }

    #[tokio::test]
    async fn daily_floor_snapshots_once_per_day() {
        let store = Arc::new(MemoryItemStore::new());
        let item = seed(&store, "1", Some(at(20, 0))).await;
        let job = MaintenanceJob::new(store.clone());

        let same_day = job.run_at(at(1, 23)).await.unwrap();
        assert_eq!(same_day.snapshots, 0);

        let next_day = job.run_at(at(2, 1)).await.unwrap();
        assert_eq!(next_day.snapshots, 1);
        let again = job.run_at(at(2, 5)).await.unwrap();
        assert_eq!(again.snapshots, 0);

        let history = price_history(store.as_ref(), &item.key, 7, at(2, 6)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].captured_at < history[1].captured_at);
    }

    #[tokio::test]
    async fn expired_items_are_closed_and_skip_the_floor() {
        let store = Arc::new(MemoryItemStore::new());
        let item = seed(&store, "1", Some(at(2, 0))).await;
        let job = MaintenanceJob::new(store.clone());

        let counts = job.run_at(at(3, 0)).await.unwrap();
        assert_eq!(counts.ended, 1);
        assert_eq!(counts.snapshots, 0);
        let stored = store.get_item(&item.key).await.unwrap().unwrap();
        assert_eq!(stored.status, ItemStatus::Ended);
    }
}
