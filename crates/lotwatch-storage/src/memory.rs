use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{AuctionItem, CachedEstimate, ItemKey, ItemStatus, PriceSnapshot, RunRecord};
use tokio::sync::RwLock;

use crate::store::{ItemFilter, ItemStore, StoreError};

/// Process-local store. Each call takes its lock for the duration of one
/// operation only.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<HashMap<ItemKey, AuctionItem>>,
    snapshots: RwLock<HashMap<ItemKey, Vec<PriceSnapshot>>>,
    runs: RwLock<Vec<RunRecord>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self, key: &ItemKey) -> usize {
        self.snapshots
            .read()
            .await
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<AuctionItem>, StoreError> {
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn upsert_item(&self, item: &AuctionItem) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let mut next = item.clone();
        if let Some(stored) = items.get(&item.key) {
            next.estimate = stored.estimate.clone();
        }
        items.insert(item.key.clone(), next);
        Ok(())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<AuctionItem>, StoreError> {
        let items = self.items.read().await;
        let mut out: Vec<AuctionItem> = items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<Vec<ItemKey>, StoreError> {
        let mut items = self.items.write().await;
        let mut ended = Vec::new();
        for item in items.values_mut() {
            if item.is_live() && item.has_ended_by(now) {
                item.status = ItemStatus::Ended;
                item.needs_reverify = false;
                item.updated_at = now;
                ended.push(item.key.clone());
            }
        }
        ended.sort();
        Ok(ended)
    }

    async fn set_estimate(&self, key: &ItemKey, estimate: &CachedEstimate) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        item.estimate = Some(estimate.clone());
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .entry(snapshot.key.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self, key: &ItemKey) -> Result<Option<PriceSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(key)
            .and_then(|history| history.iter().max_by_key(|s| s.captured_at))
            .cloned())
    }

    async fn snapshots_since(
        &self,
        key: &ItemKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSnapshot>, StoreError> {
        let snapshots = self.snapshots.read().await;
        let mut out: Vec<PriceSnapshot> = snapshots
            .get(key)
            .map(|history| {
                history
                    .iter()
                    .filter(|s| s.captured_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|s| s.captured_at);
        Ok(out)
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.runs.write().await.push(record.clone());
        Ok(())
    }

    async fn recent_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| r.job_id == job_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use lotwatch_core::ListingDraft;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    fn mk_item(source: &str, id: &str, end_time: Option<DateTime<Utc>>) -> AuctionItem {
        AuctionItem::from_draft(
            source,
            ListingDraft {
                external_id: id.into(),
                title: format!("Lot {id}"),
                end_time,
                ..Default::default()
            },
            ts(0),
        )
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let store = MemoryItemStore::new();
        let mut item = mk_item("x", "a", None);
        store.upsert_item(&item).await.unwrap();
        item.current_bid = Some(15.0);
        store.upsert_item(&item).await.unwrap();

        assert_eq!(store.item_count().await, 1);
        let stored = store.get_item(&item.key).await.unwrap().unwrap();
        assert_eq!(stored.current_bid, Some(15.0));
    }

    #[tokio::test]
    async fn expire_sweep_only_touches_live_items_past_end() {
        let store = MemoryItemStore::new();
        store.upsert_item(&mk_item("x", "past", Some(ts(2)))).await.unwrap();
        store.upsert_item(&mk_item("y", "future", Some(ts(9)))).await.unwrap();
        store.upsert_item(&mk_item("y", "open", None)).await.unwrap();

        let ended = store.expire_ended(ts(5)).await.unwrap();
        assert_eq!(ended, vec![ItemKey::new("x", "past")]);
        assert_eq!(store.live_items_for_source("y").await.unwrap().len(), 2);
        assert!(store.expire_ended(ts(5)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshots_read_back_in_time_order() {
        let store = MemoryItemStore::new();
        let item = mk_item("x", "a", None);
        for h in [3, 1, 2] {
            store.append_snapshot(&item.snapshot(ts(h))).await.unwrap();
        }
        let history = store
            .snapshots_since(&item.key, ts(2) - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(
            history.iter().map(|s| s.captured_at).collect::<Vec<_>>(),
            vec![ts(2), ts(3)]
        );
        let latest = store.latest_snapshot(&item.key).await.unwrap().unwrap();
        assert_eq!(latest.captured_at, ts(3));
    }

    fn estimate(average: f64) -> CachedEstimate {
        CachedEstimate {
            estimate: lotwatch_core::ValueEstimate {
                low: average - 1.0,
                high: average + 1.0,
                average,
                confidence: lotwatch_core::EstimateConfidence::Medium,
                notes: None,
            },
            computed_at: ts(1),
        }
    }

    #[tokio::test]
    async fn upsert_keeps_the_stored_estimate() {
        let store = MemoryItemStore::new();
        let mut item = mk_item("x", "a", None);
        store.upsert_item(&item).await.unwrap();
        store.set_estimate(&item.key, &estimate(40.0)).await.unwrap();

        item.current_bid = Some(22.0);
        item.estimate = None;
        store.upsert_item(&item).await.unwrap();

        let stored = store.get_item(&item.key).await.unwrap().unwrap();
        assert_eq!(stored.current_bid, Some(22.0));
        assert_eq!(stored.estimate, Some(estimate(40.0)));
    }

    #[tokio::test]
    async fn estimate_requires_an_existing_item() {
        let store = MemoryItemStore::new();
        let err = store
            .set_estimate(
                &ItemKey::new("x", "missing"),
                &CachedEstimate {
                    estimate: lotwatch_core::ValueEstimate {
                        low: 1.0,
                        high: 2.0,
                        average: 1.5,
                        confidence: lotwatch_core::EstimateConfidence::Low,
                        notes: None,
                    },
                    computed_at: ts(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
