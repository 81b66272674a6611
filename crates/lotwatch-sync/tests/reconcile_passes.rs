use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use lotwatch_classify::Classifier;
use lotwatch_core::{
    AuctionItem, CachedEstimate, EstimateConfidence, ItemKey, ItemStatus, ListingDraft,
    NormalizedBatch, PriceSnapshot, RunRecord, ValueEstimate,
};
use lotwatch_storage::{ItemFilter, ItemStore, MemoryItemStore, StoreError};
use lotwatch_sync::ReconciliationEngine;

const SOURCE: &str = "x";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
}

fn lot(id: &str, bid: f64, end: DateTime<Utc>) -> ListingDraft {
    ListingDraft {
        external_id: id.to_string(),
        title: format!("1993 SP Derek Jeter Rookie lot {id}"),
        current_bid: Some(bid),
        bid_count: Some(bid as u32),
        end_time: Some(end),
        ..Default::default()
    }
}

fn batch(at: DateTime<Utc>, items: Vec<ListingDraft>) -> NormalizedBatch {
    let mut batch = NormalizedBatch::new(SOURCE, at);
    batch.items = items;
    batch
}

fn setup() -> (Arc<MemoryItemStore>, ReconciliationEngine) {
    let store = Arc::new(MemoryItemStore::new());
    let engine = ReconciliationEngine::new(store.clone(), Arc::new(Classifier::builtin().unwrap()));
    (store, engine)
}

#[tokio::test]
async fn three_pass_lifecycle() {
    let (store, engine) = setup();
    let a = ItemKey::new(SOURCE, "A");
    let b = ItemKey::new(SOURCE, "B");
    let a_end = t0() + Duration::days(5);
    let b_end = t0() + Duration::hours(3);

    let pass1 = engine
        .reconcile(&batch(t0(), vec![lot("A", 10.0, a_end), lot("B", 5.0, b_end)]), t0())
        .await
        .unwrap();
    assert_eq!(pass1.counts.created, 2);
    assert_eq!(pass1.counts.updated, 0);
    assert_eq!(store.snapshot_count(&a).await + store.snapshot_count(&b).await, 2);
    assert!(store.get_item(&a).await.unwrap().unwrap().is_live());
    assert!(store.get_item(&b).await.unwrap().unwrap().is_live());

    let t1 = t0() + Duration::hours(1);
    let pass2 = engine
        .reconcile(&batch(t1, vec![lot("A", 15.0, a_end)]), t1)
        .await
        .unwrap();
    assert_eq!(pass2.counts.created, 0);
    assert_eq!(pass2.counts.updated, 1);
    let stored_a = store.get_item(&a).await.unwrap().unwrap();
    assert_eq!(stored_a.current_bid, Some(15.0));
    assert_eq!(store.snapshot_count(&a).await, 2);
    let stored_b = store.get_item(&b).await.unwrap().unwrap();
    assert_eq!(stored_b.status, ItemStatus::Live);
    assert_eq!(stored_b.current_bid, Some(5.0));
    assert_eq!(store.snapshot_count(&b).await, 1);
    assert_eq!(pass2.reverify, vec![b.clone()]);

    let t2 = t0() + Duration::hours(4);
    let pass3 = engine.reconcile(&batch(t2, vec![]), t2).await.unwrap();
    assert_eq!(pass3.counts.ended, 1);
    assert_eq!(store.get_item(&b).await.unwrap().unwrap().status, ItemStatus::Ended);
    assert!(store.get_item(&a).await.unwrap().unwrap().is_live());
}

#[tokio::test]
async fn unchanged_batch_is_idempotent() {
    let (store, engine) = setup();
    let end = t0() + Duration::days(2);
    let items = vec![lot("A", 10.0, end), lot("B", 20.0, end)];

    engine.reconcile(&batch(t0(), items.clone()), t0()).await.unwrap();
    for hour in 1..=3 {
        let at = t0() + Duration::hours(hour);
        let report = engine.reconcile(&batch(at, items.clone()), at).await.unwrap();
        assert_eq!(report.counts.created, 0);
        assert_eq!(report.counts.updated, 0);
        assert_eq!(report.counts.unchanged, 2);
        assert_eq!(report.counts.snapshots, 0);
    }
    assert_eq!(store.item_count().await, 2);
    assert_eq!(store.snapshot_count(&ItemKey::new(SOURCE, "A")).await, 1);
}

#[tokio::test]
async fn one_snapshot_per_changed_pass() {
    let (store, engine) = setup();
    let end = t0() + Duration::days(2);
    let key = ItemKey::new(SOURCE, "A");

    for (hour, bid) in [(0, 10.0), (1, 12.0), (2, 12.0), (3, 30.0)] {
        let at = t0() + Duration::hours(hour);
        engine.reconcile(&batch(at, vec![lot("A", bid, end)]), at).await.unwrap();
    }
    assert_eq!(store.snapshot_count(&key).await, 3);

    let history = store.snapshots_since(&key, t0()).await.unwrap();
    let bids: Vec<_> = history.iter().map(|s| s.current_bid).collect();
    assert_eq!(bids, vec![Some(10.0), Some(12.0), Some(30.0)]);
}

#[tokio::test]
async fn past_end_time_ends_item_even_when_present() {
    let (store, engine) = setup();
    let end = t0() + Duration::minutes(30);
    engine.reconcile(&batch(t0(), vec![lot("A", 10.0, end)]), t0()).await.unwrap();

    let later = t0() + Duration::hours(1);
    let report = engine
        .reconcile(&batch(later, vec![lot("A", 10.0, end)]), later)
        .await
        .unwrap();
    assert_eq!(report.counts.ended, 1);
    let item = store.get_item(&ItemKey::new(SOURCE, "A")).await.unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Ended);
}

#[tokio::test]
async fn duplicate_ids_resolve_to_last_record() {
    let (store, engine) = setup();
    let end = t0() + Duration::days(1);
    let report = engine
        .reconcile(
            &batch(t0(), vec![lot("A", 10.0, end), lot("A", 11.0, end), lot("A", 12.0, end)]),
            t0(),
        )
        .await
        .unwrap();
    assert_eq!(report.counts.fetched, 3);
    assert_eq!(report.counts.created, 1);
    let item = store.get_item(&ItemKey::new(SOURCE, "A")).await.unwrap().unwrap();
    assert_eq!(item.current_bid, Some(12.0));
}

#[tokio::test]
async fn other_sources_are_untouched_by_absence() {
    let (store, engine) = setup();
    let end = t0() + Duration::days(1);
    engine.reconcile(&batch(t0(), vec![lot("A", 10.0, end)]), t0()).await.unwrap();

    let mut other = NormalizedBatch::new("y", t0());
    other.items = vec![lot("Z", 1.0, end)];
    engine.reconcile(&other, t0()).await.unwrap();

    let item = store.get_item(&ItemKey::new(SOURCE, "A")).await.unwrap().unwrap();
    assert_eq!(item.missed_passes, 0);
    assert!(!item.needs_reverify);
}

#[tokio::test]
async fn truncated_passes_never_end_unseen_items() {
    let (store, engine) = setup();
    let engine = engine.with_absent_pass_limit(2);
    let a = ItemKey::new(SOURCE, "A");
    let b = ItemKey::new(SOURCE, "B");
    let open_lot = |id: &str| ListingDraft {
        end_time: None,
        ..lot(id, 10.0, t0())
    };
    engine
        .reconcile(&batch(t0(), vec![open_lot("A"), open_lot("B")]), t0())
        .await
        .unwrap();

    for hour in 1..=3 {
        let at = t0() + Duration::hours(hour);
        let mut partial = batch(at, vec![open_lot("A")]);
        partial.truncated = true;
        let report = engine.reconcile(&partial, at).await.unwrap();
        assert_eq!(report.counts.ended, 0);
        assert_eq!(report.reverify, vec![b.clone()]);
    }

    let stored_b = store.get_item(&b).await.unwrap().unwrap();
    assert_eq!(stored_b.status, ItemStatus::Live);
    assert_eq!(stored_b.missed_passes, 0);
    assert!(stored_b.needs_reverify);
    assert!(store.get_item(&a).await.unwrap().unwrap().is_live());

    // A complete pass is evidence again.
    let at = t0() + Duration::hours(4);
    engine.reconcile(&batch(at, vec![open_lot("A")]), at).await.unwrap();
    assert_eq!(store.get_item(&b).await.unwrap().unwrap().missed_passes, 1);
}

fn cached(average: f64, at: DateTime<Utc>) -> CachedEstimate {
    CachedEstimate {
        estimate: ValueEstimate {
            low: average * 0.8,
            high: average * 1.2,
            average,
            confidence: EstimateConfidence::Medium,
            notes: None,
        },
        computed_at: at,
    }
}

/// Lands an estimate write between the engine's read and its upsert, the way
/// a concurrent estimate refresh would.
struct RacingStore {
    inner: MemoryItemStore,
    estimate: CachedEstimate,
}

#[async_trait]
impl ItemStore for RacingStore {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<AuctionItem>, StoreError> {
        let item = self.inner.get_item(key).await?;
        if item.is_some() {
            self.inner.set_estimate(key, &self.estimate).await?;
        }
        Ok(item)
    }

    async fn upsert_item(&self, item: &AuctionItem) -> Result<(), StoreError> {
        self.inner.upsert_item(item).await
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<AuctionItem>, StoreError> {
        self.inner.list_items(filter).await
    }

    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<Vec<ItemKey>, StoreError> {
        self.inner.expire_ended(now).await
    }

    async fn set_estimate(&self, key: &ItemKey, estimate: &CachedEstimate) -> Result<(), StoreError> {
        self.inner.set_estimate(key, estimate).await
    }

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.inner.append_snapshot(snapshot).await
    }

    async fn latest_snapshot(&self, key: &ItemKey) -> Result<Option<PriceSnapshot>, StoreError> {
        self.inner.latest_snapshot(key).await
    }

    async fn snapshots_since(
        &self,
        key: &ItemKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSnapshot>, StoreError> {
        self.inner.snapshots_since(key, since).await
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.record_run(record).await
    }

    async fn recent_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.recent_runs(job_id, limit).await
    }
}

#[tokio::test]
async fn estimate_written_mid_pass_survives_the_upsert() {
    let store = Arc::new(RacingStore {
        inner: MemoryItemStore::new(),
        estimate: cached(250.0, t0()),
    });
    let engine = ReconciliationEngine::new(store.clone(), Arc::new(Classifier::builtin().unwrap()));
    let key = ItemKey::new(SOURCE, "A");
    let end = t0() + Duration::days(2);

    engine.reconcile(&batch(t0(), vec![lot("A", 10.0, end)]), t0()).await.unwrap();
    assert!(store.inner.get_item(&key).await.unwrap().unwrap().estimate.is_none());

    for (hour, bid) in [(1, 15.0), (2, 15.0)] {
        let at = t0() + Duration::hours(hour);
        engine.reconcile(&batch(at, vec![lot("A", bid, end)]), at).await.unwrap();
        let item = store.inner.get_item(&key).await.unwrap().unwrap();
        assert_eq!(item.current_bid, Some(15.0));
        assert_eq!(item.estimate, Some(cached(250.0, t0())));
    }
}
