use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lotwatch_adapters::{AdapterContext, AdapterRegistry, SourceAdapter, SourceUnavailable};
use lotwatch_classify::Classifier;
use lotwatch_core::{
    AuctionItem, CachedEstimate, ItemKey, ListingDraft, NormalizedBatch, PriceSnapshot,
    RunOutcome, RunRecord,
};
use lotwatch_storage::{HttpFetcher, ItemFilter, ItemStore, MemoryItemStore, StoreError};
use lotwatch_sync::{Pipeline, SourceRegistry, SyncConfig, Trigger};

/// Serves queued batches in order; an empty queue means the source is down.
struct ScriptedAdapter {
    source_id: String,
    batches: Mutex<VecDeque<Vec<ListingDraft>>>,
    delay: Duration,
}

impl ScriptedAdapter {
    fn new(source_id: &str, batches: Vec<Vec<ListingDraft>>) -> Self {
        Self {
            source_id: source_id.to_string(),
            batches: Mutex::new(batches.into()),
            delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.batches.lock().unwrap().pop_front();
        let items = next.ok_or_else(|| SourceUnavailable::new(&self.source_id, "no scripted batch"))?;
        let mut batch = NormalizedBatch::new(&self.source_id, ctx.fetched_at);
        batch.truncated = items.len() > max_items;
        batch.items = items.into_iter().take(max_items).collect();
        Ok(batch)
    }
}

/// Memory store whose writes fail for one poisoned external id.
struct PoisonedStore {
    inner: MemoryItemStore,
    poison: String,
}

#[async_trait]
impl ItemStore for PoisonedStore {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<AuctionItem>, StoreError> {
        self.inner.get_item(key).await
    }

    async fn upsert_item(&self, item: &AuctionItem) -> Result<(), StoreError> {
        if item.key.external_id == self.poison {
            return Err(StoreError::Backend("disk full".into()));
        }
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

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).single().unwrap()
}

fn lot(id: &str, bid: f64) -> ListingDraft {
    ListingDraft {
        external_id: id.to_string(),
        title: format!("1957 Topps Bill Russell rookie {id}"),
        current_bid: Some(bid),
        bid_count: Some(1),
        end_time: Some(far_future()),
        ..Default::default()
    }
}

fn pipeline_with(store: Arc<dyn ItemStore>, adapter: ScriptedAdapter) -> Pipeline {
    let source_id = adapter.source_id.clone();
    let mut adapters = AdapterRegistry::new();
    adapters.register(Arc::new(adapter));
    let sources = SourceRegistry::from_yaml_str(&format!(
        "sources:\n  - {{source_id: {source_id}, interval_minutes: 30, max_items: 50}}\n"
    ))
    .unwrap();
    let config = SyncConfig {
        adapter_timeout: Duration::from_millis(200),
        run_timeout: Duration::from_secs(5),
        ..SyncConfig::default()
    };
    Pipeline::with_adapters(config, store, Classifier::builtin().unwrap(), sources, adapters).unwrap()
}

#[tokio::test]
async fn run_records_carry_reconcile_counts() {
    let store = Arc::new(MemoryItemStore::new());
    let adapter = ScriptedAdapter::new(
        "scripted",
        vec![vec![lot("A", 10.0), lot("B", 5.0)], vec![lot("A", 15.0), lot("B", 5.0)]],
    );
    let pipeline = pipeline_with(store.clone(), adapter);

    let first = pipeline.run_source_once("scripted").await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(first.counts.created, 2);

    let second = pipeline.run_source_once("scripted").await.unwrap();
    assert_eq!(second.counts.updated, 1);
    assert_eq!(second.counts.unchanged, 1);

    let persisted = store.recent_runs("scripted", 10).await.unwrap();
    assert_eq!(persisted.len(), 2);
}

#[tokio::test]
async fn unavailable_source_fails_the_run_not_the_process() {
    let store = Arc::new(MemoryItemStore::new());
    let pipeline = pipeline_with(store, ScriptedAdapter::new("empty", vec![]));

    let record = pipeline.run_source_once("empty").await.unwrap();
    assert_eq!(record.outcome, RunOutcome::Failed);
    assert!(record.error.unwrap().contains("no scripted batch"));
    assert!(pipeline.scheduler().run_now("empty").is_ok());
}

#[tokio::test]
async fn adapter_timeout_fails_the_run_and_writes_nothing() {
    let store = Arc::new(MemoryItemStore::new());
    let mut adapter = ScriptedAdapter::new("slow", vec![vec![lot("A", 1.0)]]);
    adapter.delay = Duration::from_secs(2);
    let pipeline = pipeline_with(store.clone(), adapter);

    let record = pipeline.run_source_once("slow").await.unwrap();
    assert_eq!(record.outcome, RunOutcome::Failed);
    assert!(record.error.unwrap().contains("timed out"));
    assert_eq!(store.item_count().await, 0);
}

#[tokio::test]
async fn storage_failure_keeps_committed_items_and_resumes() {
    let store = Arc::new(PoisonedStore {
        inner: MemoryItemStore::new(),
        poison: "P".to_string(),
    });
    let adapter = ScriptedAdapter::new(
        "shaky",
        vec![
            vec![lot("A", 10.0), lot("P", 1.0), lot("C", 3.0)],
            vec![lot("A", 10.0), lot("C", 3.0)],
        ],
    );
    let pipeline = pipeline_with(store.clone(), adapter);

    let failed = pipeline.run_source_once("shaky").await.unwrap();
    assert_eq!(failed.outcome, RunOutcome::Failed);
    assert_eq!(failed.counts.created, 1);
    assert!(failed.error.unwrap().contains("disk full"));
    assert!(store.get_item(&ItemKey::new("shaky", "A")).await.unwrap().is_some());
    assert!(store.get_item(&ItemKey::new("shaky", "C")).await.unwrap().is_none());

    let resumed = pipeline.run_source_once("shaky").await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.counts.created, 1);
    assert_eq!(resumed.counts.unchanged, 1);
}

#[tokio::test]
async fn concurrent_trigger_does_not_double_run() {
    let store = Arc::new(MemoryItemStore::new());
    let mut adapter = ScriptedAdapter::new("busy", vec![vec![lot("A", 1.0)], vec![lot("A", 2.0)]]);
    adapter.delay = Duration::from_millis(100);
    let pipeline = pipeline_with(store.clone(), adapter);

    let first = pipeline.scheduler().run_now("busy").unwrap();
    let second = pipeline.scheduler().run_now("busy").unwrap();
    assert!(matches!(second, Trigger::Skipped(_)));
    let Trigger::Dispatched(handle) = first else {
        panic!("first trigger should dispatch");
    };
    assert_eq!(handle.await.unwrap().outcome, RunOutcome::Success);

    let runs = store.recent_runs("busy", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
}
