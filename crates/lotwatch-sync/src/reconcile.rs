use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lotwatch_classify::{ClassifyInput, Classifier};
use lotwatch_core::{AuctionItem, ItemKey, ItemStatus, ListingDraft, NormalizedBatch, RunCounts};
use lotwatch_storage::{ItemStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_ABSENT_PASS_LIMIT: u32 = 3;

/// A single record that cannot be merged. Skipped and counted, never fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ItemError {
    #[error("record {index} has a blank external id")]
    BlankExternalId { index: usize },
    #[error("item `{external_id}` has a blank title")]
    BlankTitle { external_id: String },
    #[error("item `{external_id}` has invalid {field} {value}")]
    InvalidAmount {
        external_id: String,
        field: &'static str,
        value: f64,
    },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Writes applied before the failure stand; the counts say how far it got.
    #[error("storage failure during reconcile: {source}")]
    Storage {
        counts: RunCounts,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn counts(&self) -> RunCounts {
        match self {
            Self::Storage { counts, .. } => *counts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub counts: RunCounts,
    /// Live items absent from this pass whose end time is still ahead.
    pub reverify: Vec<ItemKey>,
    pub item_errors: Vec<ItemError>,
}

/// Merges normalized batches into the item store.
pub struct ReconciliationEngine {
    store: Arc<dyn ItemStore>,
    classifier: Arc<Classifier>,
    absent_pass_limit: u32,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn ItemStore>, classifier: Arc<Classifier>) -> Self {
        Self {
            store,
            classifier,
            absent_pass_limit: DEFAULT_ABSENT_PASS_LIMIT,
        }
    }

    /// Consecutive absent passes after which a live item with no end time is closed.
    pub fn with_absent_pass_limit(mut self, limit: u32) -> Self {
        self.absent_pass_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    pub async fn reconcile(
        &self,
        batch: &NormalizedBatch,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let span = info_span!("reconcile", source_id = %batch.source_id, items = batch.items.len());
        self.reconcile_inner(batch, now).instrument(span).await
    }

    async fn reconcile_inner(
        &self,
        batch: &NormalizedBatch,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let source_id = batch.source_id.as_str();
        let mut report = ReconcileReport::default();
        report.counts.fetched = batch.items.len();
        report.counts.skipped = batch.skipped;

        let mut seen: HashSet<String> = HashSet::new();
        for (index, draft) in dedupe_last_wins(&batch.items) {
            if let Err(err) = validate(index, draft) {
                warn!(error = %err, "skipping item");
                report.counts.skipped += 1;
                report.item_errors.push(err);
                continue;
            }
            let mut draft = draft.clone();
            draft.external_id = draft.external_id.trim().to_string();
            seen.insert(draft.external_id.clone());
            self.merge(source_id, draft, now, &mut report.counts).await?;
        }

        let live = self
            .store
            .live_items_for_source(source_id)
            .await
            .map_err(|source| storage(report.counts, source))?;
        for item in live {
            if seen.contains(&item.key.external_id) {
                continue;
            }
            let key = if batch.truncated {
                self.defer_absent(item, now, &report.counts).await?
            } else {
                self.mark_absent(item, now, &mut report.counts).await?
            };
            if let Some(key) = key {
                report.reverify.push(key);
            }
        }

        let expired = self
            .store
            .expire_ended(now)
            .await
            .map_err(|source| storage(report.counts, source))?;
        report.counts.ended += expired.iter().filter(|k| k.source_id == source_id).count();

        let counts = report.counts;
        info!(
            fetched = counts.fetched,
            created = counts.created,
            updated = counts.updated,
            ended = counts.ended,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            snapshots = counts.snapshots,
            reverify = report.reverify.len(),
            "reconciled batch"
        );
        Ok(report)
    }

    async fn merge(
        &self,
        source_id: &str,
        draft: ListingDraft,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<(), ReconcileError> {
        let key = ItemKey::new(source_id, draft.external_id.clone());
        let existing = self
            .store
            .get_item(&key)
            .await
            .map_err(|source| storage(*counts, source))?;

        let Some(mut item) = existing else {
            let mut item = AuctionItem::from_draft(source_id, draft, now);
            self.classify(&mut item);
            self.write(&item, counts).await?;
            self.snapshot(&item, now, counts).await?;
            counts.created += 1;
            debug!(key = %key, "created item");
            return Ok(());
        };

        let change = apply_sighting(&mut item, draft, now);
        let stale_rules = item
            .classification
            .as_ref()
            .is_none_or(|c| c.rule_version != self.classifier.version());
        if change.text || change.grading || stale_rules || item.item_type.is_none() {
            self.classify(&mut item);
        }

        self.write(&item, counts).await?;
        if change.price || change.schedule || change.revived {
            self.snapshot(&item, now, counts).await?;
        }
        if change.any() {
            counts.updated += 1;
            debug!(key = %key, price = change.price, revived = change.revived, "updated item");
        } else {
            counts.unchanged += 1;
        }
        Ok(())
    }

    /// A truncated batch cannot prove absence: the item is flagged for
    /// re-verification but its miss counter and status stay as they are.
    /// Items already past their end time are left to the expiry sweep.
    async fn defer_absent(
        &self,
        mut item: AuctionItem,
        now: DateTime<Utc>,
        counts: &RunCounts,
    ) -> Result<Option<ItemKey>, ReconcileError> {
        if item.has_ended_by(now) {
            return Ok(None);
        }
        if !item.needs_reverify {
            item.needs_reverify = true;
            item.updated_at = now;
            self.write(&item, counts).await?;
        }
        Ok(Some(item.key))
    }

    /// Sport label and item type are both pure functions of the listing text.
    fn classify(&self, item: &mut AuctionItem) {
        let input = ClassifyInput::from(&*item);
        let classification = self.classifier.classify(&input);
        let item_type = self.classifier.item_type(&input);
        item.classification = Some(classification);
        item.item_type = Some(item_type);
    }

    /// Returns the key when the item stays live pending re-verification.
    async fn mark_absent(
        &self,
        mut item: AuctionItem,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<Option<ItemKey>, ReconcileError> {
        item.missed_passes = item.missed_passes.saturating_add(1);
        item.updated_at = now;

        let reverify = if item.has_ended_by(now) {
            item.status = ItemStatus::Ended;
            item.needs_reverify = false;
            false
        } else if item.end_time.is_none() && item.missed_passes >= self.absent_pass_limit {
            info!(key = %item.key, missed = item.missed_passes, "closing item absent from source");
            item.status = ItemStatus::Ended;
            item.needs_reverify = false;
            false
        } else {
            item.needs_reverify = true;
            true
        };

        self.write(&item, counts).await?;
        if item.status == ItemStatus::Ended {
            counts.ended += 1;
            return Ok(None);
        }
        Ok(reverify.then(|| item.key.clone()))
    }

    async fn write(&self, item: &AuctionItem, counts: &RunCounts) -> Result<(), ReconcileError> {
        self.store
            .upsert_item(item)
            .await
            .map_err(|source| storage(*counts, source))
    }

    async fn snapshot(
        &self,
        item: &AuctionItem,
        now: DateTime<Utc>,
        counts: &mut RunCounts,
    ) -> Result<(), ReconcileError> {
        self.store
            .append_snapshot(&item.snapshot(now))
            .await
            .map_err(|source| storage(*counts, source))?;
        counts.snapshots += 1;
        Ok(())
    }
}

fn storage(counts: RunCounts, source: StoreError) -> ReconcileError {
    ReconcileError::Storage { counts, source }
}

/// Keeps the last record per external id, ordered by that record's position.
fn dedupe_last_wins(items: &[ListingDraft]) -> Vec<(usize, &ListingDraft)> {
    let mut seen = HashSet::new();
    let mut out: Vec<(usize, &ListingDraft)> = items
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, draft)| {
            let id = draft.external_id.trim();
            id.is_empty() || seen.insert(id)
        })
        .collect();
    out.reverse();
    out
}

fn validate(index: usize, draft: &ListingDraft) -> Result<(), ItemError> {
    let external_id = draft.external_id.trim();
    if external_id.is_empty() {
        return Err(ItemError::BlankExternalId { index });
    }
    if draft.title.trim().is_empty() {
        return Err(ItemError::BlankTitle {
            external_id: external_id.to_string(),
        });
    }
    for (field, value) in [("current_bid", draft.current_bid), ("starting_bid", draft.starting_bid)] {
        if let Some(value) = value.filter(|v| !v.is_finite() || *v < 0.0) {
            return Err(ItemError::InvalidAmount {
                external_id: external_id.to_string(),
                field,
                value,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct Change {
    price: bool,
    schedule: bool,
    text: bool,
    grading: bool,
    other: bool,
    revived: bool,
}

impl Change {
    fn any(&self) -> bool {
        self.price || self.schedule || self.text || self.grading || self.other || self.revived
    }
}

/// A countdown-derived end time that lands within its own precision of the
/// stored one is the same end time read at a different moment.
fn same_end_time(stored: Option<DateTime<Utc>>, draft: &ListingDraft) -> bool {
    match (stored, draft.end_time, draft.end_time_precision_secs) {
        (Some(old), Some(new), Some(precision)) => {
            (new - old).num_seconds().abs() <= i64::from(precision)
        }
        _ => stored == draft.end_time,
    }
}

/// Applies a fresh sighting to a stored item and reports which groups changed.
fn apply_sighting(item: &mut AuctionItem, mut draft: ListingDraft, now: DateTime<Utc>) -> Change {
    if draft.end_time != item.end_time && same_end_time(item.end_time, &draft) {
        draft.end_time = item.end_time;
    }
    let mut change = Change {
        price: item.current_bid != draft.current_bid || item.bid_count != draft.bid_count,
        schedule: item.end_time != draft.end_time,
        text: item.title != draft.title
            || item.description != draft.description
            || item.category != draft.category
            || item.manufacturer != draft.manufacturer,
        grading: item.grading != draft.grading,
        other: item.starting_bid != draft.starting_bid
            || item.image_url != draft.image_url
            || item.item_url != draft.item_url
            || item.lot_number != draft.lot_number,
        revived: false,
    };

    item.title = draft.title;
    item.description = draft.description;
    item.current_bid = draft.current_bid;
    item.starting_bid = draft.starting_bid;
    item.bid_count = draft.bid_count;
    item.end_time = draft.end_time;
    item.image_url = draft.image_url;
    item.item_url = draft.item_url;
    item.lot_number = draft.lot_number;
    item.grading = draft.grading;
    item.category = draft.category;
    item.manufacturer = draft.manufacturer;
    item.missed_passes = 0;
    item.needs_reverify = false;
    item.updated_at = now;

    if item.status == ItemStatus::Ended && !item.has_ended_by(now) {
        item.status = ItemStatus::Live;
        change.revived = true;
    }
    change
}
