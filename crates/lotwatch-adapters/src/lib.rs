//! Source adapter contract, per-marketplace adapters and the startup registry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use lotwatch_core::{GradingFields, ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod cardhobby;
mod gregmorris;
mod manual;
mod pristine;
mod queencity;

pub use cardhobby::CardHobbyAdapter;
pub use gregmorris::GregMorrisAdapter;
pub use manual::ManualFileAdapter;
pub use pristine::PristineAdapter;
pub use queencity::QueenCityAdapter;

pub const CRATE_NAME: &str = "lotwatch-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

/// Whole-batch failure: network, auth, or a structural break in the source format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("source `{source_id}` unavailable: {reason}")]
pub struct SourceUnavailable {
    pub source_id: String,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(source_id: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Per-source tuning read from the sources file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SourceOptions {
    /// Overrides the adapter's built-in endpoint(s).
    #[serde(default)]
    pub listing_urls: Vec<String>,
    /// Listings whose current bid is below this are dropped.
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    /// Batch file read by the manual adapter.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetches up to `max_items` listings. Malformed records are skipped and
    /// counted; only a failure that yields nothing usable is an error.
    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable>;
}

/// One parsed page of listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub items: Vec<ListingDraft>,
    pub skipped: usize,
    pub has_more: bool,
}

/// Accumulates pages into a batch under the item cap and the
/// first-page-fatal, later-page-truncates error contract.
#[derive(Debug)]
pub struct BatchBuilder {
    batch: NormalizedBatch,
    max_items: usize,
    pages: usize,
    more_pending: bool,
}

impl BatchBuilder {
    pub fn new(source_id: &str, fetched_at: DateTime<Utc>, max_items: usize) -> Self {
        Self {
            batch: NormalizedBatch::new(source_id, fetched_at),
            max_items,
            pages: 0,
            more_pending: false,
        }
    }

    pub fn is_full(&self) -> bool {
        self.batch.items.len() >= self.max_items
    }

    /// Adds a page; returns whether another page should be requested.
    pub fn push_page(&mut self, page: ParsedPage) -> bool {
        self.pages += 1;
        self.more_pending = page.has_more;
        self.batch.skipped += page.skipped;
        for item in page.items {
            if self.is_full() {
                self.batch.truncated = true;
                return false;
            }
            self.batch.items.push(item);
        }
        if page.has_more && self.is_full() {
            self.batch.truncated = true;
        }
        page.has_more && !self.is_full()
    }

    pub fn page_failed(&mut self, err: impl std::fmt::Display) -> Result<(), SourceUnavailable> {
        if self.pages == 0 {
            return Err(SourceUnavailable::new(self.batch.source_id.clone(), err));
        }
        warn!(
            source_id = %self.batch.source_id,
            page = self.pages + 1,
            error = %err,
            "page fetch failed; keeping batch so far"
        );
        self.batch.truncated = true;
        Ok(())
    }

    /// A caller that stops at its page limit while the last page still had
    /// more leaves a truncated batch.
    pub fn finish(mut self) -> NormalizedBatch {
        if self.more_pending {
            self.batch.truncated = true;
        }
        self.batch
    }
}

/// Explicit source-id-to-adapter map, built once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.source_id().to_string(), adapter);
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id).cloned()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}

pub fn adapter_for_source(source_id: &str, options: &SourceOptions) -> Option<Arc<dyn SourceAdapter>> {
    match source_id {
        cardhobby::SOURCE_ID => Some(Arc::new(CardHobbyAdapter::new(options.clone()))),
        gregmorris::SOURCE_ID => Some(Arc::new(GregMorrisAdapter::new(options.clone()))),
        queencity::SOURCE_ID => Some(Arc::new(QueenCityAdapter::new(options.clone()))),
        pristine::SOURCE_ID => Some(Arc::new(PristineAdapter::new(options.clone()))),
        manual::SOURCE_ID => options
            .path
            .clone()
            .map(|path| Arc::new(ManualFileAdapter::new(path)) as Arc<dyn SourceAdapter>),
        _ => None,
    }
}

static GRADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(PSA|BGS|Beckett|SGC|CGC|BCCG)\s+(?:[\w\-+]+\s+)?(\d+(?:\.\d+)?)\b").unwrap()
});
static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$?\s*(\d[\d,]*(?:\.\d+)?)").unwrap());
static DAYS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*days?").unwrap());
static HOURS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*(?:hours?|hrs?)").unwrap());
static MINUTES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*min").unwrap());

pub fn normalize_grading_company(raw: &str) -> String {
    match raw.trim().to_ascii_uppercase().as_str() {
        "BGS" | "BECKETT" | "BCCG" => "Beckett".to_string(),
        other => other.to_string(),
    }
}

/// Grading company and grade as written in a listing title, e.g. `PSA 10`
/// or `BGS Pristine 9.5`.
pub fn parse_grading(title: &str) -> GradingFields {
    match GRADING_RE.captures(title) {
        Some(caps) => GradingFields {
            company: Some(normalize_grading_company(&caps[1])),
            grade: Some(caps[2].to_string()),
            cert_number: None,
        },
        None => GradingFields::default(),
    }
}

pub fn parse_price(text: &str) -> Option<f64> {
    PRICE_RE
        .captures(text)
        .and_then(|caps| caps[1].replace(',', "").parse::<f64>().ok())
}

/// Turns `3 days 4 hours` style countdown text into an absolute end time.
pub fn parse_time_remaining(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let grab = |re: &Regex| {
        re.captures(text)
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .unwrap_or(0)
    };
    let (days, hours, minutes) = (grab(&DAYS_RE), grab(&HOURS_RE), grab(&MINUTES_RE));
    if days == 0 && hours == 0 && minutes == 0 {
        return None;
    }
    Some(now + Duration::days(days) + Duration::hours(hours) + Duration::minutes(minutes))
}

/// Resolution of a countdown: its smallest unit, or `None` when it has none.
pub fn countdown_precision(text: &str) -> Option<Duration> {
    if MINUTES_RE.is_match(text) {
        Some(Duration::minutes(1))
    } else if HOURS_RE.is_match(text) {
        Some(Duration::hours(1))
    } else if DAYS_RE.is_match(text) {
        Some(Duration::days(1))
    } else {
        None
    }
}

/// Source timestamps carry no zone; they are UTC.
pub fn parse_source_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.with_timezone(&Utc)))
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Walks a JSON object path, e.g. `["data", "PagedMarketItemList"]`.
fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |cur, key| cur.get(*key))
}

fn json_string(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers arrive both as JSON numbers and as formatted strings.
fn json_f64(value: &JsonValue, key: &str) -> Option<f64> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s),
        _ => None,
    }
}

fn json_u32(value: &JsonValue, key: &str) -> Option<u32> {
    match value.get(key)? {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
