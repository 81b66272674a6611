//! Core domain model for the lotwatch ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotwatch-core";

/// Composite natural key of an auction item. The only identity reconciliation uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub source_id: String,
    pub external_id: String,
}

impl ItemKey {
    pub fn new(source_id: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.external_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Live,
    Ended,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Ended => "ended",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "ended" => Ok(Self::Ended),
            other => Err(format!("unknown item status `{other}`")),
        }
    }
}

/// Third-party grading attributes parsed from a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingFields {
    pub company: Option<String>,
    pub grade: Option<String>,
    pub cert_number: Option<String>,
}

/// Normalized handoff contract from adapters into the reconciliation engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub current_bid: Option<f64>,
    #[serde(default)]
    pub starting_bid: Option<f64>,
    #[serde(default)]
    pub bid_count: Option<u32>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Set when `end_time` was derived from a coarse countdown such as
    /// `2 days 3 hours`; moves within this many seconds are not a reschedule.
    #[serde(default)]
    pub end_time_precision_secs: Option<u32>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub item_url: Option<String>,
    #[serde(default)]
    pub lot_number: Option<String>,
    #[serde(default)]
    pub grading: GradingFields,
    /// Raw category text as reported by the source.
    #[serde(default)]
    pub category: Option<String>,
    /// Manufacturer or set name when the source reports it separately from the title.
    #[serde(default)]
    pub manufacturer: Option<String>,
}

/// One adapter invocation's output: complete-so-far, never half-written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBatch {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub items: Vec<ListingDraft>,
    /// Records the adapter dropped as malformed.
    #[serde(default)]
    pub skipped: usize,
    /// Set when paging stopped early on a later-page failure or the item cap.
    #[serde(default)]
    pub truncated: bool,
}

impl NormalizedBatch {
    pub fn new(source_id: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            fetched_at,
            items: Vec::new(),
            skipped: 0,
            truncated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Basketball,
    Baseball,
    Football,
    Hockey,
    Soccer,
    Golf,
    Boxing,
    Racing,
    Other,
}

impl Sport {
    pub const ALL: [Sport; 9] = [
        Sport::Basketball,
        Sport::Baseball,
        Sport::Football,
        Sport::Hockey,
        Sport::Soccer,
        Sport::Golf,
        Sport::Boxing,
        Sport::Racing,
        Sport::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basketball => "basketball",
            Self::Baseball => "baseball",
            Self::Football => "football",
            Self::Hockey => "hockey",
            Self::Soccer => "soccer",
            Self::Golf => "golf",
            Self::Boxing => "boxing",
            Self::Racing => "racing",
            Self::Other => "other",
        }
    }
}

impl FromStr for Sport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sport::ALL
            .into_iter()
            .find(|sport| sport.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sport `{s}`"))
    }
}

/// Kind of collectible a listing is, independent of its sport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Card,
    Memorabilia,
    Autograph,
    Sealed,
    Other,
}

impl ItemType {
    pub const ALL: [ItemType; 5] = [
        ItemType::Card,
        ItemType::Memorabilia,
        ItemType::Autograph,
        ItemType::Sealed,
        ItemType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Memorabilia => "memorabilia",
            Self::Autograph => "autograph",
            Self::Sealed => "sealed",
            Self::Other => "other",
        }
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown item type `{s}`"))
    }
}

/// Which classifier layer produced the final label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationLayer {
    NonSport,
    Entity,
    Structural,
    Combined,
    NoSignal,
}

impl ClassificationLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonSport => "non_sport",
            Self::Entity => "entity",
            Self::Structural => "structural",
            Self::Combined => "combined",
            Self::NoSignal => "no_signal",
        }
    }
}

impl FromStr for ClassificationLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non_sport" => Ok(Self::NonSport),
            "entity" => Ok(Self::Entity),
            "structural" => Ok(Self::Structural),
            "combined" => Ok(Self::Combined),
            "no_signal" => Ok(Self::NoSignal),
            other => Err(format!("unknown classification layer `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: Sport,
    /// Bounded display score in `0.0..=1.0`, not a probability.
    pub confidence: f64,
    pub layer: ClassificationLayer,
    pub rule_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateConfidence {
    Low,
    Medium,
    High,
}

impl EstimateConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for EstimateConfidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown estimate confidence `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueEstimate {
    pub low: f64,
    pub high: f64,
    pub average: f64,
    pub confidence: EstimateConfidence,
    pub notes: Option<String>,
}

/// Value estimate stored inline on the item once computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEstimate {
    pub estimate: ValueEstimate,
    pub computed_at: DateTime<Utc>,
}

/// Durable canonical record for one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionItem {
    pub key: ItemKey,
    pub title: String,
    pub description: Option<String>,
    pub current_bid: Option<f64>,
    pub starting_bid: Option<f64>,
    pub bid_count: Option<u32>,
    pub end_time: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    pub item_url: Option<String>,
    pub lot_number: Option<String>,
    pub grading: GradingFields,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub classification: Option<Classification>,
    pub item_type: Option<ItemType>,
    pub status: ItemStatus,
    pub estimate: Option<CachedEstimate>,
    /// Consecutive same-source passes this live item was absent from.
    pub missed_passes: u32,
    pub needs_reverify: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuctionItem {
    pub fn from_draft(source_id: &str, draft: ListingDraft, now: DateTime<Utc>) -> Self {
        Self {
            key: ItemKey::new(source_id, draft.external_id),
            title: draft.title,
            description: draft.description,
            current_bid: draft.current_bid,
            starting_bid: draft.starting_bid,
            bid_count: draft.bid_count,
            end_time: draft.end_time,
            image_url: draft.image_url,
            item_url: draft.item_url,
            lot_number: draft.lot_number,
            grading: draft.grading,
            category: draft.category,
            manufacturer: draft.manufacturer,
            classification: None,
            item_type: None,
            status: ItemStatus::Live,
            estimate: None,
            missed_passes: 0,
            needs_reverify: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status == ItemStatus::Live
    }

    pub fn has_ended_by(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| end < now)
    }

    pub fn snapshot(&self, captured_at: DateTime<Utc>) -> PriceSnapshot {
        PriceSnapshot {
            key: self.key.clone(),
            captured_at,
            current_bid: self.current_bid,
            bid_count: self.bid_count,
            status: self.status,
        }
    }
}

/// Append-only price history fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub key: ItemKey,
    pub captured_at: DateTime<Utc>,
    pub current_bid: Option<f64>,
    pub bid_count: Option<u32>,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    /// Trigger arrived while the job was already running.
    Skipped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub ended: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub snapshots: usize,
}

/// One execution attempt of a job. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub counts: RunCounts,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn skipped(job_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id: job_id.into(),
            started_at: at,
            finished_at: at,
            outcome: RunOutcome::Skipped,
            counts: RunCounts::default(),
            error: Some("already running".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    /// Paused or disabled.
    Inactive,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn draft_becomes_live_item_keyed_by_source() {
        let draft = ListingDraft {
            external_id: "abc".into(),
            title: "2003 Topps LeBron James".into(),
            current_bid: Some(10.0),
            end_time: Some(ts(12)),
            ..Default::default()
        };
        let item = AuctionItem::from_draft("cardhobby", draft, ts(1));
        assert_eq!(item.key, ItemKey::new("cardhobby", "abc"));
        assert_eq!(item.status, ItemStatus::Live);
        assert_eq!(item.created_at, item.updated_at);
        assert!(!item.has_ended_by(ts(11)));
        assert!(item.has_ended_by(ts(13)));
    }

    #[test]
    fn item_without_end_time_never_ends_by_time() {
        let item = AuctionItem::from_draft(
            "gregmorris",
            ListingDraft {
                external_id: "1".into(),
                title: "x".into(),
                ..Default::default()
            },
            ts(1),
        );
        assert!(!item.has_ended_by(ts(23)));
    }

    #[test]
    fn enums_round_trip_through_their_text_form() {
        for sport in Sport::ALL {
            assert_eq!(sport.as_str().parse::<Sport>().unwrap(), sport);
        }
        for kind in ItemType::ALL {
            assert_eq!(kind.as_str().parse::<ItemType>().unwrap(), kind);
        }
        assert_eq!("CARD".parse::<ItemType>().unwrap(), ItemType::Card);
        assert_eq!("ended".parse::<ItemStatus>().unwrap(), ItemStatus::Ended);
        assert_eq!(
            "combined".parse::<ClassificationLayer>().unwrap(),
            ClassificationLayer::Combined
        );
        assert!("mystery".parse::<Sport>().is_err());
    }

    #[test]
    fn draft_deserializes_with_only_required_fields() {
        let draft: ListingDraft =
            serde_json::from_str(r#"{"external_id":"9","title":"Lot 9"}"#).unwrap();
        assert_eq!(draft.external_id, "9");
        assert!(draft.current_bid.is_none());
        assert_eq!(draft.grading, GradingFields::default());
    }
}
