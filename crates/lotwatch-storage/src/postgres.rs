use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{
    AuctionItem, CachedEstimate, Classification, ClassificationLayer, EstimateConfidence,
    GradingFields, ItemKey, ItemStatus, ItemType, PriceSnapshot, RunCounts, RunOutcome, RunRecord, Sport,
    ValueEstimate,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::store::{ItemFilter, ItemStore, StoreError};

/// PostgreSQL-backed store. Upserts are single statements keyed on
/// `(source_id, external_id)` so concurrent jobs never contend on a table lock.
#[derive(Debug, Clone)]
pub struct PgItemStore {
    pool: PgPool,
}

impl PgItemStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(format!("running migrations: {err}")))
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn parse_column<T, E: std::fmt::Display>(column: &str, parsed: Result<T, E>) -> Result<T, StoreError> {
    parsed.map_err(|err| StoreError::Corrupt(format!("{column}: {err}")))
}

fn item_from_row(row: &PgRow) -> Result<AuctionItem, StoreError> {
    let status: String = row.try_get("status")?;
    let classification = match row.try_get::<Option<String>, _>("sport")? {
        Some(label) => {
            let layer: Option<String> = row.try_get("sport_layer")?;
            Some(Classification {
                label: parse_column("sport", label.parse::<Sport>())?,
                confidence: row.try_get::<Option<f64>, _>("sport_confidence")?.unwrap_or(0.0),
                layer: parse_column(
                    "sport_layer",
                    layer.as_deref().unwrap_or("no_signal").parse::<ClassificationLayer>(),
                )?,
                rule_version: row
                    .try_get::<Option<i32>, _>("classifier_version")?
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0),
            })
        }
        None => None,
    };

    let estimate = match row.try_get::<Option<DateTime<Utc>>, _>("estimate_computed_at")? {
        Some(computed_at) => {
            let confidence: Option<String> = row.try_get("estimate_confidence")?;
            Some(CachedEstimate {
                estimate: ValueEstimate {
                    low: row.try_get::<Option<f64>, _>("estimate_low")?.unwrap_or(0.0),
                    high: row.try_get::<Option<f64>, _>("estimate_high")?.unwrap_or(0.0),
                    average: row.try_get::<Option<f64>, _>("estimate_average")?.unwrap_or(0.0),
                    confidence: parse_column(
                        "estimate_confidence",
                        confidence.as_deref().unwrap_or("low").parse::<EstimateConfidence>(),
                    )?,
                    notes: row.try_get("estimate_notes")?,
                },
                computed_at,
            })
        }
        None => None,
    };

    let item_type = row
        .try_get::<Option<String>, _>("item_type")?
        .map(|kind| parse_column("item_type", kind.parse::<ItemType>()))
        .transpose()?;

    Ok(AuctionItem {
        key: ItemKey::new(
            row.try_get::<String, _>("source_id")?,
            row.try_get::<String, _>("external_id")?,
        ),
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        current_bid: row.try_get("current_bid")?,
        starting_bid: row.try_get("starting_bid")?,
        bid_count: row
            .try_get::<Option<i32>, _>("bid_count")?
            .and_then(|v| u32::try_from(v).ok()),
        end_time: row.try_get("end_time")?,
        image_url: row.try_get("image_url")?,
        item_url: row.try_get("item_url")?,
        lot_number: row.try_get("lot_number")?,
        grading: GradingFields {
            company: row.try_get("grading_company")?,
            grade: row.try_get("grade")?,
            cert_number: row.try_get("cert_number")?,
        },
        category: row.try_get("category")?,
        manufacturer: row.try_get("manufacturer")?,
        classification,
        item_type,
        status: parse_column("status", status.parse::<ItemStatus>())?,
        estimate,
        missed_passes: u32::try_from(row.try_get::<i32, _>("missed_passes")?).unwrap_or(0),
        needs_reverify: row.try_get("needs_reverify")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(PriceSnapshot {
        key: ItemKey::new(
            row.try_get::<String, _>("source_id")?,
            row.try_get::<String, _>("external_id")?,
        ),
        captured_at: row.try_get("captured_at")?,
        current_bid: row.try_get("current_bid")?,
        bid_count: row
            .try_get::<Option<i32>, _>("bid_count")?
            .and_then(|v| u32::try_from(v).ok()),
        status: parse_column("status", status.parse::<ItemStatus>())?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let outcome: String = row.try_get("outcome")?;
    let counts: serde_json::Value = row.try_get("counts")?;
    Ok(RunRecord {
        run_id: row.try_get("run_id")?,
        job_id: row.try_get("job_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        outcome: match outcome.as_str() {
            "success" => RunOutcome::Success,
            "skipped" => RunOutcome::Skipped,
            "failed" => RunOutcome::Failed,
            other => return Err(StoreError::Corrupt(format!("outcome: unknown `{other}`"))),
        },
        counts: parse_column::<RunCounts, _>("counts", serde_json::from_value(counts))?,
        error: row.try_get("error")?,
    })
}

const ITEM_COLUMNS: &str = r#"
    source_id, external_id, title, description, current_bid, starting_bid, bid_count,
    end_time, image_url, item_url, lot_number, grading_company, grade, cert_number,
    category, manufacturer, sport, sport_confidence, sport_layer, classifier_version,
    item_type, status, estimate_low, estimate_high, estimate_average, estimate_confidence,
    estimate_notes, estimate_computed_at, missed_passes, needs_reverify, created_at, updated_at
"#;

#[async_trait]
impl ItemStore for PgItemStore {
    async fn get_item(&self, key: &ItemKey) -> Result<Option<AuctionItem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM auction_items WHERE source_id = $1 AND external_id = $2"
        ))
        .bind(&key.source_id)
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Estimate columns are only written on insert; afterwards `set_estimate`
    /// owns them.
    async fn upsert_item(&self, item: &AuctionItem) -> Result<(), StoreError> {
        let classification = item.classification.as_ref();
        let estimate = item.estimate.as_ref();
        sqlx::query(
            r#"
            INSERT INTO auction_items (
                source_id, external_id, title, description, current_bid, starting_bid, bid_count,
                end_time, image_url, item_url, lot_number, grading_company, grade, cert_number,
                category, manufacturer, sport, sport_confidence, sport_layer, classifier_version,
                item_type, status, estimate_low, estimate_high, estimate_average,
                estimate_confidence, estimate_notes, estimate_computed_at, missed_passes,
                needs_reverify, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32
            )
            ON CONFLICT (source_id, external_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                current_bid = EXCLUDED.current_bid,
                starting_bid = EXCLUDED.starting_bid,
                bid_count = EXCLUDED.bid_count,
                end_time = EXCLUDED.end_time,
                image_url = EXCLUDED.image_url,
                item_url = EXCLUDED.item_url,
                lot_number = EXCLUDED.lot_number,
                grading_company = EXCLUDED.grading_company,
                grade = EXCLUDED.grade,
                cert_number = EXCLUDED.cert_number,
                category = EXCLUDED.category,
                manufacturer = EXCLUDED.manufacturer,
                sport = EXCLUDED.sport,
                sport_confidence = EXCLUDED.sport_confidence,
                sport_layer = EXCLUDED.sport_layer,
                classifier_version = EXCLUDED.classifier_version,
                item_type = EXCLUDED.item_type,
                status = EXCLUDED.status,
                missed_passes = EXCLUDED.missed_passes,
                needs_reverify = EXCLUDED.needs_reverify,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&item.key.source_id)
        .bind(&item.key.external_id)
        .bind(&item.title)
        .bind(&item.description)
        .bind(item.current_bid)
        .bind(item.starting_bid)
        .bind(item.bid_count.map(to_i32))
        .bind(item.end_time)
        .bind(&item.image_url)
        .bind(&item.item_url)
        .bind(&item.lot_number)
        .bind(&item.grading.company)
        .bind(&item.grading.grade)
        .bind(&item.grading.cert_number)
        .bind(&item.category)
        .bind(&item.manufacturer)
        .bind(classification.map(|c| c.label.as_str()))
        .bind(classification.map(|c| c.confidence))
        .bind(classification.map(|c| c.layer.as_str()))
        .bind(classification.map(|c| to_i32(c.rule_version)))
        .bind(item.item_type.map(|kind| kind.as_str()))
        .bind(item.status.as_str())
        .bind(estimate.map(|e| e.estimate.low))
        .bind(estimate.map(|e| e.estimate.high))
        .bind(estimate.map(|e| e.estimate.average))
        .bind(estimate.map(|e| e.estimate.confidence.as_str()))
        .bind(estimate.and_then(|e| e.estimate.notes.clone()))
        .bind(estimate.map(|e| e.computed_at))
        .bind(to_i32(item.missed_passes))
        .bind(item.needs_reverify)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<AuctionItem>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
              FROM auction_items
             WHERE ($1::text IS NULL OR source_id = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::timestamptz IS NULL OR end_time < $3)
             ORDER BY source_id, external_id
             LIMIT $4
            "#
        ))
        .bind(&filter.source_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.ending_before)
        .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn expire_ended(&self, now: DateTime<Utc>) -> Result<Vec<ItemKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE auction_items
               SET status = 'ended',
                   needs_reverify = FALSE,
                   updated_at = $1
             WHERE status = 'live'
               AND end_time < $1
            RETURNING source_id, external_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = rows
            .iter()
            .map(|row| {
                Ok(ItemKey::new(
                    row.try_get::<String, _>("source_id")?,
                    row.try_get::<String, _>("external_id")?,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        keys.sort();
        Ok(keys)
    }

    async fn set_estimate(&self, key: &ItemKey, estimate: &CachedEstimate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE auction_items
               SET estimate_low = $3,
                   estimate_high = $4,
                   estimate_average = $5,
                   estimate_confidence = $6,
                   estimate_notes = $7,
                   estimate_computed_at = $8
             WHERE source_id = $1 AND external_id = $2
            "#,
        )
        .bind(&key.source_id)
        .bind(&key.external_id)
        .bind(estimate.estimate.low)
        .bind(estimate.estimate.high)
        .bind(estimate.estimate.average)
        .bind(estimate.estimate.confidence.as_str())
        .bind(&estimate.estimate.notes)
        .bind(estimate.computed_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.clone()));
        }
        Ok(())
    }

    async fn append_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO price_snapshots (source_id, external_id, captured_at, current_bid, bid_count, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&snapshot.key.source_id)
        .bind(&snapshot.key.external_id)
        .bind(snapshot.captured_at)
        .bind(snapshot.current_bid)
        .bind(snapshot.bid_count.map(to_i32))
        .bind(snapshot.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_snapshot(&self, key: &ItemKey) -> Result<Option<PriceSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_id, external_id, captured_at, current_bid, bid_count, status
              FROM price_snapshots
             WHERE source_id = $1 AND external_id = $2
             ORDER BY captured_at DESC
             LIMIT 1
            "#,
        )
        .bind(&key.source_id)
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn snapshots_since(
        &self,
        key: &ItemKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, external_id, captured_at, current_bid, bid_count, status
              FROM price_snapshots
             WHERE source_id = $1 AND external_id = $2 AND captured_at >= $3
             ORDER BY captured_at ASC
            "#,
        )
        .bind(&key.source_id)
        .bind(&key.external_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn record_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        let counts = serde_json::to_value(record.counts)
            .map_err(|err| StoreError::Backend(format!("serializing run counts: {err}")))?;
        sqlx::query(
            r#"
            INSERT INTO job_runs (run_id, job_id, started_at, finished_at, outcome, counts, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(record.run_id)
        .bind(&record.job_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.outcome.as_str())
        .bind(counts)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, job_id: &str, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, job_id, started_at, finished_at, outcome, counts, error
              FROM job_runs
             WHERE job_id = $1
             ORDER BY started_at DESC
             LIMIT $2
            "#,
        )
        .bind(job_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
