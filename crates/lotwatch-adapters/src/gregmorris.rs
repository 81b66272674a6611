use async_trait::async_trait;
use lotwatch_core::{GradingFields, ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::{
    json_f64, json_path, json_string, json_u32, normalize_grading_company, parse_source_timestamp,
    AdapterContext, BatchBuilder, ParsedPage, SourceAdapter, SourceOptions, SourceUnavailable,
};

pub(crate) const SOURCE_ID: &str = "gregmorris";
const BASE_URL: &str = "https://gregmorriscards.com";
const DEFAULT_MAX_PAGES: usize = 50;

/// Paged JSON listings endpoint sorted by end time.
#[derive(Debug, Clone)]
pub struct GregMorrisAdapter {
    options: SourceOptions,
}

impl GregMorrisAdapter {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    fn endpoint(&self) -> String {
        self.options
            .listing_urls
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{BASE_URL}/auctions/getListings"))
    }
}

/// Parses one `listings` page; `has_more` comes from `current_page < last_page`.
pub fn parse_listings_page(body: &JsonValue, page: usize) -> Result<ParsedPage, String> {
    let listings = body
        .get("listings")
        .ok_or_else(|| "response has no listings object".to_string())?;
    let records = json_path(listings, &["data"])
        .and_then(JsonValue::as_array)
        .ok_or_else(|| "listings.data is not an array".to_string())?;
    let last_page = listings
        .get("last_page")
        .and_then(JsonValue::as_u64)
        .unwrap_or(1) as usize;

    let mut parsed = ParsedPage {
        has_more: page < last_page && !records.is_empty(),
        ..Default::default()
    };
    for record in records {
        match parse_record(record) {
            Ok(draft) => parsed.items.push(draft),
            Err(reason) => {
                warn!(source_id = SOURCE_ID, %reason, "skipping malformed record");
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

fn parse_record(record: &JsonValue) -> Result<ListingDraft, String> {
    let external_id = json_string(record, "item_id").ok_or("record has no item_id")?;
    let name = json_string(record, "name");
    let manufacturer = json_string(record, "manufacturer");

    let mut title_parts = Vec::new();
    if let Some(year) = json_string(record, "card_year").filter(|y| y != "0") {
        title_parts.push(year);
    }
    if let Some(m) = &manufacturer {
        title_parts.push(m.clone());
    }
    if let Some(n) = &name {
        title_parts.push(n.clone());
    }
    if let Some(number) = json_string(record, "card_number") {
        title_parts.push(format!("#{number}"));
    }
    if name.is_none() {
        return Err(format!("record {external_id} has no name"));
    }
    let title = title_parts.join(" ");

    let end_time = match json_string(record, "end_time") {
        Some(raw) => Some(
            parse_source_timestamp(&raw)
                .ok_or_else(|| format!("record {external_id} has bad end_time `{raw}`"))?,
        ),
        None => None,
    };

    let grading = GradingFields {
        company: json_string(record, "grading_service").map(|g| normalize_grading_company(&g)),
        grade: json_string(record, "service_grade"),
        cert_number: json_string(record, "cert_number"),
    };

    Ok(ListingDraft {
        item_url: Some(format!("{BASE_URL}/listing/{external_id}")),
        image_url: json_string(record, "gallery_url")
            .and_then(|g| g.split('|').map(str::trim).find(|s| !s.is_empty()).map(String::from)),
        current_bid: json_f64(record, "current_price"),
        starting_bid: json_f64(record, "starting_price"),
        bid_count: json_u32(record, "bid_count"),
        description: json_string(record, "description"),
        category: json_string(record, "category"),
        end_time,
        grading,
        manufacturer,
        external_id,
        title,
        ..Default::default()
    })
}

#[async_trait]
impl SourceAdapter for GregMorrisAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable> {
        let mut builder = BatchBuilder::new(SOURCE_ID, ctx.fetched_at, max_items);
        let max_pages = self.options.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        let endpoint = self.endpoint();

        for page in 1..=max_pages {
            let query = [
                ("page", page.to_string()),
                ("sort[sort_field]", "end_time".to_string()),
                ("sort[sort_dir]", "asc".to_string()),
            ];
            let parsed = match http
                .get_with_query(ctx.run_id, SOURCE_ID, &endpoint, &query)
                .await
            {
                Ok(resp) => resp
                    .json::<JsonValue>()
                    .map_err(|e| e.to_string())
                    .and_then(|body| parse_listings_page(&body, page)),
                Err(err) => Err(err.to_string()),
            };

            match parsed {
                Ok(page) => {
                    if !builder.push_page(page) {
                        break;
                    }
                }
                Err(reason) => {
                    builder.page_failed(reason)?;
                    break;
                }
            }
        }

        let batch = builder.finish();
        info!(
            source_id = SOURCE_ID,
            items = batch.items.len(),
            skipped = batch.skipped,
            "fetched batch"
        );
        Ok(batch)
    }
}
