use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{
    json_f64, json_path, json_string, json_u32, parse_grading, parse_source_timestamp,
    AdapterContext, BatchBuilder, ParsedPage, SourceAdapter, SourceOptions, SourceUnavailable,
};

pub(crate) const SOURCE_ID: &str = "cardhobby";
const SEARCH_URL: &str = "https://gatewayapi.cardhobby.com/solr/NewCommodity/SearchCommodityPost";
const PAGE_SIZE: usize = 100;
const DEFAULT_MIN_PRICE: f64 = 100.0;
const DEFAULT_MAX_PAGES: usize = 40;

/// Structured JSON search API, paged and sorted by current price descending.
#[derive(Debug, Clone)]
pub struct CardHobbyAdapter {
    options: SourceOptions,
}

impl CardHobbyAdapter {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    fn endpoint(&self) -> &str {
        self.options
            .listing_urls
            .first()
            .map(String::as_str)
            .unwrap_or(SEARCH_URL)
    }

    fn min_price(&self) -> f64 {
        self.options.min_price.unwrap_or(DEFAULT_MIN_PRICE)
    }

    fn search_payload(page_index: usize) -> JsonValue {
        json!({
            "userId": "",
            "pageIndex": page_index,
            "pageSize": PAGE_SIZE,
            "searchKey": "",
            "searchJson": r#"[{"Key":"Status","Value":1},{"Key":"ByWay","Value":"2"}]"#,
            "sort": "LowestPrice",
            "sortType": "desc",
            "lag": "en",
            "device": "Web",
            "version": 1,
            "appname": "Card Hobby"
        })
    }
}

/// Parses one search response page. Records below `min_price` or already
/// ended are filtered, not counted as malformed. Paging stops once the
/// page tail falls under `min_price` since results are price-sorted.
pub fn parse_search_page(
    body: &JsonValue,
    min_price: f64,
    now: DateTime<Utc>,
) -> Result<ParsedPage, String> {
    let records = json_path(body, &["data", "PagedMarketItemList"])
        .ok_or_else(|| "response has no data.PagedMarketItemList".to_string())?
        .as_array()
        .ok_or_else(|| "data.PagedMarketItemList is not an array".to_string())?;

    let mut page = ParsedPage::default();
    for record in records {
        match parse_record(record) {
            Ok(draft) => {
                if draft.current_bid.unwrap_or(0.0) < min_price {
                    continue;
                }
                if draft.end_time.is_some_and(|end| end < now) {
                    continue;
                }
                page.items.push(draft);
            }
            Err(reason) => {
                warn!(source_id = SOURCE_ID, %reason, "skipping malformed record");
                page.skipped += 1;
            }
        }
    }

    let tail_price = records
        .last()
        .and_then(|r| json_f64(r, "USD_LowestPrice"))
        .unwrap_or(0.0);
    page.has_more = !records.is_empty() && tail_price >= min_price;
    Ok(page)
}

fn parse_record(record: &JsonValue) -> Result<ListingDraft, String> {
    let external_id = json_string(record, "ID").ok_or("record has no ID")?;
    let title = json_string(record, "Title")
        .ok_or_else(|| format!("record {external_id} has no Title"))?;
    let end_time = match json_string(record, "EffectiveDate") {
        Some(raw) => Some(
            parse_source_timestamp(&raw)
                .ok_or_else(|| format!("record {external_id} has bad EffectiveDate `{raw}`"))?,
        ),
        None => None,
    };

    Ok(ListingDraft {
        grading: parse_grading(&title),
        item_url: Some(format!("https://www.cardhobby.com/#/carddetails/{external_id}")),
        image_url: json_string(record, "TitImg"),
        current_bid: json_f64(record, "USD_LowestPrice"),
        starting_bid: json_f64(record, "USD_Price"),
        bid_count: json_u32(record, "PriceCount"),
        lot_number: json_string(record, "Code"),
        end_time,
        external_id,
        title,
        ..Default::default()
    })
}

#[async_trait]
impl SourceAdapter for CardHobbyAdapter {
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

        for page_index in 1..=max_pages {
            let parsed = match http
                .post_json(ctx.run_id, SOURCE_ID, self.endpoint(), &Self::search_payload(page_index))
                .await
            {
                Ok(resp) => resp
                    .json::<JsonValue>()
                    .map_err(|e| e.to_string())
                    .and_then(|body| parse_search_page(&body, self.min_price(), ctx.fetched_at)),
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
