use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, warn};

use crate::{
    countdown_precision, parse_grading, parse_price, parse_time_remaining, text_or_none,
    AdapterContext, BatchBuilder, ParsedPage, SourceAdapter, SourceOptions, SourceUnavailable,
};

pub(crate) const SOURCE_ID: &str = "queencity";
const BASE_URL: &str = "https://www.auctionninja.com";
const SELLER_PATH: &str = "/queen-city-cards/";
const DEFAULT_MAX_AUCTIONS: usize = 10;

static AUCTION_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d+)\.html").unwrap());
static LOT_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#?\s*(\d+)").unwrap());
static CURRENT_BID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)current\s*bid\s*\$?\s*([\d,]+(?:\.\d{2})?)").unwrap());
static BIDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*bids?\b").unwrap());
static REMAINING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s*days?(?:\s*\d+\s*(?:hours?|hrs?))?|\d+\s*(?:hours?|hrs?)").unwrap());

/// HTML storefront: a seller page links to auctions, each auction page lists lot boxes.
#[derive(Debug, Clone)]
pub struct QueenCityAdapter {
    options: SourceOptions,
}

impl QueenCityAdapter {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    fn seller_url(&self) -> String {
        self.options
            .listing_urls
            .first()
            .cloned()
            .unwrap_or_else(|| format!("{BASE_URL}{SELLER_PATH}"))
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("bad selector `{css}`: {e}"))
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{BASE_URL}{href}")
    } else {
        format!("{BASE_URL}/{href}")
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

/// Distinct auction detail links on the seller page, query strings dropped.
pub fn parse_auction_links(html: &str) -> Result<Vec<String>, String> {
    let document = Html::parse_document(html);
    let links = selector("a[href]")?;
    let mut out: Vec<String> = Vec::new();
    for href in document
        .select(&links)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains("/sales/details/"))
    {
        let clean = absolute_url(href.split('?').next().unwrap_or(href));
        if !out.contains(&clean) {
            out.push(clean);
        }
    }
    Ok(out)
}

/// Lot boxes on one auction page.
pub fn parse_lots(html: &str, auction_url: &str, now: DateTime<Utc>) -> Result<ParsedPage, String> {
    let document = Html::parse_document(html);
    let boxes = selector(".search-catalog-item-box")?;
    let lot_sel = selector(".lot-number")?;
    let title_sel = selector(".hot-items-title")?;
    let img_sel = selector("img")?;

    let auction_id = AUCTION_ID_RE
        .captures(auction_url)
        .map(|c| c[1].to_string())
        .ok_or_else(|| format!("cannot read auction id from {auction_url}"))?;

    let mut page = ParsedPage::default();
    for lot in document.select(&boxes) {
        let lot_number = lot
            .select(&lot_sel)
            .next()
            .map(element_text)
            .and_then(|t| LOT_NUMBER_RE.captures(&t).map(|c| c[1].to_string()));
        let title = lot
            .select(&title_sel)
            .next()
            .and_then(|el| text_or_none(&element_text(el)))
            .filter(|t| t.chars().count() >= 5);

        let (Some(lot_number), Some(title)) = (lot_number, title) else {
            warn!(source_id = SOURCE_ID, %auction_url, "skipping lot without number or title");
            page.skipped += 1;
            continue;
        };

        let box_text = element_text(lot);
        let current_bid = CURRENT_BID_RE
            .captures(&box_text)
            .and_then(|c| parse_price(&c[1]))
            .or_else(|| box_text.find('$').and_then(|idx| parse_price(&box_text[idx..])));
        let bid_count = BIDS_RE
            .captures(&box_text)
            .and_then(|c| c[1].parse::<u32>().ok());
        let countdown = REMAINING_RE.find(&box_text).map(|m| m.as_str());
        let end_time = countdown.and_then(|text| parse_time_remaining(text, now));
        let end_time_precision_secs = countdown
            .filter(|_| end_time.is_some())
            .and_then(countdown_precision)
            .and_then(|p| u32::try_from(p.num_seconds()).ok());
        let image_url = lot
            .select(&img_sel)
            .next()
            .and_then(|img| img.value().attr("src"))
            .and_then(text_or_none)
            .map(|src| absolute_url(&src));

        page.items.push(ListingDraft {
            external_id: format!("{auction_id}-{lot_number}"),
            grading: parse_grading(&title),
            item_url: Some(auction_url.to_string()),
            lot_number: Some(lot_number),
            current_bid,
            bid_count,
            end_time,
            end_time_precision_secs,
            image_url,
            title,
            ..Default::default()
        });
    }
    Ok(page)
}

#[async_trait]
impl SourceAdapter for QueenCityAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable> {
        let seller_url = self.seller_url();
        let seller_html = http
            .get(ctx.run_id, SOURCE_ID, &seller_url)
            .await
            .map_err(|err| SourceUnavailable::new(SOURCE_ID, err))?
            .text();
        let auctions =
            parse_auction_links(&seller_html).map_err(|err| SourceUnavailable::new(SOURCE_ID, err))?;
        if auctions.is_empty() {
            return Err(SourceUnavailable::new(
                SOURCE_ID,
                "seller page lists no auctions; layout may have changed",
            ));
        }

        let max_auctions = self.options.max_pages.unwrap_or(DEFAULT_MAX_AUCTIONS);
        let mut builder = BatchBuilder::new(SOURCE_ID, ctx.fetched_at, max_items);
        let total = auctions.len().min(max_auctions);
        for (index, auction_url) in auctions.iter().take(max_auctions).enumerate() {
            let parsed = match http.get(ctx.run_id, SOURCE_ID, auction_url).await {
                Ok(resp) => parse_lots(&resp.text(), auction_url, ctx.fetched_at),
                Err(err) => Err(err.to_string()),
            };
            match parsed {
                Ok(mut page) => {
                    page.has_more = index + 1 < auctions.len();
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
            auctions = total,
            items = batch.items.len(),
            skipped = batch.skipped,
            "fetched batch"
        );
        Ok(batch)
    }
}
