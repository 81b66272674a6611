use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lotwatch_core::{ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use crate::{
    parse_grading, parse_price, text_or_none, AdapterContext, BatchBuilder, ParsedPage,
    SourceAdapter, SourceOptions, SourceUnavailable,
};

pub(crate) const SOURCE_ID: &str = "pristine";
const BASE_URL: &str = "https://www.pristineauction.com";
const PER_PAGE: usize = 60;
const DEFAULT_MAX_PAGES: usize = 50;
const MAX_EMPTY_PAGES: usize = 3;
const MAX_TITLE_CHARS: usize = 500;

/// HTML catalogue paged 60 products at a time. Ten-minute auctions live
/// under a separate listing type and are not included.
#[derive(Debug, Clone)]
pub struct PristineAdapter {
    options: SourceOptions,
}

impl PristineAdapter {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    /// `{n}` in a configured listing URL is replaced by the page number.
    fn page_url(&self, page: usize) -> String {
        match self.options.listing_urls.first() {
            Some(template) => template.replace("{n}", &page.to_string()),
            None => format!("{BASE_URL}/auction/page/{page}/per_page/{PER_PAGE}/category/all"),
        }
    }
}

fn selector(css: &str) -> Result<Selector, String> {
    Selector::parse(css).map_err(|e| format!("bad selector `{css}`: {e}"))
}

fn absolute_url(href: &str) -> String {
    if href.starts_with('/') {
        format!("{BASE_URL}{href}")
    } else {
        href.to_string()
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

fn high_bid(el: ElementRef<'_>) -> Option<f64> {
    el.value()
        .attr("data-high-bid")
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .or_else(|| parse_price(&element_text(el)))
}

fn end_time(el: ElementRef<'_>) -> Option<DateTime<Utc>> {
    let value = el.value();
    value
        .attr("data-pristine-end-time")
        .or_else(|| value.attr("data-timestamp"))
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Product cards on one catalogue page. `has_more` is left for the caller,
/// which knows how many pages came back empty.
pub fn parse_items(html: &str) -> Result<ParsedPage, String> {
    let document = Html::parse_document(html);
    let products = selector("div.product[data-pristine-product-venue-id]")?;
    let img_sel = selector("img.img-thumbnail")?;
    let link_sel = selector("a.title")?;
    let bid_sel = selector("p.high-bid")?;
    let end_sel = selector("span.end-time")?;
    let subtitle_sel = selector("p.subtitle")?;

    let mut page = ParsedPage::default();
    for product in document.select(&products) {
        let value = product.value();
        let venue_id = value
            .attr("data-pristine-product-venue-id")
            .and_then(text_or_none);
        let title = value.attr("data-pristine-title").and_then(text_or_none);
        let (Some(venue_id), Some(title)) = (venue_id, title) else {
            warn!(source_id = SOURCE_ID, "skipping product without id or title");
            page.skipped += 1;
            continue;
        };
        let title: String = title.chars().take(MAX_TITLE_CHARS).collect();

        let subtitle = product
            .select(&subtitle_sel)
            .next()
            .and_then(|el| text_or_none(&element_text(el)));
        let grading = match &subtitle {
            Some(sub) => parse_grading(&format!("{title} {sub}")),
            None => parse_grading(&title),
        };

        page.items.push(ListingDraft {
            external_id: venue_id.clone(),
            lot_number: Some(venue_id),
            current_bid: product.select(&bid_sel).next().and_then(high_bid),
            end_time: product.select(&end_sel).next().and_then(end_time),
            image_url: product
                .select(&img_sel)
                .next()
                .and_then(|img| img.value().attr("src"))
                .and_then(text_or_none),
            item_url: product
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(text_or_none)
                .map(|href| absolute_url(&href)),
            description: subtitle,
            grading,
            title,
            ..Default::default()
        });
    }
    Ok(page)
}

#[async_trait]
impl SourceAdapter for PristineAdapter {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable> {
        let max_pages = self.options.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        let mut builder = BatchBuilder::new(SOURCE_ID, ctx.fetched_at, max_items);
        let mut empty_pages = 0;

        for page_index in 1..=max_pages {
            let url = self.page_url(page_index);
            let parsed = match http.get(ctx.run_id, SOURCE_ID, &url).await {
                Ok(resp) => parse_items(&resp.text()),
                Err(err) => Err(err.to_string()),
            };
            match parsed {
                Ok(mut page) => {
                    if page.items.is_empty() && page.skipped == 0 {
                        empty_pages += 1;
                    } else {
                        empty_pages = 0;
                    }
                    if empty_pages >= MAX_EMPTY_PAGES {
                        debug!(source_id = SOURCE_ID, page = page_index, "catalogue exhausted");
                    }
                    page.has_more = empty_pages < MAX_EMPTY_PAGES;
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
            truncated = batch.truncated,
            "fetched batch"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const CATALOGUE: &str = r#"
        <html><body>
          <div class="product" data-pristine-product-venue-id="778812"
               data-pristine-title="2018 Panini Prizm Luka Doncic #280 RC">
            <img class="img-thumbnail" src="https://cdn.pristineauction.com/778812.jpg">
            <a class="title" href="/lot/778812/2018-panini-prizm-luka-doncic">Luka</a>
            <p class="subtitle">PSA 10 Gem Mint</p>
            <p class="high-bid" data-high-bid="1325.00">$1,325</p>
            <span class="end-time" data-pristine-end-time="1773230400"></span>
          </div>
          <div class="product" data-pristine-product-venue-id="778813"
               data-pristine-title="Tom Brady Signed Football (Fanatics)">
            <p class="high-bid" data-high-bid="">Current bid $410</p>
            <span class="end-time" data-timestamp="1773234000"></span>
          </div>
          <div class="product" data-pristine-product-venue-id="778814" data-pristine-title="  ">
          </div>
          <div class="product">
            <a class="title" href="/lot/0">not a catalogue card</a>
          </div>
        </body></html>
    "#;

    #[test]
    fn product_cards_become_listing_drafts() {
        let page = parse_items(CATALOGUE).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.skipped, 1);
        assert!(!page.has_more);

        let card = &page.items[0];
        assert_eq!(card.external_id, "778812");
        assert_eq!(card.lot_number.as_deref(), Some("778812"));
        assert_eq!(card.title, "2018 Panini Prizm Luka Doncic #280 RC");
        assert_eq!(card.description.as_deref(), Some("PSA 10 Gem Mint"));
        assert_eq!(card.grading.company.as_deref(), Some("PSA"));
        assert_eq!(card.grading.grade.as_deref(), Some("10"));
        assert_eq!(card.current_bid, Some(1325.0));
        assert_eq!(
            card.end_time,
            Some(Utc.with_ymd_and_hms(2026, 3, 11, 12, 0, 0).single().unwrap())
        );
        assert_eq!(
            card.item_url.as_deref(),
            Some("https://www.pristineauction.com/lot/778812/2018-panini-prizm-luka-doncic")
        );
        assert_eq!(card.image_url.as_deref(), Some("https://cdn.pristineauction.com/778812.jpg"));
        assert_eq!(card.bid_count, None);
    }

    #[test]
    fn bid_falls_back_to_text_and_end_time_to_timestamp() {
        let page = parse_items(CATALOGUE).unwrap();
        let ball = &page.items[1];
        assert_eq!(ball.current_bid, Some(410.0));
        assert_eq!(
            ball.end_time,
            Some(Utc.with_ymd_and_hms(2026, 3, 11, 13, 0, 0).single().unwrap())
        );
        assert_eq!(ball.description, None);
        assert_eq!(ball.grading.company, None);
    }

    #[test]
    fn page_urls_follow_the_catalogue_or_a_template() {
        let adapter = PristineAdapter::new(SourceOptions::default());
        assert_eq!(
            adapter.page_url(3),
            "https://www.pristineauction.com/auction/page/3/per_page/60/category/all"
        );

        let adapter = PristineAdapter::new(SourceOptions {
            listing_urls: vec!["http://localhost:8080/page/{n}".into()],
            ..Default::default()
        });
        assert_eq!(adapter.page_url(2), "http://localhost:8080/page/2");
    }

    #[test]
    fn empty_catalogue_page_parses_to_nothing() {
        let page = parse_items("<html><body><p>No results</p></body></html>").unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.skipped, 0);
    }
}
