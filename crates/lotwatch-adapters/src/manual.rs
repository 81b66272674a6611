use std::path::PathBuf;

use async_trait::async_trait;
use lotwatch_core::{ListingDraft, NormalizedBatch};
use lotwatch_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::{AdapterContext, BatchBuilder, ParsedPage, SourceAdapter, SourceUnavailable};

pub(crate) const SOURCE_ID: &str = "manual";

#[derive(Debug, Deserialize)]
struct ManualFile {
    items: Vec<JsonValue>,
}

/// Reads already-normalized listings from a JSON file for hand-curated or
/// offline ingestion. Records that do not deserialize are skipped.
#[derive(Debug, Clone)]
pub struct ManualFileAdapter {
    source_id: String,
    path: PathBuf,
}

impl ManualFileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_source_id(SOURCE_ID, path)
    }

    pub fn with_source_id(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

pub fn parse_manual_file(text: &str) -> Result<ParsedPage, String> {
    let file: ManualFile = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let mut page = ParsedPage::default();
    for (index, raw) in file.items.into_iter().enumerate() {
        match serde_json::from_value::<ListingDraft>(raw) {
            Ok(draft) if !draft.external_id.trim().is_empty() => page.items.push(draft),
            Ok(_) => {
                warn!(source_id = SOURCE_ID, index, "skipping record with blank external_id");
                page.skipped += 1;
            }
            Err(err) => {
                warn!(source_id = SOURCE_ID, index, error = %err, "skipping malformed record");
                page.skipped += 1;
            }
        }
    }
    Ok(page)
}

#[async_trait]
impl SourceAdapter for ManualFileAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        max_items: usize,
    ) -> Result<NormalizedBatch, SourceUnavailable> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            SourceUnavailable::new(&self.source_id, format!("reading {}: {err}", self.path.display()))
        })?;
        let page = parse_manual_file(&text).map_err(|err| {
            SourceUnavailable::new(&self.source_id, format!("parsing {}: {err}", self.path.display()))
        })?;

        let mut builder = BatchBuilder::new(&self.source_id, ctx.fetched_at, max_items);
        builder.push_page(page);
        Ok(builder.finish())
    }
}
