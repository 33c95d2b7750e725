//! Authoritative price-list feed.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricesync_core::{parse_json_price, PriceEntry};
use pricesync_storage::{FetchError, HttpFetcher};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedRejection {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    /// Feed order, duplicates kept.
    pub entries: Vec<PriceEntry>,
    pub rejected: Vec<FeedRejection>,
}

#[derive(Debug, Clone)]
pub struct SourcePriceFeed {
    url: String,
}

impl SourcePriceFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One GET; anything but a 200 carrying a JSON array fails the whole fetch.
    pub async fn fetch(&self, http: &HttpFetcher) -> Result<FeedSnapshot, FetchError> {
        let resp = http.send(http.request(Method::GET, &self.url)).await?;
        if resp.status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
            });
        }

        let (entries, rejected) = parse_price_feed(&resp.final_url, &resp.body)?;
        info!(
            url = %self.url,
            entries = entries.len(),
            rejected = rejected.len(),
            "price feed fetched"
        );
        Ok(FeedSnapshot {
            url: self.url.clone(),
            fetched_at: Utc::now(),
            entries,
            rejected,
        })
    }
}

/// Parse a feed body. The array shape is mandatory; individual records that lack
/// a usable `sku` or `price` are rejected without failing the feed.
pub fn parse_price_feed(
    url: &str,
    body: &[u8],
) -> Result<(Vec<PriceEntry>, Vec<FeedRejection>), FetchError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| FetchError::parse(url, e))?;
    let JsonValue::Array(records) = value else {
        return Err(FetchError::parse(url, "expected a JSON array of price records"));
    };

    let mut entries = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match entry_from_record(record) {
            Ok(entry) => entries.push(entry),
            Err(reason) => {
                warn!(index, %reason, "skipping feed record");
                rejected.push(FeedRejection { index, reason });
            }
        }
    }
    Ok((entries, rejected))
}

/// Load a saved feed body from disk, with the same per-record tolerance as [`SourcePriceFeed::fetch`].
pub fn load_feed_file(
    path: impl AsRef<Path>,
) -> anyhow::Result<(Vec<PriceEntry>, Vec<FeedRejection>)> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_price_feed(&path.display().to_string(), &data)
        .with_context(|| format!("parsing {}", path.display()))
}

fn entry_from_record(record: &JsonValue) -> Result<PriceEntry, String> {
    let JsonValue::Object(fields) = record else {
        return Err("record is not an object".to_string());
    };

    let sku = match fields.get("sku") {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Null) | None => return Err("missing sku".to_string()),
        Some(other) => return Err(format!("sku has unexpected type: {other}")),
    };
    if sku.is_empty() {
        return Err("empty sku".to_string());
    }

    let raw_price = fields
        .get("price")
        .ok_or_else(|| format!("missing price for sku {sku}"))?;
    let price = parse_json_price(raw_price)
        .ok_or_else(|| format!("unparseable price {raw_price} for sku {sku}"))?;

    Ok(PriceEntry { sku, price })
}
