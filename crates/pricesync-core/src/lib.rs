//! Core domain model for price-list to catalog reconciliation.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "pricesync-core";

/// Smallest price delta that counts as a real discrepancy (0.01 currency units).
pub const PRICE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Opaque platform identifier. The platform emits numeric ids, but we never do
/// arithmetic on them, so they are carried as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing segment of the id, so `gid://shopify/ProductVariant/42` and `42`
    /// both yield `42`.
    pub fn numeric_tail(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(serde_json::Number),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Self(n.to_string()),
            Raw::Text(s) => Self(s),
        })
    }
}

/// One record of the authoritative price list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub sku: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: ResourceId,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default_vec")]
    pub variants: Vec<CatalogVariant>,
}

/// A sellable unit of a [`CatalogProduct`]. `price` is kept exactly as the
/// platform delivered it; parsing happens during reconciliation so that one bad
/// value only skips one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub id: ResourceId,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub sku: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub price: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default)]
    pub option1: Option<String>,
    #[serde(default)]
    pub option2: Option<String>,
    #[serde(default)]
    pub option3: Option<String>,
}

impl CatalogVariant {
    /// Trimmed SKU, or `None` when absent or blank.
    pub fn normalized_sku(&self) -> Option<&str> {
        self.sku.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// A variant whose catalog price must change to match the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub product_id: ResourceId,
    pub variant_id: ResourceId,
    pub sku: String,
    pub product_title: String,
    pub variant_title: String,
    pub current_price: Decimal,
    pub new_price: Decimal,
    pub option1: Option<String>,
    pub option2: Option<String>,
    pub option3: Option<String>,
}

impl PendingUpdate {
    pub fn delta(&self) -> Decimal {
        self.new_price - self.current_price
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    Success,
    Failed { reason: String },
}

/// Terminal result of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub sku: String,
    pub variant_id: ResourceId,
    pub product_title: String,
    pub variant_title: String,
    pub old_price: Decimal,
    pub new_price: Decimal,
    #[serde(flatten)]
    pub status: UpdateStatus,
}

impl UpdateOutcome {
    pub fn success(update: &PendingUpdate) -> Self {
        Self::with_status(update, UpdateStatus::Success)
    }

    pub fn failed(update: &PendingUpdate, reason: impl Into<String>) -> Self {
        Self::with_status(
            update,
            UpdateStatus::Failed {
                reason: reason.into(),
            },
        )
    }

    fn with_status(update: &PendingUpdate, status: UpdateStatus) -> Self {
        Self {
            sku: update.sku.clone(),
            variant_id: update.variant_id.clone(),
            product_title: update.product_title.clone(),
            variant_title: update.variant_title.clone(),
            old_price: update.current_price,
            new_price: update.new_price,
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, UpdateStatus::Success)
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            UpdateStatus::Success => None,
            UpdateStatus::Failed { reason } => Some(reason),
        }
    }
}

/// True when the two prices differ by strictly more than [`PRICE_TOLERANCE`].
pub fn exceeds_tolerance(current: Decimal, new: Decimal) -> bool {
    (current - new).abs() > PRICE_TOLERANCE
}

/// Parses a textual price, accepting plain (`"12.5"`) and scientific (`"1.25e1"`) forms.
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Parses a JSON price that may be a string or a number.
pub fn parse_json_price(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::String(s) => parse_price(s),
        JsonValue::Number(n) => parse_price(&n.to_string()),
        _ => None,
    }
}

/// Renders a price with exactly two decimals, the wire format the platform expects.
pub fn format_price(price: Decimal) -> String {
    let mut rounded = price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(2);
    rounded.to_string()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_default_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => s,
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    })
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => Ok(None),
        JsonValue::String(s) => Ok(Some(s)),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {other}"
        ))),
    }
}
