//! Remote price mutation strategies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use pricesync_core::{format_price, PendingUpdate, ResourceId, UpdateOutcome};
use pricesync_storage::HttpFetcher;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::{ShopCredentials, ShopEndpoint};

pub const DEFAULT_GID_NAMESPACE: &str = "shopify";

pub const PRODUCT_UPDATE_MUTATION: &str = "mutation productUpdate($input: ProductInput!) {
  productUpdate(input: $input) {
    product { id }
    userErrors { field message }
  }
}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Legacy single-resource `PUT variants/{id}.json`.
    #[default]
    Direct,
    /// `productUpdate` mutation against the graph endpoint.
    Graph,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Graph => "graph",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "rest" => Ok(Self::Direct),
            "graph" | "graphql" => Ok(Self::Graph),
            other => Err(format!("unknown update strategy `{other}` (expected direct or graph)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterOptions {
    /// Direct strategy only: resend option1..3 so the backend does not reset them.
    pub resend_options: bool,
    /// Graph strategy only: namespace used in `gid://<namespace>/<Type>/<id>`.
    pub gid_namespace: String,
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self {
            resend_options: false,
            gid_namespace: DEFAULT_GID_NAMESPACE.to_string(),
        }
    }
}

/// Applies one pending update remotely. Implementations never return an error:
/// every failure mode ends up in the outcome's status.
#[async_trait]
pub trait PriceUpdater: Send + Sync {
    fn strategy(&self) -> UpdateStrategy;

    async fn apply(&self, update: &PendingUpdate) -> UpdateOutcome;
}

#[derive(Debug, Clone)]
pub struct DirectStrategy {
    http: Arc<HttpFetcher>,
    endpoint: ShopEndpoint,
    credentials: ShopCredentials,
    resend_options: bool,
}

impl DirectStrategy {
    pub fn new(
        http: Arc<HttpFetcher>,
        endpoint: ShopEndpoint,
        credentials: ShopCredentials,
        resend_options: bool,
    ) -> Self {
        Self {
            http,
            endpoint,
            credentials,
            resend_options,
        }
    }
}

#[async_trait]
impl PriceUpdater for DirectStrategy {
    fn strategy(&self) -> UpdateStrategy {
        UpdateStrategy::Direct
    }

    async fn apply(&self, update: &PendingUpdate) -> UpdateOutcome {
        let url = self.endpoint.variant_url(update.variant_id.numeric_tail());
        let request = self
            .credentials
            .authorize(self.http.request(Method::PUT, &url))
            .json(&direct_update_body(update, self.resend_options));

        let outcome = match self.http.send(request).await {
            Err(err) => UpdateOutcome::failed(update, err.to_string()),
            Ok(resp) if !resp.status.is_success() => UpdateOutcome::failed(
                update,
                format!("HTTP {}: {}", resp.status.as_u16(), resp.body_text().trim()),
            ),
            Ok(_) => UpdateOutcome::success(update),
        };
        log_outcome(UpdateStrategy::Direct, &outcome);
        outcome
    }
}

/// `{ "variant": { "id", "price" [, "option1", "option2", "option3"] } }`
pub fn direct_update_body(update: &PendingUpdate, resend_options: bool) -> JsonValue {
    let mut variant = serde_json::Map::new();
    variant.insert("id".into(), id_as_json(&update.variant_id));
    variant.insert("price".into(), json!(format_price(update.new_price)));
    if resend_options {
        for (key, value) in [
            ("option1", &update.option1),
            ("option2", &update.option2),
            ("option3", &update.option3),
        ] {
            if let Some(value) = value {
                variant.insert(key.into(), json!(value));
            }
        }
    }
    json!({ "variant": JsonValue::Object(variant) })
}

fn id_as_json(id: &ResourceId) -> JsonValue {
    let tail = id.numeric_tail();
    tail.parse::<u64>().map(JsonValue::from).unwrap_or_else(|_| json!(tail))
}

#[derive(Debug, Clone)]
pub struct GraphStrategy {
    http: Arc<HttpFetcher>,
    endpoint: ShopEndpoint,
    credentials: ShopCredentials,
    gid_namespace: String,
}

impl GraphStrategy {
    pub fn new(
        http: Arc<HttpFetcher>,
        endpoint: ShopEndpoint,
        credentials: ShopCredentials,
        gid_namespace: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            credentials,
            gid_namespace: gid_namespace.into(),
        }
    }
}

#[async_trait]
impl PriceUpdater for GraphStrategy {
    fn strategy(&self) -> UpdateStrategy {
        UpdateStrategy::Graph
    }

    async fn apply(&self, update: &PendingUpdate) -> UpdateOutcome {
        let request = self
            .credentials
            .authorize(self.http.request(Method::POST, &self.endpoint.graphql_url()))
            .json(&graph_update_body(update, &self.gid_namespace));

        let outcome = match self.http.send(request).await {
            Err(err) => UpdateOutcome::failed(update, err.to_string()),
            Ok(resp) if !resp.status.is_success() => UpdateOutcome::failed(
                update,
                format!("HTTP {}: {}", resp.status.as_u16(), resp.body_text().trim()),
            ),
            Ok(resp) => match classify_graph_response(&resp.body) {
                Ok(()) => UpdateOutcome::success(update),
                Err(reason) => UpdateOutcome::failed(update, reason),
            },
        };
        log_outcome(UpdateStrategy::Graph, &outcome);
        outcome
    }
}

/// `gid://<namespace>/<kind>/<id>`; ids that are already global pass through.
pub fn global_id(namespace: &str, kind: &str, id: &ResourceId) -> String {
    if id.as_str().starts_with("gid://") {
        return id.as_str().to_string();
    }
    format!("gid://{namespace}/{kind}/{}", id.numeric_tail())
}

pub fn graph_update_body(update: &PendingUpdate, namespace: &str) -> JsonValue {
    json!({
        "query": PRODUCT_UPDATE_MUTATION,
        "variables": {
            "input": {
                "id": global_id(namespace, "Product", &update.product_id),
                "variants": [{
                    "id": global_id(namespace, "ProductVariant", &update.variant_id),
                    "price": format_price(update.new_price),
                }]
            }
        }
    })
}

/// A 2xx graph response can still reject the mutation, either with top-level
/// `errors` or with `userErrors` on the payload.
pub fn classify_graph_response(body: &[u8]) -> Result<(), String> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|e| format!("unparseable graph response: {e}"))?;

    if let Some(errors) = value.get("errors").filter(|e| !is_empty_json(e)) {
        return Err(format!("graph errors: {errors}"));
    }

    let payload = value
        .get("data")
        .and_then(|d| d.get("productUpdate"))
        .filter(|p| !p.is_null())
        .ok_or_else(|| format!("graph response has no productUpdate payload: {value}"))?;

    if let Some(user_errors) = payload.get("userErrors").filter(|e| !is_empty_json(e)) {
        return Err(format!("validation errors: {user_errors}"));
    }
    Ok(())
}

fn is_empty_json(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn log_outcome(strategy: UpdateStrategy, outcome: &UpdateOutcome) {
    match outcome.failure_reason() {
        None => info!(
            %strategy,
            sku = %outcome.sku,
            variant_id = %outcome.variant_id,
            old_price = %outcome.old_price,
            new_price = %outcome.new_price,
            "price updated"
        ),
        Some(reason) => warn!(
            %strategy,
            sku = %outcome.sku,
            variant_id = %outcome.variant_id,
            %reason,
            "price update failed"
        ),
    }
}

pub fn updater_for_strategy(
    strategy: UpdateStrategy,
    http: Arc<HttpFetcher>,
    endpoint: ShopEndpoint,
    credentials: ShopCredentials,
    options: &UpdaterOptions,
) -> Box<dyn PriceUpdater> {
    match strategy {
        UpdateStrategy::Direct => Box::new(DirectStrategy::new(
            http,
            endpoint,
            credentials,
            options.resend_options,
        )),
        UpdateStrategy::Graph => Box::new(GraphStrategy::new(
            http,
            endpoint,
            credentials,
            options.gid_namespace.clone(),
        )),
    }
}
