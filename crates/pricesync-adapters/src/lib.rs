//! Remote data-source adapters: the source price feed, the platform catalog, and
//! the two price-update strategies.

use std::fmt;

use reqwest::RequestBuilder;

pub mod catalog;
pub mod feed;
pub mod updater;

pub use catalog::{
    load_catalog_file, next_page_url, parse_products_page, CatalogError, CatalogFetcher,
    CatalogSnapshot, ProductsPage, PAGE_LIMIT,
};
pub use feed::{load_feed_file, parse_price_feed, FeedRejection, FeedSnapshot, SourcePriceFeed};
pub use updater::{
    updater_for_strategy, DirectStrategy, GraphStrategy, PriceUpdater, UpdateStrategy,
    UpdaterOptions, DEFAULT_GID_NAMESPACE,
};

pub const CRATE_NAME: &str = "pricesync-adapters";

pub const DEFAULT_ACCESS_TOKEN_HEADER: &str = "X-Shop-Access-Token";

/// Versioned admin API root of one shop, e.g. `https://shop.example/admin/api/2024-01`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopEndpoint {
    base_url: String,
}

impl ShopEndpoint {
    /// `shop` is a bare hostname; validation happens in config loading.
    pub fn new(shop: &str, api_version: &str) -> Self {
        Self::from_base_url(format!(
            "https://{}/admin/api/{}",
            shop.trim().trim_end_matches('/'),
            api_version.trim()
        ))
    }

    /// Use an explicit API root (proxies, local test servers).
    pub fn from_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn products_url(&self, limit: usize) -> String {
        format!("{}/products.json?limit={limit}", self.base_url)
    }

    pub fn variant_url(&self, variant_id: &str) -> String {
        format!("{}/variants/{variant_id}.json", self.base_url)
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/graphql.json", self.base_url)
    }
}

/// Access token plus the header it travels in.
#[derive(Clone, PartialEq, Eq)]
pub struct ShopCredentials {
    header_name: String,
    access_token: String,
}

impl ShopCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self::with_header(DEFAULT_ACCESS_TOKEN_HEADER, access_token)
    }

    pub fn with_header(header_name: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            access_token: access_token.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(self.header_name.as_str(), self.access_token.as_str())
    }
}

impl fmt::Debug for ShopCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShopCredentials")
            .field("header_name", &self.header_name)
            .field("access_token", &"<redacted>")
            .finish()
    }
}
