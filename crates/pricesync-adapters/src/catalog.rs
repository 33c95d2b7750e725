//! Paginated catalog retrieval.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use pricesync_core::{CatalogProduct, CatalogVariant};
use pricesync_storage::{FetchError, HttpFetcher};
use reqwest::Method;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{ShopCredentials, ShopEndpoint};

/// Largest page the platform serves.
pub const PAGE_LIMIT: usize = 250;

#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub products: Vec<CatalogProduct>,
    pub pages: usize,
    /// Products and variants dropped because they could not be read.
    pub skipped: usize,
}

impl CatalogSnapshot {
    pub fn variant_count(&self) -> usize {
        self.products.iter().map(|p| p.variants.len()).sum()
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    /// Pagination stopped early. The products gathered so far are attached for
    /// diagnostics only; they must not be reconciled against.
    #[error("catalog fetch aborted after {pages_fetched} page(s): {source}")]
    Incomplete {
        pages_fetched: usize,
        accumulated: Vec<CatalogProduct>,
        #[source]
        source: FetchError,
    },
}

impl CatalogError {
    pub fn fetch_error(&self) -> &FetchError {
        match self {
            Self::Incomplete { source, .. } => source,
        }
    }
}

/// One decoded catalog page.
#[derive(Debug, Clone, Default)]
pub struct ProductsPage {
    pub products: Vec<CatalogProduct>,
    /// Records present on the page but unreadable.
    pub skipped: usize,
}

impl ProductsPage {
    /// True when the platform returned no records at all.
    pub fn is_exhausted(&self) -> bool {
        self.products.is_empty() && self.skipped == 0
    }
}

pub struct CatalogFetcher<'a> {
    http: &'a HttpFetcher,
    endpoint: &'a ShopEndpoint,
    credentials: &'a ShopCredentials,
}

impl<'a> CatalogFetcher<'a> {
    pub fn new(
        http: &'a HttpFetcher,
        endpoint: &'a ShopEndpoint,
        credentials: &'a ShopCredentials,
    ) -> Self {
        Self {
            http,
            endpoint,
            credentials,
        }
    }

    /// Follow `rel="next"` links until the catalog is exhausted.
    pub async fn fetch_all(&self) -> Result<CatalogSnapshot, CatalogError> {
        let mut products = Vec::new();
        let mut pages = 0usize;
        let mut skipped = 0usize;
        let mut visited = HashSet::new();
        let mut next = Some(self.endpoint.products_url(PAGE_LIMIT));

        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!(%url, pages, "next link points at an already fetched page; stopping");
                break;
            }

            let request = self
                .credentials
                .authorize(self.http.request(Method::GET, &url));
            let resp = match self.http.send_expecting_success(request).await {
                Ok(resp) => resp,
                Err(source) => {
                    return Err(CatalogError::Incomplete {
                        pages_fetched: pages,
                        accumulated: products,
                        source,
                    })
                }
            };

            let page = match parse_products_page(&resp.final_url, &resp.body) {
                Ok(page) => page,
                Err(source) => {
                    return Err(CatalogError::Incomplete {
                        pages_fetched: pages,
                        accumulated: products,
                        source,
                    })
                }
            };
            pages += 1;
            debug!(
                page = pages,
                products = page.products.len(),
                skipped = page.skipped,
                "catalog page fetched"
            );

            if page.is_exhausted() {
                break;
            }
            skipped += page.skipped;
            products.extend(page.products);
            next = resp.link_header().and_then(next_page_url);
        }

        info!(pages, products = products.len(), skipped, "catalog fetched");
        Ok(CatalogSnapshot {
            products,
            pages,
            skipped,
        })
    }
}

/// Decode a `{"products": [...]}` page or a bare product array. Only the page
/// shape is mandatory: a product or variant that cannot be read is logged and
/// skipped so the rest of the page still reconciles.
pub fn parse_products_page(url: &str, body: &[u8]) -> Result<ProductsPage, FetchError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| FetchError::parse(url, e))?;
    let records = match value {
        JsonValue::Array(records) => records,
        JsonValue::Object(mut fields) => match fields.remove("products") {
            Some(JsonValue::Array(records)) => records,
            Some(JsonValue::Null) | None => Vec::new(),
            Some(_) => return Err(FetchError::parse(url, "`products` is not an array")),
        },
        _ => return Err(FetchError::parse(url, "expected a products page object")),
    };

    let mut page = ProductsPage::default();
    for (index, record) in records.into_iter().enumerate() {
        match product_from_record(record) {
            Ok((product, dropped_variants)) => {
                page.skipped += dropped_variants;
                page.products.push(product);
            }
            Err(reason) => {
                warn!(%url, index, %reason, "skipping catalog product");
                page.skipped += 1;
            }
        }
    }
    Ok(page)
}

fn product_from_record(record: JsonValue) -> Result<(CatalogProduct, usize), String> {
    let JsonValue::Object(mut fields) = record else {
        return Err("product is not an object".to_string());
    };
    let variants = match fields.remove("variants") {
        Some(JsonValue::Array(variants)) => variants,
        Some(JsonValue::Null) | None => Vec::new(),
        Some(other) => return Err(format!("variants has unexpected type: {other}")),
    };
    let mut product: CatalogProduct =
        serde_json::from_value(JsonValue::Object(fields)).map_err(|e| e.to_string())?;

    let mut dropped = 0usize;
    for (index, variant) in variants.into_iter().enumerate() {
        match serde_json::from_value::<CatalogVariant>(variant) {
            Ok(variant) => product.variants.push(variant),
            Err(e) => {
                warn!(product_id = %product.id, index, error = %e, "skipping catalog variant");
                dropped += 1;
            }
        }
    }
    Ok((product, dropped))
}

/// Extract the `rel="next"` target from a `Link` header value. Targets are
/// delimited by `<...>` first, so commas inside a URL are kept.
pub fn next_page_url(link_header: &str) -> Option<String> {
    let mut rest = link_header;
    while let Some(open) = rest.find('<') {
        let after_open = &rest[open + 1..];
        let close = after_open.find('>')?;
        let target = after_open[..close].trim();
        let after_target = &after_open[close + 1..];

        let params_end = after_target.find('<').unwrap_or(after_target.len());
        let params = &after_target[..params_end];
        let is_next = params.split([';', ',']).any(|param| {
            let Some((key, value)) = param.split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        if is_next && !target.is_empty() {
            return Some(target.to_string());
        }
        rest = &after_target[params_end..];
    }
    None
}

/// Load a saved `products.json` page (or a bare product array) from disk.
pub fn load_catalog_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<CatalogProduct>> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let page = parse_products_page(&path.display().to_string(), &data)
        .with_context(|| format!("parsing {}", path.display()))?;
    if page.skipped > 0 {
        warn!(path = %path.display(), skipped = page.skipped, "catalog file has unreadable records");
    }
    Ok(page.products)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server;
    use axum::{
        extract::{Query, State},
        http::{header, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };
    use pricesync_storage::HttpClientConfig;
    use serde_json::json;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    #[test]
    fn next_link_is_found_among_relations() {
        let header = r#"<https://s.test/admin/api/2024-01/products.json?limit=250&page_info=abc>; rel="previous", <https://s.test/admin/api/2024-01/products.json?limit=250&page_info=def>; rel="next""#;
        assert_eq!(
            next_page_url(header).as_deref(),
            Some("https://s.test/admin/api/2024-01/products.json?limit=250&page_info=def")
        );
        assert_eq!(
            next_page_url(r#"<https://s.test/p?page_info=abc>; rel="previous""#),
            None
        );
        assert_eq!(next_page_url(""), None);
        assert_eq!(next_page_url("<>; rel=\"next\""), None);
    }

    #[test]
    fn next_link_keeps_commas_inside_the_url() {
        let header = r#"<https://s.test/products.json?fields=id,variants&page_info=a>; rel="previous", <https://s.test/products.json?fields=id,title,variants&page_info=b>; rel="next""#;
        assert_eq!(
            next_page_url(header).as_deref(),
            Some("https://s.test/products.json?fields=id,title,variants&page_info=b")
        );
        assert_eq!(
            next_page_url(r#"<https://s.test/p?page_info=c>; rel="prefetch next""#).as_deref(),
            Some("https://s.test/p?page_info=c")
        );
    }

    #[test]
    fn malformed_records_are_skipped_without_losing_the_page() {
        let body = br#"{"products":[
            {"id":1,"title":"Good","variants":[
                {"id":10,"sku":"A1","price":"5.00"},
                {"sku":"NO-ID","price":"1.00"},
                {"id":12,"sku":{"nested":true},"price":"1.00"}
            ]},
            {"id":2,"title":"Numeric sku","variants":[{"id":20,"sku":12345,"price":"7.00"}]},
            {"title":"Missing id","variants":[{"id":30,"sku":"C3","price":"1.00"}]},
            "not a product"
        ]}"#;
        let page = parse_products_page("u", body).unwrap();
        assert_eq!(
            page.products.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        assert_eq!(page.products[0].variants.len(), 1);
        assert_eq!(page.products[1].variants[0].normalized_sku(), Some("12345"));
        assert_eq!(page.skipped, 4);
        assert!(!page.is_exhausted());
    }

    #[test]
    fn page_without_products_field_is_empty() {
        assert!(parse_products_page("u", br#"{}"#).unwrap().is_exhausted());
        assert!(parse_products_page("u", br#"{"products":null}"#).unwrap().is_exhausted());
        assert_eq!(parse_products_page("u", br#"[{"id":1}]"#).unwrap().products.len(), 1);
        assert!(matches!(
            parse_products_page("u", br#"{"products":{}}"#),
            Err(FetchError::Parse { .. })
        ));
        assert!(matches!(
            parse_products_page("u", b"not json"),
            Err(FetchError::Parse { .. })
        ));
    }

    fn product_page(ids: &[u64]) -> serde_json::Value {
        json!({
            "products": ids.iter().map(|id| json!({
                "id": id,
                "title": format!("Product {id}"),
                "variants": [{ "id": id * 10, "sku": format!("SKU-{id}"), "price": "10.00", "title": "Default" }]
            })).collect::<Vec<_>>()
        })
    }

    async fn paged_products(
        State(addr): State<SocketAddr>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        if headers.get("x-shop-access-token").map(|v| v.as_bytes()) != Some(b"token".as_slice()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let next = |cursor: &str| {
            format!("<http://{addr}/admin/api/2024-01/products.json?limit=250&page_info={cursor}>; rel=\"next\"")
        };
        match params.get("page_info").map(String::as_str) {
            None => ([(header::LINK, next("p2"))], Json(product_page(&[1, 2]))).into_response(),
            Some("p2") => ([(header::LINK, next("p3"))], Json(product_page(&[3]))).into_response(),
            Some("p3") => Json(product_page(&[4, 5])).into_response(),
            Some(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn serve_catalog() -> ShopEndpoint {
        let (listener, addr) = test_server::bind().await;
        let app = Router::new()
            .route("/admin/api/2024-01/products.json", get(paged_products))
            .with_state(addr);
        test_server::serve(listener, app);
        ShopEndpoint::from_base_url(format!("http://{addr}/admin/api/2024-01"))
    }

    #[tokio::test]
    async fn pagination_collects_every_page_then_stops() {
        let endpoint = serve_catalog().await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let creds = ShopCredentials::new("token");
        let snapshot = CatalogFetcher::new(&http, &endpoint, &creds)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(snapshot.pages, 3);
        assert_eq!(
            snapshot
                .products
                .iter()
                .map(|p| p.id.as_str().to_string())
                .collect::<Vec<_>>(),
            vec!["1", "2", "3", "4", "5"]
        );
        assert_eq!(snapshot.variant_count(), 5);
    }

    #[tokio::test]
    async fn missing_credentials_abort_with_http_status() {
        let endpoint = serve_catalog().await;
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let creds = ShopCredentials::new("wrong");
        let err = CatalogFetcher::new(&http, &endpoint, &creds)
            .fetch_all()
            .await
            .unwrap_err();
        assert_eq!(err.fetch_error().status(), Some(401));
        let CatalogError::Incomplete { pages_fetched, accumulated, .. } = err;
        assert_eq!(pages_fetched, 0);
        assert!(accumulated.is_empty());
    }

    #[tokio::test]
    async fn mid_pagination_failure_keeps_partial_products_on_the_error() {
        let (listener, addr) = test_server::bind().await;
        let app = Router::new().route(
            "/admin/api/2024-01/products.json",
            get(move |Query(params): Query<HashMap<String, String>>| async move {
                if params.contains_key("page_info") {
                    return StatusCode::BAD_GATEWAY.into_response();
                }
                let link = format!(
                    "<http://{addr}/admin/api/2024-01/products.json?page_info=x>; rel=\"next\""
                );
                ([(header::LINK, link)], Json(product_page(&[1]))).into_response()
            }),
        );
        test_server::serve(listener, app);

        let endpoint = ShopEndpoint::from_base_url(format!("http://{addr}/admin/api/2024-01"));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let creds = ShopCredentials::new("token");
        let err = CatalogFetcher::new(&http, &endpoint, &creds)
            .fetch_all()
            .await
            .unwrap_err();
        let CatalogError::Incomplete { pages_fetched, accumulated, source } = err;
        assert_eq!(pages_fetched, 1);
        assert_eq!(accumulated.len(), 1);
        assert_eq!(source.status(), Some(502));
    }

    #[tokio::test]
    async fn self_referencing_next_link_does_not_loop() {
        let (listener, addr) = test_server::bind().await;
        let app = Router::new().route(
            "/admin/api/2024-01/products.json",
            get(move || async move {
                let link = format!(
                    "<http://{addr}/admin/api/2024-01/products.json?limit=250>; rel=\"next\""
                );
                ([(header::LINK, link)], Json(product_page(&[9]))).into_response()
            }),
        );
        test_server::serve(listener, app);

        let endpoint = ShopEndpoint::from_base_url(format!("http://{addr}/admin/api/2024-01"));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let creds = ShopCredentials::new("token");
        let snapshot = CatalogFetcher::new(&http, &endpoint, &creds)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(snapshot.pages, 1);
        assert_eq!(snapshot.products.len(), 1);
    }

    #[tokio::test]
    async fn empty_page_ends_pagination() {
        let (listener, addr) = test_server::bind().await;
        let app = Router::new().route(
            "/admin/api/2024-01/products.json",
            get(move || async move {
                let link = format!(
                    "<http://{addr}/admin/api/2024-01/products.json?page_info=again>; rel=\"next\""
                );
                ([(header::LINK, link)], Json(json!({ "products": [] }))).into_response()
            }),
        );
        test_server::serve(listener, app);

        let endpoint = ShopEndpoint::from_base_url(format!("http://{addr}/admin/api/2024-01"));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let creds = ShopCredentials::new("token");
        let snapshot = CatalogFetcher::new(&http, &endpoint, &creds)
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(snapshot.pages, 1);
        assert!(snapshot.products.is_empty());
    }
}
