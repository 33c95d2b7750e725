//! Sync pipeline orchestration: fetch, reconcile, apply, report.

pub mod collect;
pub mod config;
pub mod executor;
pub mod reconcile;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use pricesync_adapters::{
    load_catalog_file, load_feed_file, updater_for_strategy, CatalogError, CatalogFetcher,
    CatalogSnapshot, FeedSnapshot, SourcePriceFeed, UpdateStrategy,
};
use pricesync_storage::{HttpFetcher, ReportStore};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub use collect::{collect, Progress, ResultCollector, Summary};
pub use config::{ConfigError, ConfigFile, SyncConfig, DEFAULT_CONFIG_FILE, DEFAULT_FEED_URL};
pub use executor::{ExecutionEvent, UpdateExecutor};
pub use reconcile::{build_lookup, diff, reconcile, ComparisonWarning, ReconcileStats, Reconciliation};

pub const CRATE_NAME: &str = "pricesync-sync";

/// Everything known before any write is attempted.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub feed: FeedSnapshot,
    pub catalog: CatalogSnapshot,
    pub reconciliation: Reconciliation,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: UpdateStrategy,
    pub feed_entries: usize,
    pub feed_rejected: usize,
    pub catalog_products: usize,
    pub catalog_variants: usize,
    pub catalog_pages: usize,
    /// Catalog products and variants dropped as unreadable.
    pub catalog_skipped: usize,
    pub pending_updates: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub warnings: usize,
    pub failure_report: Option<String>,
    pub failure_report_sha256: Option<String>,
    /// Set when the failure report could not be written; the counts above still hold.
    pub failure_report_error: Option<String>,
}

impl SyncRunSummary {
    pub fn is_clean(&self) -> bool {
        self.failure_count == 0 && self.failure_report_error.is_none()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    reports: ReportStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let reports = ReportStore::new(config.reports_dir.clone());
        Ok(Self {
            config,
            http: Arc::new(http),
            reports,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn fetch_feed(&self) -> Result<FeedSnapshot> {
        let feed = SourcePriceFeed::new(self.config.feed_url.clone());
        let snapshot = feed
            .fetch(&self.http)
            .await
            .with_context(|| format!("fetching price feed {}", feed.url()))?;
        if snapshot.entries.is_empty() {
            warn!(url = %snapshot.url, "price feed returned no usable entries");
        }
        Ok(snapshot)
    }

    pub async fn fetch_catalog(&self) -> Result<CatalogSnapshot> {
        let endpoint = self.config.endpoint();
        let credentials = self.config.credentials();
        let fetcher = CatalogFetcher::new(&self.http, &endpoint, &credentials);
        match fetcher.fetch_all().await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                let CatalogError::Incomplete {
                    pages_fetched,
                    accumulated,
                    ..
                } = &err;
                warn!(
                    pages_fetched,
                    partial_products = accumulated.len(),
                    status = ?err.fetch_error().status(),
                    "catalog fetch incomplete; nothing will be updated"
                );
                Err(err).context("fetching catalog")
            }
        }
    }

    /// Fetch both sides and diff them. Either fetch failing aborts the run
    /// before any update is sent.
    pub async fn plan(&self) -> Result<SyncPlan> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (feed, catalog) = tokio::try_join!(self.fetch_feed(), self.fetch_catalog())?;

        let reconciliation = reconcile(&feed.entries, &catalog.products);
        info!(
            %run_id,
            feed_skus = reconciliation.stats.feed_skus,
            variants = reconciliation.stats.variants_seen,
            pending = reconciliation.stats.pending,
            in_sync = reconciliation.stats.in_sync,
            unmatched = reconciliation.stats.unmatched,
            warnings = reconciliation.warnings.len(),
            "reconciliation complete"
        );

        Ok(SyncPlan {
            run_id,
            started_at,
            feed,
            catalog,
            reconciliation,
        })
    }

    pub fn executor(&self) -> UpdateExecutor {
        let updater = updater_for_strategy(
            self.config.update_strategy,
            Arc::clone(&self.http),
            self.config.endpoint(),
            self.config.credentials(),
            &self.config.updater_options(),
        );
        UpdateExecutor::new(Arc::from(updater), self.config.concurrency)
    }

    /// Apply the plan's updates, handing every event and the running progress to `on_event`.
    pub async fn execute<F>(&self, plan: &SyncPlan, mut on_event: F) -> Summary
    where
        F: FnMut(&ExecutionEvent, &Progress),
    {
        let updates = plan.reconciliation.updates.clone();
        let mut collector = ResultCollector::new(updates.len());
        let mut events = self.executor().execute(updates);
        while let Some(event) = events.next().await {
            let progress = collector.observe(&event);
            on_event(&event, progress);
        }
        collector.finish()
    }

    /// Persist the failure list when there is one, then build the run summary.
    /// An explicit `export_path` wins over the per-run reports directory. A
    /// report that cannot be written is recorded on the summary instead of
    /// discarding the tally.
    pub async fn finalize(
        &self,
        plan: &SyncPlan,
        summary: &Summary,
        export_path: Option<&Path>,
    ) -> SyncRunSummary {
        let written = if summary.is_clean() {
            Ok(None)
        } else {
            let text = summary.failure_report();
            match export_path {
                Some(path) => self.reports.export_to(path, &text).await.map(Some),
                None if self.config.export_failures => self
                    .reports
                    .store_failure_report(plan.started_at, plan.run_id, &text)
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (stored, failure_report_error) = match written {
            Ok(stored) => (stored, None),
            Err(err) => {
                warn!(
                    run_id = %plan.run_id,
                    failed = summary.failure_count,
                    error = %format!("{err:#}"),
                    "failure report could not be written"
                );
                (None, Some(format!("{err:#}")))
            }
        };
        let failure_report = stored
            .as_ref()
            .map(|report| report.absolute_path.display().to_string());

        let finished_at = Utc::now();
        info!(
            run_id = %plan.run_id,
            success = summary.success_count,
            failed = summary.failure_count,
            report = failure_report.as_deref().unwrap_or("-"),
            "sync run finished"
        );

        SyncRunSummary {
            run_id: plan.run_id,
            started_at: plan.started_at,
            finished_at,
            strategy: self.config.update_strategy,
            feed_entries: plan.feed.entries.len(),
            feed_rejected: plan.feed.rejected.len(),
            catalog_products: plan.catalog.products.len(),
            catalog_variants: plan.catalog.variant_count(),
            catalog_pages: plan.catalog.pages,
            catalog_skipped: plan.catalog.skipped,
            pending_updates: plan.reconciliation.updates.len(),
            success_count: summary.success_count,
            failure_count: summary.failure_count,
            warnings: plan.reconciliation.warnings.len(),
            failure_report,
            failure_report_sha256: stored.map(|report| report.content_hash),
            failure_report_error,
        }
    }

    pub async fn run_once(&self, export_path: Option<&Path>) -> Result<SyncRunSummary> {
        let plan = self.plan().await?;
        let summary = self.execute(&plan, |_, _| {}).await;
        Ok(self.finalize(&plan, &summary, export_path).await)
    }
}

/// Diff saved feed and catalog files without touching the network.
pub fn plan_from_files(feed_path: &Path, catalog_path: &Path) -> Result<Reconciliation> {
    let (entries, rejected) = load_feed_file(feed_path)?;
    if !rejected.is_empty() {
        warn!(rejected = rejected.len(), path = %feed_path.display(), "feed file has unusable records");
    }
    let products = load_catalog_file(catalog_path)?;
    Ok(reconcile(&entries, &products))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path as UrlPath,
        http::{HeaderMap, StatusCode},
        routing::{get, post, put},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn start_shop(puts: Calls) -> String {
        start_shop_recording(puts, Calls::default()).await
    }

    async fn start_shop_recording(puts: Calls, mutations: Calls) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/feed",
                get(|| async {
                    Json(json!([
                        { "sku": "A1", "price": "100.00" },
                        { "sku": "B2", "price": "10.00" },
                        { "sku": "C3", "price": "5.005" },
                        { "sku": "D4", "price": 20 }
                    ]))
                }),
            )
            .route("/broken-feed", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/admin/api/2024-01/products.json",
                get(|headers: HeaderMap| async move {
                    if headers.get("x-shop-access-token").and_then(|v| v.to_str().ok()) != Some("tok") {
                        return Err(StatusCode::UNAUTHORIZED);
                    }
                    Ok(Json(json!({
                        "products": [
                            {
                                "id": 1,
                                "title": "Inverter",
                                "variants": [
                                    { "id": 11, "sku": "A1", "price": "95.00", "title": "12V", "option1": "12V" },
                                    { "id": 12, "sku": "B2", "price": "10.00", "title": "24V", "option1": "24V" }
                                ]
                            },
                            {
                                "id": 2,
                                "title": "Cable",
                                "variants": [
                                    { "id": 21, "sku": null, "price": "1.00", "title": "Default" },
                                    { "id": 22, "sku": "D4", "price": "25.00", "title": "Default" }
                                ]
                            }
                        ]
                    })))
                }),
            )
            .route(
                "/admin/api/2024-01/variants/{file}",
                put(move |UrlPath(file): UrlPath<String>, Json(body): Json<Value>| {
                    let puts = Arc::clone(&puts);
                    async move {
                        let id = file.trim_end_matches(".json").to_string();
                        puts.lock().unwrap().push((id.clone(), body.clone()));
                        if id == "22" {
                            (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "errors": { "price": ["invalid"] } })))
                        } else {
                            (StatusCode::OK, Json(json!({ "variant": body["variant"].clone() })))
                        }
                    }
                }),
            )
            .route(
                "/admin/api/2024-01/graphql.json",
                post(move |Json(body): Json<Value>| {
                    let mutations = Arc::clone(&mutations);
                    async move {
                        let input = &body["variables"]["input"];
                        let variant = input["variants"][0]["id"].as_str().unwrap_or_default().to_string();
                        mutations.lock().unwrap().push((variant.clone(), input.clone()));
                        if variant.ends_with("/22") {
                            Json(json!({
                                "data": { "productUpdate": { "product": null, "userErrors": [{ "field": ["variants", "0", "price"], "message": "Price is invalid" }] } }
                            }))
                        } else {
                            Json(json!({
                                "data": { "productUpdate": { "product": { "id": input["id"].clone() }, "userErrors": [] } }
                            }))
                        }
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config_for(base: &str, reports_dir: &Path) -> SyncConfig {
        SyncConfig {
            shop: "test-shop.example.com".into(),
            access_token: "tok".into(),
            feed_url: format!("{base}/feed"),
            api_base_url: Some(format!("{base}/admin/api/2024-01")),
            reports_dir: reports_dir.to_path_buf(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn end_to_end_run_updates_mismatches_and_reports_failures() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let base = start_shop(Arc::clone(&puts)).await;
        let dir = tempfile::tempdir().unwrap();
        let pipeline = SyncPipeline::new(config_for(&base, dir.path())).unwrap();

        let summary = pipeline.run_once(None).await.unwrap();
        assert_eq!(summary.feed_entries, 4);
        assert_eq!(summary.catalog_products, 2);
        assert_eq!(summary.catalog_variants, 4);
        assert_eq!(summary.pending_updates, 2);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 1);

        let calls = puts.lock().unwrap().clone();
        assert_eq!(
            calls.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
            vec!["11", "22"]
        );
        assert_eq!(calls[0].1["variant"]["price"], json!("100.00"));

        let report_path = summary.failure_report.expect("failure report written");
        let text = std::fs::read_to_string(&report_path).unwrap();
        assert!(text.starts_with("D4\t22\tHTTP 422"));
        assert!(report_path.starts_with(&dir.path().display().to_string()));
        assert_eq!(
            summary.failure_report_sha256.as_deref(),
            Some(pricesync_storage::ReportStore::sha256_hex(text.as_bytes()).as_str())
        );
    }

    #[tokio::test]
    async fn explicit_export_path_wins_and_progress_is_reported() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let base = start_shop(puts).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&base, &dir.path().join("reports"));
        config.concurrency = 2;
        let pipeline = SyncPipeline::new(config).unwrap();

        let plan = pipeline.plan().await.unwrap();
        let mut seen = Vec::new();
        let summary = pipeline
            .execute(&plan, |event, progress| {
                if matches!(event, ExecutionEvent::Finished { .. }) {
                    seen.push(progress.completed);
                }
            })
            .await;
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(
            summary.outcomes.iter().map(|o| o.sku.as_str()).collect::<Vec<_>>(),
            vec!["A1", "D4"]
        );

        let export = dir.path().join("out/failed.tsv");
        let run = pipeline.finalize(&plan, &summary, Some(&export)).await;
        assert!(run.failure_report_error.is_none());
        assert_eq!(run.failure_report.as_deref(), Some(export.display().to_string().as_str()));
        assert!(export.exists());
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn unwritable_report_keeps_the_tally() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let base = start_shop(puts).await;
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let pipeline = SyncPipeline::new(config_for(&base, dir.path())).unwrap();

        let run = pipeline.run_once(Some(&blocker.join("failed.tsv"))).await.unwrap();
        assert_eq!(run.success_count, 1);
        assert_eq!(run.failure_count, 1);
        assert!(run.failure_report.is_none());
        assert!(run.failure_report_sha256.is_none());
        assert!(run.failure_report_error.is_some());
        assert!(!run.is_clean());
    }

    #[tokio::test]
    async fn graph_strategy_runs_through_the_pipeline() {
        let puts = Calls::default();
        let mutations = Calls::default();
        let base = start_shop_recording(Arc::clone(&puts), Arc::clone(&mutations)).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&base, dir.path());
        config.update_strategy = UpdateStrategy::Graph;
        config.export_failures = false;
        let pipeline = SyncPipeline::new(config).unwrap();

        let plan = pipeline.plan().await.unwrap();
        let summary = pipeline.execute(&plan, |_, _| {}).await;
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 1);
        assert_eq!(summary.failures[0].sku, "D4");
        assert!(summary.failures[0]
            .failure_reason()
            .unwrap_or_default()
            .contains("validation errors"));

        let calls = mutations.lock().unwrap().clone();
        let mut variants = calls.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>();
        variants.sort();
        assert_eq!(
            variants,
            vec!["gid://shopify/ProductVariant/11", "gid://shopify/ProductVariant/22"]
        );
        let a1 = calls.iter().find(|(id, _)| id.ends_with("/11")).unwrap();
        assert_eq!(a1.1["id"], json!("gid://shopify/Product/1"));
        assert_eq!(a1.1["variants"][0]["price"], json!("100.00"));
        assert!(puts.lock().unwrap().is_empty());

        let run = pipeline.finalize(&plan, &summary, None).await;
        assert_eq!(run.strategy, UpdateStrategy::Graph);
        assert!(run.failure_report.is_none());
    }

    #[tokio::test]
    async fn feed_failure_aborts_before_any_update() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let base = start_shop(Arc::clone(&puts)).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&base, dir.path());
        config.feed_url = format!("{base}/broken-feed");
        let pipeline = SyncPipeline::new(config).unwrap();

        let err = pipeline.run_once(None).await.unwrap_err();
        let fetch = err
            .downcast_ref::<pricesync_storage::FetchError>()
            .expect("fetch error in chain");
        assert_eq!(fetch.status(), Some(502));
        assert!(puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn catalog_auth_failure_aborts_before_any_update() {
        let puts = Arc::new(Mutex::new(Vec::new()));
        let base = start_shop(Arc::clone(&puts)).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_for(&base, dir.path());
        config.access_token = "wrong".into();
        let pipeline = SyncPipeline::new(config).unwrap();

        let err = pipeline.plan().await.unwrap_err();
        let catalog = err.downcast_ref::<CatalogError>().expect("catalog error in chain");
        assert_eq!(catalog.fetch_error().status(), Some(401));
        assert!(puts.lock().unwrap().is_empty());
    }

    #[test]
    fn offline_plan_from_fixture_files() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let result = plan_from_files(
            &root.join("feed/sample.json"),
            &root.join("catalog/products_page1.json"),
        )
        .unwrap();
        assert_eq!(result.stats.pending, 2);
        assert_eq!(result.updates[0].sku, "MPPT-100-30");
        assert_eq!(result.warnings.len(), 1);
    }
}
