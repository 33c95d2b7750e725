//! HTTP transport + failure-report storage for pricesync.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Method, RequestBuilder, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::Instrument;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricesync-storage";

pub const FAILURE_REPORT_FILE: &str = "failures.txt";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Writes run reports under a root directory, one subdirectory per run.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_relative_dir(&self, started_at: DateTime<Utc>, run_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(format!("{stamp}_{run_id}"))
    }

    /// Store the failure report for a run using an atomic temp-file rename.
    /// A report already present for the run is replaced.
    pub async fn store_failure_report(
        &self,
        started_at: DateTime<Utc>,
        run_id: Uuid,
        text: &str,
    ) -> anyhow::Result<StoredReport> {
        let relative_path = self
            .run_relative_dir(started_at, run_id)
            .join(FAILURE_REPORT_FILE);
        let absolute_path = self.root.join(&relative_path);
        self.write_atomically(&absolute_path, text.as_bytes()).await?;

        Ok(StoredReport {
            content_hash: Self::sha256_hex(text.as_bytes()),
            relative_path,
            absolute_path,
            byte_size: text.len(),
        })
    }

    /// Write `bytes` to an explicit path (e.g. a user-chosen export target).
    pub async fn export_to(&self, path: &Path, text: &str) -> anyhow::Result<StoredReport> {
        self.write_atomically(path, text.as_bytes()).await?;
        Ok(StoredReport {
            content_hash: Self::sha256_hex(text.as_bytes()),
            relative_path: path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_path_buf(),
            absolute_path: path.to_path_buf(),
            byte_size: text.len(),
        })
    }

    async fn write_atomically(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = match absolute_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating report directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn link_header(&self) -> Option<&str> {
        self.headers.get(LINK).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparseable response from {url}: {message}")]
    Parse { url: String, message: String },
}

impl FetchError {
    pub fn parse(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Shared HTTP client. Every request goes through the global concurrency limit
/// and, when configured, the token bucket. There is no retry layer: a failed
/// request is reported to the caller as-is.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
        })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Send a prepared request and read the full body, whatever the status.
    pub async fn send(&self, request: RequestBuilder) -> Result<HttpResponse, FetchError> {
        let request = request.build().map_err(|source| FetchError::Transport {
            url: String::from("<unbuilt request>"),
            source,
        })?;
        let method = request.method().clone();
        let url = request.url().to_string();

        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = tracing::info_span!("http_request", %method, url = %url);
        async {
            let resp = self
                .client
                .execute(request)
                .await
                .map_err(|source| FetchError::Transport {
                    url: url.clone(),
                    source,
                })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let headers = resp.headers().clone();
            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Transport {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            tracing::debug!(status = status.as_u16(), bytes = body.len(), "response received");
            Ok(HttpResponse {
                status,
                final_url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// Send a request and require a 2xx status.
    pub async fn send_expecting_success(
        &self,
        request: RequestBuilder,
    ) -> Result<HttpResponse, FetchError> {
        let resp = self.send(request).await?;
        if !resp.status.is_success() {
            return Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
            });
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn report_hashing_is_stable() {
        let hash = ReportStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn failure_report_lands_in_run_directory() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let started_at = Utc
            .with_ymd_and_hms(2026, 2, 24, 12, 0, 0)
            .single()
            .expect("ts");
        let run_id = Uuid::nil();

        let stored = store
            .store_failure_report(started_at, run_id, "A1\t1\tboom\n")
            .await
            .expect("store");

        assert_eq!(
            stored.relative_path,
            PathBuf::from(format!("20260224_120000_{run_id}")).join(FAILURE_REPORT_FILE)
        );
        assert_eq!(stored.byte_size, 11);
        let text = std::fs::read_to_string(&stored.absolute_path).expect("read back");
        assert_eq!(text, "A1\t1\tboom\n");

        let rewritten = store
            .store_failure_report(started_at, run_id, "")
            .await
            .expect("overwrite");
        assert_eq!(rewritten.absolute_path, stored.absolute_path);
        assert_eq!(std::fs::read_to_string(&rewritten.absolute_path).unwrap(), "");
        let leftovers = std::fs::read_dir(stored.absolute_path.parent().unwrap())
            .unwrap()
            .count();
        assert_eq!(leftovers, 1, "temp files must be renamed away");
    }

    #[tokio::test]
    async fn export_to_explicit_path_creates_parents() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let target = dir.path().join("exports").join("failed.txt");
        let stored = store.export_to(&target, "x\n").await.expect("export");
        assert_eq!(stored.relative_path, PathBuf::from("exports/failed.txt"));
        assert_eq!(std::fs::read_to_string(target).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fetch_error_exposes_status() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.to_string(), "http status 503 for https://example.test");
        assert_eq!(FetchError::parse("u", "bad").status(), None);
    }
}
