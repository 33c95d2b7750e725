//! Run configuration: defaults, optional YAML file, then `PRICESYNC_*` env vars.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pricesync_adapters::{
    ShopCredentials, ShopEndpoint, UpdateStrategy, UpdaterOptions, DEFAULT_ACCESS_TOKEN_HEADER,
    DEFAULT_GID_NAMESPACE,
};
use pricesync_storage::{HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "pricesync.yaml";
pub const DEFAULT_FEED_URL: &str = "https://eorder.victronenergy.com/api/v1/pricelist/map/us/";
pub const DEFAULT_API_VERSION: &str = "2024-01";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("config file {path}: {message}")]
    File { path: PathBuf, message: String },
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

/// Everything a run needs, built once at startup and passed by reference.
#[derive(Clone)]
pub struct SyncConfig {
    /// Bare hostname, e.g. `my-store.myshopify.com`.
    pub shop: String,
    pub access_token: String,
    pub access_token_header: String,
    pub feed_url: String,
    pub api_version: String,
    /// Overrides the `https://{shop}/admin/api/{version}` root.
    pub api_base_url: Option<String>,
    pub update_strategy: UpdateStrategy,
    pub resend_options: bool,
    pub gid_namespace: String,
    pub concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub requests_per_second: Option<u32>,
    pub reports_dir: PathBuf,
    pub export_failures: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            shop: String::new(),
            access_token: String::new(),
            access_token_header: DEFAULT_ACCESS_TOKEN_HEADER.to_string(),
            feed_url: DEFAULT_FEED_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            update_strategy: UpdateStrategy::Direct,
            resend_options: false,
            gid_namespace: DEFAULT_GID_NAMESPACE.to_string(),
            concurrency: 1,
            user_agent: "pricesync/0.1".to_string(),
            http_timeout_secs: 30,
            requests_per_second: None,
            reports_dir: PathBuf::from("./reports"),
            export_failures: true,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("shop", &self.shop)
            .field("access_token", &"<redacted>")
            .field("access_token_header", &self.access_token_header)
            .field("feed_url", &self.feed_url)
            .field("api_version", &self.api_version)
            .field("api_base_url", &self.api_base_url)
            .field("update_strategy", &self.update_strategy)
            .field("resend_options", &self.resend_options)
            .field("gid_namespace", &self.gid_namespace)
            .field("concurrency", &self.concurrency)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("requests_per_second", &self.requests_per_second)
            .field("reports_dir", &self.reports_dir)
            .field("export_failures", &self.export_failures)
            .finish()
    }
}

/// On-disk shape of `pricesync.yaml`; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub shop: Option<String>,
    pub access_token: Option<String>,
    pub access_token_header: Option<String>,
    pub feed_url: Option<String>,
    pub api_version: Option<String>,
    pub api_base_url: Option<String>,
    pub update_strategy: Option<UpdateStrategy>,
    pub resend_options: Option<bool>,
    pub gid_namespace: Option<String>,
    pub concurrency: Option<usize>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub requests_per_second: Option<u32>,
    pub reports_dir: Option<PathBuf>,
    pub export_failures: Option<bool>,
}

impl SyncConfig {
    /// Defaults, then `path` (or `./pricesync.yaml` when present), then env vars,
    /// then validation. Nothing touches the network before this succeeds.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::resolve(path, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// The layered settings without validation, for commands that only need
    /// part of them (the feed listing needs no shop credentials).
    pub fn resolve<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let file_path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        if let Some(file_path) = file_path {
            config.apply_file(&ConfigFile::read(&file_path)?);
        }
        config.apply_env(lookup)?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: &ConfigFile) {
        let file = file.clone();
        set(&mut self.shop, file.shop);
        set(&mut self.access_token, file.access_token);
        set(&mut self.access_token_header, file.access_token_header);
        set(&mut self.feed_url, file.feed_url);
        set(&mut self.api_version, file.api_version);
        if file.api_base_url.is_some() {
            self.api_base_url = file.api_base_url;
        }
        set(&mut self.update_strategy, file.update_strategy);
        set(&mut self.resend_options, file.resend_options);
        set(&mut self.gid_namespace, file.gid_namespace);
        set(&mut self.concurrency, file.concurrency);
        set(&mut self.user_agent, file.user_agent);
        set(&mut self.http_timeout_secs, file.http_timeout_secs);
        if file.requests_per_second.is_some() {
            self.requests_per_second = file.requests_per_second;
        }
        set(&mut self.reports_dir, file.reports_dir);
        set(&mut self.export_failures, file.export_failures);
    }

    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        set(&mut self.shop, get("PRICESYNC_SHOP"));
        set(&mut self.access_token, get("PRICESYNC_ACCESS_TOKEN"));
        set(&mut self.access_token_header, get("PRICESYNC_ACCESS_TOKEN_HEADER"));
        set(&mut self.feed_url, get("PRICESYNC_FEED_URL"));
        set(&mut self.api_version, get("PRICESYNC_API_VERSION"));
        if let Some(base) = get("PRICESYNC_API_BASE_URL") {
            self.api_base_url = Some(base);
        }
        if let Some(raw) = get("PRICESYNC_UPDATE_STRATEGY") {
            self.update_strategy = raw
                .parse()
                .map_err(|message: String| invalid("PRICESYNC_UPDATE_STRATEGY", message))?;
        }
        if let Some(raw) = get("PRICESYNC_RESEND_OPTIONS") {
            self.resend_options = parse_flag("PRICESYNC_RESEND_OPTIONS", &raw)?;
        }
        set(&mut self.gid_namespace, get("PRICESYNC_GID_NAMESPACE"));
        if let Some(raw) = get("PRICESYNC_CONCURRENCY") {
            self.concurrency = parse_number("PRICESYNC_CONCURRENCY", &raw)?;
        }
        set(&mut self.user_agent, get("PRICESYNC_USER_AGENT"));
        if let Some(raw) = get("PRICESYNC_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("PRICESYNC_HTTP_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("PRICESYNC_REQUESTS_PER_SECOND") {
            self.requests_per_second = Some(parse_number("PRICESYNC_REQUESTS_PER_SECOND", &raw)?);
        }
        if let Some(raw) = get("PRICESYNC_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(raw);
        }
        if let Some(raw) = get("PRICESYNC_EXPORT_FAILURES") {
            self.export_failures = parse_flag("PRICESYNC_EXPORT_FAILURES", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let shop = self.shop.trim();
        if shop.is_empty() {
            return Err(ConfigError::Missing("shop"));
        }
        let lowered = shop.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return Err(invalid("shop", "expected a bare hostname without http(s)://"));
        }
        if shop.contains('/') || shop.chars().any(char::is_whitespace) {
            return Err(invalid("shop", "expected a bare hostname"));
        }
        if self.access_token.trim().is_empty() {
            return Err(ConfigError::Missing("access_token"));
        }
        if self.access_token_header.trim().is_empty() {
            return Err(ConfigError::Missing("access_token_header"));
        }
        if !is_http_url(&self.feed_url) {
            return Err(invalid("feed_url", "expected an http(s) URL"));
        }
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::Missing("api_version"));
        }
        if let Some(base) = &self.api_base_url {
            if !is_http_url(base) {
                return Err(invalid("api_base_url", "expected an http(s) URL"));
            }
        }
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("http_timeout_secs", "must be at least 1"));
        }
        if self.requests_per_second == Some(0) {
            return Err(invalid("requests_per_second", "must be at least 1 when set"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> ShopEndpoint {
        match &self.api_base_url {
            Some(base) => ShopEndpoint::from_base_url(base.clone()),
            None => ShopEndpoint::new(&self.shop, &self.api_version),
        }
    }

    pub fn credentials(&self) -> ShopCredentials {
        ShopCredentials::with_header(self.access_token_header.clone(), self.access_token.clone())
    }

    pub fn updater_options(&self) -> UpdaterOptions {
        UpdaterOptions {
            resend_options: self.resend_options,
            gid_namespace: self.gid_namespace.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency.max(1) + 1,
            token_bucket: self.requests_per_second.map(|rps| TokenBucketConfig {
                capacity: rps,
                refill_every: Duration::from_millis((1000 / u64::from(rps.max(1))).max(1)),
            }),
        }
    }
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "no" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got `{other}`"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("expected a number, got `{}`", raw.trim())))
}

fn is_http_url(raw: &str) -> bool {
    let lowered = raw.trim().to_ascii_lowercase();
    (lowered.starts_with("http://") || lowered.starts_with("https://"))
        && lowered.split("://").nth(1).is_some_and(|rest| !rest.is_empty())
}
