//! Catalog persistence, diagnostic dumps and the signed GraphQL transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use shoptrends_core::{CanonicalItem, Catalog, IdentityKey, UpsertCounts};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shoptrends-storage";

pub const DEFAULT_SHOPEE_ENDPOINT: &str = "https://open-api.affiliate.shopee.com.br/graphql";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing credentials: SHOPEE_APP_ID / SHOPEE_SECRET must be set")]
    MissingCredentials,
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
    #[error("invalid category configuration: {0}")]
    InvalidCategories(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("response body is not JSON: {0}")]
    InvalidBody(String),
    #[error("encoding request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("moving unreadable catalog {from} -> {to}: {source}")]
    Quarantine {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing catalog: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("curated url must not be empty")]
    EmptyCuratedUrl,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to a sibling temp file, then rename it over `path`, so readers never
/// observe a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

/// Write-only, best-effort side channel holding the most recent interesting payload.
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn record(&self, payload: JsonValue);
}

#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl DiagnosticSink for NoopSink {
    async fn record(&self, _payload: JsonValue) {}
}

/// Overwrites a single JSON file on every record.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DiagnosticSink for JsonFileSink {
    async fn record(&self, payload: JsonValue) {
        let bytes = match serde_json::to_vec_pretty(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "could not serialize diagnostic payload");
                return;
            }
        };
        if let Err(err) = write_atomic(&self.path, &bytes).await {
            warn!(path = %self.path.display(), error = %err, "could not write diagnostic dump");
        }
    }
}

/// Owns the persisted catalog file and its corrupt-file sidecar.
#[derive(Clone)]
pub struct CatalogStore {
    path: PathBuf,
    corrupt_path: PathBuf,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl CatalogStore {
    pub fn new(
        path: impl Into<PathBuf>,
        corrupt_path: impl Into<PathBuf>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            path: path.into(),
            corrupt_path: corrupt_path.into(),
            diagnostics,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn corrupt_path(&self) -> &Path {
        &self.corrupt_path
    }

    /// Read the catalog. A missing file is an empty catalog; an unparseable one is
    /// moved to the corrupt path and replaced by an empty catalog. Only IO failures
    /// other than "not found" are returned as errors.
    pub async fn load(&self) -> Result<Catalog, StoreError> {
        let Some(bytes) = self.read_bytes().await? else {
            debug!(path = %self.path.display(), "no catalog yet; starting empty");
            return Ok(Catalog::new());
        };

        match parse_catalog(&bytes) {
            Ok((catalog, folded)) => {
                if folded > 0 {
                    warn!(folded, "catalog held duplicate items; folded on load");
                }
                Ok(catalog)
            }
            Err(reason) => self.quarantine(reason).await,
        }
    }

    /// Read the catalog without touching the filesystem. An unparseable file is
    /// served as an empty catalog and left in place for the next [`load`](Self::load).
    pub async fn peek(&self) -> Result<Catalog, StoreError> {
        let Some(bytes) = self.read_bytes().await? else {
            return Ok(Catalog::new());
        };
        match parse_catalog(&bytes) {
            Ok((catalog, _)) => Ok(catalog),
            Err(reason) => {
                debug!(
                    path = %self.path.display(),
                    error = %reason,
                    "catalog unreadable; serving empty"
                );
                Ok(Catalog::new())
            }
        }
    }

    async fn read_bytes(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn quarantine(&self, reason: String) -> Result<Catalog, StoreError> {
        fs::rename(&self.path, &self.corrupt_path)
            .await
            .map_err(|source| StoreError::Quarantine {
                from: self.path.clone(),
                to: self.corrupt_path.clone(),
                source,
            })?;
        warn!(
            path = %self.path.display(),
            moved_to = %self.corrupt_path.display(),
            error = %reason,
            "catalog unreadable; moved aside and starting empty"
        );
        self.diagnostics
            .record(json!({
                "status": "catalog_corrupt",
                "error": reason,
                "path": self.path.display().to_string(),
                "movedTo": self.corrupt_path.display().to_string(),
                "ts": Utc::now().to_rfc3339(),
            }))
            .await;
        Ok(Catalog::new())
    }

    pub fn upsert<I>(&self, catalog: &mut Catalog, items: I) -> UpsertCounts
    where
        I: IntoIterator<Item = CanonicalItem>,
    {
        catalog.upsert(items)
    }

    /// Stamp `updatedAt` and replace the catalog file atomically.
    pub async fn save(&self, catalog: &mut Catalog) -> Result<(), StoreError> {
        catalog.stamp(Utc::now());
        let bytes = serde_json::to_vec_pretty(catalog)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: self.path.clone(),
                source,
            })
    }

    /// Out-of-band curation. Returns whether the key exists in the catalog.
    pub fn curate(
        &self,
        catalog: &mut Catalog,
        key: &IdentityKey,
        url: &str,
    ) -> Result<bool, StoreError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(StoreError::EmptyCuratedUrl);
        }
        Ok(catalog.set_curated_url(key, url))
    }
}

fn parse_catalog(bytes: &[u8]) -> Result<(Catalog, usize), String> {
    let root: JsonValue = serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {e}"))?;
    let JsonValue::Object(mut root) = root else {
        return Err("catalog root is not an object".to_string());
    };

    let updated_at = match root.remove("updatedAt") {
        Some(JsonValue::String(s)) => s,
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => {
            warn!(value = %other, "catalog updatedAt is not a string; resetting");
            String::new()
        }
    };

    let raw_items = match root.remove("items") {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) | None => Vec::new(),
        Some(_) => {
            warn!("catalog items is not a list; resetting to empty");
            Vec::new()
        }
    };

    let total = raw_items.len();
    let items = raw_items
        .into_iter()
        .filter_map(CanonicalItem::from_persisted)
        .collect::<Vec<_>>();
    let dropped = total - items.len();
    if dropped > 0 {
        warn!(dropped, "catalog items without a usable key were dropped on load");
    }

    Ok(Catalog::from_parts(updated_at, items))
}

/// Anything able to run a GraphQL query against the affiliate API.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn execute(
        &self,
        query: &str,
        variables: &JsonValue,
    ) -> Result<JsonValue, TransportError>;
}

#[derive(Clone)]
pub struct Credentials {
    app_id: String,
    secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(app_id: &str, secret: &str) -> Result<Self, ConfigError> {
        let app_id = app_id.trim();
        let secret = secret.trim();
        if app_id.is_empty() || secret.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(Self {
            app_id: app_id.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(
            &std::env::var("SHOPEE_APP_ID").unwrap_or_default(),
            &std::env::var("SHOPEE_SECRET").unwrap_or_default(),
        )
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// `Authorization` header value for `payload` sent at `timestamp` (unix seconds).
    pub fn authorization(&self, timestamp: i64, payload: &str) -> String {
        let base = format!("{}{}{}{}", self.app_id, timestamp, payload, self.secret);
        let signature = sha256_hex(base.as_bytes());
        format!(
            "SHA256 Credential={}, Timestamp={}, Signature={}",
            self.app_id, timestamp, signature
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ShopeeClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for ShopeeClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SHOPEE_ENDPOINT.to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Signed HTTPS client for the Shopee affiliate GraphQL endpoint.
#[derive(Debug)]
pub struct ShopeeAffiliateClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
    backoff: BackoffPolicy,
}

impl ShopeeAffiliateClient {
    pub fn new(
        credentials: Credentials,
        config: ShopeeClientConfig,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            credentials,
            backoff: config.backoff,
        })
    }

    async fn post_signed(&self, payload: String) -> Result<JsonValue, TransportError> {
        let mut attempt = 0usize;
        loop {
            // Re-signed on every attempt; the timestamp is part of the signature.
            let authorization = self
                .credentials
                .authorization(Utc::now().timestamp(), &payload);
            let sent = self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, authorization)
                .body(payload.clone())
                .send()
                .await;

            let retryable = match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body)
                            .map_err(|e| TransportError::InvalidBody(e.to_string()));
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(TransportError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    format!("http status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(TransportError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, reason = %retryable, "retrying affiliate request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl GraphqlTransport for ShopeeAffiliateClient {
    async fn execute(
        &self,
        query: &str,
        variables: &JsonValue,
    ) -> Result<JsonValue, TransportError> {
        let payload = serde_json::to_string(&json!({ "query": query, "variables": variables }))?;
        let span = info_span!("graphql_request", endpoint = %self.endpoint, bytes = payload.len());
        self.post_signed(payload).instrument(span).await
    }
}
