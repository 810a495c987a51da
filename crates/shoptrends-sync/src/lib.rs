//! Catalog sync orchestration: one pass over the configured categories per run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shoptrends_adapters::{
    probe_type_fields, response_error, SearchShape, ShopeeAffiliateAdapter, SourceAdapter,
};
use shoptrends_core::{CanonicalItem, Catalog, Category, UpsertCounts};
use shoptrends_storage::{
    BackoffPolicy, CatalogStore, ConfigError, Credentials, DiagnosticSink, GraphqlTransport,
    JsonFileSink, ShopeeAffiliateClient, ShopeeClientConfig, StoreError, TransportError,
    DEFAULT_SHOPEE_ENDPOINT,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shoptrends-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    pub categories: Vec<Category>,
}

impl CategoryRegistry {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let registry: CategoryRegistry =
            serde_yaml::from_str(text).map_err(|e| ConfigError::InvalidCategories(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidCategories(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.slug.trim().is_empty() {
                return Err(ConfigError::InvalidCategories("empty slug".into()));
            }
            if category.search_keyword.trim().is_empty() {
                return Err(ConfigError::InvalidCategories(format!(
                    "category {} has no search keyword",
                    category.slug
                )));
            }
            if !seen.insert(category.slug.as_str()) {
                return Err(ConfigError::InvalidCategories(format!(
                    "duplicate slug {}",
                    category.slug
                )));
            }
        }
        Ok(())
    }
}

/// Run configuration, built once and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub catalog_path: PathBuf,
    pub corrupt_path: PathBuf,
    pub debug_path: PathBuf,
    pub categories_path: PathBuf,
    pub endpoint: String,
    pub page_size: u32,
    pub pages_per_category: u32,
    pub schema_probe: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub search_shape: SearchShape,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("data/products.json"),
            corrupt_path: PathBuf::from("data/products.json.corrupt"),
            debug_path: PathBuf::from("data/debug_last_response.json"),
            categories_path: PathBuf::from("categories.yaml"),
            endpoint: DEFAULT_SHOPEE_ENDPOINT.to_string(),
            page_size: 20,
            pages_per_category: 1,
            schema_probe: true,
            http_timeout_secs: 60,
            user_agent: "shoptrends-sync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            search_shape: SearchShape::default(),
        }
    }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

pub fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => parse_value(name, &value),
        Err(_) => Ok(default),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let catalog_path = std::env::var("SHOPTRENDS_CATALOG_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.catalog_path);
        let corrupt_path = std::env::var("SHOPTRENDS_CORRUPT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut name = catalog_path.as_os_str().to_owned();
                name.push(".corrupt");
                PathBuf::from(name)
            });

        Ok(Self {
            corrupt_path,
            debug_path: std::env::var("SHOPTRENDS_DEBUG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.debug_path),
            categories_path: std::env::var("SHOPTRENDS_CATEGORIES")
                .map(PathBuf::from)
                .unwrap_or(defaults.categories_path),
            endpoint: std::env::var("SHOPEE_ENDPOINT").unwrap_or(defaults.endpoint),
            page_size: env_parsed("SHOPTRENDS_PAGE_SIZE", defaults.page_size)?,
            pages_per_category: env_parsed(
                "SHOPTRENDS_PAGES_PER_CATEGORY",
                defaults.pages_per_category,
            )?,
            schema_probe: std::env::var("SHOPTRENDS_SCHEMA_PROBE")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.schema_probe),
            http_timeout_secs: env_parsed(
                "SHOPTRENDS_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            )?,
            user_agent: std::env::var("SHOPTRENDS_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: std::env::var("SHOPTRENDS_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            search_shape: defaults.search_shape,
            catalog_path,
        })
    }

    /// Store over the configured catalog path, reporting to the debug dump.
    pub fn catalog_store(&self) -> CatalogStore {
        CatalogStore::new(
            self.catalog_path.clone(),
            self.corrupt_path.clone(),
            Arc::new(JsonFileSink::new(self.debug_path.clone())),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CategoryOutcome {
    pub slug: String,
    pub pages: u32,
    pub records: usize,
    pub rejected: usize,
    pub skipped: bool,
    pub counts: UpsertCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub schema_probed: bool,
    pub categories: usize,
    pub skipped_categories: usize,
    pub fetched_records: usize,
    pub rejected_records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub total_items: usize,
    pub outcomes: Vec<CategoryOutcome>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    categories: Vec<Category>,
    adapter: Box<dyn SourceAdapter>,
    transport: Arc<dyn GraphqlTransport>,
    diagnostics: Arc<dyn DiagnosticSink>,
    store: CatalogStore,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        categories: Vec<Category>,
        transport: Arc<dyn GraphqlTransport>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let store = CatalogStore::new(
            config.catalog_path.clone(),
            config.corrupt_path.clone(),
            diagnostics.clone(),
        );
        let adapter = Box::new(ShopeeAffiliateAdapter::new(config.search_shape.clone()));
        Self {
            config,
            categories,
            adapter,
            transport,
            diagnostics,
            store,
        }
    }

    pub fn with_adapter(mut self, adapter: Box<dyn SourceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Probe once, build the query once, then sync every category in order and save.
    ///
    /// A transport failure aborts the run before anything is saved; a category whose
    /// response carries an application error is skipped.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.diagnostics
            .record(json!({ "status": "starting", "runId": run_id, "ts": started_at.to_rfc3339() }))
            .await;

        let mut catalog = self.store.load().await?;

        let known_fields = if self.config.schema_probe {
            probe_type_fields(self.transport.as_ref(), self.adapter.item_type_name()).await
        } else {
            None
        };
        self.diagnostics
            .record(json!({
                "status": "schema_probe",
                "itemType": self.adapter.item_type_name(),
                "fields": known_fields,
            }))
            .await;
        let query = self.adapter.build_query(known_fields.as_deref());

        let mut outcomes = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            let span = info_span!("category", %run_id, category = %category.slug);
            let outcome = self
                .sync_category(&query, category, &mut catalog)
                .instrument(span)
                .await?;
            outcomes.push(outcome);
        }

        self.store.save(&mut catalog).await?;

        let mut totals = UpsertCounts::default();
        for outcome in &outcomes {
            totals += outcome.counts;
        }
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            schema_probed: known_fields.is_some(),
            categories: outcomes.len(),
            skipped_categories: outcomes.iter().filter(|o| o.skipped).count(),
            fetched_records: outcomes.iter().map(|o| o.records).sum(),
            rejected_records: outcomes.iter().map(|o| o.rejected).sum(),
            inserted: totals.inserted,
            updated: totals.updated,
            total_items: catalog.len(),
            outcomes,
        };
        info!(
            %run_id,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped_categories,
            total = summary.total_items,
            "sync complete"
        );
        Ok(summary)
    }

    async fn sync_category(
        &self,
        query: &str,
        category: &Category,
        catalog: &mut Catalog,
    ) -> Result<CategoryOutcome, SyncError> {
        let mut outcome = CategoryOutcome {
            slug: category.slug.clone(),
            ..Default::default()
        };
        let mut pending: Vec<CanonicalItem> = Vec::new();

        for page in 1..=self.config.pages_per_category.max(1) {
            let variables = json!({
                "keyword": category.search_keyword,
                "page": page,
                "limit": self.config.page_size,
            });
            let response = match self.transport.execute(query, &variables).await {
                Ok(response) => response,
                Err(err) => {
                    self.diagnostics
                        .record(json!({
                            "status": "transport_error",
                            "category": category.slug,
                            "page": page,
                            "error": err.to_string(),
                        }))
                        .await;
                    return Err(err.into());
                }
            };
            outcome.pages = page;
            self.diagnostics
                .record(json!({
                    "status": "response",
                    "category": category.slug,
                    "page": page,
                    "response": response,
                }))
                .await;

            if let Some(message) = response_error(&response) {
                warn!(
                    page,
                    error = %message,
                    "affiliate API rejected the search; skipping category"
                );
                outcome.skipped = true;
                return Ok(outcome);
            }

            let records = self.adapter.extract_records(&response);
            let batch = self.adapter.normalize_all(&records, category);
            outcome.records += records.len();
            outcome.rejected += batch.rejected;
            pending.extend(batch.items);
            if records.is_empty() {
                break;
            }
        }

        outcome.counts = self.store.upsert(catalog, pending);
        info!(
            records = outcome.records,
            inserted = outcome.counts.inserted,
            updated = outcome.counts.updated,
            "category merged"
        );
        Ok(outcome)
    }
}

/// Assemble the production pipeline from the environment. Missing credentials fail
/// here, before any request is made.
pub fn pipeline_from_env() -> Result<SyncPipeline, SyncError> {
    let credentials = Credentials::from_env()?;
    let config = SyncConfig::from_env()?;
    let registry = CategoryRegistry::load(&config.categories_path)?;

    let client = ShopeeAffiliateClient::new(
        credentials,
        ShopeeClientConfig {
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        },
    )?;
    let diagnostics = Arc::new(JsonFileSink::new(config.debug_path.clone()));
    Ok(SyncPipeline::new(
        config,
        registry.categories,
        Arc::new(client),
        diagnostics,
    ))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary, SyncError> {
    pipeline_from_env()?.run_once().await
}

/// Cron scheduler for the pipeline, only when enabled in the config.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline).await.map(Some)
}

/// Scheduler running one sync per `sync_cron` tick. A failed run is logged and
/// the next tick starts from whatever was last saved.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_categories_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../categories.yaml");
        let registry = CategoryRegistry::load(&path).expect("categories.yaml");
        assert_eq!(registry.categories.len(), 10);
        assert_eq!(registry.categories[0].slug, "miniaturas");
        assert_eq!(registry.categories[5].display_name, "Eletrônicos & Acessórios");
    }

    #[test]
    fn duplicate_slugs_are_rejected() {
        let yaml = r#"
categories:
  - { slug: pet, display_name: Pet, search_keyword: ração }
  - { slug: pet, display_name: Pet 2, search_keyword: coleira }
"#;
        assert!(matches!(
            CategoryRegistry::from_yaml(yaml),
            Err(ConfigError::InvalidCategories(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn blank_keyword_is_rejected() {
        let yaml = "categories:\n  - { slug: casa, display_name: Casa, search_keyword: '  ' }\n";
        assert!(CategoryRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        assert!(matches!(
            CategoryRegistry::from_yaml("categories: [ {slug: "),
            Err(ConfigError::InvalidCategories(_))
        ));
    }

    #[test]
    fn env_value_parsing() {
        assert_eq!(parse_value::<u32>("SHOPTRENDS_PAGE_SIZE", " 50 ").unwrap(), 50);
        assert!(matches!(
            parse_value::<u32>("SHOPTRENDS_PAGE_SIZE", "lots"),
            Err(ConfigError::InvalidValue { name, .. }) if name == "SHOPTRENDS_PAGE_SIZE"
        ));
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("no"));
    }

    #[test]
    fn default_config_matches_shipped_layout() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.pages_per_category, 1);
        assert_eq!(config.catalog_path, PathBuf::from("data/products.json"));
        assert_eq!(config.corrupt_path, PathBuf::from("data/products.json.corrupt"));
    }
}
