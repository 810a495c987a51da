use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use shoptrends_core::{Category, IdentityKey, SOURCE_SHOPEE_AFFILIATE};
use shoptrends_storage::{CatalogStore, GraphqlTransport, JsonFileSink, NoopSink, TransportError};
use shoptrends_sync::{build_scheduler, maybe_build_scheduler, SyncConfig, SyncError, SyncPipeline};

/// Answers `__type` probes with a fixed payload and search requests from a queue.
struct ScriptedTransport {
    introspection: Option<JsonValue>,
    searches: Mutex<VecDeque<Result<JsonValue, TransportError>>>,
    queries: Mutex<Vec<(String, JsonValue)>>,
}

impl ScriptedTransport {
    fn new(
        introspection: Option<JsonValue>,
        searches: Vec<Result<JsonValue, TransportError>>,
    ) -> Self {
        Self {
            introspection,
            searches: Mutex::new(searches.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    fn search_queries(&self) -> Vec<(String, JsonValue)> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(query, _)| !query.contains("__type"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GraphqlTransport for ScriptedTransport {
    async fn execute(
        &self,
        query: &str,
        variables: &JsonValue,
    ) -> Result<JsonValue, TransportError> {
        self.queries
            .lock()
            .unwrap()
            .push((query.to_string(), variables.clone()));
        if query.contains("__type") {
            return match &self.introspection {
                Some(payload) => Ok(payload.clone()),
                None => Err(TransportError::HttpStatus {
                    status: 400,
                    body: "introspection disabled".into(),
                }),
            };
        }
        self.searches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected search request: {variables}"))
    }
}

fn offer_fields() -> JsonValue {
    json!({
        "data": { "__type": { "fields": [
            { "name": "itemId" }, { "name": "productName" }, { "name": "imageUrl" },
            { "name": "priceMin" }, { "name": "priceDiscountRate" }, { "name": "offerLink" }
        ]}}
    })
}

fn page(nodes: JsonValue) -> Result<JsonValue, TransportError> {
    Ok(json!({ "data": { "productOfferV2": { "nodes": nodes } } }))
}

fn node(id: u64, name: &str, price: &str) -> JsonValue {
    json!({
        "itemId": id,
        "productName": name,
        "imageUrl": format!("https://cf.shopee.com.br/file/{id}"),
        "priceMin": price,
        "offerLink": format!("https://s.shopee.com.br/{id}"),
    })
}

fn categories() -> Vec<Category> {
    vec![
        Category::new("miniaturas", "Miniaturas de carrinhos", "miniatura carrinho"),
        Category::new("brinquedos", "Brinquedos", "brinquedo educativo"),
    ]
}

fn config_in(dir: &Path) -> SyncConfig {
    SyncConfig {
        catalog_path: dir.join("products.json"),
        corrupt_path: dir.join("products.json.corrupt"),
        debug_path: dir.join("debug_last_response.json"),
        ..SyncConfig::default()
    }
}

fn pipeline(config: SyncConfig, transport: Arc<ScriptedTransport>) -> SyncPipeline {
    let diagnostics = Arc::new(JsonFileSink::new(config.debug_path.clone()));
    SyncPipeline::new(config, categories(), transport, diagnostics)
}

fn key(id: &str) -> IdentityKey {
    IdentityKey::new(SOURCE_SHOPEE_AFFILIATE, id)
}

#[tokio::test]
async fn later_category_wins_for_shared_item() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![
            page(json!([
                node(1001, "Hot Wheels Mustang", "19.90"),
                node(1002, "Matchbox Van", "14.00")
            ])),
            page(json!([node(1001, "Hot Wheels Mustang", "17.50")])),
        ],
    ));

    let summary = pipeline(config.clone(), transport.clone()).run_once().await.unwrap();
    assert!(summary.schema_probed);
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.total_items, 2);

    let catalog = CatalogStore::new(&config.catalog_path, &config.corrupt_path, Arc::new(NoopSink))
        .load()
        .await
        .unwrap();
    assert_eq!(catalog.len(), 2);
    let shared = catalog.get(&key("1001")).unwrap();
    assert_eq!(shared.price, 17.5);
    assert_eq!(shared.category_slug, "brinquedos");
    assert_eq!(shared.category_name, "Brinquedos");
    assert!(!catalog.updated_at().is_empty());

    let searches = transport.search_queries();
    assert_eq!(searches.len(), 2);
    assert_eq!(searches[0].1["keyword"], "miniatura carrinho");
    assert_eq!(searches[0].1["limit"], 20);
    assert_eq!(searches[1].1["page"], 1);
    assert!(searches[0].0.contains("priceMin"));
    assert!(!searches[0].0.contains("priceDiscountRate"));
}

#[tokio::test]
async fn application_error_skips_only_that_category() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![
            Ok(json!({ "errors": [{ "message": "Invalid Signature" }] })),
            page(json!([node(2001, "Lego Classic", "149.90")])),
        ],
    ));

    let summary = pipeline(config.clone(), transport).run_once().await.unwrap();
    assert_eq!(summary.skipped_categories, 1);
    assert!(summary.outcomes[0].skipped);
    assert_eq!(summary.inserted, 1);

    let catalog = CatalogStore::new(&config.catalog_path, &config.corrupt_path, Arc::new(NoopSink))
        .load()
        .await
        .unwrap();
    assert_eq!(catalog.category_counts().get("brinquedos"), Some(&1));
    assert_eq!(catalog.category_counts().get("miniaturas"), None);
}

#[tokio::test]
async fn transport_failure_aborts_without_saving() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![
            page(json!([node(3001, "Carrinho Fusca", "25.00")])),
            Err(TransportError::HttpStatus {
                status: 502,
                body: "bad gateway".into(),
            }),
        ],
    ));

    let err = pipeline(config.clone(), transport).run_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(TransportError::HttpStatus { status: 502, .. })));
    assert!(!config.catalog_path.exists());

    let debug: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(&config.debug_path).unwrap()).unwrap();
    assert_eq!(debug["status"], "transport_error");
    assert_eq!(debug["category"], "brinquedos");
}

#[tokio::test]
async fn conservative_query_when_probe_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let transport = Arc::new(ScriptedTransport::new(
        None,
        vec![page(json!([])), page(json!([]))],
    ));

    let summary = pipeline(config, transport.clone()).run_once().await.unwrap();
    assert!(!summary.schema_probed);
    assert_eq!(summary.total_items, 0);

    let searches = transport.search_queries();
    for field in ["itemId", "productName", "imageUrl", "priceMin", "offerLink"] {
        assert!(searches[0].0.contains(field), "missing {field}");
    }
}

#[tokio::test]
async fn probe_can_be_switched_off() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        schema_probe: false,
        ..config_in(dir.path())
    };
    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![page(json!([])), page(json!([]))],
    ));

    pipeline(config, transport.clone()).run_once().await.unwrap();
    let all = transport.queries.lock().unwrap().len();
    assert_eq!(all, transport.search_queries().len());
}

#[tokio::test]
async fn curated_url_survives_resync() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(
        &config.catalog_path,
        serde_json::to_vec(&json!({
            "updatedAt": "2024-01-01 00:00 UTC",
            "items": [{
                "source": "shopee_affiliate",
                "sourceId": "1001",
                "title": "Hot Wheels Mustang",
                "price": 21.0,
                "categorySlug": "miniaturas",
                "tiktokUrl": "https://www.tiktok.com/@loja/video/1",
                "addedAt": "2023-12-24"
            }]
        }))
        .unwrap(),
    )
    .unwrap();

    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![page(json!([node(1001, "Hot Wheels Mustang", "18.00")])), page(json!([]))],
    ));
    let summary = pipeline(config.clone(), transport).run_once().await.unwrap();
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.updated, 1);

    let saved: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(&config.catalog_path).unwrap()).unwrap();
    let item = &saved["items"][0];
    assert_eq!(item["curatedUrl"], "https://www.tiktok.com/@loja/video/1");
    assert_eq!(item["price"], 18.0);
    assert_eq!(item["addedAt"], "2023-12-24");
    assert_ne!(saved["updatedAt"], "2024-01-01 00:00 UTC");
}

#[tokio::test]
async fn legacy_catalog_with_string_prices_keeps_every_item() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let legacy = json!({
        "updatedAt": "2024-01-01 00:00 UTC",
        "items": [
            {
                "source": "shopee_affiliate", "sourceId": "1001", "title": "Hot Wheels Mustang",
                "price": "21.00", "categorySlug": "miniaturas", "tiktokUrl": null,
                "curatedUrl": "https://www.tiktok.com/@loja/video/1"
            },
            {
                "source": "shopee_affiliate", "sourceId": "7001", "title": "Kit Pincéis",
                "price": "35.50", "promoPrice": null, "categorySlug": "beleza", "tiktokUrl": null
            },
            {
                "source": "shopee_affiliate", "sourceId": "7002", "title": "Escova",
                "price": null, "categorySlug": "beleza",
                "tiktokUrl": "https://www.tiktok.com/@loja/video/2"
            }
        ]
    });
    std::fs::write(&config.catalog_path, serde_json::to_vec(&legacy).unwrap()).unwrap();

    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![page(json!([node(1001, "Hot Wheels Mustang", "18.00")])), page(json!([]))],
    ));
    let summary = pipeline(config.clone(), transport).run_once().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.total_items, 3);
    assert!(!config.corrupt_path.exists());

    let saved: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(&config.catalog_path).unwrap()).unwrap();
    let items = saved["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["curatedUrl"], "https://www.tiktok.com/@loja/video/1");
    assert_eq!(items[0]["price"], 18.0);
    assert_eq!(items[1]["price"], 35.5);
    assert_eq!(items[2]["price"], 0.0);
    assert_eq!(items[2]["curatedUrl"], "https://www.tiktok.com/@loja/video/2");
}

#[tokio::test]
async fn corrupt_catalog_is_moved_aside_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.catalog_path, b"{\"items\": [ oops").unwrap();

    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![page(json!([node(4001, "Boneca", "59.90")])), page(json!([]))],
    ));
    let summary = pipeline(config.clone(), transport).run_once().await.unwrap();
    assert_eq!(summary.inserted, 1);

    assert_eq!(
        std::fs::read(&config.corrupt_path).unwrap(),
        b"{\"items\": [ oops".to_vec()
    );
    let catalog = CatalogStore::new(&config.catalog_path, &config.corrupt_path, Arc::new(NoopSink))
        .load()
        .await
        .unwrap();
    assert!(catalog.get(&key("4001")).is_some());
}

#[tokio::test]
async fn second_identical_run_inserts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let responses = || {
        vec![
            page(json!([node(5001, "Kombi", "30.00"), node(5002, "Opala", "32.00")])),
            page(json!([node(5003, "Pião", "5.00")])),
        ]
    };

    let scripted = || Arc::new(ScriptedTransport::new(Some(offer_fields()), responses()));
    let first = pipeline(config.clone(), scripted()).run_once().await.unwrap();
    let second = pipeline(config.clone(), scripted()).run_once().await.unwrap();

    assert_eq!(first.inserted, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 3);
    assert_eq!(second.total_items, 3);
}

#[tokio::test]
async fn paging_stops_at_first_empty_page() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        pages_per_category: 3,
        ..config_in(dir.path())
    };
    let transport = Arc::new(ScriptedTransport::new(
        Some(offer_fields()),
        vec![
            page(json!([node(6001, "Caminhão", "40.00")])),
            page(json!([])),
            page(json!([node(6002, "Trem", "80.00")])),
            page(json!([node(6003, "Avião", "60.00")])),
            page(json!([])),
        ],
    ));

    let summary = pipeline(config, transport.clone()).run_once().await.unwrap();
    assert_eq!(summary.outcomes[0].pages, 2);
    assert_eq!(summary.outcomes[1].pages, 3);
    assert_eq!(summary.total_items, 3);

    let pages: Vec<_> = transport
        .search_queries()
        .iter()
        .map(|(_, vars)| vars["page"].as_u64().unwrap())
        .collect();
    assert_eq!(pages, vec![1, 2, 1, 2, 3]);
}

#[tokio::test]
async fn scheduler_respects_enable_flag_and_cron() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(None, Vec::new()));

    let disabled = Arc::new(pipeline(config_in(dir.path()), transport.clone()));
    assert!(maybe_build_scheduler(disabled).await.unwrap().is_none());

    let enabled = Arc::new(pipeline(
        SyncConfig {
            scheduler_enabled: true,
            ..config_in(dir.path())
        },
        transport.clone(),
    ));
    assert!(maybe_build_scheduler(enabled).await.unwrap().is_some());

    let bad_cron = Arc::new(pipeline(
        SyncConfig {
            sync_cron: "every now and then".into(),
            ..config_in(dir.path())
        },
        transport,
    ));
    assert!(build_scheduler(bad_cron).await.is_err());
}
