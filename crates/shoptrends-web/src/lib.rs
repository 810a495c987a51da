//! Read-only axum + askama view of the persisted catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shoptrends_core::{CanonicalItem, Catalog};
use shoptrends_storage::CatalogStore;
use shoptrends_sync::{parse_value, SyncConfig};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "shoptrends-web";

#[derive(Clone)]
pub struct AppState {
    pub store: CatalogStore,
}

impl AppState {
    pub fn new(store: CatalogStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CatalogQuery {
    category: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryFacet {
    pub slug: String,
    pub name: String,
    pub count: usize,
    #[serde(skip)]
    selected: bool,
}

#[derive(Debug, Clone)]
struct ItemRow {
    title: String,
    image_url: String,
    price_text: String,
    promo_text: String,
    product_url: String,
    curated_url: String,
    category_name: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    updated_at: String,
    total_items: usize,
    facets: Vec<CategoryFacet>,
    all_selected: bool,
    selected_category: String,
    rows: Vec<ItemRow>,
    page: usize,
    total_pages: usize,
    prev_page: usize,
    next_page: usize,
    per_page: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/catalog", get(api_catalog_handler))
        .route("/api/categories", get(api_categories_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = match std::env::var("SHOPTRENDS_WEB_PORT") {
        Ok(value) => parse_value("SHOPTRENDS_WEB_PORT", &value)?,
        Err(_) => 8000,
    };
    let config = SyncConfig::from_env()?;
    let state = AppState::new(config.catalog_store());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, catalog = %config.catalog_path.display(), "serving catalog");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Response {
    let catalog = match state.store.peek().await {
        Ok(catalog) => catalog,
        Err(err) => return server_error(err.into()),
    };

    let selected_category = query.category.clone().unwrap_or_default();
    let facets = category_facets(&catalog, &selected_category);
    let filtered = filter_items(&catalog, &selected_category);

    let per_page = query.per_page.unwrap_or(24).clamp(1, 200);
    let total_pages = filtered.len().max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let rows = filtered
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(item_row)
        .collect::<Vec<_>>();

    render_html(IndexTemplate {
        updated_at: if catalog.updated_at().is_empty() {
            "never".to_string()
        } else {
            catalog.updated_at().to_string()
        },
        total_items: catalog.len(),
        all_selected: selected_category.is_empty(),
        facets,
        selected_category,
        rows,
        page,
        total_pages,
        prev_page: page.saturating_sub(1),
        next_page: if page < total_pages { page + 1 } else { 0 },
        per_page,
    })
}

async fn api_catalog_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Response {
    match state.store.peek().await {
        Ok(catalog) => {
            let selected = query.category.unwrap_or_default();
            let items = filter_items(&catalog, &selected);
            Json(json!({
                "updatedAt": catalog.updated_at(),
                "items": items,
            }))
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn api_categories_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.peek().await {
        Ok(catalog) => Json(category_facets(&catalog, "")).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn filter_items<'a>(catalog: &'a Catalog, category: &str) -> Vec<&'a CanonicalItem> {
    catalog
        .items()
        .iter()
        .filter(|item| category.is_empty() || item.category_slug == category)
        .collect()
}

fn category_facets(catalog: &Catalog, selected: &str) -> Vec<CategoryFacet> {
    let mut names = BTreeMap::<&str, &str>::new();
    for item in catalog.items() {
        names.entry(item.category_slug.as_str()).or_insert(item.category_name.as_str());
    }
    catalog
        .category_counts()
        .into_iter()
        .map(|(slug, count)| {
            let name = names
                .get(slug.as_str())
                .filter(|name| !name.is_empty())
                .map(|name| name.to_string())
                .unwrap_or_else(|| slug.clone());
            CategoryFacet {
                selected: !selected.is_empty() && selected == slug,
                slug,
                name,
                count,
            }
        })
        .collect()
}

/// `R$ 1.234,50` style price.
fn format_brl(value: f64) -> String {
    let cents = (value * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("R$ {grouped},{:02}", cents % 100)
}

fn item_row(item: &CanonicalItem) -> ItemRow {
    ItemRow {
        title: item.title.clone(),
        image_url: item.image_url.clone(),
        price_text: format_brl(item.price),
        promo_text: item.promo_price.map(format_brl).unwrap_or_default(),
        product_url: item.product_url.clone(),
        curated_url: if item.has_curated_url() {
            item.curated_url.clone().unwrap_or_default()
        } else {
            String::new()
        },
        category_name: item.category_name.clone(),
    }
}
