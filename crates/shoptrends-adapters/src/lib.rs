//! Source adapter contract and the Shopee affiliate adapter.
//!
//! The upstream schema is not fixed: field names and list wrapping change between
//! releases. Every lookup here goes through an ordered candidate table instead of a
//! fixed path.

use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use shoptrends_core::{CanonicalItem, Category, SOURCE_SHOPEE_AFFILIATE};
pub use shoptrends_core::{json_price, json_text};
use shoptrends_storage::GraphqlTransport;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "shoptrends-adapters";

/// One item record as returned upstream, before normalization.
pub type RawRecord = Map<String, JsonValue>;

pub const IDENTITY_FIELDS: &[&str] = &["itemId", "itemid", "item_id", "id", "productId"];
pub const TITLE_FIELDS: &[&str] = &[
    "itemName",
    "name",
    "item_name",
    "title",
    "productName",
    "product_name",
];
pub const IMAGE_FIELDS: &[&str] = &["imageUrl", "image", "image_url", "imageURL", "thumbnail"];
pub const PRICE_FIELDS: &[&str] = &["price", "priceMin", "price_min", "minPrice"];
pub const PROMO_PRICE_FIELDS: &[&str] = &[
    "promoPrice",
    "promo_price",
    "salePrice",
    "sale_price",
    "discountPrice",
];
pub const LINK_FIELDS: &[&str] = &[
    "productUrl",
    "offerLink",
    "productLink",
    "link",
    "product_url",
    "offer_link",
];

/// Wrapper fields holding a direct list of records.
pub const DIRECT_LIST_FIELDS: &[&str] = &["nodes", "items", "list", "results"];
/// Wrapper fields holding a list of edges.
pub const EDGE_LIST_FIELDS: &[&str] = &["edges"];
/// Keys under which an edge carries its record.
pub const EDGE_NODE_FIELDS: &[&str] = &["node", "item"];

/// Always selectable on any GraphQL object type.
pub const META_FIELD: &str = "__typename";

/// What a requested field is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPurpose {
    Identity,
    Title,
    Image,
    Price,
    PromoPrice,
    Link,
}

impl FieldPurpose {
    pub const ALL: [FieldPurpose; 6] = [
        FieldPurpose::Identity,
        FieldPurpose::Title,
        FieldPurpose::Image,
        FieldPurpose::Price,
        FieldPurpose::PromoPrice,
        FieldPurpose::Link,
    ];

    /// Ranked source field names; shared by query building and normalization.
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            FieldPurpose::Identity => IDENTITY_FIELDS,
            FieldPurpose::Title => TITLE_FIELDS,
            FieldPurpose::Image => IMAGE_FIELDS,
            FieldPurpose::Price => PRICE_FIELDS,
            FieldPurpose::PromoPrice => PROMO_PRICE_FIELDS,
            FieldPurpose::Link => LINK_FIELDS,
        }
    }
}

/// Field chosen per purpose. Purposes without a match are left out of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryPlan {
    pub selections: BTreeMap<FieldPurpose, String>,
}

impl QueryPlan {
    pub fn from_known_fields(known: &[String]) -> Self {
        let selections = FieldPurpose::ALL
            .iter()
            .filter_map(|&purpose| {
                purpose
                    .candidates()
                    .iter()
                    .find(|candidate| known.iter().any(|k| k == *candidate))
                    .map(|name| (purpose, (*name).to_string()))
            })
            .collect();
        Self { selections }
    }

    /// Selected field names in purpose order, de-duplicated.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.selections.len());
        for name in self.selections.values() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }
}

/// Resolver and type names of the search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchShape {
    pub resolver: String,
    pub item_type: String,
    pub list_field: String,
}

impl Default for SearchShape {
    fn default() -> Self {
        Self {
            resolver: "productOfferV2".to_string(),
            item_type: "ProductOfferV2".to_string(),
            list_field: "nodes".to_string(),
        }
    }
}

/// Fields requested when the item type could not be introspected.
pub const CONSERVATIVE_FIELDS: &[&str] =
    &["itemId", "productName", "imageUrl", "priceMin", "offerLink"];

pub fn render_search_query(shape: &SearchShape, fields: &[&str]) -> String {
    let fields = if fields.is_empty() { &[META_FIELD][..] } else { fields };
    let selection = fields
        .iter()
        .map(|f| format!("      {f}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        concat!(
            "query ProductSearch($keyword: String!, $page: Int!, $limit: Int!) {{\n",
            "  {resolver}(keyword: $keyword, page: $page, limit: $limit) {{\n",
            "    {list} {{\n",
            "{selection}\n",
            "    }}\n",
            "  }}\n",
            "}}\n",
        ),
        resolver = shape.resolver,
        list = shape.list_field,
        selection = selection,
    )
}

/// Build the search query from introspected field names, or the conservative
/// built-in query when introspection was unavailable.
pub fn build_query(shape: &SearchShape, known_fields: Option<&[String]>) -> String {
    match known_fields {
        Some(known) => {
            let plan = QueryPlan::from_known_fields(known);
            if plan.selections.is_empty() {
                warn!(
                    item_type = %shape.item_type,
                    "no known field matched any purpose; requesting meta field only"
                );
            }
            render_search_query(shape, &plan.field_names())
        }
        None => render_search_query(shape, CONSERVATIVE_FIELDS),
    }
}

pub const TYPE_FIELDS_QUERY: &str = concat!(
    "query TypeFields($name: String!) {\n",
    "  __type(name: $name) {\n",
    "    fields {\n",
    "      name\n",
    "    }\n",
    "  }\n",
    "}\n",
);

/// Ask the remote type system which fields `type_name` declares. Disabled
/// introspection, transport failures and odd payloads all yield `None`.
pub async fn probe_type_fields(
    transport: &dyn GraphqlTransport,
    type_name: &str,
) -> Option<Vec<String>> {
    let response = match transport
        .execute(TYPE_FIELDS_QUERY, &json!({ "name": type_name }))
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(type_name, error = %err, "schema probe failed; using built-in query");
            return None;
        }
    };

    let fields = response
        .pointer("/data/__type/fields")
        .and_then(JsonValue::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(|f| f.get("name").and_then(JsonValue::as_str))
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if fields.is_empty() {
        debug!(type_name, error = ?response_error(&response), "schema probe returned no fields");
        return None;
    }
    Some(fields)
}

/// Top-level application error carried by a response, if any.
pub fn response_error(response: &JsonValue) -> Option<String> {
    if let Some(errors) = response.get("errors").and_then(JsonValue::as_array) {
        if errors.is_empty() {
            return None;
        }
        let messages = errors
            .iter()
            .map(|e| {
                e.get("message")
                    .and_then(JsonValue::as_str)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| e.to_string())
            })
            .collect::<Vec<_>>();
        return Some(messages.join("; "));
    }
    match response.get("error") {
        None | Some(JsonValue::Null) | Some(JsonValue::Bool(false)) => None,
        Some(JsonValue::String(s)) if s.trim().is_empty() => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn object_records(list: &[JsonValue]) -> Vec<RawRecord> {
    list.iter()
        .filter_map(JsonValue::as_object)
        .cloned()
        .collect()
}

/// Locate the item records of a search response.
///
/// Wrappers under `data` are visited with `preferred_resolver` first. A direct list
/// field wins over an edge list; a bare list directly under `data` is the last
/// resort. Anything else yields no records.
pub fn extract_records(response: &JsonValue, preferred_resolver: Option<&str>) -> Vec<RawRecord> {
    let Some(data) = response.get("data").and_then(JsonValue::as_object) else {
        return Vec::new();
    };

    let mut wrappers: Vec<&JsonValue> = Vec::with_capacity(data.len());
    if let Some(preferred) = preferred_resolver.and_then(|name| data.get(name)) {
        wrappers.push(preferred);
    }
    for (name, value) in data {
        if Some(name.as_str()) != preferred_resolver {
            wrappers.push(value);
        }
    }

    for wrapper in wrappers.iter().filter_map(|w| w.as_object()) {
        for field in DIRECT_LIST_FIELDS {
            if let Some(list) = wrapper.get(*field).and_then(JsonValue::as_array) {
                return object_records(list);
            }
        }
    }

    for wrapper in wrappers.iter().filter_map(|w| w.as_object()) {
        for field in EDGE_LIST_FIELDS {
            if let Some(edges) = wrapper.get(*field).and_then(JsonValue::as_array) {
                return edges
                    .iter()
                    .filter_map(|edge| {
                        EDGE_NODE_FIELDS
                            .iter()
                            .find_map(|key| edge.get(*key).and_then(JsonValue::as_object))
                    })
                    .cloned()
                    .collect();
            }
        }
    }

    for wrapper in &wrappers {
        if let Some(list) = wrapper.as_array() {
            return object_records(list);
        }
    }

    Vec::new()
}

/// First candidate present in `raw` whose value `convert` accepts.
pub fn resolve<T>(
    raw: &RawRecord,
    candidates: &[&str],
    convert: impl Fn(&JsonValue) -> Option<T>,
) -> Option<T> {
    candidates
        .iter()
        .filter_map(|name| raw.get(*name))
        .find_map(convert)
}

pub fn resolve_text(raw: &RawRecord, candidates: &[&str]) -> Option<String> {
    resolve(raw, candidates, json_text)
}

pub fn resolve_price(raw: &RawRecord, candidates: &[&str]) -> Option<f64> {
    resolve(raw, candidates, json_price)
}

/// Map one raw record onto the canonical item, or reject it when it has no usable
/// identity.
pub fn normalize_record(
    source: &str,
    raw: &RawRecord,
    category: &Category,
) -> Option<CanonicalItem> {
    let source_id = resolve_text(raw, IDENTITY_FIELDS)?;
    let title = resolve_text(raw, TITLE_FIELDS).unwrap_or_else(|| format!("Item {source_id}"));

    Some(CanonicalItem {
        source: source.to_string(),
        title,
        image_url: resolve_text(raw, IMAGE_FIELDS).unwrap_or_default(),
        price: resolve_price(raw, PRICE_FIELDS).unwrap_or(0.0),
        promo_price: resolve_price(raw, PROMO_PRICE_FIELDS),
        product_url: resolve_text(raw, LINK_FIELDS).unwrap_or_default(),
        category_slug: category.slug.clone(),
        category_name: category.display_name.clone(),
        curated_url: None,
        extra: BTreeMap::new(),
        source_id,
    })
}

/// Normalized batch plus the number of rejected records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub items: Vec<CanonicalItem>,
    pub rejected: usize,
}

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// GraphQL type whose fields the schema probe asks about.
    fn item_type_name(&self) -> &str;

    fn build_query(&self, known_fields: Option<&[String]>) -> String;

    fn extract_records(&self, response: &JsonValue) -> Vec<RawRecord>;

    fn normalize(&self, raw: &RawRecord, category: &Category) -> Option<CanonicalItem>;

    fn normalize_all(&self, records: &[RawRecord], category: &Category) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in records {
            match self.normalize(raw, category) {
                Some(item) => batch.items.push(item),
                None => batch.rejected += 1,
            }
        }
        if batch.rejected > 0 {
            debug!(
                source = self.source_id(),
                category = %category.slug,
                rejected = batch.rejected,
                "dropped records without identity"
            );
        }
        batch
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShopeeAffiliateAdapter {
    shape: SearchShape,
}

impl ShopeeAffiliateAdapter {
    pub fn new(shape: SearchShape) -> Self {
        Self { shape }
    }

    pub fn shape(&self) -> &SearchShape {
        &self.shape
    }
}

impl SourceAdapter for ShopeeAffiliateAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_SHOPEE_AFFILIATE
    }

    fn item_type_name(&self) -> &str {
        &self.shape.item_type
    }

    fn build_query(&self, known_fields: Option<&[String]>) -> String {
        build_query(&self.shape, known_fields)
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<RawRecord> {
        extract_records(response, Some(&self.shape.resolver))
    }

    fn normalize(&self, raw: &RawRecord, category: &Category) -> Option<CanonicalItem> {
        normalize_record(SOURCE_SHOPEE_AFFILIATE, raw, category)
    }
}

pub fn shopee_affiliate_adapter() -> impl SourceAdapter {
    ShopeeAffiliateAdapter::default()
}

pub fn adapter_for_source(source_id: &str, shape: SearchShape) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        SOURCE_SHOPEE_AFFILIATE => Some(Box::new(ShopeeAffiliateAdapter::new(shape))),
        _ => None,
    }
}
