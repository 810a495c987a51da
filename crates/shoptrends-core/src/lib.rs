//! Core catalog model for Shop Trends.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "shoptrends-core";

/// Source identifier stamped on every record produced by the Shopee affiliate adapter.
pub const SOURCE_SHOPEE_AFFILIATE: &str = "shopee_affiliate";

/// Human-readable format of `Catalog::updated_at`.
pub const UPDATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

/// One search unit of the storefront: a slug plus the keyword sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub slug: String,
    pub display_name: String,
    pub search_keyword: String,
}

impl Category {
    pub fn new(
        slug: impl Into<String>,
        display_name: impl Into<String>,
        search_keyword: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            display_name: display_name.into(),
            search_keyword: search_keyword.into(),
        }
    }
}

/// `(source, sourceId)` pair; unique across a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub source: String,
    pub source_id: String,
}

impl IdentityKey {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.source.trim().is_empty() && !self.source_id.trim().is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

/// Normalized product record as persisted in the catalog file.
///
/// Serialized in camelCase. Reading goes through [`CanonicalItem::from_persisted`],
/// which tolerates the loose typing of older catalog files.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalItem {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub image_url: String,
    pub price: f64,
    pub promo_price: Option<f64>,
    pub product_url: String,
    pub category_slug: String,
    pub category_name: String,
    /// Set by a curator, never by the sync. Older files call it `tiktokUrl`.
    pub curated_url: Option<String>,
    /// Keys this model does not know about (e.g. `addedAt`), carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// Legacy name of `curatedUrl`.
const LEGACY_CURATED_KEY: &str = "tiktokUrl";

/// Largest float that still renders exactly as an integer id.
const MAX_EXACT_FLOAT_ID: f64 = 9_007_199_254_740_992.0;

/// Trimmed non-empty string, or a number rendered as text. Whole-valued floats
/// render without a fraction so `1.0` and `1` name the same id.
pub fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) if n.is_f64() => {
            let f = n.as_f64()?;
            if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT_ID {
                Some(format!("{}", f as i64))
            } else {
                Some(n.to_string())
            }
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lenient non-negative number: JSON numbers, `"12.50"` and `"12,50"`.
pub fn json_price(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<f64>().ok().or_else(|| {
                if s.contains(',') && !s.contains('.') {
                    s.replace(',', ".").parse::<f64>().ok()
                } else {
                    None
                }
            })
        }
        _ => None,
    }?;
    (parsed.is_finite() && parsed >= 0.0).then_some(parsed)
}

fn take_text(map: &mut Map<String, JsonValue>, key: &str) -> Option<String> {
    map.remove(key).as_ref().and_then(json_text)
}

impl CanonicalItem {
    /// Read one item of a persisted catalog. Null or mistyped scalars fall back to
    /// their defaults and numeric strings count as prices. `None` when the entry is
    /// not an object or has no usable identity key.
    pub fn from_persisted(raw: JsonValue) -> Option<Self> {
        let JsonValue::Object(mut map) = raw else {
            return None;
        };

        let source = take_text(&mut map, "source")?;
        let source_id = take_text(&mut map, "sourceId")?;
        let curated = take_text(&mut map, "curatedUrl");
        let legacy_curated = take_text(&mut map, LEGACY_CURATED_KEY);

        Some(Self {
            source,
            source_id,
            title: take_text(&mut map, "title").unwrap_or_default(),
            image_url: take_text(&mut map, "imageUrl").unwrap_or_default(),
            price: map.remove("price").as_ref().and_then(json_price).unwrap_or(0.0),
            promo_price: map.remove("promoPrice").as_ref().and_then(json_price),
            product_url: take_text(&mut map, "productUrl").unwrap_or_default(),
            category_slug: take_text(&mut map, "categorySlug").unwrap_or_default(),
            category_name: take_text(&mut map, "categoryName").unwrap_or_default(),
            curated_url: curated.or(legacy_curated),
            extra: map.into_iter().collect(),
        })
    }

    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.source.clone(), self.source_id.clone())
    }

    pub fn has_curated_url(&self) -> bool {
        self.curated_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Replace every field with the candidate's, keeping a non-empty curated URL
    /// the candidate does not override.
    pub fn merge_from(&mut self, candidate: CanonicalItem) {
        let CanonicalItem {
            source,
            source_id,
            title,
            image_url,
            price,
            promo_price,
            product_url,
            category_slug,
            category_name,
            curated_url,
            extra,
        } = candidate;

        let candidate_curates = curated_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if candidate_curates || !self.has_curated_url() {
            self.curated_url = curated_url;
        }

        self.source = source;
        self.source_id = source_id;
        self.title = title;
        self.image_url = image_url;
        self.price = price;
        self.promo_price = promo_price;
        self.product_url = product_url;
        self.category_slug = category_slug;
        self.category_name = category_name;
        self.extra.extend(extra);
    }
}

/// Insert/update tallies reported by [`Catalog::upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

/// In-memory catalog. Items keep arrival order; the identity index is private and
/// rebuilt from `items` whenever a catalog is assembled.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    updated_at: String,
    items: Vec<CanonicalItem>,
    #[serde(skip)]
    index: HashMap<IdentityKey, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble a catalog from persisted parts. Items are folded through
    /// [`Catalog::upsert`], so duplicate keys collapse onto their first position and
    /// key-less items are dropped. Returns the catalog and the number of input items
    /// that did not become their own entry.
    pub fn from_parts(updated_at: impl Into<String>, items: Vec<CanonicalItem>) -> (Self, usize) {
        let total = items.len();
        let mut catalog = Self {
            updated_at: updated_at.into(),
            items: Vec::with_capacity(total),
            index: HashMap::with_capacity(total),
        };
        catalog.upsert(items);
        let folded = total - catalog.items.len();
        (catalog, folded)
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    pub fn items(&self) -> &[CanonicalItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&CanonicalItem> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    /// Idempotent merge of `candidates` into the catalog.
    pub fn upsert<I>(&mut self, candidates: I) -> UpsertCounts
    where
        I: IntoIterator<Item = CanonicalItem>,
    {
        let mut counts = UpsertCounts::default();
        for candidate in candidates {
            let key = candidate.identity_key();
            if !key.is_valid() {
                continue;
            }
            match self.index.get(&key) {
                Some(&i) => {
                    self.items[i].merge_from(candidate);
                    counts.updated += 1;
                }
                None => {
                    self.index.insert(key, self.items.len());
                    self.items.push(candidate);
                    counts.inserted += 1;
                }
            }
        }
        counts
    }

    /// Set the curated URL of an existing item. Returns `false` when the key is unknown.
    pub fn set_curated_url(&mut self, key: &IdentityKey, url: impl Into<String>) -> bool {
        match self.index.get(key) {
            Some(&i) => {
                self.items[i].curated_url = Some(url.into());
                true
            }
            None => false,
        }
    }

    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.format(UPDATED_AT_FORMAT).to_string();
    }

    /// Item count per category slug.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.category_slug.clone()).or_default() += 1;
        }
        counts
    }
}
