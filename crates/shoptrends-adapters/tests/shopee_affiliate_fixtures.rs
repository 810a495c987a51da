use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use shoptrends_adapters::{shopee_affiliate_adapter, SourceAdapter};
use shoptrends_core::Category;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/shopee_affiliate")
}

fn load(name: &str) -> JsonValue {
    let text = std::fs::read_to_string(fixture_dir().join(name)).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn recorded_responses_exist() {
    for name in [
        "product_offer_v2_nodes.json",
        "product_offer_list_items.json",
        "search_edges.json",
        "application_error.json",
        "introspection_product_offer_v2.json",
        "introspection_disabled.json",
    ] {
        assert!(fixture_dir().join(name).exists(), "missing fixture {name}");
    }
}

#[test]
fn legacy_items_wrapper_with_snake_case_fields() {
    let adapter = shopee_affiliate_adapter();
    let beleza = Category::new("beleza", "Beleza", "skin care maquiagem perfume");
    let records = adapter.extract_records(&load("product_offer_list_items.json"));
    let batch = adapter.normalize_all(&records, &beleza);

    assert_eq!(batch.rejected, 0);
    let item = &batch.items[0];
    assert_eq!(item.source_id, "501");
    assert_eq!(item.title, "Perfume Floral 100ml");
    assert_eq!(item.image_url, "https://cf.shopee.com.br/file/perfume-floral");
    assert_eq!(item.price, 0.0);
    assert_eq!(item.promo_price, Some(59.9));
    assert_eq!(item.product_url, "https://shopee.com.br/perfume-floral-i.1.501");
    assert_eq!(item.category_slug, "beleza");
}

#[test]
fn edge_wrapped_search_results() {
    let adapter = shopee_affiliate_adapter();
    let pet = Category::new("pet", "Pet Shop", "ração pet brinquedo pet");
    let records = adapter.extract_records(&load("search_edges.json"));
    let batch = adapter.normalize_all(&records, &pet);

    assert_eq!(batch.items.len(), 2);
    assert_eq!(batch.items[0].title, "Ração Premium Cães Adultos 15kg");
    assert_eq!(batch.items[0].price, 189.9);
    assert_eq!(batch.items[0].product_url, "https://s.shopee.com.br/racao15");
    assert_eq!(batch.items[1].source_id, "9002");
    assert_eq!(batch.items[1].title, "Item 9002");
    assert_eq!(batch.items[1].price, 0.0);
}
