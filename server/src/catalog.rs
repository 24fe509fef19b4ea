//! Read-only catalog lookups exposed to the model as tools.
//!
//! Every operation is scoped to one business and skips inactive rows. Errors
//! are plain data (`CatalogError` serializes to `{"error": "..."}`) so a
//! missing product reaches the model as a result it can phrase, never as a
//! failed turn.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::store::{Store, StoreError};
use crate::types::{CategorySummary, Product};

pub const SEARCH_LIMIT: usize = 10;
const KEYWORD_MATCHES_PER_WORD: usize = 3;
const KEYWORD_MATCH_LIMIT: usize = 5;
const MIN_KEYWORD_CHARS: usize = 3;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Category '{0}' not found")]
    CategoryNotFound(String),

    #[error("Product '{0}' not found")]
    ProductNotFound(String),

    #[error("Catalog is temporarily unavailable")]
    Unavailable,
}

impl Serialize for CatalogError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("error", &self.to_string())?;
        map.end()
    }
}

impl From<StoreError> for CatalogError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "catalog query failed");
        CatalogError::Unavailable
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryList {
    pub categories: Vec<CategorySummary>,
    pub total_categories: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryProducts {
    pub category: String,
    pub products: Vec<ProductListing>,
    pub total_products: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductListing {
    pub name: String,
    pub sku: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_usd: Decimal,
    pub price_lbp: Option<i64>,
    pub description: String,
    pub metadata: Option<Value>,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProductDetails {
    pub name: String,
    pub sku: Option<String>,
    pub description: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_usd: Decimal,
    pub price_lbp: Option<i64>,
    pub category: Option<String>,
    pub metadata: Option<Value>,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub name: String,
    pub sku: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_usd: Decimal,
    pub price_lbp: Option<i64>,
    pub category: Option<String>,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub search_term: String,
    pub products: Vec<SearchHit>,
    pub total_found: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptionMatch {
    pub name: String,
    pub sku: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub price_usd: Decimal,
    pub price_lbp: Option<i64>,
    pub description: String,
    pub category: Option<String>,
    pub metadata: Option<Value>,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptionIdentification {
    pub found: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<CaptionMatch>,
    pub post_caption: String,
    pub user_message: String,
    pub message: String,
}

impl From<Product> for ProductListing {
    fn from(product: Product) -> Self {
        Self {
            available: product.available(),
            name: product.name,
            sku: product.sku,
            price_usd: product.price_usd,
            price_lbp: product.price_lbp,
            description: product.description,
            metadata: product.metadata,
        }
    }
}

impl From<Product> for ProductDetails {
    fn from(product: Product) -> Self {
        Self {
            available: product.available(),
            name: product.name,
            sku: product.sku,
            description: product.description,
            price_usd: product.price_usd,
            price_lbp: product.price_lbp,
            category: product.category,
            metadata: product.metadata,
        }
    }
}

impl From<Product> for SearchHit {
    fn from(product: Product) -> Self {
        Self {
            available: product.available(),
            name: product.name,
            sku: product.sku,
            price_usd: product.price_usd,
            price_lbp: product.price_lbp,
            category: product.category,
        }
    }
}

impl CaptionMatch {
    fn new(product: Product, match_reason: Option<String>) -> Self {
        Self {
            available: product.available(),
            name: product.name,
            sku: product.sku,
            price_usd: product.price_usd,
            price_lbp: product.price_lbp,
            description: product.description,
            category: product.category,
            metadata: product.metadata,
            match_reason,
        }
    }
}

fn word_regex() -> &'static Regex {
    static WORDS: OnceLock<Regex> = OnceLock::new();
    WORDS.get_or_init(|| Regex::new(r"\b\w+\b").expect("static regex"))
}

/// True when the caption names the product outright or mentions one of its
/// longer name words.
fn caption_mentions(caption_lower: &str, product_name: &str) -> bool {
    let name_lower = product_name.to_lowercase();
    if caption_lower.contains(name_lower.as_str()) {
        return true;
    }
    name_lower
        .split_whitespace()
        .filter(|word| word.chars().count() > MIN_KEYWORD_CHARS)
        .any(|word| caption_lower.contains(word))
}

fn caption_keywords(caption_lower: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    word_regex()
        .find_iter(caption_lower)
        .map(|m| m.as_str())
        .filter(|word| word.chars().count() > MIN_KEYWORD_CHARS)
        .filter(|word| seen.insert(word.to_string()))
        .map(str::to_string)
        .collect()
}

pub struct CatalogService<'a> {
    store: &'a dyn Store,
    business_id: i64,
}

impl<'a> CatalogService<'a> {
    pub fn new(store: &'a dyn Store, business_id: i64) -> Self {
        Self { store, business_id }
    }

    pub async fn list_categories(&self) -> Result<CategoryList, CatalogError> {
        let categories = self.store.categories_with_counts(self.business_id).await?;
        Ok(CategoryList {
            total_categories: categories.len(),
            categories,
        })
    }

    pub async fn list_products_by_category(
        &self,
        category_name: &str,
    ) -> Result<CategoryProducts, CatalogError> {
        let Some(category) = self
            .store
            .find_category(self.business_id, category_name)
            .await?
        else {
            return Err(CatalogError::CategoryNotFound(category_name.to_string()));
        };

        let products = self
            .store
            .products_in_category(self.business_id, category.id)
            .await?
            .into_iter()
            .map(ProductListing::from)
            .collect::<Vec<_>>();

        Ok(CategoryProducts {
            category: category.name,
            total_products: products.len(),
            products,
        })
    }

    pub async fn get_product_details(
        &self,
        product_name: &str,
    ) -> Result<ProductDetails, CatalogError> {
        self.store
            .find_product(self.business_id, product_name)
            .await?
            .map(ProductDetails::from)
            .ok_or_else(|| CatalogError::ProductNotFound(product_name.to_string()))
    }

    pub async fn search_products(&self, search_term: &str) -> Result<SearchResults, CatalogError> {
        let products = self
            .store
            .search_products(self.business_id, search_term, SEARCH_LIMIT)
            .await?
            .into_iter()
            .map(SearchHit::from)
            .collect::<Vec<_>>();

        Ok(SearchResults {
            search_term: search_term.to_string(),
            total_found: products.len(),
            products,
        })
    }

    pub async fn identify_product_from_post_caption(
        &self,
        post_caption: &str,
        user_message: &str,
    ) -> Result<CaptionIdentification, CatalogError> {
        let caption_lower = post_caption.to_lowercase();
        debug!(caption = %post_caption, "identifying product from post caption");

        let direct = self
            .store
            .active_products(self.business_id)
            .await?
            .into_iter()
            .filter(|product| caption_mentions(&caption_lower, &product.name))
            .map(|product| CaptionMatch::new(product, None))
            .collect::<Vec<_>>();

        if !direct.is_empty() {
            return Ok(CaptionIdentification {
                found: true,
                message: format!(
                    "Found {} product(s) mentioned in the post caption",
                    direct.len()
                ),
                products: direct,
                post_caption: post_caption.to_string(),
                user_message: user_message.to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut keyword_matches = Vec::new();
        'keywords: for keyword in caption_keywords(&caption_lower) {
            let hits = self
                .store
                .search_products(self.business_id, &keyword, KEYWORD_MATCHES_PER_WORD)
                .await?;
            for product in hits {
                if !seen.insert(product.id) {
                    continue;
                }
                keyword_matches.push(CaptionMatch::new(
                    product,
                    Some(format!(
                        "Keyword '{keyword}' found in product name or description"
                    )),
                ));
                if keyword_matches.len() >= KEYWORD_MATCH_LIMIT {
                    break 'keywords;
                }
            }
        }

        if keyword_matches.is_empty() {
            return Ok(CaptionIdentification {
                found: false,
                products: Vec::new(),
                post_caption: post_caption.to_string(),
                user_message: user_message.to_string(),
                message: "No products found matching the post caption. Please specify the product name."
                    .to_string(),
            });
        }

        Ok(CaptionIdentification {
            found: true,
            message: format!(
                "Found {} product(s) matching keywords from the post caption",
                keyword_matches.len()
            ),
            products: keyword_matches,
            post_caption: post_caption.to_string(),
            user_message: user_message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn shop() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let business = store.add_business("Sneaker Spot", "page-1");
        (store, business.id)
    }

    #[tokio::test]
    async fn list_categories_includes_global_and_counts_active_products() {
        let (store, business_id) = shop();
        let shoes = store.add_category(Some(business_id), "Shoes");
        store.add_category(None, "Accessories");
        store.add_product(business_id, Some(&shoes), "Air Max 90", "", Decimal::new(12000, 2), 3, None);
        let hidden = store.add_product(business_id, Some(&shoes), "Old Runner", "", Decimal::ONE, 1, None);
        store.deactivate_product(hidden.id);

        let list = CatalogService::new(&store, business_id)
            .list_categories()
            .await
            .unwrap();

        assert_eq!(list.total_categories, 2);
        assert_eq!(list.categories[0].name, "Accessories");
        assert!(list.categories[0].is_global);
        assert_eq!(list.categories[1].name, "Shoes");
        assert_eq!(list.categories[1].product_count, 1);
    }

    #[tokio::test]
    async fn products_by_category_is_case_insensitive_active_only_and_sorted() {
        let (store, business_id) = shop();
        let shoes = store.add_category(Some(business_id), "Running Shoes");
        store.add_product(business_id, Some(&shoes), "Zoom Fly", "", Decimal::ONE, 0, None);
        store.add_product(business_id, Some(&shoes), "Air Max 90", "", Decimal::ONE, 2, None);
        let inactive = store.add_product(business_id, Some(&shoes), "Boost", "", Decimal::ONE, 2, None);
        store.deactivate_product(inactive.id);

        let result = CatalogService::new(&store, business_id)
            .list_products_by_category("SHOES")
            .await
            .unwrap();

        assert_eq!(result.category, "Running Shoes");
        assert_eq!(result.total_products, 2);
        let names = result.products.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Air Max 90", "Zoom Fly"]);
        assert!(result.products[0].available);
        assert!(!result.products[1].available);
    }

    #[tokio::test]
    async fn missing_category_is_structured_not_found() {
        let (store, business_id) = shop();
        let err = CatalogService::new(&store, business_id)
            .list_products_by_category("hats")
            .await
            .unwrap_err();

        assert!(matches!(err, CatalogError::CategoryNotFound(_)));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({ "error": "Category 'hats' not found" })
        );
    }

    #[tokio::test]
    async fn product_details_resolve_category_and_hide_stock_count() {
        let (store, business_id) = shop();
        let shoes = store.add_category(Some(business_id), "Shoes");
        store.add_product(
            business_id,
            Some(&shoes),
            "Air Max 90",
            "Classic runner",
            Decimal::new(12000, 2),
            7,
            Some(json!({ "sizes": [41, 42, 43], "colors": ["white", "black"] })),
        );

        let details = CatalogService::new(&store, business_id)
            .get_product_details("air max")
            .await
            .unwrap();

        assert_eq!(details.category.as_deref(), Some("Shoes"));
        assert!(details.available);
        let value = serde_json::to_value(&details).unwrap();
        assert!(value.get("stock").is_none());
        assert_eq!(value["price_usd"], json!(120.0));
        assert_eq!(value["metadata"]["colors"], json!(["white", "black"]));
    }

    #[tokio::test]
    async fn search_is_capped_and_skips_inactive_products() {
        let (store, business_id) = shop();
        for i in 0..14 {
            store.add_product(business_id, None, &format!("Tee {i:02}"), "cotton", Decimal::ONE, 1, None);
        }
        let inactive = store.add_product(business_id, None, "Tee 00 old", "cotton", Decimal::ONE, 1, None);
        store.deactivate_product(inactive.id);

        let results = CatalogService::new(&store, business_id)
            .search_products("COTTON")
            .await
            .unwrap();

        assert_eq!(results.total_found, SEARCH_LIMIT);
        assert!(results.products.iter().all(|p| p.name != "Tee 00 old"));
        assert_eq!(results.products[0].name, "Tee 00");
    }

    #[tokio::test]
    async fn caption_names_product_directly() {
        let (store, business_id) = shop();
        store.add_product(business_id, None, "Air Max 90", "", Decimal::ONE, 1, None);
        store.add_product(business_id, None, "Leather Belt", "", Decimal::ONE, 1, None);

        let result = CatalogService::new(&store, business_id)
            .identify_product_from_post_caption("Check out our new Air Max 90 sneakers!", "price?")
            .await
            .unwrap();

        assert!(result.found);
        assert_eq!(result.products.len(), 1);
        assert_eq!(result.products[0].name, "Air Max 90");
        assert!(result.products[0].match_reason.is_none());
    }

    #[tokio::test]
    async fn caption_falls_back_to_keyword_search() {
        let (store, business_id) = shop();
        store.add_product(
            business_id,
            None,
            "Trail Runner",
            "Waterproof hiking boots for rough terrain",
            Decimal::ONE,
            1,
            None,
        );

        let result = CatalogService::new(&store, business_id)
            .identify_product_from_post_caption("Ready for winter hiking?", "how much")
            .await
            .unwrap();

        assert!(result.found);
        assert_eq!(result.products.len(), 1);
        assert_eq!(
            result.products[0].match_reason.as_deref(),
            Some("Keyword 'hiking' found in product name or description")
        );
    }

    #[tokio::test]
    async fn caption_without_overlap_reports_not_found() {
        let (store, business_id) = shop();
        store.add_product(business_id, None, "Air Max 90", "sneaker", Decimal::ONE, 1, None);

        let result = CatalogService::new(&store, business_id)
            .identify_product_from_post_caption("Happy holidays everyone", "price?")
            .await
            .unwrap();

        assert!(!result.found);
        assert!(result.products.is_empty());
        assert!(result.message.contains("specify the product"));
    }

    #[test]
    fn caption_keywords_skip_short_and_repeated_words() {
        let words = caption_keywords("new boots, new boots and a bag!");
        assert_eq!(words, vec!["boots".to_string()]);
    }
}
