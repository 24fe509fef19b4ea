//! In-memory `Store` used by unit tests across the crate.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::{Store, StoreError};
use crate::types::{
    Business, Category, CategorySummary, Customer, MessageLog, NewMessageLog, Product,
};

#[derive(Default)]
struct Tables {
    businesses: Vec<Business>,
    categories: Vec<Category>,
    products: Vec<Product>,
    customers: Vec<Customer>,
    message_logs: Vec<MessageLog>,
    processed: HashMap<(i64, String), DateTime<Utc>>,
    failing_senders: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack
        .to_lowercase()
        .contains(needle.trim().to_lowercase().as_str())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_business(&self, name: &str, page_id: &str) -> Business {
        let mut tables = self.tables.lock().unwrap();
        let business = Business {
            id: tables.businesses.len() as i64 + 1,
            name: name.to_string(),
            active: true,
            ai_enabled: true,
            allow_auto_reply_from_unknown: true,
            instagram_page_id: Some(page_id.to_string()),
            page_access_token: Some(format!("token-{page_id}")),
            page_token_expires_at: None,
        };
        tables.businesses.push(business.clone());
        business
    }

    pub fn update_business(&self, business_id: i64, change: impl FnOnce(&mut Business)) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(business) = tables.businesses.iter_mut().find(|b| b.id == business_id) {
            change(business);
        }
    }

    pub fn add_category(&self, business_id: Option<i64>, name: &str) -> Category {
        let mut tables = self.tables.lock().unwrap();
        let category = Category {
            id: tables.categories.len() as i64 + 1,
            name: name.to_string(),
            business_id,
            is_global: business_id.is_none(),
        };
        tables.categories.push(category.clone());
        category
    }

    pub fn add_product(
        &self,
        business_id: i64,
        category: Option<&Category>,
        name: &str,
        description: &str,
        price_usd: Decimal,
        stock: i32,
        metadata: Option<Value>,
    ) -> Product {
        let mut tables = self.tables.lock().unwrap();
        let product = Product {
            id: tables.products.len() as i64 + 1,
            business_id,
            category_id: category.map(|c| c.id),
            category: category.map(|c| c.name.clone()),
            sku: None,
            name: name.to_string(),
            description: description.to_string(),
            price_usd,
            price_lbp: None,
            stock,
            metadata,
            active: true,
        };
        tables.products.push(product.clone());
        product
    }

    pub fn deactivate_product(&self, product_id: i64) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(product) = tables.products.iter_mut().find(|p| p.id == product_id) {
            product.active = false;
        }
    }

    /// Makes `get_or_create_customer` fail for this platform id.
    pub fn fail_customer_lookups_for(&self, platform_id: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables.failing_senders.insert(platform_id.to_string());
    }

    /// Backdates a claimed message id.
    pub fn age_processed_event(&self, business_id: i64, platform_message_id: &str, at: DateTime<Utc>) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(claimed_at) = tables
            .processed
            .get_mut(&(business_id, platform_message_id.to_string()))
        {
            *claimed_at = at;
        }
    }

    pub fn message_logs(&self) -> Vec<MessageLog> {
        self.tables.lock().unwrap().message_logs.clone()
    }

    pub fn customers(&self) -> Vec<Customer> {
        self.tables.lock().unwrap().customers.clone()
    }

    pub fn business(&self, business_id: i64) -> Option<Business> {
        let tables = self.tables.lock().unwrap();
        tables.businesses.iter().find(|b| b.id == business_id).cloned()
    }

    fn visible_categories(tables: &Tables, business_id: i64) -> Vec<Category> {
        let mut categories = tables
            .categories
            .iter()
            .filter(|c| c.business_id == Some(business_id) || c.business_id.is_none() || c.is_global)
            .cloned()
            .collect::<Vec<_>>();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        categories
    }

    fn active_sorted(tables: &Tables, business_id: i64) -> Vec<Product> {
        let mut products = tables
            .products
            .iter()
            .filter(|p| p.business_id == business_id && p.active)
            .cloned()
            .collect::<Vec<_>>();
        products.sort_by(|a, b| a.name.cmp(&b.name));
        products
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn business_by_id(&self, business_id: i64) -> Result<Option<Business>, StoreError> {
        Ok(self.business(business_id))
    }

    async fn active_business_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<Business>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .businesses
            .iter()
            .find(|b| b.active && b.instagram_page_id.as_deref() == Some(page_id))
            .cloned())
    }

    async fn update_page_credentials(
        &self,
        business_id: i64,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(business) = tables.businesses.iter_mut().find(|b| b.id == business_id) else {
            return Ok(false);
        };
        business.page_access_token = Some(access_token.to_string());
        business.page_token_expires_at = expires_at;
        Ok(true)
    }

    async fn categories_with_counts(
        &self,
        business_id: i64,
    ) -> Result<Vec<CategorySummary>, StoreError> {
        let tables = self.tables.lock().unwrap();
        let active = Self::active_sorted(&tables, business_id);
        Ok(Self::visible_categories(&tables, business_id)
            .into_iter()
            .map(|category| CategorySummary {
                product_count: active
                    .iter()
                    .filter(|p| p.category_id == Some(category.id))
                    .count() as i64,
                name: category.name,
                is_global: category.is_global,
            })
            .collect())
    }

    async fn find_category(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Category>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::visible_categories(&tables, business_id)
            .into_iter()
            .find(|c| contains_ci(&c.name, fragment)))
    }

    async fn products_in_category(
        &self,
        business_id: i64,
        category_id: i64,
    ) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::active_sorted(&tables, business_id)
            .into_iter()
            .filter(|p| p.category_id == Some(category_id))
            .collect())
    }

    async fn find_product(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Product>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::active_sorted(&tables, business_id)
            .into_iter()
            .find(|p| contains_ci(&p.name, fragment)))
    }

    async fn search_products(
        &self,
        business_id: i64,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::active_sorted(&tables, business_id)
            .into_iter()
            .filter(|p| contains_ci(&p.name, term) || contains_ci(&p.description, term))
            .take(limit)
            .collect())
    }

    async fn active_products(&self, business_id: i64) -> Result<Vec<Product>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(Self::active_sorted(&tables, business_id))
    }

    async fn get_or_create_customer(
        &self,
        business_id: i64,
        platform: &str,
        platform_id: &str,
    ) -> Result<(Customer, bool), StoreError> {
        let mut tables = self.tables.lock().unwrap();
        if tables.failing_senders.contains(platform_id) {
            return Err(StoreError::Corrupt(format!("customer {platform_id}")));
        }
        if let Some(existing) = tables.customers.iter().find(|c| {
            c.business_id == business_id && c.platform == platform && c.platform_id == platform_id
        }) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let customer = Customer {
            id: tables.customers.len() as i64 + 1,
            business_id,
            platform: platform.to_string(),
            platform_id: platform_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        tables.customers.push(customer.clone());
        Ok((customer, true))
    }

    async fn append_message_log(&self, entry: NewMessageLog) -> Result<MessageLog, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let log = MessageLog {
            id: tables.message_logs.len() as i64 + 1,
            business_id: entry.business_id,
            customer_id: entry.customer_id,
            sender_id: entry.sender_id,
            incoming_text: entry.incoming_text,
            reply_text: entry.reply_text,
            direction: entry.direction,
            error_message: entry.error_message,
            created_at: Utc::now(),
        };
        tables.message_logs.push(log.clone());
        Ok(log)
    }

    async fn recent_message_logs(
        &self,
        business_id: i64,
        sender_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let tables = self.tables.lock().unwrap();
        let matching = tables
            .message_logs
            .iter()
            .filter(|log| {
                log.business_id == business_id
                    && log.sender_id.as_deref() == Some(sender_id)
                    && log.created_at >= since
            })
            .cloned()
            .collect::<Vec<_>>();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn claim_inbound_event(
        &self,
        business_id: i64,
        platform_message_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let key = (business_id, platform_message_id.to_string());
        if tables.processed.contains_key(&key) {
            return Ok(false);
        }
        tables.processed.insert(key, Utc::now());
        Ok(true)
    }

    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().unwrap();
        let count = tables.processed.len();
        tables.processed.retain(|_, claimed_at| *claimed_at >= before);
        Ok((count - tables.processed.len()) as u64)
    }
}
