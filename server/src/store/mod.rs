//! Persistence boundary for the chat pipeline.
//!
//! Catalog CRUD lives elsewhere; this trait only exposes what the webhook
//! pipeline reads and appends.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Business, Category, CategorySummary, Customer, MessageLog, NewMessageLog, Product};

pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- businesses --

    async fn business_by_id(&self, business_id: i64) -> Result<Option<Business>, StoreError>;

    /// Active business owning the given Instagram page id.
    async fn active_business_by_page_id(&self, page_id: &str)
        -> Result<Option<Business>, StoreError>;

    /// Overwrite the stored page token. Returns false if the business does not exist.
    async fn update_page_credentials(
        &self,
        business_id: i64,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    // -- catalog (active rows only, case-insensitive substring matching) --

    /// Categories visible to the business (its own plus global ones), by name.
    async fn categories_with_counts(
        &self,
        business_id: i64,
    ) -> Result<Vec<CategorySummary>, StoreError>;

    /// First visible category (by name) whose name contains `fragment`.
    async fn find_category(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Category>, StoreError>;

    async fn products_in_category(
        &self,
        business_id: i64,
        category_id: i64,
    ) -> Result<Vec<Product>, StoreError>;

    /// First active product (by name) whose name contains `fragment`.
    async fn find_product(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Product>, StoreError>;

    /// Active products whose name or description contains `term`, by name.
    async fn search_products(
        &self,
        business_id: i64,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError>;

    async fn active_products(&self, business_id: i64) -> Result<Vec<Product>, StoreError>;

    // -- conversation --

    /// Returns the customer and whether it was created by this call.
    async fn get_or_create_customer(
        &self,
        business_id: i64,
        platform: &str,
        platform_id: &str,
    ) -> Result<(Customer, bool), StoreError>;

    async fn append_message_log(&self, entry: NewMessageLog) -> Result<MessageLog, StoreError>;

    /// Newest `limit` rows for (business, sender) created after `since`,
    /// returned oldest first.
    async fn recent_message_logs(
        &self,
        business_id: i64,
        sender_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageLog>, StoreError>;

    /// Record a platform message id. Returns false if it was already seen.
    async fn claim_inbound_event(
        &self,
        business_id: i64,
        platform_message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Forget claimed message ids recorded before `before`. Returns the count removed.
    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
