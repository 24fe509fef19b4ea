use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use super::{Store, StoreError};
use crate::types::{
    Business, Category, CategorySummary, Customer, Direction, MessageLog, NewMessageLog, Product,
};

const PRODUCT_COLUMNS: &str = "p.id, p.business_id, p.category_id, c.name AS category_name, \
     p.sku, p.name, p.description, p.price_usd, p.price_lbp, p.stock, p.metadata, p.active";

const BUSINESS_COLUMNS: &str = "id, name, active, ai_enabled, allow_auto_reply_from_unknown, \
     instagram_page_id, page_access_token, page_token_expires_at";

const MESSAGE_LOG_COLUMNS: &str = "id, business_id, customer_id, sender_id, incoming_text, \
     reply_text, direction, error_message, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// `%fragment%` with LIKE metacharacters escaped.
fn contains_pattern(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    escaped.push('%');
    for ch in fragment.trim().chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn parse_business_row(row: PgRow) -> Result<Business, StoreError> {
    Ok(Business {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        active: row.try_get("active")?,
        ai_enabled: row.try_get("ai_enabled")?,
        allow_auto_reply_from_unknown: row.try_get("allow_auto_reply_from_unknown")?,
        instagram_page_id: row.try_get("instagram_page_id")?,
        page_access_token: row.try_get("page_access_token")?,
        page_token_expires_at: row.try_get("page_token_expires_at")?,
    })
}

fn parse_product_row(row: PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        category_id: row.try_get("category_id")?,
        category: row.try_get("category_name")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price_usd: row.try_get("price_usd")?,
        price_lbp: row.try_get("price_lbp")?,
        stock: row.try_get("stock")?,
        metadata: row.try_get("metadata")?,
        active: row.try_get("active")?,
    })
}

fn parse_customer_row(row: PgRow) -> Result<Customer, StoreError> {
    Ok(Customer {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        platform: row.try_get("platform")?,
        platform_id: row.try_get("platform_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_log_row(row: PgRow) -> Result<MessageLog, StoreError> {
    let direction: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown message direction '{direction}'")))?;
    Ok(MessageLog {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        customer_id: row.try_get("customer_id")?,
        sender_id: row.try_get("sender_id")?,
        incoming_text: row.try_get("incoming_text")?,
        reply_text: row.try_get("reply_text")?,
        direction,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn business_by_id(&self, business_id: i64) -> Result<Option<Business>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE id = $1"
        ))
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_business_row).transpose()
    }

    async fn active_business_by_page_id(
        &self,
        page_id: &str,
    ) -> Result<Option<Business>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses \
             WHERE instagram_page_id = $1 AND active = true"
        ))
        .bind(page_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_business_row).transpose()
    }

    async fn update_page_credentials(
        &self,
        business_id: i64,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE businesses \
             SET page_access_token = $1, page_token_expires_at = $2, updated_at = NOW() \
             WHERE id = $3",
        )
        .bind(access_token)
        .bind(expires_at)
        .bind(business_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn categories_with_counts(
        &self,
        business_id: i64,
    ) -> Result<Vec<CategorySummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.name, c.is_global, \
                    (SELECT COUNT(*) FROM products p \
                     WHERE p.category_id = c.id AND p.business_id = $1 AND p.active = true) \
                    AS product_count \
             FROM categories c \
             WHERE c.business_id = $1 OR c.business_id IS NULL OR c.is_global = true \
             ORDER BY c.name ASC",
        )
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<CategorySummary, StoreError> {
                Ok(CategorySummary {
                    name: row.try_get("name")?,
                    product_count: row.try_get("product_count")?,
                    is_global: row.try_get("is_global")?,
                })
            })
            .collect()
    }

    async fn find_category(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Category>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, business_id, is_global FROM categories \
             WHERE (business_id = $1 OR business_id IS NULL OR is_global = true) \
               AND name ILIKE $2 \
             ORDER BY name ASC LIMIT 1",
        )
        .bind(business_id)
        .bind(contains_pattern(fragment))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Category {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            business_id: row.try_get("business_id")?,
            is_global: row.try_get("is_global")?,
        }))
    }

    async fn products_in_category(
        &self,
        business_id: i64,
        category_id: i64,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products p \
             LEFT JOIN categories c ON c.id = p.category_id \
             WHERE p.business_id = $1 AND p.category_id = $2 AND p.active = true \
             ORDER BY p.name ASC"
        ))
        .bind(business_id)
        .bind(category_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_product_row).collect()
    }

    async fn find_product(
        &self,
        business_id: i64,
        fragment: &str,
    ) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products p \
             LEFT JOIN categories c ON c.id = p.category_id \
             WHERE p.business_id = $1 AND p.active = true AND p.name ILIKE $2 \
             ORDER BY p.name ASC LIMIT 1"
        ))
        .bind(business_id)
        .bind(contains_pattern(fragment))
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_product_row).transpose()
    }

    async fn search_products(
        &self,
        business_id: i64,
        term: &str,
        limit: usize,
    ) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products p \
             LEFT JOIN categories c ON c.id = p.category_id \
             WHERE p.business_id = $1 AND p.active = true \
               AND (p.name ILIKE $2 OR p.description ILIKE $2) \
             ORDER BY p.name ASC LIMIT $3"
        ))
        .bind(business_id)
        .bind(contains_pattern(term))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_product_row).collect()
    }

    async fn active_products(&self, business_id: i64) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products p \
             LEFT JOIN categories c ON c.id = p.category_id \
             WHERE p.business_id = $1 AND p.active = true \
             ORDER BY p.name ASC"
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(parse_product_row).collect()
    }

    async fn get_or_create_customer(
        &self,
        business_id: i64,
        platform: &str,
        platform_id: &str,
    ) -> Result<(Customer, bool), StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO customers (business_id, platform, platform_id) VALUES ($1, $2, $3) \
             ON CONFLICT (platform, platform_id, business_id) DO NOTHING \
             RETURNING id, business_id, platform, platform_id, created_at, updated_at",
        )
        .bind(business_id)
        .bind(platform)
        .bind(platform_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok((parse_customer_row(row)?, true));
        }

        let row = sqlx::query(
            "SELECT id, business_id, platform, platform_id, created_at, updated_at \
             FROM customers WHERE platform = $1 AND platform_id = $2 AND business_id = $3",
        )
        .bind(platform)
        .bind(platform_id)
        .bind(business_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((parse_customer_row(row)?, false))
    }

    async fn append_message_log(&self, entry: NewMessageLog) -> Result<MessageLog, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO message_logs \
             (business_id, customer_id, sender_id, incoming_text, reply_text, direction, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {MESSAGE_LOG_COLUMNS}"
        ))
        .bind(entry.business_id)
        .bind(entry.customer_id)
        .bind(&entry.sender_id)
        .bind(&entry.incoming_text)
        .bind(&entry.reply_text)
        .bind(entry.direction.as_str())
        .bind(&entry.error_message)
        .fetch_one(&self.pool)
        .await?;
        parse_message_log_row(row)
    }

    async fn recent_message_logs(
        &self,
        business_id: i64,
        sender_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageLog>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_LOG_COLUMNS} FROM message_logs \
             WHERE business_id = $1 AND sender_id = $2 AND created_at >= $3 \
             ORDER BY created_at DESC, id DESC LIMIT $4"
        ))
        .bind(business_id)
        .bind(sender_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut logs = rows
            .into_iter()
            .map(parse_message_log_row)
            .collect::<Result<Vec<_>, _>>()?;
        logs.reverse();
        Ok(logs)
    }

    async fn claim_inbound_event(
        &self,
        business_id: i64,
        platform_message_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO processed_events (business_id, platform_message_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(business_id)
        .bind(platform_message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn prune_processed_events(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM processed_events WHERE created_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
