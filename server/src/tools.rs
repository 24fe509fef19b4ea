//! The function-calling menu offered to the model and its dispatch onto the
//! catalog.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::catalog::{CatalogError, CatalogService};
use crate::llm::ToolDefinition;

pub const GET_CATEGORIES: &str = "get_categories";
pub const GET_PRODUCTS_BY_CATEGORY: &str = "get_products_by_category";
pub const GET_PRODUCT_DETAILS: &str = "get_product_details";
pub const SEARCH_PRODUCTS: &str = "search_products";
pub const IDENTIFY_PRODUCT_FROM_POST_CONTEXT: &str = "identify_product_from_post_context";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool {tool} got unparsable arguments: {source}")]
    InvalidArguments {
        tool: String,
        source: serde_json::Error,
    },
}

fn string_param(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

/// The fixed tool menu. Names and parameter schemas are part of the contract
/// with the model provider.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: GET_CATEGORIES,
            description: "Get all product categories available in the store. Use this when user asks 'what do you sell?' or 'what products do you have?'",
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
        },
        ToolDefinition {
            name: GET_PRODUCTS_BY_CATEGORY,
            description: "Get products in a specific category. ALWAYS use this when user asks about a specific category like 'show me [category]', 'what [category] do you have?', '[category] options', or says 'yes' after you mentioned a category. Also use it for 'other options' or 'more options' to show different products from the same category.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "category_name": string_param("Name of the category to search for (e.g., 'shoes', 'clothing', 'accessories')")
                },
                "required": ["category_name"]
            }),
        },
        ToolDefinition {
            name: GET_PRODUCT_DETAILS,
            description: "Get detailed information about a specific product. Use this when user asks about a specific product by name.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "product_name": string_param("Name of the product to get details for")
                },
                "required": ["product_name"]
            }),
        },
        ToolDefinition {
            name: SEARCH_PRODUCTS,
            description: "Search for products by name or description. Use this when user is looking for something specific or when you need to find products that might match a post context.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "search_term": string_param("Search term to find products")
                },
                "required": ["search_term"]
            }),
        },
        ToolDefinition {
            name: IDENTIFY_PRODUCT_FROM_POST_CONTEXT,
            description: "Identify product from post context when user replies to a post. Use this when the message contains post context and the user is asking about a product.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "post_caption": string_param("The post caption that might contain product information"),
                    "user_message": string_param("The user's message (e.g., 'price?', 'cost?')")
                },
                "required": ["post_caption", "user_message"]
            }),
        },
    ]
}

fn arg<'v>(args: &'v Value, key: &str) -> &'v str {
    args.get(key).and_then(Value::as_str).unwrap_or("")
}

fn to_value<T: Serialize>(result: Result<T, CatalogError>) -> Value {
    let encoded = match &result {
        Ok(data) => serde_json::to_value(data),
        Err(err) => serde_json::to_value(err),
    };
    encoded.unwrap_or_else(|err| json!({ "error": err.to_string() }))
}

/// Run one tool call against the catalog. Catalog failures and unknown tool
/// names come back as `{"error": ...}` data for the model; only arguments
/// that are not a JSON object are an error here.
pub async fn execute_tool(
    catalog: &CatalogService<'_>,
    name: &str,
    arguments: &str,
) -> Result<Value, ToolError> {
    let args = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str::<Value>(arguments).map_err(|source| ToolError::InvalidArguments {
            tool: name.to_string(),
            source,
        })?
    };
    info!(tool = name, arguments = %args, "executing tool call");

    let result = match name {
        GET_CATEGORIES => to_value(catalog.list_categories().await),
        GET_PRODUCTS_BY_CATEGORY => to_value(
            catalog
                .list_products_by_category(arg(&args, "category_name"))
                .await,
        ),
        GET_PRODUCT_DETAILS => to_value(
            catalog
                .get_product_details(arg(&args, "product_name"))
                .await,
        ),
        SEARCH_PRODUCTS => to_value(catalog.search_products(arg(&args, "search_term")).await),
        IDENTIFY_PRODUCT_FROM_POST_CONTEXT => to_value(
            catalog
                .identify_product_from_post_caption(
                    arg(&args, "post_caption"),
                    arg(&args, "user_message"),
                )
                .await,
        ),
        other => json!({ "error": format!("Unknown function: {other}") }),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use rust_decimal::Decimal;

    #[test]
    fn menu_has_five_tools_with_object_schemas() {
        let tools = tool_definitions();
        let names = tools.iter().map(|t| t.name).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "get_categories",
                "get_products_by_category",
                "get_product_details",
                "search_products",
                "identify_product_from_post_context",
            ]
        );
        for tool in &tools {
            assert_eq!(tool.parameters["type"], "object");
        }
        assert_eq!(
            tools[4].parameters["required"],
            json!(["post_caption", "user_message"])
        );
    }

    #[tokio::test]
    async fn dispatches_product_details() {
        let store = MemoryStore::new();
        let business = store.add_business("Shop", "page-1");
        store.add_product(
            business.id,
            None,
            "Trail Runner",
            "Grippy outsole",
            Decimal::new(8000, 2),
            4,
            Some(json!({ "sizes": [41, 42] })),
        );
        let catalog = CatalogService::new(&store, business.id);

        let result = execute_tool(&catalog, GET_PRODUCT_DETAILS, r#"{"product_name":"trail"}"#)
            .await
            .unwrap();

        assert_eq!(result["name"], "Trail Runner");
        assert_eq!(result["available"], true);
        assert_eq!(result["metadata"]["sizes"], json!([41, 42]));
        assert!(result.get("stock").is_none());
    }

    #[tokio::test]
    async fn catalog_misses_and_unknown_tools_are_error_data() {
        let store = MemoryStore::new();
        let business = store.add_business("Shop", "page-1");
        let catalog = CatalogService::new(&store, business.id);

        let missing = execute_tool(&catalog, GET_PRODUCTS_BY_CATEGORY, r#"{"category_name":"hats"}"#)
            .await
            .unwrap();
        assert_eq!(missing, json!({ "error": "Category 'hats' not found" }));

        let unknown = execute_tool(&catalog, "place_order", "{}").await.unwrap();
        assert_eq!(unknown, json!({ "error": "Unknown function: place_order" }));
    }

    #[tokio::test]
    async fn malformed_arguments_are_rejected() {
        let store = MemoryStore::new();
        let business = store.add_business("Shop", "page-1");
        let catalog = CatalogService::new(&store, business.id);

        let err = execute_tool(&catalog, SEARCH_PRODUCTS, "{search_term: boots")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn empty_arguments_are_treated_as_no_arguments() {
        let store = MemoryStore::new();
        let business = store.add_business("Shop", "page-1");
        store.add_category(None, "Accessories");
        let catalog = CatalogService::new(&store, business.id);

        let result = execute_tool(&catalog, GET_CATEGORIES, "").await.unwrap();

        assert_eq!(result["total_categories"], 1);
    }
}
