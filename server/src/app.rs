use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, POST_CONTEXT_TTL, PROCESSED_EVENT_RETENTION};
use crate::conversation::PostContextCache;
use crate::error::AppError;
use crate::gateway::{GraphApiClient, MessagingGateway};
use crate::llm::{LanguageModel, OpenAiClient};
use crate::responder::Responder;
use crate::store::{PgStore, Store};
use crate::webhook;

const DEFAULT_TEST_MESSAGE: &str = "Hello, what products do you have?";
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// One async lock per business so concurrent credential refreshes for the
/// same business apply in order.
#[derive(Default)]
pub struct CredentialLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl CredentialLocks {
    pub async fn for_business(&self, business_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(business_id).or_default().clone()
    }
}

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub responder: Responder,
    pub post_contexts: PostContextCache,
    pub credential_locks: CredentialLocks,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn Store>,
        gateway: Arc<dyn MessagingGateway>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let responder = Responder::new(store.clone(), model, config.ai.clone());
        Self {
            config,
            store,
            gateway,
            responder,
            post_contexts: PostContextCache::new(POST_CONTEXT_TTL),
            credential_locks: CredentialLocks::default(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhook/instagram",
            get(webhook::verify).post(webhook::receive),
        )
        .route(
            "/api/businesses/{business_id}/page-credentials",
            put(update_page_credentials),
        )
        .route("/api/businesses/{business_id}/subscribe", post(subscribe_page))
        .route("/api/businesses/{business_id}/ai/test", post(test_ai_reply))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn constant_time_eq(given: &[u8], expected: &[u8]) -> bool {
    given.len() == expected.len() && given.ct_eq(expected).into()
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(AppError::Forbidden("admin API disabled".to_string()));
    };
    match bearer_token(headers) {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

#[derive(Debug, Deserialize)]
struct PageCredentialsBody {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

async fn update_page_credentials(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<PageCredentialsBody>,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let access_token = body.access_token.trim();
    if access_token.is_empty() {
        return Err(AppError::BadRequest("access_token is required".to_string()));
    }
    let expires_at = match body.expires_in.filter(|seconds| *seconds > 0) {
        Some(seconds) => Some(
            chrono::Duration::try_seconds(seconds)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .ok_or_else(|| AppError::BadRequest("expires_in out of range".to_string()))?,
        ),
        None => None,
    };

    if state.store.business_by_id(business_id).await?.is_none() {
        return Err(AppError::NotFound(format!("business {business_id}")));
    }
    let lock = state.credential_locks.for_business(business_id).await;
    let _guard = lock.lock().await;
    let updated = state
        .store
        .update_page_credentials(business_id, access_token, expires_at)
        .await?;
    if !updated {
        return Err(AppError::NotFound(format!("business {business_id}")));
    }

    info!(business_id, ?expires_at, "page credentials updated");
    Ok(Json(json!({
        "success": true,
        "business_id": business_id,
        "expires_at": expires_at,
    })))
}

async fn subscribe_page(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let business = state
        .store
        .business_by_id(business_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("business {business_id}")))?;
    let page_id = business
        .instagram_page_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("business has no instagram page id".to_string()))?;
    let token = business
        .access_token()
        .ok_or_else(|| AppError::BadRequest("missing page access token".to_string()))?;

    let result = state
        .gateway
        .subscribe_page(page_id, token)
        .await
        .map_err(|err| AppError::Upstream(err.to_string()))?;
    Ok(Json(json!({ "success": true, "result": result })))
}

#[derive(Debug, Default, Deserialize)]
struct AiTestBody {
    #[serde(default)]
    message: Option<String>,
}

async fn test_ai_reply(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    require_admin(&state, &headers)?;
    let body = if body.is_empty() {
        AiTestBody::default()
    } else {
        serde_json::from_slice::<AiTestBody>(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid body: {err}")))?
    };
    if state.store.business_by_id(business_id).await?.is_none() {
        return Err(AppError::NotFound(format!("business {business_id}")));
    }
    let test_message = body
        .message
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TEST_MESSAGE.to_string());

    let response = state.responder.respond(business_id, &test_message, None).await;
    Ok(Json(json!({
        "success": true,
        "response": response,
        "business_id": business_id,
        "test_message": test_message,
    })))
}

async fn purge_expired(state: &AppState) {
    let purged = state.post_contexts.purge_expired().await;
    if purged > 0 {
        debug!(purged, "purged expired post contexts");
    }

    let Some(cutoff) = chrono::Duration::from_std(PROCESSED_EVENT_RETENTION)
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
    else {
        return;
    };
    match state.store.prune_processed_events(cutoff).await {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "pruned processed webhook events"),
        Err(err) => warn!(error = %err, "failed to prune processed webhook events"),
    }
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    if config.app_secret.is_none() {
        warn!("FB_APP_SECRET not set; webhook signatures will NOT be verified");
    }
    if config.ai.api_key.is_none() {
        warn!("OPENAI_API_KEY not set; every reply will be the fallback message");
    }
    if config.admin_token.is_none() {
        info!("ADMIN_TOKEN not set; admin API disabled");
    }

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;
    info!("database ready");

    let http = reqwest::Client::new();
    let gateway = GraphApiClient::new(http.clone(), config.graph_api_base.clone());
    let model = OpenAiClient::new(http, config.ai.clone());
    let addr = config.http_addr;

    let state = Arc::new(AppState::new(
        config,
        Arc::new(store),
        Arc::new(gateway),
        Arc::new(model),
    ));

    let purge_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            purge_expired(&purge_state).await;
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "storefront chat server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        })
        .await?;
    Ok(())
}
