//! Axum JSON API for ATSync.

use std::sync::Arc;

use atsync_adapters::{AdapterError, LinkTokenRequest, MergeAtsAdapter};
use atsync_core::{redact_token, DEFAULT_TABLE_NAME};
use atsync_sync::{BridgeRuntime, SyncError, SyncPipeline, SyncScope, DEFAULT_PAGE_SIZE};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

pub const CRATE_NAME: &str = "atsync-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    /// Needed only by the account-linking endpoints.
    pub merge: Option<Arc<MergeAtsAdapter>>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, merge: Option<Arc<MergeAtsAdapter>>) -> Self {
        Self { pipeline, merge }
    }

    pub fn from_runtime(runtime: &BridgeRuntime) -> Self {
        Self::new(runtime.pipeline.clone(), Some(runtime.merge.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    pub account_token: String,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub all_pages: Option<bool>,
}

impl SyncRequest {
    fn table(&self) -> &str {
        self.table_name.as_deref().unwrap_or(DEFAULT_TABLE_NAME)
    }

    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub public_token: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/create-link-token", post(create_link_token_handler))
        .route("/exchange-token", post(exchange_token_handler))
        .route("/merge-supabase/fetch-candidates", post(fetch_candidates_handler))
        .route("/merge-supabase/sync-candidates", post(sync_candidates_handler))
        .route(
            "/merge-supabase/get-transformed-candidates",
            post(transformed_candidates_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(runtime: BridgeRuntime) -> anyhow::Result<()> {
    let port = runtime.config.port;
    let router = app(AppState::from_runtime(&runtime))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn json_response(status: StatusCode, body: JsonValue) -> Response {
    (status, Json(body)).into_response()
}

fn failure(status: StatusCode, err: &SyncError) -> Response {
    json_response(
        status,
        json!({"success": false, "message": err.to_string(), "error_code": err.code()}),
    )
}

fn missing_token() -> Response {
    failure(
        StatusCode::BAD_REQUEST,
        &SyncError::Validation("account_token is required".into()),
    )
}

/// Unwrap a candidate request body, answering malformed JSON and a blank
/// token with the same failure shape as every other error.
fn sync_request(payload: Result<Json<SyncRequest>, JsonRejection>) -> Result<SyncRequest, Response> {
    let Json(request) = payload.map_err(|rejection| {
        failure(
            StatusCode::BAD_REQUEST,
            &SyncError::Validation(rejection.body_text()),
        )
    })?;
    if request.account_token.trim().is_empty() {
        return Err(missing_token());
    }
    Ok(request)
}

fn fetch_failure(err: &SyncError) -> Response {
    match err {
        SyncError::NoCandidates => json_response(
            StatusCode::NOT_FOUND,
            json!({"success": false, "message": "No candidates found or error fetching data"}),
        ),
        SyncError::Remote(_) => failure(StatusCode::BAD_GATEWAY, err),
        _ => failure(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn remote_failure(err: &AdapterError) -> Response {
    let status = err
        .remote_status()
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, json!({"detail": format!("Merge API error: {err}")}))
}

fn linking_unavailable() -> Response {
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"detail": "Merge client not configured"}),
    )
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({"status": "healthy"}))
}

async fn create_link_token_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LinkTokenRequest>,
) -> Response {
    let Some(merge) = &state.merge else {
        return linking_unavailable();
    };
    match merge.create_link_token(&request).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            error!(error = %err, "create link token failed");
            remote_failure(&err)
        }
    }
}

async fn exchange_token_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Response {
    let Some(merge) = &state.merge else {
        return linking_unavailable();
    };
    info!(user_id = request.user_id.as_deref().unwrap_or_default(), "token exchange requested");
    match merge.exchange_account_token(&request.public_token).await {
        Ok(link) => Json(link).into_response(),
        Err(err) => {
            error!(error = %err, "token exchange failed");
            remote_failure(&err)
        }
    }
}

async fn fetch_candidates_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let request = match sync_request(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    info!(account = %redact_token(&request.account_token), "fetch candidates requested");
    let fetched = state
        .pipeline
        .fetch(&request.account_token, request.limit(), request.offset())
        .await
        .and_then(|c| if c.is_empty() { Err(SyncError::NoCandidates) } else { Ok(c) });
    match fetched {
        Ok(candidates) => Json(json!({
            "success": true,
            "count": candidates.len(),
            "data": candidates,
        }))
        .into_response(),
        Err(err) => fetch_failure(&err),
    }
}

async fn sync_candidates_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let request = match sync_request(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let scope = if request.all_pages.unwrap_or(false) {
        SyncScope::AllPages
    } else {
        SyncScope::FirstPage
    };
    info!(table = request.table(), ?scope, "sync candidates requested");
    let result = state
        .pipeline
        .sync_scoped(&request.account_token, request.table(), scope)
        .await;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

async fn transformed_candidates_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SyncRequest>, JsonRejection>,
) -> Response {
    let request = match sync_request(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match state
        .pipeline
        .preview(&request.account_token, request.limit(), request.offset())
        .await
    {
        Ok(preview) => Json(json!({
            "success": true,
            "count": preview.count,
            "table_structure": preview.table_structure,
            "data": preview.data,
        }))
        .into_response(),
        Err(err) => fetch_failure(&err),
    }
}
