use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tallybook_core::{
    ClassificationSource, KeywordSet, Provenance, Rule, RuleDraft, RuleId, MANUAL_PRIORITY,
};
use tallybook_engine::{normalize, rule_name};
use tallybook_storage::get_all_rules;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::categorizer::{
    vendor_from, IngestedRow, LearnParams, LearnReport, ReviewResult, Stats, TransactionInput,
};
use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
const MANUAL_RULE_CONFIDENCE: f64 = 0.95;

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, request_id: &str) -> Self {
        Self { success: true, data: Some(data), error: None, request_id: request_id.to_string() }
    }

    pub fn error(message: &str, request_id: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.to_string()),
            request_id: request_id.to_string(),
        }
    }
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

fn reply<T>(result: Result<T, ApiError>, ok: StatusCode) -> Reply<T> {
    let req_id = request_id();
    match result {
        Ok(data) => (ok, Json(ApiResponse::success(data, &req_id))),
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                error!(request_id = %req_id, error = %e, "request failed");
            }
            (status, Json(ApiResponse::error(&e.to_string(), &req_id)))
        }
    }
}

// ── DTOs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRow {
    #[serde(default)]
    pub row_index: Option<u64>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub rows: Vec<ClassifyRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedRow {
    pub row_index: Option<u64>,
    pub description: String,
    pub vendor: Option<String>,
    pub rule_hit: Option<String>,
    pub rule_id: Option<RuleId>,
    pub main_category: String,
    pub sub_category: String,
    pub confidence: f64,
    pub source: ClassificationSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub rows: Vec<TransactionInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub main_category: String,
    pub sub_category: String,
}

/// Omitted fields fall back to the `[learn]` config section. Runs are dry
/// unless `dry_run` is explicitly false.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnRequest {
    pub min_frequency: Option<u32>,
    pub min_confidence: Option<f64>,
    pub reviewed_only: Option<bool>,
    pub max_rules: Option<usize>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    pub keywords: Vec<String>,
    pub main_category: String,
    pub sub_category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/classify", post(classify))
        .route("/transactions", post(ingest))
        .route("/transactions/{id}/review", post(review))
        .route("/learn-rules", post(learn_rules))
        .route("/rule-stats", get(rule_stats))
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/{id}/deactivate", post(deactivate_rule))
        .route("/clear-cache", post(clear_cache))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = request.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected) {
            return reply::<()>(Err(ApiError::Unauthorized), StatusCode::OK).into_response();
        }
    }
    next.run(request).await
}

// ── Handlers ──────────────────────────────────────────────────────────────────

pub async fn health_check(State(state): State<AppState>) -> Reply<HealthResponse> {
    let health = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
    };
    reply(Ok(health), StatusCode::OK)
}

pub async fn classify(
    State(state): State<AppState>,
    Json(payload): Json<ClassifyRequest>,
) -> Reply<Vec<ClassifiedRow>> {
    let mut out = Vec::with_capacity(payload.rows.len());
    for row in payload.rows {
        let c = state.categorizer.classify_one(&row.description).await;
        out.push(ClassifiedRow {
            row_index: row.row_index,
            vendor: vendor_from(&normalize(&row.description)),
            description: row.description,
            rule_id: c.rule_hit.as_ref().map(|r| r.id),
            rule_hit: c.rule_hit.map(|r| r.name),
            main_category: c.main_category,
            sub_category: c.sub_category,
            confidence: c.confidence,
            source: c.source,
        });
    }
    reply(Ok(out), StatusCode::OK)
}

pub async fn ingest(
    State(state): State<AppState>,
    Json(payload): Json<IngestRequest>,
) -> Reply<Vec<IngestedRow>> {
    reply(state.categorizer.ingest(&payload.rows).await, StatusCode::OK)
}

pub async fn review(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ReviewRequest>,
) -> Reply<ReviewResult> {
    let result = state
        .categorizer
        .review(id, payload.main_category.trim(), payload.sub_category.trim())
        .await;
    reply(result, StatusCode::OK)
}

pub async fn learn_rules(State(state): State<AppState>, body: Bytes) -> Reply<LearnReport> {
    let request: LearnRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LearnRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return reply(Err(ApiError::Validation(e.to_string())), StatusCode::OK),
        }
    };

    let defaults = &state.config.learn;
    let params = LearnParams {
        min_frequency: request.min_frequency.unwrap_or(defaults.min_frequency),
        min_confidence: request.min_confidence.unwrap_or(defaults.min_confidence),
        reviewed_only: request.reviewed_only.unwrap_or(defaults.reviewed_only),
        max_rules: request.max_rules.unwrap_or(defaults.max_rules),
        dry_run: request.dry_run.unwrap_or(true),
    };
    info!(?params, "learning run requested");
    reply(state.categorizer.learn(params).await, StatusCode::OK)
}

pub async fn rule_stats(State(state): State<AppState>) -> Reply<Stats> {
    reply(state.categorizer.stats().await, StatusCode::OK)
}

pub async fn list_rules(State(state): State<AppState>) -> Reply<Vec<Rule>> {
    let result = get_all_rules(state.categorizer.store().pool()).await.map_err(ApiError::from);
    reply(result, StatusCode::OK)
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(payload): Json<CreateRuleRequest>,
) -> Reply<Rule> {
    let result = async {
        let keywords = KeywordSet::new(&payload.keywords)?;
        let name = payload
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| rule_name("Manual", &keywords));
        let draft = RuleDraft {
            name,
            priority: payload.priority.unwrap_or(MANUAL_PRIORITY),
            keywords,
            main_category: payload.main_category.trim().to_string(),
            sub_category: payload.sub_category.trim().to_string(),
            frequency: 0,
            confidence: MANUAL_RULE_CONFIDENCE,
            created_by: Provenance::Manual,
        };
        draft.validate()?;
        Ok::<_, ApiError>(state.categorizer.store().append(&draft).await?)
    }
    .await;
    reply(result, StatusCode::CREATED)
}

pub async fn deactivate_rule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Reply<MessageResponse> {
    let result = state
        .categorizer
        .store()
        .deactivate(RuleId(id))
        .await
        .map(|()| MessageResponse { message: format!("Rule {id} deactivated") })
        .map_err(ApiError::from);
    reply(result, StatusCode::OK)
}

pub async fn clear_cache(State(state): State<AppState>) -> Reply<MessageResponse> {
    state.categorizer.store().invalidate();
    info!("rule cache cleared by request");
    reply(
        Ok(MessageResponse {
            message: "Rules cache cleared. Next request will reload from storage.".to_string(),
        }),
        StatusCode::OK,
    )
}
