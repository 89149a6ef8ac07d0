use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder, QuerySelect};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::entities::{card_log, fetch_log};
use crate::error::{FetchError, RejectReason};
use crate::ledger::Requester;
use crate::orchestrator::RetrievalService;
use crate::proxy::health::HealthRegistry;
use crate::transport::message::MailRecord;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub registry: Arc<HealthRegistry>,
    pub service: Arc<RetrievalService>,
}

async fn log_middleware(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    tracing::info!(">>> {} {}", method, uri);
    let res = next.run(req).await;
    tracing::info!("<<< {} {} -> {}", method, uri, res.status());
    res
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/fetch", post(fetch_mail))
        .route("/api/audit/card-logs", get(list_card_logs))
        .route("/api/audit/fetch-logs", get(list_fetch_logs))
        .route("/api/proxies/health", get(proxy_health))
        .route("/api/accounts/:id/test", post(test_account))
        .layer(middleware::from_fn(log_middleware))
        .with_state(state)
}

impl IntoResponse for FetchError {
    fn into_response(self) -> Response {
        let status = match &self {
            FetchError::CardRejected(RejectReason::NotFound) => StatusCode::NOT_FOUND,
            FetchError::CardRejected(_) => StatusCode::FORBIDDEN,
            FetchError::AccountUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FetchError::AuthFailed(_) | FetchError::NoRoute => StatusCode::BAD_GATEWAY,
            FetchError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            // Database detail stays in the logs.
            FetchError::Db(err) => {
                tracing::error!("request failed: {err}");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error_code": self.code(),
            "message": message,
        }));
        (status, body).into_response()
    }
}

#[derive(Deserialize)]
struct FetchBody {
    card_key: String,
}

#[derive(Serialize)]
struct FetchResponse {
    success: bool,
    account: String,
    mails: Vec<MailRecord>,
    parse_failures: u32,
    card: CardInfo,
    route: String,
}

#[derive(Serialize)]
struct CardInfo {
    remaining_uses: i32,
}

/// Redeem a card and return the matching mailbox contents. The key comes
/// from the JSON body or, for thin clients, the X-Card-Key header.
async fn fetch_mail(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<FetchBody>>,
) -> Response {
    let card_key = body
        .map(|Json(b)| b.card_key)
        .or_else(|| header_value(&headers, "x-card-key"));
    let Some(card_key) = card_key.filter(|key| !key.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_code": "missing_card_key",
                "message": "provide card_key in the body or the X-Card-Key header",
            })),
        )
            .into_response();
    };

    let requester = Requester {
        ip: header_value(&headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string())),
        user_agent: header_value(&headers, "user-agent"),
    };

    match state.service.redeem_and_fetch(card_key.trim(), &requester).await {
        Ok(outcome) => Json(FetchResponse {
            success: true,
            account: outcome.account_email,
            mails: outcome.records,
            parse_failures: outcome.parse_failures,
            card: CardInfo {
                remaining_uses: outcome.remaining_uses,
            },
            route: outcome.route,
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<u64>,
}

impl AuditQuery {
    fn limit(&self) -> u64 {
        self.limit.unwrap_or(100).min(1000)
    }
}

async fn list_card_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<card_log::Model>>, FetchError> {
    let rows = card_log::Entity::find()
        .order_by_desc(card_log::Column::CreatedAt)
        .limit(query.limit())
        .all(&state.db)
        .await?;
    Ok(Json(rows))
}

async fn list_fetch_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<fetch_log::Model>>, FetchError> {
    let rows = fetch_log::Entity::find()
        .order_by_desc(fetch_log::Column::CreatedAt)
        .limit(query.limit())
        .all(&state.db)
        .await?;
    Ok(Json(rows))
}

async fn proxy_health(State(state): State<AppState>) -> Response {
    Json(state.registry.snapshot().await).into_response()
}

async fn test_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.service.test_account(id).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => err.into_response(),
    }
}
