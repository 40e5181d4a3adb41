//! HTTP routes: the WebSocket endpoint, connection stats, and the admin
//! endpoints that feed the hub and the stock coordinator.

use crate::auth::{MaybeWsAuth, TokenValidator};
use crate::stock::{BatchError, ProductId, StockCoordinator, StockLevel};
use crate::ws::hub::Hub;
use crate::ws::publisher::Publisher;
use crate::ws::types::UserId;
use crate::ws::upgrade::upgrade_handler;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state behind every route.
///
/// `V` resolves bearer tokens for the WebSocket endpoint.
pub struct AppState<V> {
    pub hub: Hub,
    pub publisher: Publisher,
    pub stock: StockCoordinator,
    pub tokens: Arc<V>,
}

impl<V> Clone for AppState<V> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            publisher: self.publisher.clone(),
            stock: self.stock.clone(),
            tokens: Arc::clone(&self.tokens),
        }
    }
}

#[async_trait]
impl<V> TokenValidator for AppState<V>
where
    V: TokenValidator<User = UserId> + Send + Sync + 'static,
{
    type User = UserId;
    type Error = V::Error;

    async fn validate_token(&self, token: &str) -> Result<UserId, Self::Error> {
        self.tokens.validate_token(token).await
    }
}

/// Standard response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub online_users: usize,
    pub total_connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StockFailure {
    pub product_id: ProductId,
    pub delta: i64,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchStockResult {
    pub applied: Vec<StockLevel>,
    #[serde(default)]
    pub failures: Vec<StockFailure>,
}

/// Builds the router for the realtime service.
pub fn router<V>(state: AppState<V>) -> Router
where
    V: TokenValidator<User = UserId> + Send + Sync + 'static,
{
    let admin_routes = Router::new()
        .route("/products/batch-stock", post(batch_stock_handler::<V>))
        .route("/notifications/promotion", post(promotion_handler::<V>));

    Router::new()
        .route("/ws", get(ws_handler::<V>))
        .route("/ws/stats", get(stats_handler::<V>))
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
}

// Authentication runs before the upgrade extractor so a bad token is a 401.
async fn ws_handler<V>(
    State(state): State<AppState<V>>,
    MaybeWsAuth(user_id): MaybeWsAuth<UserId>,
    ws: WebSocketUpgrade,
) -> Response
where
    V: TokenValidator<User = UserId> + Send + Sync + 'static,
{
    upgrade_handler(ws, state.hub, user_id).await
}

async fn stats_handler<V>(State(state): State<AppState<V>>) -> Json<ApiResponse<ConnectionStats>> {
    Json(ApiResponse::success(ConnectionStats {
        online_users: state.hub.online_user_count(),
        total_connections: state.hub.total_connections(),
    }))
}

async fn batch_stock_handler<V>(
    State(state): State<AppState<V>>,
    body: Result<Json<HashMap<ProductId, i64>>, JsonRejection>,
) -> Response {
    let updates = match body {
        Ok(Json(updates)) => updates,
        Err(rejection) => {
            warn!("Rejected batch stock body: {}", rejection);
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::error(rejection.body_text())),
            )
                .into_response();
        }
    };

    match state.stock.apply_batch(updates).await {
        Ok(report) => Json(ApiResponse::success(BatchStockResult {
            applied: report.applied,
            failures: Vec::new(),
        }))
        .into_response(),
        Err(BatchError::EmptyBatch) => (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(BatchError::EmptyBatch.to_string())),
        )
            .into_response(),
        Err(err) => {
            let message = err.to_string();
            let BatchError::PartialFailure {
                applied, failures, ..
            } = err
            else {
                return (StatusCode::BAD_REQUEST, Json(ApiResponse::<()>::error(message)))
                    .into_response();
            };
            let failures = failures
                .into_iter()
                .map(|f| StockFailure {
                    product_id: f.product_id,
                    delta: f.delta,
                    error: f.error.to_string(),
                })
                .collect();
            let body = ApiResponse {
                success: false,
                data: Some(BatchStockResult { applied, failures }),
                error: Some(message),
            };
            (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
        }
    }
}

async fn promotion_handler<V>(
    State(state): State<AppState<V>>,
    body: Result<Json<PromotionRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::error(rejection.body_text())),
            )
                .into_response();
        }
    };
    if request.title.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error("promotion title is required")),
        )
            .into_response();
    }

    state.publisher.broadcast_promotion(&request.title, &request.content);
    info!(title = %request.title, "Promotion broadcast.");
    Json(ApiResponse::success(ConnectionStats {
        online_users: state.publisher.online_user_count(),
        total_connections: state.publisher.total_connections(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HubConfig, StockConfig};
    use crate::stock::{MemoryStockStore, ProductStatus, StockStore};
    use crate::ws::message::Event;
    use crate::ws::types::{Outbound, SessionHandle};
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct NumericTokens;

    #[derive(Debug, thiserror::Error)]
    #[error("invalid token")]
    struct InvalidToken;

    #[async_trait]
    impl TokenValidator for NumericTokens {
        type User = UserId;
        type Error = InvalidToken;

        async fn validate_token(&self, token: &str) -> Result<UserId, InvalidToken> {
            token.parse().map_err(|_| InvalidToken)
        }
    }

    fn test_state() -> (AppState<NumericTokens>, Arc<MemoryStockStore>) {
        let hub = Hub::new(HubConfig::default());
        let store = Arc::new(MemoryStockStore::new());
        store.insert(1, "Teapot", 10, ProductStatus::Active);
        store.insert(2, "Cup", 0, ProductStatus::OutOfStock);
        let stock = StockCoordinator::new(
            Arc::clone(&store) as Arc<dyn StockStore>,
            &StockConfig::default(),
        );
        let state = AppState {
            publisher: Publisher::new(hub.clone()),
            hub,
            stock,
            tokens: Arc::new(NumericTokens),
        };
        (state, store)
    }

    async fn connect(hub: &Hub, user_id: Option<UserId>) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        hub.register(SessionHandle::new(Uuid::new_v4(), user_id, tx)).await;
        rx
    }

    #[tokio::test]
    async fn test_stats_reports_users_and_connections() {
        let (state, _) = test_state();
        let _a = connect(&state.hub, Some(1)).await;
        let _b = connect(&state.hub, None).await;
        let server = TestServer::new(router(state)).unwrap();

        let response = server.get("/ws/stats").await;
        response.assert_status_ok();
        let body: ApiResponse<ConnectionStats> = response.json();
        assert!(body.success);
        let stats = body.data.unwrap();
        assert_eq!(stats.online_users, 1);
        assert_eq!(stats.total_connections, 2);
    }

    #[tokio::test]
    async fn test_batch_stock_success() {
        let (state, store) = test_state();
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .post("/api/v1/admin/products/batch-stock")
            .json(&json!({"1": -5, "2": 3}))
            .await;
        response.assert_status_ok();
        let body: ApiResponse<BatchStockResult> = response.json();
        assert!(body.success);
        assert_eq!(body.data.unwrap().applied.len(), 2);

        assert_eq!(store.stock_level(1).await.unwrap().stock, 5);
        let cup = store.stock_level(2).await.unwrap();
        assert_eq!(cup.stock, 3);
        assert_eq!(cup.status, ProductStatus::Active);
    }

    #[tokio::test]
    async fn test_batch_stock_rejects_empty_and_malformed() {
        let (state, _) = test_state();
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .post("/api/v1/admin/products/batch-stock")
            .json(&json!({}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: ApiResponse<Value> = response.json();
        assert!(!body.success);
        assert!(body.error.is_some());

        let response = server
            .post("/api/v1/admin/products/batch-stock")
            .json(&json!({"1": "lots"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_stock_partial_failure_reports_details() {
        let (state, store) = test_state();
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .post("/api/v1/admin/products/batch-stock")
            .json(&json!({"1": -50, "2": 4}))
            .await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: ApiResponse<BatchStockResult> = response.json();
        assert!(!body.success);
        let result = body.data.unwrap();
        assert_eq!(result.applied.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].product_id, 1);

        assert_eq!(store.stock_level(1).await.unwrap().stock, 10);
        assert_eq!(store.stock_level(2).await.unwrap().stock, 4);
    }

    #[tokio::test]
    async fn test_promotion_reaches_every_session() {
        let (state, _) = test_state();
        let mut user = connect(&state.hub, Some(3)).await;
        let mut anonymous = connect(&state.hub, None).await;
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .post("/api/v1/admin/notifications/promotion")
            .json(&json!({"title": "Sale", "content": "Half price"}))
            .await;
        response.assert_status_ok();

        for rx in [&mut user, &mut anonymous] {
            let message = rx.recv().await.unwrap();
            match &message.event {
                Event::Promotion(promotion) => assert_eq!(promotion.title, "Sale"),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_promotion_requires_title() {
        let (state, _) = test_state();
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .post("/api/v1/admin/notifications/promotion")
            .json(&json!({"title": " ", "content": "x"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_websocket_rejects_invalid_token() {
        let (state, _) = test_state();
        let server = TestServer::new(router(state)).unwrap();

        let response = server
            .get("/ws")
            .add_query_param("token", "not-a-number")
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
    }
}
