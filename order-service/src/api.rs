use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::OrderItem;
use uuid::Uuid;

use crate::handlers::OrderSaga;
use crate::models::{InvalidOrder, Order, PlaceOrder};
use crate::repository::OrderRepository;

/// Trusted caller identity, set by the gateway in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub saga: OrderSaga<dyn OrderRepository>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn user_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                format!("missing or invalid {} header", USER_ID_HEADER),
            )
        })
}

pub async fn create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let user_id = user_id(&headers)?;
    let command = PlaceOrder::new(user_id, request.items)
        .map_err(|e: InvalidOrder| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    match state.saga.place_order(command).await {
        Ok(order) => Ok((StatusCode::CREATED, Json(order))),
        Err(e) => {
            tracing::error!("Failed to place order for user {}: {}", user_id, e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to place order: {}", e),
            ))
        }
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    match state.saga.find_order(order_id).await {
        Ok(Some(order)) => Ok(Json(order)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("order {} not found", order_id),
        )),
        Err(e) => {
            tracing::error!("Failed to load order {}: {}", order_id, e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load order: {}", e),
            ))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}
