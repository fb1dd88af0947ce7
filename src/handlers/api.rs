use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::models::{
    Cart, LineItem, PaymentConfirmation, PaymentToken, RepositoryError, ServiceError, StoreOrder,
};
use crate::observability::get_current_trace_id;
use crate::services::CartService;

/// Shared application state for the cart endpoints
#[derive(Clone)]
pub struct ApiState {
    pub cart_service: Arc<CartService>,
}

/// Body of `POST /api/panier/:user_id/articles`
#[derive(Debug, Deserialize, Serialize)]
pub struct AddArticleRequest {
    pub magasin: StoreOrder,
    pub article: LineItem,
    pub qte: u32,
}

/// Body of `PUT /api/panier/:user_id/articles`; a quantity below one removes the article
#[derive(Debug, Deserialize, Serialize)]
pub struct ChangeQuantityRequest {
    pub magasin: StoreOrder,
    pub article: LineItem,
    pub qte: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoveArticleRequest {
    pub magasin: StoreOrder,
    pub article: LineItem,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeliveryRequest {
    #[serde(rename = "heureLivraison")]
    pub delivery_time: DateTime<Utc>,
}

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;

/// Create API router with all cart endpoints
///
/// The current cart lives under its own prefix so that no user id is shadowed
/// by a static segment.
pub fn create_api_router(cart_service: Arc<CartService>) -> Router {
    Router::new()
        .route("/api/panier-courant", get(get_current_cart))
        .route("/api/panier-courant/livraison", put(change_delivery_date))
        .route("/api/panier/:user_id", get(get_cart))
        .route(
            "/api/panier/:user_id/articles",
            post(add_article)
                .put(change_article_quantity)
                .delete(remove_article),
        )
        .route("/api/panier/:user_id/livraison", post(persist_delivery_date))
        .route(
            "/api/residences/:residence_id/magasins",
            get(get_residence_stores),
        )
        .route("/api/pay", post(request_payment_token))
        .route("/api/pay/success", post(confirm_payment))
        .with_state(ApiState { cart_service })
}

// =============================================================================
// CART ENDPOINTS
// =============================================================================

/// The cart last loaded or changed through this service
#[instrument(name = "get_current_cart", skip(state))]
pub async fn get_current_cart(State(state): State<ApiState>) -> ApiResult<Cart> {
    state
        .cart_service
        .current_cart()
        .map(Json)
        .ok_or_else(|| service_error_to_response(ServiceError::NoCurrentCart))
}

/// Load a user's cart from the backend
#[instrument(name = "get_cart", skip(state), fields(user_id = %user_id))]
pub async fn get_cart(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> ApiResult<Cart> {
    match state.cart_service.fetch_cart(&user_id).await {
        Ok(cart) => {
            info!(stores = cart.stores.len(), "Cart retrieved");
            Ok(Json(cart))
        }
        Err(err) => {
            error!("Failed to get cart for user {}: {}", user_id, err);
            Err(service_error_to_response(err))
        }
    }
}

#[instrument(name = "add_article", skip(state, request), fields(
    user_id = %user_id,
    store_id = %request.magasin.id,
    denomination = %request.article.denomination,
    quantity = request.qte,
))]
pub async fn add_article(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(request): Json<AddArticleRequest>,
) -> ApiResult<Cart> {
    state
        .cart_service
        .add_item(&user_id, &request.magasin, &request.article, request.qte)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to add article: {}", err);
            service_error_to_response(err)
        })
}

#[instrument(name = "change_article_quantity", skip(state, request), fields(
    user_id = %user_id,
    store_id = %request.magasin.id,
    denomination = %request.article.denomination,
    quantity = request.qte,
))]
pub async fn change_article_quantity(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(request): Json<ChangeQuantityRequest>,
) -> ApiResult<Cart> {
    state
        .cart_service
        .change_item_quantity(&user_id, &request.magasin, &request.article, request.qte)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to change article quantity: {}", err);
            service_error_to_response(err)
        })
}

#[instrument(name = "remove_article", skip(state, request), fields(
    user_id = %user_id,
    store_id = %request.magasin.id,
    denomination = %request.article.denomination,
))]
pub async fn remove_article(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(request): Json<RemoveArticleRequest>,
) -> ApiResult<Cart> {
    state
        .cart_service
        .remove_item(&user_id, &request.magasin, &request.article)
        .await
        .map(Json)
        .map_err(|err| {
            warn!("Failed to remove article: {}", err);
            service_error_to_response(err)
        })
}

/// Draft edit of the current cart's delivery time, not persisted
#[instrument(name = "change_delivery_date", skip(state, request))]
pub async fn change_delivery_date(
    State(state): State<ApiState>,
    Json(request): Json<DeliveryRequest>,
) -> ApiResult<Cart> {
    state
        .cart_service
        .change_delivery_date(request.delivery_time)
        .map(Json)
        .map_err(service_error_to_response)
}

#[instrument(name = "persist_delivery_date", skip(state, request), fields(user_id = %user_id))]
pub async fn persist_delivery_date(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(request): Json<DeliveryRequest>,
) -> ApiResult<Cart> {
    state
        .cart_service
        .persist_delivery_date(&user_id, request.delivery_time)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to save delivery time: {}", err);
            service_error_to_response(err)
        })
}

// =============================================================================
// STORE AND PAYMENT ENDPOINTS
// =============================================================================

#[instrument(name = "get_residence_stores", skip(state), fields(residence_id = %residence_id))]
pub async fn get_residence_stores(
    State(state): State<ApiState>,
    Path(residence_id): Path<String>,
) -> ApiResult<Vec<StoreOrder>> {
    state
        .cart_service
        .fetch_stores_for_residence(&residence_id)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to list stores of residence {}: {}", residence_id, err);
            service_error_to_response(err)
        })
}

#[instrument(name = "request_payment_token", skip(state, cart))]
pub async fn request_payment_token(
    State(state): State<ApiState>,
    Json(cart): Json<Cart>,
) -> ApiResult<PaymentToken> {
    state
        .cart_service
        .get_payment_token(&cart)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to get payment token: {}", err);
            service_error_to_response(err)
        })
}

#[instrument(name = "confirm_payment", skip(state, confirmation), fields(payment_id = %confirmation.payment_id))]
pub async fn confirm_payment(
    State(state): State<ApiState>,
    Json(confirmation): Json<PaymentConfirmation>,
) -> ApiResult<Value> {
    state
        .cart_service
        .send_payment_confirmation(&confirmation)
        .await
        .map(Json)
        .map_err(|err| {
            error!("Failed to confirm payment: {}", err);
            service_error_to_response(err)
        })
}

/// Map a service error to its HTTP status and a `{error, timestamp}` body,
/// plus `trace_id` when the error happens inside a traced span
pub fn service_error_to_response(err: ServiceError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        ServiceError::ItemNoLongerInCart { .. } => StatusCode::CONFLICT,
        ServiceError::NoCurrentCart => StatusCode::NOT_FOUND,
        ServiceError::ValidationError { .. } => StatusCode::BAD_REQUEST,
        ServiceError::Repository { source } => match source {
            RepositoryError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        },
        ServiceError::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = json!({
        "error": err.to_string(),
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(trace_id) = get_current_trace_id() {
        body["trace_id"] = Value::String(trace_id);
    }

    (status, Json(body))
}
