use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

pub mod control;
pub mod error;
pub mod event;
pub mod middleware;
pub mod state;
pub mod telegram;
pub mod worker;

pub use error::AppError;
pub use state::AppState;

use event::InboundEvent;
use telegram::Update;

pub const WEBHOOK_PATH: &str = "/bot";

pub fn app(state: AppState) -> Router {
    let webhook = Router::new()
        .route(WEBHOOK_PATH, post(handle_update))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::webhook_secret_middleware,
        ));

    Router::new()
        .merge(webhook)
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /bot
///
/// Always answers 200 once the update is parsed; a failure is logged rather than
/// returned so Telegram does not redeliver the same update.
async fn handle_update(State(state): State<AppState>, Json(update): Json<Update>) -> StatusCode {
    let update_id = update.update_id;
    if let Err(e) = state.control.handle(InboundEvent::from(update)).await {
        error!(update_id, "Failed to handle update: {}", e);
    }
    StatusCode::OK
}

/// GET /health
async fn health(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let trains = state.repo.count_trains().await?;
    Ok(Json(json!({ "status": "ok", "trains": trains })))
}
