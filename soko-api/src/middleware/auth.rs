use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

// ============================================================================
// Webhook Authentication Middleware
// ============================================================================

/// Telegram echoes the secret given to `setWebhook` on every delivery.
pub async fn webhook_secret_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(SECRET_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    let expected = state.webhook_secret.expose().as_bytes();
    if !presented.is_some_and(|p| constant_time_eq(p.as_bytes(), expected)) {
        warn!("Rejected webhook call with missing or wrong secret token");
        return AppError::AuthenticationError("Invalid secret token".to_string()).into_response();
    }

    next.run(req).await
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
