use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Bearer-token check with the shared API key, applied to every
/// control-plane route.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if !is_authorized(header, &state.settings.api_key) {
        return ApiError::Unauthorized("Unauthorized".to_string()).into_response();
    }
    next.run(request).await
}

fn is_authorized(header: Option<&str>, api_key: &str) -> bool {
    header
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == api_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_bearer_key_passes() {
        assert!(is_authorized(Some("Bearer sekrit"), "sekrit"));
        assert!(!is_authorized(Some("Bearer wrong"), "sekrit"));
        assert!(!is_authorized(Some("sekrit"), "sekrit"));
        assert!(!is_authorized(Some("Basic sekrit"), "sekrit"));
        assert!(!is_authorized(None, "sekrit"));
    }
}
