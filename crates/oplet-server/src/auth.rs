//! Bearer-token runner resolution.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;

use oplet_store::StoreError;

use crate::error::ApiError;
use crate::state::AppState;

/// Resolves `Authorization: Bearer <token>` to a registered runner,
/// stamps its `contacted_at` and injects it into request extensions.
/// Everything else is a 403.
pub async fn require_runner(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();

    if token.is_empty() {
        return Err(ApiError::Forbidden);
    }

    let runners = state.runners();
    let runner = match runners.get_by_token(&token) {
        Ok(runner) => runner,
        Err(StoreError::NotFound) => {
            tracing::warn!("could not retrieve runner from token");
            return Err(ApiError::Forbidden);
        }
        Err(err) => return Err(err.into()),
    };

    runners.update_contacted_at(runner.id, Utc::now())?;

    request.extensions_mut().insert(runner);
    Ok(next.run(request).await)
}
