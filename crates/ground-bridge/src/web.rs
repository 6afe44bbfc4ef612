//! Minimal local HTTP surface: the `/state` broadcaster route and a
//! liveness probe, plus informative routes left as unimplemented stubs
//! since the local operator UI they back is out of scope here.

use crate::state::{run_state_broadcaster, ApplicationState};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{http::StatusCode, Router};
use std::sync::Arc;

pub fn build_router(app_state: Arc<ApplicationState>) -> Router {
    Router::new()
        .route("/state", get(state_ws_handler))
        .route("/healthz", get(healthz))
        .route("/cgi/{*path}", any(not_built_out))
        .route("/dmz/startUsingApplication", any(not_built_out))
        .with_state(app_state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn state_ws_handler(ws: WebSocketUpgrade, State(app_state): State<Arc<ApplicationState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_state_broadcaster(socket, app_state))
}

/// Local operator UI plumbing is an out-of-scope collaborator; these routes
/// are named but intentionally not built out.
async fn not_built_out() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = build_router(ApplicationState::new());
        let response =
            app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn informative_routes_are_stubbed_501() {
        let app = build_router(ApplicationState::new());
        let response = app
            .oneshot(Request::builder().uri("/dmz/startUsingApplication").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }
}
