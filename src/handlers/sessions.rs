//! Session diagnostics and explicit stop requests.

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// List live sessions, oldest first. Diagnostics only.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.snapshots().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// Ask the session for `client_id` to close. Teardown runs asynchronously;
/// the response only confirms the request was delivered.
pub async fn stop_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let client_id = path.into_inner();

    if !state.registry.stop(&client_id).await {
        return Err(AppError::NotFound(format!("no active session for client '{}'", client_id)));
    }

    info!(client_id = %client_id, "Stop requested over HTTP");
    Ok(HttpResponse::Accepted().json(json!({
        "status": "stopping",
        "client_id": client_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::link::testing::ScriptedConnector;
    use crate::relay::CloseReason;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::Value;
    use std::sync::Arc;

    fn app_state() -> web::Data<AppState> {
        web::Data::new(AppState::new(
            AppConfig::default(),
            Arc::new(ScriptedConnector::failing()),
        ))
    }

    #[actix_web::test]
    async fn test_list_sessions() {
        let state = app_state();
        state.registry.create("alice").await.unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/sessions", web::get().to(list_sessions)),
        )
        .await;
        let body: Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/sessions").to_request()).await;

        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["client_id"], "alice");
        assert_eq!(body["sessions"][0]["state"], "connecting");
    }

    #[actix_web::test]
    async fn test_stop_session() {
        let state = app_state();
        let session = state.registry.create("alice").await.unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/sessions/{client_id}", web::delete().to(stop_session)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::delete().uri("/sessions/alice").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(session.close_reason(), Some(CloseReason::StopRequested));

        let resp = test::call_service(
            &app,
            test::TestRequest::delete().uri("/sessions/nobody").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
