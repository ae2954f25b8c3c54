//! Session inspection and administrative teardown.

use crate::error::{AppError, AppResult};
use crate::session::OrchestratorError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.orchestrator.list_sessions();
    Ok(HttpResponse::Ok().json(json!({
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`: a live session's summary, or the final status
/// of a recently ended one.
pub async fn get_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    match state.orchestrator.get_session(&session_id) {
        Ok(summary) => Ok(HttpResponse::Ok().json(json!({
            "live": true,
            "session": summary
        }))),
        Err(OrchestratorError::NotFound(_)) => {
            let status = state.orchestrator.get_status(&session_id)?;
            Ok(HttpResponse::Ok().json(json!({
                "live": false,
                "session": { "id": session_id, "status": status }
            })))
        }
        Err(e) => Err(AppError::from(e)),
    }
}

/// `DELETE /api/v1/sessions/{id}`
pub async fn end_session(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let status = state.orchestrator.end_session(&session_id).await?;
    info!(session_id = %session_id, status = %status, "Session ended via API");
    Ok(HttpResponse::Ok().json(json!({
        "id": session_id,
        "status": status
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionOptions, SessionStatus};
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_list_get_and_delete() {
        let state = test_state();
        let id = state
            .orchestrator
            .start_session("owner-1", SessionOptions::default())
            .await
            .unwrap();

        let app = test::init_service(
            App::new().app_data(web::Data::new(state.clone())).service(
                web::scope("/api/v1")
                    .route("/sessions", web::get().to(list_sessions))
                    .route("/sessions/{id}", web::get().to(get_session))
                    .route("/sessions/{id}", web::delete().to(end_session)),
            ),
        )
        .await;

        let listed: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/sessions").to_request()).await;
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["sessions"][0]["ownerId"], "owner-1");

        let uri = format!("/api/v1/sessions/{}", id);
        let deleted: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::delete().uri(&uri).to_request()).await;
        assert_eq!(deleted["status"], "closed");

        let ended: serde_json::Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(ended["live"], false);
        assert_eq!(ended["session"]["status"], "closed");
        assert_eq!(state.orchestrator.get_status(&id).unwrap(), SessionStatus::Closed);

        let missing = test::call_service(&app, test::TestRequest::get().uri("/api/v1/sessions/nope").to_request()).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
