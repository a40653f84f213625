//! Status endpoint: read-only views over the latest engine snapshot.

use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::state::AppState;

/// Current call state, identity health and queue, with live media counters.
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let mut snapshot = state.engine.status().as_ref().clone();
    snapshot.media = state.engine.media().map(|m| m.stats());
    HttpResponse::Ok().json(snapshot)
}

pub async fn jobs(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.engine.status();
    HttpResponse::Ok().json(json!({
        "queue_depth": snapshot.queue_depth,
        "playing": snapshot.queue.playing,
        "pending": snapshot.queue.pending,
        "history": snapshot.queue.history,
    }))
}

pub async fn config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::idle_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_status_views() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(idle_state()))
                .route("/status", web::get().to(status))
                .route("/jobs", web::get().to(jobs))
                .route("/config", web::get().to(config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["joins_allowed"], false);
        assert!(body["media"].is_null());

        let req = test::TestRequest::get().uri("/jobs").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["queue_depth"], 0);
        assert_eq!(body["pending"], json!([]));

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["control"]["port"], 8082);
        assert_eq!(body["config"]["identities"]["user"], "interactive_call_session");
    }
}
