use crate::error::{AppError, AppResult};
use crate::session::DeviceReply;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct DeviceMessageRequest {
    pub text: String,
}

fn encode(text: String) -> AppResult<String> {
    if text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }
    Ok(DeviceReply::text(text).to_json()?)
}

pub async fn list_devices(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let devices = state.hub.connected_devices().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": devices.len(),
        "devices": devices
    })))
}

pub async fn send_to_device(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<DeviceMessageRequest>,
) -> AppResult<HttpResponse> {
    let device_id = path.into_inner();
    let payload = encode(body.into_inner().text)?;

    state.hub.send_to_device(&device_id, payload).await?;
    info!(device_id = %device_id, "Message delivered to device queue");

    Ok(HttpResponse::Ok().json(json!({
        "status": "queued",
        "device_id": device_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub async fn broadcast(
    state: web::Data<AppState>,
    body: web::Json<DeviceMessageRequest>,
) -> AppResult<HttpResponse> {
    let payload = encode(body.into_inner().text)?;
    let delivered = state.hub.broadcast(payload).await?;
    info!(delivered, "Broadcast queued");

    Ok(HttpResponse::Ok().json(json!({
        "status": "queued",
        "delivered": delivered,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::{Session, SessionIdentity, SessionSettings};
    use crate::state::test_state;
    use crate::testing::{test_services, MemoryHistoryStore, StubTranscriber};
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn session(device_id: &str) -> Arc<Session> {
        let services = test_services(
            Arc::new(MemoryHistoryStore::default()),
            Arc::new(StubTranscriber::text("")),
        );
        Session::new(SessionIdentity::new(1, device_id, "1.0"), SessionSettings::default(), services)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .route("/api/v1/devices", web::get().to(list_devices))
                    .route("/api/v1/devices/{device_id}/messages", web::post().to(send_to_device))
                    .route("/api/v1/broadcast", web::post().to(broadcast)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_list_devices() {
        let state = test_state(AppConfig::default());
        state.hub.register(session("b")).await.unwrap();
        state.hub.register(session("a")).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/v1/devices").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["devices"], json!(["a", "b"]));
    }

    #[actix_web::test]
    async fn test_send_to_missing_device_is_404() {
        let state = test_state(AppConfig::default());
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/ghost/messages")
            .set_json(json!({ "text": "halo" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_send_and_broadcast() {
        let state = test_state(AppConfig::default());
        let connected = session("doll-1");
        state.hub.register(connected.clone()).await.unwrap();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/devices/doll-1/messages")
            .set_json(json!({ "text": "halo" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/api/v1/broadcast")
            .set_json(json!({ "text": "semua" }))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["delivered"], 1);

        let req = test::TestRequest::post()
            .uri("/api/v1/broadcast")
            .set_json(json!({ "text": "  " }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }
}
