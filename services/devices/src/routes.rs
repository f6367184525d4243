//! Device service routes

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde_json::json;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult, DeviceError},
    history::ConversationKey,
    models::{
        CONNECTED_MARKER, ConnectOutcome, ConnectRequest, DisconnectRequest, SendMessageRequest,
    },
    state::AppState,
};

/// Create the router for the device service
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/devices/connect", post(connect_device))
        .route("/api/devices/disconnect", post(disconnect_device))
        .route("/api/devices/status", get(get_status))
        .route("/api/devices/status/:device_id", get(get_device))
        .route("/api/devices/reconnect-all", post(reconnect_all))
        .route("/api/devices/:device_id/messages", post(send_message))
        .route("/chat-history/stats", get(get_history_stats))
        .route("/chat-history", delete(clear_all_history))
        .route(
            "/chat-history/:device_id/:contact",
            get(get_history).delete(clear_history),
        )
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "devices-service"
    }))
}

/// Connect a device, returning a pairing code or `CONNECTED`
pub async fn connect_device(
    State(state): State<AppState>,
    Json(payload): Json<ConnectRequest>,
) -> ApiResult<impl IntoResponse> {
    info!(user_id = %payload.device.owner_user_id, "Connect requested");

    let result = match state
        .manager
        .connect(payload.device, payload.force_new)
        .await?
    {
        ConnectOutcome::Connected => json!(CONNECTED_MARKER),
        ConnectOutcome::Pairing(pairing) => json!(pairing),
    };

    Ok(Json(json!({ "result": result })))
}

/// Log a device out and delete its session
pub async fn disconnect_device(
    State(state): State<AppState>,
    Json(payload): Json<DisconnectRequest>,
) -> ApiResult<impl IntoResponse> {
    state.manager.disconnect(&payload.device_id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Every registered device plus chat statistics
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(
        state
            .manager
            .registry()
            .status_snapshot(&state.history)
            .await,
    )
}

/// One registered device
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let entry = state
        .manager
        .registry()
        .get(&device_id)
        .await
        .ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;

    Ok(Json(entry.status()))
}

/// Resume every persisted session
pub async fn reconnect_all(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let summary = state.manager.reconnect_all().await?;
    Ok(Json(summary))
}

/// Send a text through a connected device
pub async fn send_message(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(payload): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".to_string()));
    }

    let chat_id = if payload.to.contains('@') {
        payload.to
    } else {
        format!("{}@s.whatsapp.net", common::phone::digits_only(&payload.to))
    };

    state
        .manager
        .registry()
        .send_text(&device_id, &chat_id, &payload.text)
        .await?;

    Ok(Json(json!({ "sent": true, "to": chat_id })))
}

pub async fn get_history_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.history.stats().await)
}

pub async fn get_history(
    State(state): State<AppState>,
    Path((device_id, contact)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = ConversationKey::new(device_id, contact);
    let entries = state.history.entries(&key).await;

    Json(json!({
        "deviceId": key.device_id,
        "whatsappNumber": key.contact_number,
        "messageCount": entries.len(),
        "formatted": state.history.formatted(&key).await,
        "history": entries,
    }))
}

pub async fn clear_history(
    State(state): State<AppState>,
    Path((device_id, contact)): Path<(String, String)>,
) -> impl IntoResponse {
    let cleared = state
        .history
        .clear(&ConversationKey::new(device_id, contact))
        .await;
    Json(json!({ "cleared": cleared }))
}

pub async fn clear_all_history(State(state): State<AppState>) -> impl IntoResponse {
    let cleared = state.history.clear_all().await;
    Json(json!({ "cleared": cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        history::{ChatHistoryStore, Role},
        lifecycle::{ConnectionManager, LifecycleSettings},
        protocol::{ProtocolEvent, fake::FakeConnector},
        registry::DeviceRegistry,
        router::MessageRouter,
        session_store::SessionStore,
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::inference::{InferenceClient, InferenceConfig};
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        router: Router,
        history: ChatHistoryStore,
    }

    async fn app(scripts: Vec<Vec<ProtocolEvent>>) -> TestApp {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let registry = DeviceRegistry::new();
        let history = ChatHistoryStore::default();
        let inference = InferenceClient::new(InferenceConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: "secret".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        let router = MessageRouter::new(registry.clone(), history.clone(), inference, "sorry", "55");
        let settings = LifecycleSettings {
            pairing_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let manager = ConnectionManager::new(
            store,
            registry,
            Arc::new(FakeConnector::with_scripts(scripts)),
            router,
            settings,
        );

        TestApp {
            _dir: dir,
            router: create_router(AppState {
                manager,
                history: history.clone(),
            }),
            history,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn connect_body() -> Value {
        json!({
            "name": "Pousada Mar",
            "user_id": "owner-1",
            "whatsappNumber": "+55 (11) 98765-4321"
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = app(vec![]).await;
        let (status, body) = call(&app.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "devices-service");
    }

    #[tokio::test]
    async fn test_connect_returns_pairing_code_and_registers_device() {
        let app = app(vec![vec![ProtocolEvent::Qr {
            code: "2@pairing".to_string(),
        }]])
        .await;

        let (status, body) = call(&app.router, "POST", "/api/devices/connect", Some(connect_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["code"], "2@pairing");
        assert!(
            body["result"]["imageDataUrl"]
                .as_str()
                .unwrap()
                .starts_with("data:image/svg+xml;base64,")
        );

        let (status, device) = call(
            &app.router,
            "GET",
            "/api/devices/status/device-5511987654321",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(device["connected"], false);
        assert_eq!(device["whatsappNumber"], "5511987654321");
    }

    #[tokio::test]
    async fn test_connect_without_pairing_event_times_out() {
        let app = app(vec![vec![]]).await;
        let (status, body) = call(&app.router, "POST", "/api/devices/connect", Some(connect_body())).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body["error"].as_str().unwrap().contains("pairing"));
    }

    #[tokio::test]
    async fn test_connect_rejects_short_numbers() {
        let app = app(vec![]).await;
        let (status, _) = call(
            &app.router,
            "POST",
            "/api/devices/connect",
            Some(json!({ "name": "x", "user_id": "owner-1", "whatsappNumber": "123" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let app = app(vec![]).await;

        let (status, _) = call(&app.router, "GET", "/api/devices/status/device-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app.router,
            "POST",
            "/api/devices/device-1/messages",
            Some(json!({ "to": "5511911112222", "text": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_message_requires_text() {
        let app = app(vec![]).await;
        let (status, body) = call(
            &app.router,
            "POST",
            "/api/devices/device-1/messages",
            Some(json!({ "to": "5511911112222", "text": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "text must not be empty");
    }

    #[tokio::test]
    async fn test_chat_history_endpoints() {
        let app = app(vec![]).await;
        let key = ConversationKey::new("device-1", "5511911112222");
        app.history.append(&key, Role::User, "Is there a room?").await;
        app.history.append(&key, Role::Assistant, "Yes").await;

        let (_, stats) = call(&app.router, "GET", "/chat-history/stats", None).await;
        assert_eq!(stats["totalConversations"], 1);

        let (_, history) = call(&app.router, "GET", "/chat-history/device-1/5511911112222", None).await;
        assert_eq!(history["messageCount"], 2);
        assert_eq!(history["formatted"], "User: Is there a room?\nAssistant: Yes");

        let (_, cleared) = call(&app.router, "DELETE", "/chat-history/device-1/5511911112222", None).await;
        assert_eq!(cleared["cleared"], true);

        let (_, cleared) = call(&app.router, "DELETE", "/chat-history", None).await;
        assert_eq!(cleared["cleared"], 0);
    }
}
