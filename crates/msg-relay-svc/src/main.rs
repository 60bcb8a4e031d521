//! Message Relay Service
//!
//! HTTP mediator for ceremony sessions. Serves the same surface as the
//! public relay so that devices on a local network can pair and exchange
//! round messages without leaving it.

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use clap::Parser;
use msg_relay::{MediatorStore, RelayError, RoundMessage, MESSAGE_ID_HEADER};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};

/// Message relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "msg-relay-svc")]
#[command(about = "Mediator service for threshold ceremonies")]
struct Args {
    /// Listen address
    #[arg(short, long, env = "LISTEN", default_value = "0.0.0.0:18080")]
    listen: String,

    /// Entry TTL in seconds
    #[arg(long, env = "MESSAGE_TTL", default_value = "3600")]
    ttl: i64,

    /// Expired entry sweep interval in seconds
    #[arg(long, default_value = "60")]
    cleanup_interval: u64,
}

/// Application state
struct AppState {
    store: MediatorStore,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!(
        listen = %args.listen,
        ttl = args.ttl,
        "Starting mediator service"
    );

    let state = Arc::new(AppState {
        store: MediatorStore::new(args.ttl),
    });

    // Spawn cleanup task
    let cleanup_store = state.store.clone();
    let cleanup_every = std::time::Duration::from_secs(args.cleanup_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        loop {
            interval.tick().await;
            cleanup_store.cleanup();
        }
    });

    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/:session_id",
            post(register_parties).get(get_participants).delete(delete_session),
        )
        .route(
            "/start/:session_id",
            post(start_session).get(get_committee),
        )
        .route(
            "/complete/:session_id",
            post(mark_complete).get(get_completed),
        )
        .route(
            "/complete/:session_id/keysign",
            post(mark_keysign_complete).get(get_keysign_complete),
        )
        .route("/message/:session_id", post(post_message))
        .route("/message/:session_id/:participant", get(get_messages))
        .route(
            "/message/:session_id/:participant/:hash",
            delete(delete_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body returned to clients
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let status = match e {
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            RelayError::Conflict(_) => StatusCode::CONFLICT,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

/// Party lists are accepted with or without a JSON content type
fn parse_parties(body: &Bytes) -> Result<Vec<String>, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("Invalid party list: {}", e)))
}

fn message_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

fn required_message_id(headers: &HeaderMap) -> Result<String, ApiError> {
    message_id(headers).ok_or_else(|| {
        ApiError(
            StatusCode::BAD_REQUEST,
            format!("{} header is empty", MESSAGE_ID_HEADER),
        )
    })
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "msg-relay-svc",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn register_parties(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let parties = parse_parties(&body)?;
    let all = state.store.register(&session_id, &parties);
    info!(session_id = %session_id, participants = ?all, "Parties registered");
    Ok(StatusCode::CREATED)
}

async fn get_participants(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.participants(&session_id) {
        Some(parties) => Json(parties).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.store.remove_session(&session_id);
    info!(session_id = %session_id, "Session removed");
    StatusCode::OK
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let committee = parse_parties(&body)?;
    state.store.start(&session_id, &committee).map_err(|e| {
        warn!(session_id = %session_id, error = %e, "Start rejected");
        ApiError::from(e)
    })?;
    info!(session_id = %session_id, committee = ?committee, "Session started");
    Ok(StatusCode::OK)
}

async fn get_committee(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.committee(&session_id) {
        Some(committee) => Json(committee).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mark_complete(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let parties = parse_parties(&body)?;
    let completed = state.store.mark_complete(&session_id, &parties);
    info!(session_id = %session_id, completed = ?completed, "Keygen completion recorded");
    Ok(StatusCode::CREATED)
}

async fn get_completed(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    match state.store.completed(&session_id) {
        Some(parties) => Json(parties).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mark_keysign_complete(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let message_id = required_message_id(&headers)?;
    state.store.put_signature(&session_id, &message_id, body);
    info!(session_id = %session_id, message_id = %message_id, "Keysign completion recorded");
    Ok(StatusCode::CREATED)
}

async fn get_keysign_complete(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let message_id = required_message_id(&headers)?;
    Ok(match state.store.signature(&session_id, &message_id) {
        Some(body) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let mut message: RoundMessage = serde_json::from_slice(&body)
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("Invalid message: {}", e)))?;
    message.session_id = session_id;
    let message_id = message_id(&headers);
    state.store.put_message(message_id.as_deref(), message)?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant)): Path<(String, String)>,
    headers: HeaderMap,
) -> Json<Vec<RoundMessage>> {
    let message_id = message_id(&headers);
    let messages = state
        .store
        .messages_for(&session_id, &participant, message_id.as_deref());
    debug!(
        session_id = %session_id,
        participant = %participant,
        count = messages.len(),
        "Messages fetched"
    );
    Json(messages)
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant, hash)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> StatusCode {
    let message_id = message_id(&headers);
    state
        .store
        .delete_message(&session_id, &participant, &hash, message_id.as_deref());
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_app() -> Router {
        app(Arc::new(AppState {
            store: MediatorStore::new(3600),
        }))
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let app = test_app();

        let response = app.clone().oneshot(request("GET", "/abc", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        for body in [r#"["P1"]"#, r#"["P1"]"#, r#"["P2"]"#] {
            let response = app.clone().oneshot(request("POST", "/abc", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app.clone().oneshot(request("GET", "/abc", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!(["P1", "P2"]));
    }

    #[tokio::test]
    async fn test_start_keeps_first_committee() {
        let app = test_app();

        let response = app.clone().oneshot(request("GET", "/start/abc", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(request("POST", "/start/abc", r#"["P1","P2"]"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request("POST", "/start/abc", r#"["P1","P3"]"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.clone().oneshot(request("GET", "/start/abc", "")).await.unwrap();
        assert_eq!(body_json(response).await, serde_json::json!(["P1", "P2"]));
    }

    #[tokio::test]
    async fn test_keysign_completion_requires_message_id() {
        let app = test_app();

        let response = app
            .clone()
            .oneshot(request("POST", "/complete/abc/keysign", r#"{"r":"01"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let post = Request::builder()
            .method("POST")
            .uri("/complete/abc/keysign")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::from(r#"{"r":"01"}"#))
            .unwrap();
        let response = app.clone().oneshot(post).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let get = Request::builder()
            .uri("/complete/abc/keysign")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(get).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({ "r": "01" }));

        let missing = Request::builder()
            .uri("/complete/abc/keysign")
            .header(MESSAGE_ID_HEADER, "h2")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_roundtrip_through_routes() {
        let app = test_app();
        let message = serde_json::json!({
            "session_id": "abc",
            "from": "P1",
            "to": ["P2"],
            "body": "Y2lwaGVy",
            "hash": "h-1",
            "sequence_no": 0
        });

        let post = Request::builder()
            .method("POST")
            .uri("/message/abc")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::from(message.to_string()))
            .unwrap();
        let response = app.clone().oneshot(post).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let get = Request::builder()
            .uri("/message/abc/P2")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(get).await.unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([message]));

        let delete = Request::builder()
            .method("DELETE")
            .uri("/message/abc/P2/h-1")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let get = Request::builder()
            .uri("/message/abc/P2")
            .header(MESSAGE_ID_HEADER, "h1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(get).await.unwrap();
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }
}
