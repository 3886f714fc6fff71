//! HTTP and WebSocket server using Axum.

use crate::error::SandboxError;
use crate::protocol::{ClientEvent, SocketHandle};
use crate::registry::ContainerKey;
use crate::runtime::PortMap;
use crate::state::{AppState, ANONYMOUS_USER};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const USER_HEADER: &str = "x-user-id";

#[derive(Deserialize)]
struct SocketParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    environment: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    terminals: usize,
    containers: usize,
    #[serde(rename = "availablePorts")]
    available_ports: usize,
}

#[derive(Deserialize)]
struct CloneRequest {
    #[serde(rename = "repoUrl")]
    repo_url: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
struct CloneResponse {
    #[serde(rename = "projectId")]
    project_id: String,
    path: String,
}

type ApiError = (StatusCode, String);

pub fn router(state: AppState, frontend_url: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/projects/:project_id/ports", get(project_ports))
        .route("/api/projects/:project_id/clone", post(clone_project))
        .route("/api/projects/:project_id", delete(delete_project))
        .layer(cors_layer(frontend_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `addr` until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    frontend_url: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state, frontend_url);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(USER_HEADER)]);
    match HeaderValue::from_str(frontend_url) {
        Ok(origin) => cors.allow_origin(origin),
        Err(e) => {
            warn!(frontend_url, error = %e, "Invalid frontend URL, cross-origin requests disabled");
            cors
        }
    }
}

fn error_response(err: SandboxError) -> ApiError {
    let status = match &err {
        SandboxError::InvalidProjectId(_) | SandboxError::InvalidUserId(_) => StatusCode::BAD_REQUEST,
        SandboxError::NoPortsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SandboxError::Git(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn request_user(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        terminals: state.terminals.active_session_count(),
        containers: state.containers.container_count(),
        available_ports: state.containers.ports().available(),
    })
}

async fn project_ports(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PortMap>, ApiError> {
    let key = ContainerKey::new(request_user(&headers), project_id);
    state
        .containers
        .get_ports(&key)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("No container for {}", key)))
}

async fn clone_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CloneRequest>,
) -> Result<(StatusCode, Json<CloneResponse>), ApiError> {
    let user_id = request_user(&headers);
    let path = state
        .workspace
        .project_path(&user_id, &project_id)
        .map_err(error_response)?;

    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|e| error_response(e.into()))?;
    if exists {
        return Err((
            StatusCode::CONFLICT,
            format!("Project {} already exists", project_id),
        ));
    }

    state
        .workspace
        .clone_repo(&path, &req.repo_url, req.token.as_deref())
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(CloneResponse {
            project_id,
            path: path.display().to_string(),
        }),
    ))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = request_user(&headers);
    let path = state
        .workspace
        .project_path(&user_id, &project_id)
        .map_err(error_response)?;

    state
        .containers
        .stop_container(&ContainerKey::new(user_id, project_id))
        .await;
    state
        .workspace
        .delete_tree(&path)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: SocketParams, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (handle, mut events) = SocketHandle::channel();
    let socket_id = handle.id();
    let user_id = params
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());
    info!(%socket_id, user_id = %user_id, "Client connected");

    let sender = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                dispatch(&state, &handle, &user_id, params.environment.as_deref(), &text).await
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%socket_id, error = %e, "Socket read failed");
                break;
            }
        }
    }

    state.terminals.on_disconnect(socket_id).await;
    sender.abort();
    info!(%socket_id, "Client disconnected");
}

async fn dispatch(
    state: &AppState,
    socket: &SocketHandle,
    user_id: &str,
    default_environment: Option<&str>,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(socket_id = %socket.id(), error = %e, "Ignoring malformed message");
            return;
        }
    };

    match event {
        ClientEvent::Create {
            project_id,
            environment,
        } => {
            let environment = environment.as_deref().or(default_environment);
            // Failures were already reported to the client.
            let _ = state
                .terminals
                .on_create(socket, user_id, &project_id, environment)
                .await;
        }
        ClientEvent::Input { data } => state.terminals.on_input(socket.id(), &data),
        ClientEvent::Resize { cols, rows } => {
            state.terminals.on_resize(socket.id(), cols, rows).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use crate::environment::Environment;
    use crate::ports::PortAllocator;
    use crate::runtime::mock::MockRuntime;
    use crate::workspace::Workspace;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite;

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        mock: Arc<MockRuntime>,
        _dir: TempDir,
    }

    async fn spawn_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockRuntime::new());
        let state = AppState::new(
            mock.clone(),
            Arc::new(PortAllocator::new(3100, 1000, false)),
            Workspace::new(dir.path()),
            ContainerConfig::default(),
        );
        let app = router(state.clone(), "http://localhost:3000");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        TestServer {
            addr,
            state,
            mock,
            _dir: dir,
        }
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let tungstenite::Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let server = spawn_server().await;
        let body: Value = reqwest::get(format!("http://{}/health", server.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["terminals"], 0);
        assert_eq!(body["containers"], 0);
        assert_eq!(body["availablePorts"], 1000);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn websocket_terminal_session() {
        let server = spawn_server().await;
        let url = format!("ws://{}/ws?userId=u1", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(tungstenite::Message::Text("not json".into()))
            .await
            .unwrap();
        let create = json!({"type": "terminal:create", "projectId": "p1", "environment": "node"});
        ws.send(tungstenite::Message::Text(create.to_string()))
            .await
            .unwrap();

        let ready = next_json(&mut ws).await;
        assert_eq!(ready["type"], "terminal:ready");
        let ports = ready["ports"].as_object().unwrap();
        assert_eq!(ports.len(), 11);
        assert_eq!(ports["3000"], 3100);
        assert_eq!(ports["3010"], 3110);

        let input = json!({"type": "terminal:input", "data": "echo hi\n"});
        ws.send(tungstenite::Message::Text(input.to_string()))
            .await
            .unwrap();
        let mut output = String::new();
        while !output.contains("hi") {
            let frame = next_json(&mut ws).await;
            assert_eq!(frame["type"], "terminal:output");
            output.push_str(frame["data"].as_str().unwrap());
        }

        ws.close(None).await.unwrap();
        let terminals = server.state.terminals.clone();
        wait_until(|| terminals.active_session_count() == 0).await;
        assert_eq!(server.state.containers.container_count(), 1);
        let key = ContainerKey::new("u1", "p1");
        let info = server.state.containers.registry().get(&key).unwrap();
        assert_eq!(
            server.mock.container(&info.container_id).unwrap().spec.image,
            "codeblocking/node"
        );
    }

    #[tokio::test]
    async fn websocket_reports_missing_project() {
        let server = spawn_server().await;
        let url = format!("ws://{}/ws", server.addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        ws.send(tungstenite::Message::Text(
            json!({"type": "terminal:create"}).to_string(),
        ))
        .await
        .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "terminal:error");
        assert_eq!(frame["message"], "Project ID required");
    }

    #[tokio::test]
    async fn ports_endpoint_uses_user_header() {
        let server = spawn_server().await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/projects/p1/ports", server.addr);

        let missing = client.get(&url).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let dir = server.state.workspace.project_path("u7", "p1").unwrap();
        server
            .state
            .containers
            .ensure_container(&ContainerKey::new("u7", "p1"), Environment::Base, &dir)
            .await
            .unwrap();

        let anonymous = client.get(&url).send().await.unwrap();
        assert_eq!(anonymous.status(), reqwest::StatusCode::NOT_FOUND);

        let ports: Value = client
            .get(&url)
            .header(USER_HEADER, "u7")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ports["3005"], 3105);
    }

    #[tokio::test]
    async fn ports_endpoint_does_not_touch_the_runtime() {
        let server = spawn_server().await;
        let key = ContainerKey::new("u7", "p1");
        let dir = server.state.workspace.project_path("u7", "p1").unwrap();
        let info = server
            .state
            .containers
            .ensure_container(&key, Environment::Base, &dir)
            .await
            .unwrap();
        server.mock.kill(&info.container_id);

        let resp = reqwest::Client::new()
            .get(format!("http://{}/api/projects/p1/ports", server.addr))
            .header(USER_HEADER, "u7")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        // The dead container is only reconciled by the next terminal request.
        assert!(server.mock.container(&info.container_id).is_some());
        assert_eq!(server.state.containers.container_count(), 1);
        assert_eq!(server.state.containers.ports().leased().len(), 11);
    }

    #[tokio::test]
    async fn clone_rejects_existing_project_and_bad_ids() {
        let server = spawn_server().await;
        let client = reqwest::Client::new();
        let existing = server.state.workspace.project_path(ANONYMOUS_USER, "p1").unwrap();
        tokio::fs::create_dir_all(&existing).await.unwrap();

        let conflict = client
            .post(format!("http://{}/api/projects/p1/clone", server.addr))
            .json(&json!({"repoUrl": "https://github.com/acme/app.git"}))
            .send()
            .await
            .unwrap();
        assert_eq!(conflict.status(), reqwest::StatusCode::CONFLICT);

        let bad = client
            .post(format!("http://{}/api/projects/bad%20id/clone", server.addr))
            .json(&json!({"repoUrl": "https://github.com/acme/app.git"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let bad_user = client
            .post(format!("http://{}/api/projects/p2/clone", server.addr))
            .header(USER_HEADER, "..")
            .json(&json!({"repoUrl": "https://github.com/acme/app.git"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_user.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(bad_user.text().await.unwrap().contains("invalid user id"));
    }

    #[tokio::test]
    async fn failed_clone_reports_server_error() {
        let server = spawn_server().await;
        let missing = server._dir.path().join("no-such-repo.git");

        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/projects/p3/clone", server.addr))
            .json(&json!({"repoUrl": missing.to_string_lossy()}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_server_error());
        let path = server.state.workspace.project_path(ANONYMOUS_USER, "p3").unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn delete_stops_container_and_removes_tree() {
        let server = spawn_server().await;
        let key = ContainerKey::new("u1", "p1");
        let dir = server.state.workspace.project_path("u1", "p1").unwrap();
        let info = server
            .state
            .containers
            .ensure_container(&key, Environment::Python, &dir)
            .await
            .unwrap();
        tokio::fs::write(dir.join("main.py"), "print(1)").await.unwrap();

        let resp = reqwest::Client::new()
            .delete(format!("http://{}/api/projects/p1", server.addr))
            .header(USER_HEADER, "u1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        assert!(!dir.exists());
        assert!(server.mock.container(&info.container_id).is_none());
        assert!(server.state.containers.ports().leased().is_empty());
    }
}
