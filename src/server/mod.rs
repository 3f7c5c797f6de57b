//! HTTP surface for the tool-execution layer and administrators.
//!
//! | Method | Path | Auth |
//! |--------|------|------|
//! | `GET` | `/health` | none |
//! | `POST` | `/v1/exec` | bearer |
//! | `POST` | `/v1/classify` | bearer |
//! | `POST` | `/v1/files/check` | bearer |
//! | `GET` | `/v1/sandbox/stats` | bearer |
//! | `DELETE` | `/v1/sandbox/{user_id}` | bearer |
//! | `POST` | `/v1/patterns/rescan` | bearer |

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use secrecy::SecretString;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::ServerError;
use crate::executor::CommandExecutor;

pub use auth::AuthState;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<CommandExecutor>,
}

/// Build the router. `auth_token = None` leaves the API routes open.
pub fn router(executor: Arc<CommandExecutor>, auth_token: Option<SecretString>) -> Router {
    let state = AppState { executor };

    let mut api = Router::new()
        .route("/v1/exec", post(handlers::exec))
        .route("/v1/classify", post(handlers::classify))
        .route("/v1/files/check", post(handlers::check_file))
        .route("/v1/sandbox/stats", get(handlers::sandbox_stats))
        .route("/v1/sandbox/{user_id}", delete(handlers::stop_sandbox))
        .route("/v1/patterns/rescan", post(handlers::rescan_patterns));

    match auth_token {
        Some(token) => {
            api = api.route_layer(middleware::from_fn_with_state(
                AuthState::new(token),
                auth::auth_middleware,
            ));
        }
        None => tracing::warn!("HTTP API running without authentication"),
    }

    Router::new()
        .route("/health", get(handlers::health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The listening HTTP server.
///
/// `start` binds and spawns the serve task; `shutdown` signals graceful
/// shutdown and waits for it.
pub struct ApiServer {
    addr: SocketAddr,
    app: Option<Router>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, app: Router) -> Self {
        Self {
            addr,
            app: Some(app),
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let app = self.app.take().ok_or_else(|| ServerError::Bind {
            addr: self.addr.to_string(),
            reason: "server already started".to_string(),
        })?;

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: self.addr.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(addr = %local_addr, "HTTP API listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("HTTP API shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "HTTP API error");
            }
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::config::ExecutorConfig;
    use crate::safety::SecurityGate;
    use crate::sandbox::config::SandboxConfig;
    use crate::sandbox::manager::SandboxManagerBuilder;
    use crate::sandbox::memory::InMemoryRuntime;

    const TOKEN: &str = "test-token";

    fn app() -> Router {
        let runtime = Arc::new(InMemoryRuntime::new());
        let sandbox = Arc::new(
            SandboxManagerBuilder::new()
                .config(SandboxConfig {
                    provision_command: String::new(),
                    ..SandboxConfig::default()
                })
                .runtime(runtime)
                .build(),
        );
        let gate = Arc::new(SecurityGate::with_defaults("/workspace"));
        let executor = Arc::new(CommandExecutor::new(gate, sandbox, ExecutorConfig::default()));
        router(executor, Some(SecretString::from(TOKEN)))
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sandbox_available"], true);
    }

    #[tokio::test]
    async fn test_api_requires_token() {
        let response = app()
            .oneshot(Request::get("/v1/sandbox/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app()
            .oneshot(
                Request::get("/v1/sandbox/stats")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_classify_route() {
        let response = app()
            .oneshot(authed(
                "POST",
                "/v1/classify",
                Some(json!({"command": "rm -rf ./x", "chat_type": "group"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["blocked"], true);
        assert_eq!(body["dangerous"], true);
    }

    #[tokio::test]
    async fn test_exec_route_runs_in_sandbox() {
        let app = app();
        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/v1/exec",
                Some(json!({"user_id": "123456", "command": "echo hello"})),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body, json!({"success": true, "output": "hello", "sandboxed": true}));

        let response = app
            .clone()
            .oneshot(authed("GET", "/v1/sandbox/stats", None))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["active_containers"], 1);
        assert_eq!(body["containers"][0]["user_id"], "123456");
        assert_eq!(body["containers"][0]["port_range"], "5560-5569");

        let response = app
            .clone()
            .oneshot(authed("DELETE", "/v1/sandbox/123456", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(authed("GET", "/v1/sandbox/stats", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["active_containers"], 0);
    }

    #[tokio::test]
    async fn test_exec_route_blocks() {
        let response = app()
            .oneshot(authed(
                "POST",
                "/v1/exec",
                Some(json!({"user_id": "1", "command": "printenv", "chat_type": "private"})),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["output"], "🚫 BLOCKED: Environment dump");
    }

    #[tokio::test]
    async fn test_stop_rejects_bad_user_id() {
        let response = app()
            .oneshot(authed("DELETE", "/v1/sandbox/bad%20id", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rescan_without_file_conflicts() {
        let response = app()
            .oneshot(authed("POST", "/v1/patterns/rescan", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_file_check_route() {
        let response = app()
            .oneshot(authed(
                "POST",
                "/v1/files/check",
                Some(json!({"user_id": "1", "path": "/etc/passwd"})),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "denied");
        assert_eq!(body["reason"], "Path outside workspace");
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut server = ApiServer::new("127.0.0.1:0".parse().unwrap(), app());
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.start().await.is_err());
        server.shutdown().await;
    }
}
