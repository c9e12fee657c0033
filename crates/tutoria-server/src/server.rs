use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tutoria_core::{CodeGenerator, ServerMessage, Tutor};
use tutoria_sandbox::{RouteTable, SandboxControl, SandboxError, SandboxOrchestrator, SandboxSink};
use tutoria_settings::TutoriaSettings;
use tutoria_store::SessionStore;

use crate::connection;
use crate::control::SandboxController;
use crate::gateway::Gateway;
use crate::log_sink::StoreLogSink;
use crate::proxy::{self, ProxyState};
use crate::publish::Publisher;
use crate::registry::ConnectionRegistry;
use crate::sync::DialogueSynchronizer;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
        }
    }
}

impl From<&TutoriaSettings> for ServerConfig {
    fn from(settings: &TutoriaSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub store: Arc<dyn SessionStore>,
    pub proxy: ProxyState,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the session services around an already-built sandbox.
    pub fn with_sandbox(
        settings: &TutoriaSettings,
        store: Arc<dyn SessionStore>,
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RouteTable>,
        sandbox: Arc<dyn SandboxControl>,
        tutor: Arc<dyn Tutor>,
        codegen: Arc<dyn CodeGenerator>,
    ) -> Self {
        let publisher = Arc::new(Publisher::new(Arc::clone(&store), registry));
        let control = Arc::new(SandboxController::new(
            Arc::clone(&publisher),
            sandbox,
            codegen,
            settings.sandbox.route_prefix.clone(),
        ));
        let sync = DialogueSynchronizer::new(Arc::clone(&publisher), tutor);
        let gateway = Gateway::new(publisher, sync, control, settings.keepalive.clone());
        Self {
            gateway: Arc::new(gateway),
            store,
            proxy: ProxyState::new(routes, settings.sandbox.route_prefix.clone()),
            metrics: None,
        }
    }

    /// Wire everything with the process-backed sandbox orchestrator.
    pub fn assemble(
        settings: &TutoriaSettings,
        store: Arc<dyn SessionStore>,
        tutor: Arc<dyn Tutor>,
        codegen: Arc<dyn CodeGenerator>,
    ) -> Result<Self, SandboxError> {
        let registry = Arc::new(ConnectionRegistry::new(settings.server.max_send_queue));
        let routes = Arc::new(RouteTable::new());
        let sink: Arc<dyn SandboxSink> = Arc::new(StoreLogSink::new(Arc::new(Publisher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
        ))));
        let orchestrator = SandboxOrchestrator::new(&settings.sandbox, Arc::clone(&routes), sink)?;
        Ok(Self::with_sandbox(
            settings,
            store,
            registry,
            routes,
            Arc::new(orchestrator),
            tutor,
            codegen,
        ))
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn sandbox(&self) -> &Arc<dyn SandboxControl> {
        self.gateway.control().sandbox()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let prefix = state.proxy.prefix().to_string();
    let proxy_routes = Router::new()
        .route(&format!("{prefix}/{{code}}"), any(proxy::proxy_root))
        .route(&format!("{prefix}/{{code}}/{{*path}}"), any(proxy::proxy_path))
        .with_state(state.proxy.clone());

    Router::new()
        .route("/connect/{code}", get(connect_handler))
        .route("/session/{code}/identity", get(identity_handler))
        .route("/hello", get(hello_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(proxy_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;

    tracing::info!(%addr, "Tutoria server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    uuid: Option<String>,
}

async fn connect_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = query.uuid.unwrap_or_default();
    ws.on_upgrade(move |socket| connection::serve_socket(socket, state.gateway, code, identity))
}

async fn identity_handler(Path(code): Path<String>, State(state): State<AppState>) -> axum::response::Response {
    match state.store.get(&code).await {
        Ok(Some(record)) => Json(serde_json::json!({ "uuid": record.owner_identity })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Session not found").into_response(),
        Err(e) => {
            tracing::warn!(code = %code, error = %e, "identity lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ServerMessage::GENERIC_ERROR).into_response()
        }
    }
}

async fn hello_handler() -> &'static str {
    "hello"
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.gateway.registry().count(),
        "sandboxes": state.sandbox().running_count(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    match &state.metrics {
        Some(handle) => tutoria_telemetry::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::tests::FakeSandbox;
    use tutoria_core::SessionRecord;
    use tutoria_llm::{MockCodeGenerator, MockTutor};
    use tutoria_store::MemorySessionStore;

    fn state(records: Vec<SessionRecord>) -> AppState {
        let settings = TutoriaSettings::default();
        AppState::with_sandbox(
            &settings,
            Arc::new(MemorySessionStore::with_records(records)),
            Arc::new(ConnectionRegistry::new(16)),
            Arc::new(RouteTable::new()),
            Arc::new(FakeSandbox::default()),
            Arc::new(MockTutor::new(vec![])),
            Arc::new(MockCodeGenerator::returning("")),
        )
    }

    async fn serve(records: Vec<SessionRecord>) -> ServerHandle {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        start(config, state(records)).await.unwrap()
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = serve(vec![]).await;
        assert!(handle.port() > 0);

        let resp = reqwest::get(format!("http://{}/health", handle.addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["sandboxes"], 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn identity_lookup() {
        let handle = serve(vec![SessionRecord::new("ABCD", "u1", "en")]).await;

        let found: serde_json::Value = reqwest::get(format!("http://{}/session/ABCD/identity", handle.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(found, serde_json::json!({"uuid": "u1"}));

        let missing = reqwest::get(format!("http://{}/session/NOPE/identity", handle.addr))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        assert_eq!(missing.text().await.unwrap(), "Session not found");
    }

    #[tokio::test]
    async fn hello_and_disabled_metrics() {
        let handle = serve(vec![]).await;
        let hello = reqwest::get(format!("http://{}/hello", handle.addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(hello, "hello");

        let metrics = reqwest::get(format!("http://{}/metrics", handle.addr)).await.unwrap();
        assert_eq!(metrics.status(), 404);
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(state(vec![]));
    }
}
