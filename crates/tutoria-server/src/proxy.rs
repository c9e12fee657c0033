//! Reverse proxy from `{prefix}/{code}/...` to the session's sandbox worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use tutoria_sandbox::RouteTable;

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the proxy handlers need.
#[derive(Clone)]
pub struct ProxyState {
    routes: Arc<RouteTable>,
    client: reqwest::Client,
    prefix: String,
}

impl ProxyState {
    pub fn new(routes: Arc<RouteTable>, prefix: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            routes,
            client,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn resolve(&self, code: &str) -> Option<SocketAddr> {
        self.routes.resolve(&format!("{}/{}", self.prefix, code))
    }
}

pub async fn proxy_root(
    State(state): State<ProxyState>,
    Path(code): Path<String>,
    req: Request,
) -> Response {
    forward(state, code, String::new(), req).await
}

pub async fn proxy_path(
    State(state): State<ProxyState>,
    Path((code, path)): Path<(String, String)>,
    req: Request,
) -> Response {
    forward(state, code, path, req).await
}

async fn forward(state: ProxyState, code: String, path: String, req: Request) -> Response {
    let Some(addr) = state.resolve(&code) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    let target = match req.uri().query() {
        Some(query) => format!("/{path}?{query}"),
        None => format!("/{path}"),
    };
    debug!(code = %code, %addr, %target, "proxying");

    if wants_upgrade(req.headers()) {
        return forward_websocket(addr, target, req).await;
    }
    forward_http(&state.client, addr, target, req).await
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
}

async fn forward_http(client: &reqwest::Client, addr: SocketAddr, target: String, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large").into_response(),
    };

    let mut upstream = client
        .request(parts.method, format!("http://{addr}{target}"))
        .body(body);
    for (name, value) in parts.headers.iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        upstream = upstream.header(name, value);
    }

    let resp = match upstream.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%addr, error = %e, "sandbox upstream unreachable");
            return bad_gateway();
        }
    };

    let mut builder = Response::builder().status(resp.status());
    for (name, value) in resp.headers().iter().filter(|(n, _)| !is_hop_by_hop(n)) {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| bad_gateway())
}

async fn forward_websocket(addr: SocketAddr, target: String, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let upstream = match tokio_tungstenite::connect_async(format!("ws://{addr}{target}")).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            warn!(%addr, error = %e, "sandbox websocket unreachable");
            return bad_gateway();
        }
    };
    upgrade.on_upgrade(move |client| bridge(client, upstream))
}

/// Pump frames both ways until either side closes.
async fn bridge(client: WebSocket, upstream: Upstream) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let Some(msg) = to_upstream_message(msg) else {
                continue;
            };
            let closing = msg.is_close();
            if upstream_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };
    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let Some(msg) = to_client_message(msg) else {
                continue;
            };
            let closing = matches!(msg, Message::Close(_));
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        () = to_upstream => {}
        () = to_client => {}
    }
}

fn to_upstream_message(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(UpstreamMessage::Binary(bytes)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client_message(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        UpstreamMessage::Binary(bytes) => Some(Message::Binary(bytes)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message as ClientFrame;

    async fn spawn(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        addr
    }

    async fn sandbox_listener() -> SocketAddr {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        spawn(tutoria_sandbox::listener::router(tx)).await
    }

    async fn proxy(routes: Arc<RouteTable>) -> SocketAddr {
        let state = ProxyState::new(routes, "/sandbox");
        let router = Router::new()
            .route("/sandbox/{code}", any(proxy_root))
            .route("/sandbox/{code}/{*path}", any(proxy_path))
            .with_state(state);
        spawn(router).await
    }

    #[tokio::test]
    async fn unknown_code_is_404() {
        let front = proxy(Arc::new(RouteTable::new())).await;
        let resp = reqwest::get(format!("http://{front}/sandbox/NOPE/test")).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn forwards_http_with_prefix_stripped() {
        let routes = Arc::new(RouteTable::new());
        routes.register("/sandbox/ABCD", sandbox_listener().await);
        let front = proxy(routes).await;

        let body = reqwest::get(format!("http://{front}/sandbox/ABCD/test"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "Hello, World!");

        let missing = reqwest::get(format!("http://{front}/sandbox/ABCD/elsewhere")).await.unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn preserves_path_and_query() {
        let echo = Router::new().fallback(|uri: axum::http::Uri| async move { uri.to_string() });
        let routes = Arc::new(RouteTable::new());
        routes.register("/sandbox/ABCD", spawn(echo).await);
        let front = proxy(routes).await;

        let body = reqwest::get(format!("http://{front}/sandbox/ABCD/a/b?x=1&y=2"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "/a/b?x=1&y=2");
    }

    #[tokio::test]
    async fn dead_upstream_is_502() {
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let routes = Arc::new(RouteTable::new());
        routes.register("/sandbox/ABCD", dead);
        let front = proxy(routes).await;

        let resp = reqwest::get(format!("http://{front}/sandbox/ABCD/test")).await.unwrap();
        assert_eq!(resp.status(), 502);
    }

    #[tokio::test]
    async fn bridges_websockets() {
        let routes = Arc::new(RouteTable::new());
        routes.register("/sandbox/ABCD", sandbox_listener().await);
        let front = proxy(routes).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{front}/sandbox/ABCD/wstest"))
            .await
            .unwrap();
        let greeting = ws.next().await.unwrap().unwrap();
        assert_eq!(greeting.into_text().unwrap().as_str(), tutoria_sandbox::listener::GREETING);

        ws.send(ClientFrame::text("through the proxy")).await.unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(echoed.into_text().unwrap().as_str(), "through the proxy");
    }
}
