//! HTTP surface each worker exposes behind the reverse proxy.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::events::WorkerEvent;

pub const GREETING: &str = "Hello from server!";

#[derive(Clone)]
struct ListenerState {
    events: mpsc::Sender<WorkerEvent>,
}

impl ListenerState {
    fn emit(&self, event: WorkerEvent) {
        // dropping a line is preferable to stalling a request
        let _ = self.events.try_send(event);
    }
}

pub fn router(events: mpsc::Sender<WorkerEvent>) -> Router {
    Router::new()
        .route("/test", get(test_handler))
        .route("/wstest", get(ws_test_handler))
        .fallback(not_found)
        .with_state(ListenerState { events })
}

async fn test_handler(State(state): State<ListenerState>) -> &'static str {
    state.emit(WorkerEvent::Info("test route requested".into()));
    "Hello, World!"
}

async fn ws_test_handler(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| echo(socket, state))
}

async fn echo(socket: WebSocket, state: ListenerState) {
    let (mut tx, mut rx) = socket.split();
    state.emit(WorkerEvent::Info("websocket client connected".into()));
    if tx.send(Message::Text(GREETING.into())).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = rx.next().await {
        match msg {
            Message::Text(text) => {
                state.emit(WorkerEvent::Log(format!("message from client: {}", text.as_str())));
                if tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Message::Binary(bytes) => {
                if tx.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    state.emit(WorkerEvent::Info("websocket client disconnected".into()));
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}
