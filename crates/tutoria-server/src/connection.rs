//! One session socket: a writer draining its send queue, a reader with the
//! keepalive ticker, and a dispatcher that applies inbound messages in order.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tutoria_core::{ClientMessage, ConnectionId, ControlRequest, ServerMessage};
use tutoria_telemetry::metrics::{WS_DISCONNECTIONS_TOTAL, WS_PING_TIMEOUTS_TOTAL, WS_REJECTIONS_TOTAL};

use crate::error::SessionError;
use crate::gateway::{Admission, Gateway, Inbound};
use crate::heartbeat::{Beat, Heartbeat};
use crate::registry::Outbound;
use crate::tasks::ConnectionTasks;

const INBOUND_QUEUE: usize = 64;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Run a session socket from upgrade to teardown.
pub async fn serve_socket(mut socket: WebSocket, gateway: Arc<Gateway>, code: String, identity: String) {
    let Admission { id, outbound, .. } = match gateway.admit(&code, &identity).await {
        Ok(admission) => admission,
        Err(e) => {
            reject(&mut socket, &e).await;
            return;
        }
    };

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(ws_tx, outbound));
    let tasks = ConnectionTasks::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    {
        let gateway = Arc::clone(&gateway);
        let code = code.clone();
        let id = id.clone();
        let dispatch_tasks = tasks.clone();
        tasks.spawn(move |cancel| {
            dispatch_loop(gateway, code, identity, id, inbound_rx, dispatch_tasks, cancel)
        });
    }

    let registry = Arc::clone(gateway.registry());
    let mut heartbeat = Heartbeat::new();
    let mut ticker = tokio::time::interval(gateway.keepalive().ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut writer_done = false;
    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => match heartbeat.on_tick() {
                Beat::SendPing => {
                    registry.send_to(&id, Outbound::Text(ServerMessage::ping().to_text()));
                }
                Beat::Terminate => {
                    counter!(WS_PING_TIMEOUTS_TOTAL).increment(1);
                    warn!(connection = %id, "ping timeout");
                    break "ping_timeout";
                }
                Beat::Idle => {}
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let forward = match ClientMessage::parse(text.as_str()) {
                        Ok(ClientMessage::Control { request }) => match request {
                            ControlRequest::Ping => {
                                registry.send_to(&id, Outbound::Text(ServerMessage::pong().to_text()));
                                None
                            }
                            ControlRequest::Pong => heartbeat.on_pong().then_some(Inbound::Pong),
                            ControlRequest::Open => Some(Inbound::Open),
                            ControlRequest::Stop => Some(Inbound::Stop),
                        },
                        Ok(ClientMessage::Document(record)) => Some(Inbound::Document(record)),
                        Err(e) => {
                            debug!(connection = %id, error = %e, "unparseable message");
                            registry.send_to(&id, Outbound::Text(ServerMessage::generic_error().to_text()));
                            None
                        }
                    };
                    if let Some(message) = forward {
                        if inbound_tx.send(message).await.is_err() {
                            break "dispatcher_stopped";
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    if heartbeat.on_pong() && inbound_tx.send(Inbound::Pong).await.is_err() {
                        break "dispatcher_stopped";
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "closed",
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %id, error = %e, "socket error");
                    break "socket_error";
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break "writer_closed";
            }
        }
    };

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    drop(inbound_tx);
    registry.unregister(&id);
    if heartbeat.is_terminated() {
        writer.abort();
    }

    let grace = gateway.keepalive().teardown_grace();
    if !tasks.shutdown(grace).await {
        info!(connection = %id, "connection tasks cancelled at teardown");
    }
    if let Err(e) = gateway.disconnect(&code, &id).await {
        warn!(connection = %id, error = %e, "disconnect bookkeeping failed");
    }
    if !writer_done && tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn dispatch_loop(
    gateway: Arc<Gateway>,
    code: String,
    identity: String,
    id: ConnectionId,
    mut inbound: mpsc::Receiver<Inbound>,
    tasks: ConnectionTasks,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = gateway.dispatch(&code, &identity, message, &tasks).await {
            if gateway.report(&id, &e) {
                info!(connection = %id, error = %e, "closing connection");
                break;
            }
            warn!(connection = %id, error = %e, "message handling failed");
        }
    }
}

async fn write_frames(mut sink: SplitSink<WebSocket, Message>, mut outbound: mpsc::Receiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        let sent = match frame {
            Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
            Outbound::Close(reason) => {
                let _ = sink.send(close_frame(reason)).await;
                break;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

async fn reject(socket: &mut WebSocket, err: &SessionError) {
    let reason = err
        .close_reason()
        .map(|r| r.to_string())
        .unwrap_or_else(|| ServerMessage::GENERIC_ERROR.to_string());
    counter!(WS_REJECTIONS_TOTAL, "reason" => reason.clone()).increment(1);
    info!(error = %err, "connection rejected");
    let _ = socket
        .send(Message::Text(err.client_message().to_text().into()))
        .await;
    let _ = socket.send(close_frame(reason)).await;
}

fn close_frame(reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    }))
}
