//! The WebSocket adapter over the stream fan-out. Each connection owns one
//! fan-out subscription keyed by its connection id.

pub mod messages;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use chrono::TimeZone;
use devlens_core::stream::DeliveryKind;
use devlens_model::Event;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use messages::{ClientMessage, ServerMessage};

const OUTGOING_BUFFER: usize = 256;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTGOING_BUFFER);
    debug!(conn = %conn_id, "websocket client connected");

    // Outgoing pump: everything the connection sends goes through `tx`.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender
                .send(Message::Text(message.to_json().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let heartbeat = Duration::from_millis(state.server_config.heartbeat_ms.max(1_000));
    let idle_close = Duration::from_millis(state.server_config.idle_close_ms.max(2_000));
    let mut heartbeat_tick = tokio::time::interval(heartbeat);
    heartbeat_tick.tick().await; // first tick is immediate
    let mut last_client_activity = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat_tick.tick() => {
                if last_client_activity.elapsed() > idle_close {
                    debug!(conn = %conn_id, "closing idle websocket client");
                    break;
                }
                let _ = tx
                    .send(ServerMessage::system("heartbeat", serde_json::Value::Null))
                    .await;
            }
            incoming = ws_receiver.next() => {
                let Some(Ok(message)) = incoming else { break };
                last_client_activity = Instant::now();
                match message {
                    Message::Text(text) => {
                        handle_control(&state, &conn_id, &tx, text.as_str()).await;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                    Message::Binary(_) => {}
                }
            }
        }
    }

    state.fanout.unsubscribe(&conn_id);
    send_task.abort();
    debug!(conn = %conn_id, "websocket client disconnected");
}

async fn handle_control(
    state: &AppState,
    conn_id: &str,
    tx: &mpsc::Sender<ServerMessage>,
    raw: &str,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(raw);
    let message = match parsed {
        Ok(message) => message,
        Err(err) => {
            let _ = tx
                .send(ServerMessage::system(
                    "error",
                    serde_json::json!({"message": format!("bad control message: {err}")}),
                ))
                .await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe(filter) => {
            let callback_tx = tx.clone();
            let callback = Arc::new(
                move |event: &Event, kind: DeliveryKind| {
                    let message = ServerMessage::Event {
                        event: event.clone(),
                        replayed: kind == DeliveryKind::Replay,
                    };
                    // A full outgoing buffer means a slow client; dropping
                    // here keeps the fan-out healthy and shows up in the
                    // subscriber's error counter.
                    callback_tx
                        .try_send(message)
                        .map_err(|err| -> devlens_core::stream::DeliveryError {
                            format!("outgoing buffer: {err}").into()
                        })
                },
            );
            state.fanout.subscribe(
                conn_id.to_string(),
                callback,
                filter.unwrap_or_default(),
            );
            let _ = tx
                .send(ServerMessage::system(
                    "subscribed",
                    serde_json::json!({"id": conn_id}),
                ))
                .await;
        }
        ClientMessage::Unsubscribe => {
            state.fanout.unsubscribe(conn_id);
            let _ = tx
                .send(ServerMessage::system("unsubscribed", serde_json::Value::Null))
                .await;
        }
        ClientMessage::UpdateFilter(filter) => {
            respond_result(
                tx,
                "filterUpdated",
                state.fanout.update_filter(conn_id, filter),
            )
            .await;
        }
        ClientMessage::Replay(args) => {
            let since = args
                .and_then(|args| args.since)
                .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single());
            match state.fanout.replay(conn_id, since) {
                Ok(count) => {
                    let _ = tx
                        .send(ServerMessage::system(
                            "replayed",
                            serde_json::json!({"count": count}),
                        ))
                        .await;
                }
                Err(err) => {
                    warn!(conn = %conn_id, error = %err, "replay failed");
                    let _ = tx
                        .send(ServerMessage::system(
                            "error",
                            serde_json::json!({"message": err.to_string()}),
                        ))
                        .await;
                }
            }
        }
    }
}

async fn respond_result(
    tx: &mpsc::Sender<ServerMessage>,
    ok_type: &'static str,
    result: devlens_core::Result<()>,
) {
    let message = match result {
        Ok(()) => ServerMessage::system(ok_type, serde_json::Value::Null),
        Err(err) => ServerMessage::system(
            "error",
            serde_json::json!({"message": err.to_string()}),
        ),
    };
    let _ = tx.send(message).await;
}
