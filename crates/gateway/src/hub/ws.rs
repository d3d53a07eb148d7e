//! Hub WebSocket endpoint.
//!
//! One task per connection; a writer task drains an outbound queue into
//! the socket, each room subscription runs its own forwarder task, and
//! a watchdog enforces the 25 s idle timeout against the 10 s server
//! pings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{snapshot, HubContext};
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Deserialize)]
pub struct HubQuery {
    /// Bearer equivalent for browsers that cannot set headers on a
    /// WebSocket handshake.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn server_frame(event: &str, data: Value) -> Message {
    Message::Text(json!({ "event": event, "data": data }).to_string())
}

/// `GET /socket.io/` — upgrade to the dashboard WebSocket. When an API
/// key is configured the `token` query parameter must match it.
pub async fn hub_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<HubQuery>,
) -> impl IntoResponse {
    if let Some(expected_hash) = &state.api_key_hash {
        let provided = Sha256::digest(query.token.as_deref().unwrap_or("").as_bytes());
        if !bool::from(provided.ct_eq(expected_hash.as_slice())) {
            return (
                axum::http::StatusCode::UNAUTHORIZED,
                "invalid or missing token",
            )
                .into_response();
        }
    }
    let ctx = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
        .into_response()
}

async fn handle_socket(socket: WebSocket, ctx: Arc<HubContext>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let session = CancellationToken::new();
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    // Writer: the only task touching the sink.
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Heartbeat ping.
    let ping = {
        let tx = tx.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = session.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Idle watchdog.
    let watchdog = {
        let last_seen = last_seen.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if last_seen.lock().elapsed() > IDLE_TIMEOUT {
                    tracing::debug!("hub client idle past timeout, closing");
                    session.cancel();
                    break;
                }
            }
        })
    };

    let mut subscriptions: HashMap<String, CancellationToken> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => break,
            msg = stream.next() => msg,
        };
        let Some(Ok(msg)) = msg else { break };
        *last_seen.lock() = Instant::now();

        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    let _ = tx
                        .send(server_frame("error", json!({ "message": "bad frame" })))
                        .await;
                    continue;
                };
                handle_frame(&ctx, &tx, &mut subscriptions, frame).await;
            }
            Message::Close(_) => break,
            // Pings and pongs only refresh last_seen, done above.
            _ => {}
        }
    }

    for (_, token) in subscriptions {
        token.cancel();
    }
    session.cancel();
    ping.abort();
    watchdog.abort();
    drop(tx);
    writer.abort();
}

async fn handle_frame(
    ctx: &Arc<HubContext>,
    tx: &mpsc::Sender<Message>,
    subscriptions: &mut HashMap<String, CancellationToken>,
    frame: ClientFrame,
) {
    let topic = frame.data["topic"].as_str().unwrap_or_default().to_string();
    if !super::is_valid_topic(&topic) {
        let _ = tx
            .send(server_frame(
                "error",
                json!({ "message": format!("unknown topic: {topic}") }),
            ))
            .await;
        return;
    }

    match frame.event.as_str() {
        "subscribe" => {
            // Re-subscribing replaces the forwarder; the fresh snapshot
            // below is the client's new truth.
            if let Some(old) = subscriptions.remove(&topic) {
                old.cancel();
            }
            send_snapshot(ctx, tx, &topic).await;

            let token = CancellationToken::new();
            subscriptions.insert(topic.clone(), token.clone());
            spawn_forwarder(ctx.clone(), tx.clone(), topic, token);
        }
        "unsubscribe" => {
            if let Some(token) = subscriptions.remove(&topic) {
                token.cancel();
            }
        }
        "snapshot" => send_snapshot(ctx, tx, &topic).await,
        other => {
            let _ = tx
                .send(server_frame(
                    "error",
                    json!({ "message": format!("unknown event: {other}") }),
                ))
                .await;
        }
    }
}

async fn send_snapshot(ctx: &HubContext, tx: &mpsc::Sender<Message>, topic: &str) {
    match snapshot::build(ctx, topic) {
        Some(data) => {
            let _ = tx.send(server_frame(&format!("snapshot.{topic}"), data)).await;
        }
        None => {
            let _ = tx
                .send(server_frame(
                    "error",
                    json!({ "message": format!("no such entity for {topic}") }),
                ))
                .await;
        }
    }
}

/// Forward bus events for one room until unsubscribed or disconnected.
fn spawn_forwarder(
    ctx: Arc<HubContext>,
    tx: mpsc::Sender<Message>,
    topic: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut rx = ctx.bus.subscribe(&topic);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        let data = match serde_json::to_value(&event) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if tx
                            .send(server_frame(&format!("event.{topic}"), data))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(topic = %topic, skipped, "hub subscriber lagged");
                        let _ = tx
                            .send(server_frame(
                                &format!("lagged.{topic}"),
                                json!({ "skipped": skipped }),
                            ))
                            .await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
