// =============================================================================
// WebSocket Handler — push subscriptions
// =============================================================================
//
// Clients connect to `/api/v1/ws` and drive subscriptions with JSON messages:
//   {"action":"subscribe","type":"orderbook","symbol":"BTC","exchange":"all"}
//   {"action":"unsubscribe","subscriptionId":"..."}
//   {"action":"ping"}
//
// The handler:
//   - Registers the connection with the hub and forwards its outbound queue.
//   - Pings every `client_ping_secs`; no frame from the client within one
//     interval closes the connection.
//   - Answers Ping frames with Pong frames.
//   - Removes the connection from the hub on every exit path.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs one connection until the client leaves, stops answering pings, or the
/// hub drops it as a slow consumer.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let hub = state.hub.clone();
    let mut conn = hub.connect();
    let id = conn.id;
    info!(connection = %id, "WebSocket connection accepted");

    let (mut sender, mut receiver) = socket.split();
    let mut ping = interval(state.client_ping_interval());
    ping.tick().await;
    let mut alive = true;

    loop {
        tokio::select! {
            _ = conn.closed.cancelled() => {
                debug!(connection = %id, "connection dropped by hub");
                break;
            }

            // ── Outbound: acks, snapshots and live updates ──────────────
            out = conn.outbound.recv() => {
                let Some(text) = out else { break };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(connection = %id, error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            // ── Liveness ────────────────────────────────────────────────
            _ = ping.tick() => {
                if !alive {
                    info!(connection = %id, "no response within ping interval — closing");
                    break;
                }
                alive = false;
                if let Err(e) = sender.send(Message::Ping(Vec::new())).await {
                    debug!(connection = %id, error = %e, "WebSocket ping failed — disconnecting");
                    break;
                }
            }

            // ── Inbound ─────────────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        alive = true;
                        hub.handle_client_message(id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        alive = true;
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(connection = %id, error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        alive = true;
                        debug!(connection = %id, "WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    hub.disconnect(id);
    let _ = sender.send(Message::Close(None)).await;
    info!(connection = %id, "WebSocket connection closed");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, SharedCache};
    use crate::market_data::MemoryTradeStore;
    use crate::runtime_config::RuntimeConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    /// Serve the full router on a local port; returns the push endpoint URL.
    async fn serve(client_ping_secs: u64) -> (Arc<AppState>, String) {
        let cache: SharedCache = Arc::new(MemoryCache::new());
        let config = RuntimeConfig {
            client_ping_secs,
            ..RuntimeConfig::default()
        };
        let state = Arc::new(AppState::new(config, cache, Arc::new(MemoryTradeStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/api/v1/ws", listener.local_addr().unwrap());
        let app = crate::api::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, url)
    }

    async fn wait_for_connections(state: &AppState, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.hub.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection count never reached {expected}"));
    }

    #[tokio::test]
    async fn ping_frames_are_answered_with_pong() {
        let (state, url) = serve(30).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        wait_for_connections(&state, 1).await;

        ws.send(WsMessage::Ping(b"hello".to_vec())).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Pong(data))) => return data,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pong, b"hello".to_vec());
    }

    #[tokio::test]
    async fn json_messages_reach_the_hub() {
        let (state, url) = serve(30).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        ws.send(WsMessage::Text(
            r#"{"action":"subscribe","type":"trades","symbol":"btc","subscriptionId":"t1"}"#.into(),
        ))
        .await
        .unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(text))) => return text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {other:?}"),
                }
            }
        })
        .await
        .unwrap();
        let ack: serde_json::Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(ack["type"], "subscribed");
        assert_eq!(ack["subscriptionId"], "t1");
        assert_eq!(state.hub.subscription_count(), 1);

        ws.close(None).await.unwrap();
        wait_for_connections(&state, 0).await;
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_the_ping_interval() {
        let (state, url) = serve(1).await;
        // Never polled, so the server's pings go unanswered.
        let (_silent, _) = connect_async(&url).await.unwrap();
        wait_for_connections(&state, 1).await;

        // One interval to send the ping, another to notice no reply.
        wait_for_connections(&state, 0).await;
    }
}
