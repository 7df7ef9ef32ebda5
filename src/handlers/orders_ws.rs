//! WebSocket handler for real-time order status streaming.
//!
//! Clients upgrade on `/orders/execute?orderId=<id>` and receive one
//! `backfill` message (the persisted row and full log history) followed by
//! `status_update` messages as the worker publishes transitions. The bus
//! subscription is registered before the backfill read, so events racing the
//! read queue up in the receiver and replay after backfill in causal order.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::orders;
use crate::models::order::{OrderEvent, OrderStatus};
use crate::AppState;

/// Close codes per the stream contract
pub const CLOSE_MISSING_ORDER_ID: u16 = 4000;
pub const CLOSE_NOT_FOUND: u16 = 4004;
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4029;
pub const CLOSE_SERVER_ERROR: u16 = 1011;

/// Concurrent streams allowed per (order, client IP)
pub const MAX_STREAMS_PER_CLIENT: u32 = 3;

/// Delay before closing a stream whose order is already terminal
const TERMINAL_LINGER: Duration = Duration::from_millis(100);

/// Tracks live stream counts per (order, client IP).
#[derive(Default)]
pub struct StreamConnectionRegistry {
    per_client: Mutex<HashMap<(Uuid, IpAddr), u32>>,
}

impl StreamConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a connection slot; None when the client is at the cap.
    pub fn try_acquire(
        self: &Arc<Self>,
        order_id: Uuid,
        client_ip: IpAddr,
    ) -> Option<ConnectionSlot> {
        let mut counts = self.per_client.lock();
        let count = counts.entry((order_id, client_ip)).or_insert(0);
        if *count >= MAX_STREAMS_PER_CLIENT {
            return None;
        }
        *count += 1;
        Some(ConnectionSlot {
            registry: self.clone(),
            order_id,
            client_ip,
        })
    }

    pub fn active(&self, order_id: Uuid, client_ip: IpAddr) -> u32 {
        self.per_client
            .lock()
            .get(&(order_id, client_ip))
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, order_id: Uuid, client_ip: IpAddr) {
        let mut counts = self.per_client.lock();
        if let Some(count) = counts.get_mut(&(order_id, client_ip)) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&(order_id, client_ip));
            }
        }
    }
}

/// RAII slot in the per-client connection budget.
pub struct ConnectionSlot {
    registry: Arc<StreamConnectionRegistry>,
    order_id: Uuid,
    client_ip: IpAddr,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.registry.release(self.order_id, self.client_ip);
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
}

/// Key order attributes carried in the backfill message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub token_in: String,
    pub token_out: String,
    pub amount_in: String,
    pub amount_out: Option<String>,
    pub dex_used: Option<String>,
    pub tx_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Messages sent to the stream client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    #[serde(rename = "backfill")]
    Backfill {
        #[serde(rename = "orderId")]
        order_id: Uuid,
        status: String,
        logs: serde_json::Value,
        order: OrderSnapshot,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "status_update")]
    StatusUpdate(OrderEvent),
    #[serde(rename = "error")]
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl StreamMessage {
    fn backfill(row: &orders::Model, timestamp: DateTime<Utc>) -> Self {
        StreamMessage::Backfill {
            order_id: row.id,
            status: row.status.clone(),
            logs: row.logs.clone(),
            order: OrderSnapshot {
                token_in: row.token_in.clone(),
                token_out: row.token_out.clone(),
                amount_in: row.amount_in.clone(),
                amount_out: row.amount_out.clone(),
                dex_used: row.dex_used.clone(),
                tx_hash: row.tx_hash.clone(),
                failure_reason: row.failure_reason.clone(),
            },
            timestamp,
        }
    }
}

/// GET /orders/execute?orderId=<id> - WebSocket upgrade for status streaming
pub async fn order_stream(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, addr.ip()))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: StreamQuery, client_ip: IpAddr) {
    let (mut sender, mut receiver) = socket.split();

    let order_id = match query.order_id.as_deref().map(Uuid::parse_str) {
        Some(Ok(order_id)) => order_id,
        _ => {
            close_with(&mut sender, CLOSE_MISSING_ORDER_ID, "missing_orderId").await;
            return;
        }
    };

    let _slot = match state.stream_connections.try_acquire(order_id, client_ip) {
        Some(slot) => slot,
        None => {
            warn!(order_id = %order_id, client_ip = %client_ip, "Stream cap reached");
            close_with(&mut sender, CLOSE_TOO_MANY_CONNECTIONS, "too_many_connections").await;
            return;
        }
    };

    // Subscribe first: events published during the backfill read buffer in
    // the receiver and replay after the backfill message.
    let mut subscription = state.bus.subscribe(order_id);

    let row = match state.repo.find(order_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            close_with(&mut sender, CLOSE_NOT_FOUND, "not_found").await;
            return;
        }
        Err(err) => {
            error!(order_id = %order_id, error = %err, "Backfill read failed");
            close_with(&mut sender, CLOSE_SERVER_ERROR, "server_error").await;
            return;
        }
    };

    info!(order_id = %order_id, client_ip = %client_ip, "Order stream connected");

    let backfill = StreamMessage::backfill(&row, state.clock.now());
    if send_json(&mut sender, &backfill).await.is_err() {
        return;
    }

    // A terminal order at backfill time produces no further updates
    if row
        .status
        .parse::<OrderStatus>()
        .map(|s| s.is_terminal())
        .unwrap_or(false)
    {
        sleep(TERMINAL_LINGER).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    run_tail_loop(&state, &mut sender, &mut receiver, &mut subscription.receiver).await;

    info!(order_id = %order_id, client_ip = %client_ip, "Order stream closed");
}

/// Bridge bus events to the client with heartbeats until the order settles
/// or the connection dies.
async fn run_tail_loop(
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    events: &mut broadcast::Receiver<OrderEvent>,
) {
    let mut heartbeat = tokio::time::interval(state.config.ping_interval);
    heartbeat.tick().await; // immediate first tick
    let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let terminal = event.status == OrderStatus::Confirmed.to_string()
                            || event.status == OrderStatus::Failed.to_string();
                        if send_json(sender, &StreamMessage::StatusUpdate(event)).await.is_err() {
                            break;
                        }
                        if terminal {
                            sleep(TERMINAL_LINGER).await;
                            let _ = sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Stream lagged behind the bus");
                        let message = StreamMessage::Error {
                            message: "stream lagged, reconnect for a fresh backfill".to_string(),
                            timestamp: state.clock.now(),
                        };
                        if send_json(sender, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Bus topic closed");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Box::pin(sleep(state.config.pong_timeout)));
                }
            }

            _ = async { pong_deadline.as_mut().expect("deadline armed").await }, if pong_deadline.is_some() => {
                pong_deadline = None;
                missed_pongs += 1;
                if missed_pongs >= 2 {
                    warn!("Client missed two consecutive pongs, terminating stream");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Stream closed by client");
                        break;
                    }
                    Some(Err(err)) => {
                        debug!(error = %err, "Stream receive error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(text.into())).await
}

async fn close_with(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_cap_rejects_the_fourth_stream() {
        let registry = Arc::new(StreamConnectionRegistry::new());
        let order_id = Uuid::new_v4();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let slots: Vec<_> = (0..3)
            .map(|_| registry.try_acquire(order_id, ip).unwrap())
            .collect();
        assert!(registry.try_acquire(order_id, ip).is_none());

        // Other IPs and orders are unaffected
        let other_ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(registry.try_acquire(order_id, other_ip).is_some());
        assert!(registry.try_acquire(Uuid::new_v4(), ip).is_some());

        drop(slots);
        assert_eq!(registry.active(order_id, ip), 0);
        assert!(registry.try_acquire(order_id, ip).is_some());
    }

    #[test]
    fn backfill_message_shape() {
        let now = Utc::now();
        let row = orders::Model {
            id: Uuid::new_v4(),
            order_type: "market".to_string(),
            token_in: "SOL".to_string(),
            token_out: "USDC".to_string(),
            amount_in: "1.0".to_string(),
            slippage: "0.05".to_string(),
            status: "confirmed".to_string(),
            amount_out: Some("100.2".to_string()),
            dex_used: Some("beta".to_string()),
            tx_hash: Some("0xabc".to_string()),
            failure_reason: None,
            expected_price: Some("100.5".to_string()),
            executed_price: Some("100.2".to_string()),
            quotes: serde_json::json!({}),
            logs: serde_json::json!([]),
            correlation_id: "c".to_string(),
            created_at: now.into(),
            updated_at: now.into(),
        };

        let json = serde_json::to_value(StreamMessage::backfill(&row, now)).unwrap();
        assert_eq!(json["type"], "backfill");
        assert_eq!(json["status"], "confirmed");
        assert_eq!(json["order"]["tokenIn"], "SOL");
        assert_eq!(json["order"]["txHash"], "0xabc");
        assert!(json["order"]["failureReason"].is_null());
    }
}
