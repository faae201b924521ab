//! Gateway (§4.12): the realtime transport. Connection auth, per-user
//! rooms, state-snapshot-on-connect, and server→client event fan-out.
//!
//! Grounded directly on `main.rs`'s `websocket_handler`/`handle_socket`/
//! `websocket_broadcaster` trio: an `axum::extract::ws` upgrade, a
//! `tokio::select!` loop multiplexing inbound client frames against a
//! `broadcast::Receiver`, with room routing layered on top by filtering
//! each `RoutedEvent` against the connection's bound user id (real or
//! `anon-<connectionId>`) — the single broadcast channel the engine
//! already emits through preserves per-subscriber delivery order (§5
//! "ordering guarantees"), so no separate per-user registry is needed.

use crate::auth::jwt::JwtHandler;
use crate::config::Config;
use crate::engine::{GameEngineHandle, PlaceBetRequest};
use crate::errors::EngineError;
use crate::models::BetStatus;
use crate::protocol::{
    BetConfirmedPayload, BetRefundedPayload, BetRejectedPayload, BetSettledPayload, ClientMessage,
    EventTarget, RoundStartPayload, ServerEvent, StateSnapshotPayload,
};
use crate::store::Store;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Clone)]
pub struct GatewayState {
    pub engine: GameEngineHandle,
    pub events: broadcast::Sender<crate::protocol::RoutedEvent>,
    pub store: Arc<dyn Store>,
    pub jwt: Arc<JwtHandler>,
    pub config: Arc<Config>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

fn origin_allowed(allowlist: &[String], origin: Option<&str>) -> bool {
    if allowlist.iter().any(|a| a == "*") {
        return true;
    }
    match origin {
        Some(origin) => allowlist.iter().any(|a| a == origin),
        // No Origin header at all (native clients, curl) is not a browser
        // cross-site request; only same-origin-capable browsers send one.
        None => true,
    }
}

/// Token from the `?token=` query param or a `session=` cookie — a
/// websocket upgrade request can't carry an `Authorization` header from a
/// browser client, so both of the REST layer's lookup sites collapse to
/// these two for the handshake.
fn extract_ws_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(token) = query.get("token") {
        return Some(token.clone());
    }
    let cookie_header = headers.get("cookie")?.to_str().ok()?;
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        pair.strip_prefix("session=").map(|v| v.to_string())
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> Response {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !origin_allowed(&state.config.origin_allowlist, origin) {
        warn!(?origin, "websocket upgrade rejected: origin not allowed");
        return (axum::http::StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let connection_id = Uuid::new_v4().to_string();
    let bound_user = extract_ws_token(&headers, &query)
        .and_then(|token| state.jwt.validate_token(&token).ok())
        .map(|claims| claims.sub);

    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id, bound_user))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: GatewayState,
    connection_id: String,
    mut bound_user: Option<String>,
) {
    let anon_id = format!("anon-{connection_id}");
    info!(connection_id, user = bound_user.as_deref(), "websocket connected");

    if send_state_snapshot(&mut socket, &state, bound_user.as_deref(), None).await.is_err() {
        return;
    }
    if replay_legacy_init(&mut socket, &state).await.is_err() {
        return;
    }
    if let Some(user_id) = bound_user.as_deref() {
        if replay_user_bets(&mut socket, &state, user_id).await.is_err() {
            return;
        }
    }

    let mut events_rx = state.events.subscribe();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        let room_id = bound_user.clone().unwrap_or_else(|| anon_id.clone());
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_event(&mut socket, &ServerEvent::Pong).await.is_err() {
                    break;
                }
            }
            routed = events_rx.recv() => {
                match routed {
                    Ok(routed) => {
                        let deliver = match &routed.target {
                            EventTarget::Broadcast => true,
                            EventTarget::User(uid) => uid == &room_id,
                        };
                        if deliver && send_event(&mut socket, &routed.event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(connection_id, skipped, "gateway event receiver lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(&text, &mut socket, &state, &mut bound_user, &connection_id)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    info!(connection_id, "websocket disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text)).await
}

async fn handle_client_message(
    text: &str,
    socket: &mut WebSocket,
    state: &GatewayState,
    bound_user: &mut Option<String>,
    connection_id: &str,
) -> Result<(), axum::Error> {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = %err, "malformed client message");
            return send_event(
                socket,
                &ServerEvent::Error {
                    code: crate::errors::ErrorCode::InvalidRequest,
                    message: "malformed message".to_string(),
                },
            )
            .await;
        }
    };

    match msg {
        ClientMessage::Auth { token } => match state.jwt.validate_token(&token) {
            Ok(claims) => {
                *bound_user = Some(claims.sub.clone());
                send_event(
                    socket,
                    &ServerEvent::AuthResult { ok: true, user_id: Some(claims.sub) },
                )
                .await?;
                send_state_snapshot(socket, state, bound_user.as_deref(), None).await?;
                if let Some(user_id) = bound_user.as_deref() {
                    replay_user_bets(socket, state, user_id).await?;
                }
                Ok(())
            }
            Err(_) => {
                send_event(socket, &ServerEvent::AuthResult { ok: false, user_id: None }).await
            }
        },
        ClientMessage::StateRequest { include_history, history_limit } => {
            let limit = include_history.then_some(history_limit.unwrap_or(state.config.history_limit));
            send_state_snapshot(socket, state, bound_user.as_deref(), limit).await
        }
        ClientMessage::PlaceBet { order_id, target_row, target_time, amount, is_play_mode } => {
            let user_id = bound_user.clone().unwrap_or_else(|| format!("anon-{connection_id}"));
            let req = PlaceBetRequest {
                order_id: order_id.clone(),
                user_id,
                target_row,
                target_time,
                amount,
                is_play_mode,
            };
            if let Err(err) = state.engine.place_bet(req).await {
                return send_event(socket, &rejected_event(order_id, err)).await;
            }
            Ok(())
        }
        ClientMessage::Ping => send_event(socket, &ServerEvent::Pong).await,
    }
}

fn rejected_event(order_id: String, err: EngineError) -> ServerEvent {
    ServerEvent::BetRejected(BetRejectedPayload { order_id, code: err.code(), message: err.to_string() })
}

/// Composes and sends the state snapshot (§4.12 point 4): current
/// `GameState`, plus for authenticated users their balances and up to
/// `history_limit` recent bets.
async fn send_state_snapshot(
    socket: &mut WebSocket,
    state: &GatewayState,
    user_id: Option<&str>,
    history_limit: Option<usize>,
) -> Result<(), axum::Error> {
    let view = state.engine.state_snapshot().await;

    let (balance, play_balance, recent_bets) = match user_id {
        Some(user_id) => {
            let user = state.store.get_user(user_id).await.ok().flatten();
            let limit = history_limit.unwrap_or(state.config.history_limit).min(state.config.history_limit);
            let bets = state.store.list_recent_bets(user_id, limit).await.unwrap_or_default();
            (user.as_ref().map(|u| u.balance), user.as_ref().map(|u| u.play_balance), bets)
        }
        None => (None, None, Vec::new()),
    };

    let payload = StateSnapshotPayload {
        round_id: view.as_ref().map(|v| v.round_id.clone()),
        status: view.as_ref().map(|v| v.status.clone()),
        start_price: view.as_ref().map(|v| v.start_price),
        current_price: view.as_ref().map(|v| v.current_price),
        current_row: view.as_ref().map(|v| v.current_row),
        elapsed: view.as_ref().map(|v| v.elapsed),
        round_start_time_ms: view.as_ref().map(|v| v.round_start_time_ms),
        balance,
        play_balance,
        recent_bets,
    };
    send_event(socket, &ServerEvent::StateSnapshot(payload)).await
}

/// Legacy init events (`round:start`, `round:running`, `state:update`)
/// replayed on connect so clients that only understand the pre-snapshot
/// protocol still see an active round immediately (§4.12 point 4).
async fn replay_legacy_init(socket: &mut WebSocket, state: &GatewayState) -> Result<(), axum::Error> {
    let Some(view) = state.engine.state_snapshot().await else {
        return Ok(());
    };

    send_event(
        socket,
        &ServerEvent::RoundStart(RoundStartPayload {
            round_id: view.round_id.clone(),
            asset: view.asset.clone(),
            start_price: view.start_price,
            betting_duration_secs: state.config.betting_duration.as_secs_f64(),
            max_duration_secs: state.config.max_duration.as_secs_f64(),
        }),
    )
    .await?;

    if view.status == "running" || view.status == "settling" {
        send_event(socket, &ServerEvent::RoundRunning { round_id: view.round_id.clone() }).await?;
    }

    send_event(
        socket,
        &ServerEvent::StateUpdate(crate::protocol::StateUpdatePayload {
            round_id: view.round_id,
            current_price: view.current_price,
            current_row: view.current_row,
            elapsed: view.elapsed,
        }),
    )
    .await
}

/// Replays the user's bets in the current round as `bet:confirmed`, plus
/// `bet:settled`/`bet:refunded` for any already terminal, so a client that
/// reconnects mid-round recovers its own bet history without a separate
/// request (§4.12 point 4).
async fn replay_user_bets(socket: &mut WebSocket, state: &GatewayState, user_id: &str) -> Result<(), axum::Error> {
    let bets = state.store.list_recent_bets(user_id, state.config.history_limit).await.unwrap_or_default();
    let Some(view) = state.engine.state_snapshot().await else {
        return Ok(());
    };

    for bet in bets.into_iter().filter(|b| b.round_id == view.round_id) {
        send_event(
            socket,
            &ServerEvent::BetConfirmed(BetConfirmedPayload {
                order_id: bet.order_id.clone(),
                bet_id: bet.id.clone(),
                multiplier: bet.multiplier,
                target_row: bet.target_row,
                target_time: bet.target_time,
                new_balance: Default::default(),
            }),
        )
        .await?;

        match bet.status {
            BetStatus::Won | BetStatus::Lost => {
                send_event(
                    socket,
                    &ServerEvent::BetSettled(BetSettledPayload {
                        order_id: bet.order_id.clone(),
                        status: bet.status,
                        payout: bet.payout,
                        hit_row: bet.hit_row,
                        hit_price: bet.hit_price,
                        hit_time: bet.hit_time,
                    }),
                )
                .await?;
            }
            BetStatus::Refunded => {
                send_event(
                    socket,
                    &ServerEvent::BetRefunded(BetRefundedPayload { order_id: bet.order_id.clone(), amount: bet.amount }),
                )
                .await?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_allowlist_admits_any_origin() {
        let allowlist = vec!["*".to_string()];
        assert!(origin_allowed(&allowlist, Some("https://evil.example")));
        assert!(origin_allowed(&allowlist, None));
    }

    #[test]
    fn explicit_allowlist_rejects_unknown_origins() {
        let allowlist = vec!["https://game.example".to_string()];
        assert!(origin_allowed(&allowlist, Some("https://game.example")));
        assert!(!origin_allowed(&allowlist, Some("https://evil.example")));
    }

    #[test]
    fn token_extraction_prefers_query_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "session=from-cookie".parse().unwrap());
        let mut query = HashMap::new();
        query.insert("token".to_string(), "from-query".to_string());
        assert_eq!(extract_ws_token(&headers, &query), Some("from-query".to_string()));

        let query = HashMap::new();
        assert_eq!(extract_ws_token(&headers, &query), Some("from-cookie".to_string()));
    }
}
