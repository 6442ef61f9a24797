// WebSocket endpoint: upgrade, per-connection loop, cleanup.
//
// Each accepted socket runs one task. The task owns the socket and the
// strong end of its outbound queue; the room registry only sees a weak
// handle. Whatever ends the loop, the connection leaves every room before
// the socket is released.

pub mod connection;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use globechat_common::protocol::ws::{decode_control_frame, SUBPROTOCOL};
use tokio::{
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info_span, warn, Instrument};

pub use connection::{CloseReason, Connection, ConnectionState};

use crate::{
    config::{ConnectionSettings, MAX_TIMER},
    error::request_id_from_headers_or_generate,
    metrics,
    rate_limit::TokenBucket,
    rooms::{ConnectionId, OutboundFrame, RoomRegistry},
};

#[derive(Clone)]
struct WsRouterState {
    registry: Arc<RoomRegistry>,
    settings: ConnectionSettings,
}

pub fn router(registry: Arc<RoomRegistry>, settings: ConnectionSettings) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(WsRouterState { registry, settings })
}

async fn ws_upgrade(
    State(state): State<WsRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let WsRouterState { registry, settings } = state;

    ws.protocols([SUBPROTOCOL])
        .max_frame_size(settings.max_frame_bytes)
        .max_message_size(settings.max_frame_bytes)
        .on_failed_upgrade(|error| {
            warn!(%error, "websocket upgrade failed");
        })
        .on_upgrade(move |socket| {
            let connection_id = ConnectionId::next();
            let span = info_span!("ws_connection", %connection_id, %request_id);
            run_connection(socket, connection_id, registry, settings).instrument(span)
        })
}

/// Drives one accepted socket until it closes.
pub async fn run_connection(
    mut socket: WebSocket,
    connection_id: ConnectionId,
    registry: Arc<RoomRegistry>,
    settings: ConnectionSettings,
) {
    let (outbound_sender, mut outbound_receiver) =
        mpsc::channel::<OutboundFrame>(settings.outbound_buffer.max(1));
    let mut connection = Connection::new(connection_id, registry, outbound_sender);
    connection.mark_open();
    metrics::record_connection_opened();
    debug!(%connection_id, "connection opened");

    let mut limiter = TokenBucket::new(settings.rate_limit);
    let frame_wait = settings.frame_wait_timeout.min(MAX_TIMER);
    let mut deadline = Instant::now() + frame_wait;

    let reason = loop {
        tokio::select! {
            Some(frame) = outbound_receiver.recv() => {
                let written =
                    write_frame(&mut socket, Message::Text(frame), settings.write_timeout).await;
                if let Err(reason) = written {
                    break reason;
                }
            }
            _ = sleep_until(deadline) => {
                break CloseReason::FrameWaitTimeout(frame_wait);
            }
            inbound = async {
                limiter.ready().await;
                socket.recv().await
            } => {
                deadline = Instant::now() + frame_wait;

                let message = match inbound {
                    Some(Ok(message)) => message,
                    Some(Err(error)) => break CloseReason::ReadFailed(error),
                    None => break CloseReason::StreamEnded,
                };

                match message {
                    Message::Text(raw_message) => {
                        limiter.consume();
                        match decode_control_frame(raw_message.as_str()) {
                            Ok(frame) => {
                                metrics::record_control_frame(frame.type_str());
                                connection.apply(frame);
                            }
                            Err(error) => break CloseReason::ProtocolViolation(error),
                        }
                    }
                    Message::Binary(_) => break CloseReason::BinaryFrame,
                    Message::Ping(payload) => {
                        let written =
                            write_frame(&mut socket, Message::Pong(payload), settings.write_timeout)
                                .await;
                        if let Err(reason) = written {
                            break reason;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(frame) => {
                        break CloseReason::PeerClosed { code: frame.map(|frame| frame.code) };
                    }
                }
            }
        }
    };

    connection.begin_closing();
    let rooms_left = connection.close();
    drop(outbound_receiver);

    if let Some(close_frame) = reason.close_frame() {
        let message = Message::Close(Some(close_frame));
        if let Err(error) = write_frame(&mut socket, message, settings.write_timeout).await {
            debug!(%connection_id, %error, "close frame not delivered");
        }
    }
    drop(socket);

    metrics::record_connection_closed(reason.label());
    if reason.is_normal() {
        debug!(%connection_id, rooms_left = ?rooms_left, "connection closed");
    } else {
        warn!(
            %connection_id,
            rooms_left = ?rooms_left,
            reason = %reason,
            "connection closed abnormally"
        );
    }
}

/// One socket write, bounded so a peer that stops reading cannot park the
/// connection task.
async fn write_frame(
    socket: &mut WebSocket,
    message: Message,
    limit: Duration,
) -> Result<(), CloseReason> {
    match timeout(limit, socket.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(CloseReason::WriteFailed(error)),
        Err(_) => Err(CloseReason::WriteTimedOut(limit)),
    }
}
