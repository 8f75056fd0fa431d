use std::{collections::VecDeque, time::Duration};

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, info_span, warn, Instrument};
use workshop_chat_common::protocol::ws::WsMessage;

use super::protocol::{self as ws_protocol, error_frame};
use super::session::{
    CloseDirective, ConnectionSession, Step, HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS,
    MAX_FRAME_BYTES,
};
use super::ChatContext;
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
};
use crate::metrics;
use crate::validation::check_ws_frame_size;

pub fn router(context: ChatContext) -> Router {
    Router::new().route("/v1/chat/ws", get(ws_upgrade)).with_state(context)
}

pub async fn ws_upgrade(
    State(context): State<ChatContext>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES as usize)
        .max_message_size(MAX_FRAME_BYTES as usize)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(context, socket)).await;
        })
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_with(socket: &mut WebSocket, directive: CloseDirective) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: directive.code,
            reason: directive.reason.into(),
        })))
        .await;
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    close_with(
        socket,
        CloseDirective { code: close_code::SIZE, reason: frame_size_exceeded_reason() },
    )
    .await;
}

async fn send_all(socket: &mut WebSocket, frames: &[WsMessage]) -> Result<(), ()> {
    for frame in frames {
        ws_protocol::send_ws_message(socket, frame).await?;
    }
    Ok(())
}

async fn handle_socket(context: ChatContext, socket: WebSocket) {
    let mut session = ConnectionSession::new(context);
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let span = info_span!(
        "chat.ws.connection",
        connection_id = %session.connection_id(),
        request_id = %request_id
    );

    metrics::ws_connection_opened();
    run_connection(&mut session, socket).instrument(span).await;
    session.close().await;
    metrics::ws_connection_closed();
}

/// Frames read from the socket while an action is in flight, processed once
/// it settles. Reading stops when the backlog is full.
const MAX_PIPELINED_FRAMES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

async fn deliver(socket: &mut WebSocket, step: Step) -> Flow {
    if send_all(socket, &step.replies).await.is_err() {
        return Flow::Disconnect;
    }
    match step.close {
        Some(directive) => {
            close_with(socket, directive).await;
            Flow::Disconnect
        }
        None => Flow::Continue,
    }
}

async fn run_connection(session: &mut ConnectionSession, mut socket: WebSocket) {
    let auth_deadline = session.auth_deadline();

    // Server pings every HEARTBEAT_INTERVAL_MS and drops the connection when a
    // ping goes unanswered for HEARTBEAT_TIMEOUT_MS.
    let heartbeat_every = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let mut unanswered_ping: Option<Instant> = None;
    let mut backlog = VecDeque::new();

    loop {
        if let Some(queued) = backlog.pop_front() {
            let flow =
                on_incoming(session, &mut socket, Ok(queued), &mut backlog, &mut unanswered_ping)
                    .await;
            if flow == Flow::Disconnect {
                break;
            }
            continue;
        }

        let membership_check = session.next_membership_check();
        tokio::select! {
            _ = sleep_until(auth_deadline), if !session.is_authenticated() => {
                warn!("no valid hello before the authentication deadline");
                let step = session.authentication_expired();
                let _ = deliver(&mut socket, step).await;
                break;
            }
            _ = heartbeat.tick() => {
                if unanswered_ping.is_some_and(|sent_at| sent_at.elapsed() > heartbeat_timeout) {
                    warn!("heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if unanswered_ping.is_none() {
                    unanswered_ping = Some(Instant::now());
                }
            }
            _ = sleep_until(membership_check.unwrap_or_else(Instant::now)), if membership_check.is_some() => {
                let step = session.revalidate_membership().await;
                if deliver(&mut socket, step).await == Flow::Disconnect {
                    break;
                }
            }
            event = session.next_room_event() => {
                if ws_protocol::send_ws_message(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(incoming) = incoming else {
                    break;
                };
                let flow =
                    on_incoming(session, &mut socket, incoming, &mut backlog, &mut unanswered_ping)
                        .await;
                if flow == Flow::Disconnect {
                    break;
                }
            }
        }
    }
}

async fn on_incoming(
    session: &mut ConnectionSession,
    socket: &mut WebSocket,
    incoming: Result<Message, axum::Error>,
    backlog: &mut VecDeque<Message>,
    unanswered_ping: &mut Option<Instant>,
) -> Flow {
    match incoming {
        Ok(Message::Text(raw_message)) => {
            if check_ws_frame_size(raw_message.as_str().as_bytes()).is_err() {
                close_frame_too_large(socket).await;
                return Flow::Disconnect;
            }

            let frame = match ws_protocol::decode_message(&raw_message) {
                Ok(frame) => frame,
                Err(error) => {
                    debug!(error = %error, "undecodable frame");
                    let reply = error_frame(
                        ErrorCode::InvalidMessage,
                        ErrorCode::InvalidMessage.default_message(),
                        None,
                    );
                    return match ws_protocol::send_ws_message(socket, &reply).await {
                        Ok(()) => Flow::Continue,
                        Err(()) => Flow::Disconnect,
                    };
                }
            };

            match run_action(session, socket, frame, backlog, unanswered_ping).await {
                Some(step) => deliver(socket, step).await,
                None => Flow::Disconnect,
            }
        }
        Ok(Message::Binary(_)) => {
            let reply = error_frame(ErrorCode::InvalidMessage, "binary frames are not supported", None);
            match ws_protocol::send_ws_message(socket, &reply).await {
                Ok(()) => Flow::Continue,
                Err(()) => Flow::Disconnect,
            }
        }
        Ok(Message::Ping(payload)) => match socket.send(Message::Pong(payload)).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Disconnect,
        },
        Ok(Message::Pong(_)) => {
            *unanswered_ping = None;
            Flow::Continue
        }
        Ok(Message::Close(_)) => Flow::Disconnect,
        Err(error) => {
            if is_frame_size_violation(&error) {
                close_frame_too_large(socket).await;
            } else {
                debug!(error = %error, "websocket receive failed");
            }
            Flow::Disconnect
        }
    }
}

/// Drives one client action while still watching the socket. `None` means the
/// client went away first: the action future is dropped, which abandons any
/// write it has queued but the room has not yet started.
async fn run_action(
    session: &mut ConnectionSession,
    socket: &mut WebSocket,
    frame: WsMessage,
    backlog: &mut VecDeque<Message>,
    unanswered_ping: &mut Option<Instant>,
) -> Option<Step> {
    let action = session.handle_frame(frame);
    tokio::pin!(action);

    loop {
        tokio::select! {
            step = &mut action => return Some(step),
            incoming = socket.recv(), if backlog.len() < MAX_PIPELINED_FRAMES => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return None;
                    }
                }
                Some(Ok(Message::Pong(_))) => *unanswered_ping = None,
                Some(Ok(Message::Close(_))) | None => {
                    debug!("client closed with an action in flight, abandoning it");
                    return None;
                }
                Some(Ok(message)) => backlog.push_back(message),
                Some(Err(error)) => {
                    if is_frame_size_violation(&error) {
                        close_frame_too_large(socket).await;
                    } else {
                        debug!(error = %error, "websocket receive failed");
                    }
                    return None;
                }
            },
        }
    }
}
