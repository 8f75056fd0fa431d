//! Protocol state of one chat connection.
//!
//! A session moves `Connecting -> Authenticated -> Joined <-> Authenticated -> Closed`.
//! It owns nothing shared: room state lives in the room actor and the session
//! only holds the receiving end of its room event queue. The socket loop in
//! `handler.rs` feeds inbound frames to [`ConnectionSession::handle_frame`]
//! and forwards [`ConnectionSession::next_room_event`] to the client.

use std::time::Duration;

use axum::extract::ws::close_code;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use workshop_chat_common::protocol::ws::WsMessage;
use workshop_chat_common::types::{MessageKind, RoomRole};

use super::protocol::{error_frame, is_server_frame};
use super::ChatContext;
use crate::auth::jwt::Identity;
use crate::error::{ChatError, ErrorCode};
use crate::metrics;
use crate::protocol as versions;
use crate::room::broker::OUTBOUND_QUEUE_CAPACITY;
use crate::room::Member;
use crate::validation::validate_send;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: u64 = 262_144;
/// Lower bound on the enrollment re-check period of a joined connection.
pub(crate) const MEMBERSHIP_CHECK_FLOOR_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticated,
    Joined,
    Closed,
}

/// Close the socket after flushing the step's replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDirective {
    pub code: u16,
    pub reason: String,
}

/// Frames owed to the client for one inbound frame.
#[derive(Debug, Default)]
pub struct Step {
    pub replies: Vec<WsMessage>,
    pub close: Option<CloseDirective>,
}

impl Step {
    fn none() -> Self {
        Self::default()
    }

    fn reply(frame: WsMessage) -> Self {
        Self { replies: vec![frame], close: None }
    }

    fn error(error: &ChatError, room_id: Option<Uuid>) -> Self {
        Self::reply(error.to_ws_message(room_id))
    }

    fn closing(frame: WsMessage, code: u16, reason: &str) -> Self {
        Self {
            replies: vec![frame],
            close: Some(CloseDirective { code, reason: reason.to_string() }),
        }
    }
}

struct JoinedRoom {
    room_id: Uuid,
    events: mpsc::Receiver<WsMessage>,
    next_membership_check: Instant,
}

enum State {
    Connecting,
    Authenticated(Identity),
    Joined { identity: Identity, room: JoinedRoom },
    Closed,
}

pub struct ConnectionSession {
    context: ChatContext,
    connection_id: Uuid,
    auth_deadline: Instant,
    state: State,
    /// Room an admit was sent to but not yet confirmed. Cleared once joined.
    admitting: Option<Uuid>,
}

impl ConnectionSession {
    pub fn new(context: ChatContext) -> Self {
        let auth_deadline = Instant::now() + context.config.auth_timeout;
        Self {
            context,
            connection_id: Uuid::new_v4(),
            auth_deadline,
            state: State::Connecting,
            admitting: None,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// A connection that has not said `hello` by this instant is closed.
    pub fn auth_deadline(&self) -> Instant {
        self.auth_deadline
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            State::Connecting => SessionPhase::Connecting,
            State::Authenticated(_) => SessionPhase::Authenticated,
            State::Joined { .. } => SessionPhase::Joined,
            State::Closed => SessionPhase::Closed,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity().is_some()
    }

    pub fn joined_room(&self) -> Option<Uuid> {
        match &self.state {
            State::Joined { room, .. } => Some(room.room_id),
            _ => None,
        }
    }

    fn identity(&self) -> Option<&Identity> {
        match &self.state {
            State::Authenticated(identity) | State::Joined { identity, .. } => Some(identity),
            State::Connecting | State::Closed => None,
        }
    }

    pub async fn handle_frame(&mut self, frame: WsMessage) -> Step {
        if matches!(self.state, State::Closed) {
            return Step::none();
        }

        let endpoint = frame.kind();
        let started_at = Instant::now();
        let step = self.dispatch(frame).await;
        let failed = step.replies.iter().any(|reply| matches!(reply, WsMessage::Error { .. }));
        metrics::record_ws_request(endpoint, failed, started_at.elapsed().as_millis() as u64);
        step
    }

    async fn dispatch(&mut self, frame: WsMessage) -> Step {
        if is_server_frame(&frame) {
            return server_frame_rejected(&frame);
        }

        match frame {
            WsMessage::Hello { protocol_version, token } => self.hello(&protocol_version, &token),
            _ if !self.is_authenticated() => Step::error(
                &ChatError::Unauthenticated("send hello before any other frame".into()),
                None,
            ),
            WsMessage::JoinRoom { room_id } => self.join(room_id).await,
            WsMessage::LeaveRoom { room_id } => self.leave(room_id).await,
            WsMessage::SendMessage { room_id, body, kind, attachment_ref, client_nonce } => {
                let deadline = self.action_deadline();
                if let Err(step) = self.confirm_membership(room_id, deadline, "send_message").await {
                    return step;
                }
                let result = self
                    .send_message(room_id, body, kind, attachment_ref, client_nonce, deadline)
                    .await;
                match result {
                    Ok(Some(frame)) => Step::reply(frame),
                    Ok(None) => Step::none(),
                    Err(error) => Step::error(&error, Some(room_id)),
                }
            }
            WsMessage::EditMessage { room_id, message_id, body } => {
                let deadline = self.action_deadline();
                if let Err(step) = self.confirm_membership(room_id, deadline, "edit_message").await {
                    return step;
                }
                match self.edit_message(room_id, message_id, body, deadline).await {
                    Ok(()) => Step::none(),
                    Err(error) => Step::error(&error, Some(room_id)),
                }
            }
            WsMessage::DeleteMessage { room_id, message_id } => {
                let deadline = self.action_deadline();
                let role = match self.confirm_membership(room_id, deadline, "delete_message").await
                {
                    Ok(role) => role,
                    Err(step) => return step,
                };
                match self.delete_message(room_id, message_id, role, deadline).await {
                    Ok(()) => Step::none(),
                    Err(error) => Step::error(&error, Some(room_id)),
                }
            }
            WsMessage::TypingStart { room_id } => self.typing(room_id, true).await,
            WsMessage::TypingStop { room_id } => self.typing(room_id, false).await,
            other => server_frame_rejected(&other),
        }
    }

    fn hello(&mut self, protocol_version: &str, token: &str) -> Step {
        if !matches!(self.state, State::Connecting) {
            return Step::reply(error_frame(
                ErrorCode::InvalidMessage,
                "hello was already accepted on this connection",
                None,
            ));
        }

        if !versions::is_supported(protocol_version) {
            info!(protocol_version, "rejecting unsupported protocol version");
            return Step::closing(
                error_frame(
                    ErrorCode::UpgradeRequired,
                    format!("unsupported protocol version: {protocol_version}"),
                    None,
                ),
                close_code::PROTOCOL,
                "unsupported protocol version",
            );
        }

        match self.context.identity.verify(token) {
            Ok(identity) => {
                debug!(
                    connection_id = %self.connection_id,
                    user_id = %identity.user_id,
                    "connection authenticated"
                );
                let ack = WsMessage::HelloAck {
                    user_id: identity.user_id,
                    display_name: identity.display_name.clone(),
                    server_time: Utc::now().to_rfc3339(),
                };
                self.state = State::Authenticated(identity);
                Step::reply(ack)
            }
            Err(error) => {
                debug!(connection_id = %self.connection_id, error = %error, "rejecting identity token");
                Step::error(&ChatError::Unauthenticated("invalid identity token".into()), None)
            }
        }
    }

    /// Called by the socket loop when [`auth_deadline`](Self::auth_deadline)
    /// passes without a successful `hello`.
    pub fn authentication_expired(&mut self) -> Step {
        self.state = State::Closed;
        Step::closing(
            ChatError::Unauthenticated("no valid hello within the authentication window".into())
                .to_ws_message(None),
            close_code::POLICY,
            "authentication window elapsed",
        )
    }

    async fn join(&mut self, room_id: Uuid) -> Step {
        let window = self.context.config.auth_timeout;
        let mut replies = Vec::new();
        match timeout(window, self.enter_room(room_id, &mut replies)).await {
            Ok(Ok(())) => Step { replies, close: None },
            Ok(Err(error)) => {
                replies.push(error.to_ws_message(Some(room_id)));
                Step { replies, close: None }
            }
            Err(_) => {
                warn!(connection_id = %self.connection_id, room_id = %room_id, "join timed out");
                // An admit that was already queued may still land.
                self.context.registry.remove(room_id, self.connection_id).await;
                replies.push(ChatError::Timeout("join_room").to_ws_message(Some(room_id)));
                self.state = State::Closed;
                Step {
                    replies,
                    close: Some(CloseDirective {
                        code: close_code::AGAIN,
                        reason: "join timed out".to_string(),
                    }),
                }
            }
        }
    }

    async fn enter_room(
        &mut self,
        room_id: Uuid,
        replies: &mut Vec<WsMessage>,
    ) -> Result<(), ChatError> {
        let identity = self
            .identity()
            .cloned()
            .ok_or_else(|| ChatError::Unauthenticated("send hello before joining".into()))?;
        let role = self.context.gate.require_role(identity.user_id, room_id).await?;

        if let Some(previous) = self.joined_room() {
            self.context.registry.remove(previous, self.connection_id).await;
            self.return_to_lobby();
            replies.push(WsMessage::Left { room_id: previous });
        }

        let (outbound, events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let member = Member {
            connection_id: self.connection_id,
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            role,
            joined_at: Utc::now(),
        };
        self.admitting = Some(room_id);
        let admission = self.context.registry.admit(room_id, member, outbound).await;
        self.admitting = None;
        let admission = admission?;

        info!(
            connection_id = %self.connection_id,
            room_id = %room_id,
            user_id = %identity.user_id,
            role = role.as_str(),
            head_seq = admission.head_seq,
            "joined room"
        );
        let next_membership_check = Instant::now() + self.membership_check_interval();
        self.state =
            State::Joined { identity, room: JoinedRoom { room_id, events, next_membership_check } };
        replies.push(WsMessage::Joined {
            room_id,
            role,
            head_seq: admission.head_seq,
            presence: admission.presence,
            recent_messages: admission.recent_messages,
        });
        Ok(())
    }

    async fn leave(&mut self, room_id: Uuid) -> Step {
        if self.joined_room() != Some(room_id) {
            return Step::error(&ChatError::NotJoined { room_id }, Some(room_id));
        }
        self.context.registry.remove(room_id, self.connection_id).await;
        self.return_to_lobby();
        Step::reply(WsMessage::Left { room_id })
    }

    fn return_to_lobby(&mut self) {
        self.state = match std::mem::replace(&mut self.state, State::Closed) {
            State::Joined { identity, .. } => State::Authenticated(identity),
            other => other,
        };
    }

    fn require_joined(&self, room_id: Uuid) -> Result<Uuid, ChatError> {
        match &self.state {
            State::Joined { identity, room } if room.room_id == room_id => Ok(identity.user_id),
            _ => Err(ChatError::NotJoined { room_id }),
        }
    }

    fn action_deadline(&self) -> Instant {
        Instant::now() + self.context.config.action_timeout
    }

    /// Re-reads the caller's enrollment before a room action. A member whose
    /// enrollment was revoked is evicted and the returned step carries
    /// `left` followed by `FORBIDDEN`.
    async fn confirm_membership(
        &mut self,
        room_id: Uuid,
        deadline: Instant,
        action: &'static str,
    ) -> Result<RoomRole, Step> {
        let user_id =
            self.require_joined(room_id).map_err(|error| Step::error(&error, Some(room_id)))?;
        let outcome = timeout_at(deadline, self.context.gate.require_role(user_id, room_id)).await;
        match outcome {
            Ok(Ok(role)) => Ok(role),
            Ok(Err(error @ ChatError::Forbidden(_))) => Err(self.evict(room_id, &error).await),
            Ok(Err(error)) => Err(Step::error(&error, Some(room_id))),
            Err(_) => Err(Step::error(&ChatError::Timeout(action), Some(room_id))),
        }
    }

    async fn evict(&mut self, room_id: Uuid, error: &ChatError) -> Step {
        info!(
            connection_id = %self.connection_id,
            room_id = %room_id,
            "enrollment revoked, removing connection from room"
        );
        self.context.registry.remove(room_id, self.connection_id).await;
        self.return_to_lobby();
        Step {
            replies: vec![WsMessage::Left { room_id }, error.to_ws_message(Some(room_id))],
            close: None,
        }
    }

    fn membership_check_interval(&self) -> Duration {
        self.context.config.authz_cache_ttl.max(Duration::from_millis(MEMBERSHIP_CHECK_FLOOR_MS))
    }

    /// When the socket loop should next call
    /// [`revalidate_membership`](Self::revalidate_membership). `None` outside a room.
    pub fn next_membership_check(&self) -> Option<Instant> {
        match &self.state {
            State::Joined { room, .. } => Some(room.next_membership_check),
            _ => None,
        }
    }

    /// Periodic enrollment re-check for an idle joined connection. Only a
    /// definite "not enrolled" evicts; lookup failures keep the membership
    /// until the next check.
    pub async fn revalidate_membership(&mut self) -> Step {
        let next_check = Instant::now() + self.membership_check_interval();
        let State::Joined { identity, room } = &mut self.state else {
            return Step::none();
        };
        room.next_membership_check = next_check;
        let (user_id, room_id) = (identity.user_id, room.room_id);

        let deadline = self.action_deadline();
        let outcome = timeout_at(deadline, self.context.gate.require_role(user_id, room_id)).await;
        match outcome {
            Ok(Ok(_)) => Step::none(),
            Ok(Err(error @ ChatError::Forbidden(_))) => self.evict(room_id, &error).await,
            Ok(Err(error)) => {
                debug!(
                    connection_id = %self.connection_id,
                    room_id = %room_id,
                    error = %error,
                    "membership check failed, retrying later"
                );
                Step::none()
            }
            Err(_) => {
                debug!(connection_id = %self.connection_id, room_id = %room_id, "membership check timed out");
                Step::none()
            }
        }
    }

    /// Returns a frame for the sender only when the send was a retry of an
    /// already persisted nonce; fresh messages reach the sender via fan-out.
    async fn send_message(
        &self,
        room_id: Uuid,
        body: String,
        kind: MessageKind,
        attachment_ref: Option<String>,
        client_nonce: Option<String>,
        deadline: Instant,
    ) -> Result<Option<WsMessage>, ChatError> {
        let message = validate_send(body, kind, attachment_ref, client_nonce)?;
        let client_nonce = message.client_nonce.clone();

        let receipt = timeout_at(
            deadline,
            self.context.registry.send_message(room_id, self.connection_id, message, deadline),
        )
        .await
        .map_err(|_| ChatError::Timeout("send_message"))??;

        if !receipt.duplicate {
            return Ok(None);
        }
        Ok(Some(WsMessage::MessageCreated {
            room_id,
            seq: receipt.message.seq,
            message: receipt.message,
            client_nonce,
        }))
    }

    async fn edit_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        body: String,
        deadline: Instant,
    ) -> Result<(), ChatError> {
        timeout_at(
            deadline,
            self.context.registry.edit_message(
                room_id,
                self.connection_id,
                message_id,
                body,
                deadline,
            ),
        )
        .await
        .map_err(|_| ChatError::Timeout("edit_message"))??;
        Ok(())
    }

    async fn delete_message(
        &self,
        room_id: Uuid,
        message_id: Uuid,
        role: RoomRole,
        deadline: Instant,
    ) -> Result<(), ChatError> {
        timeout_at(
            deadline,
            self.context.registry.delete_message(
                room_id,
                self.connection_id,
                role,
                message_id,
                deadline,
            ),
        )
        .await
        .map_err(|_| ChatError::Timeout("delete_message"))??;
        Ok(())
    }

    /// Typing for a room this connection is not in is dropped without a reply.
    async fn typing(&mut self, room_id: Uuid, is_typing: bool) -> Step {
        if self.joined_room() == Some(room_id) {
            self.context.registry.set_typing(room_id, self.connection_id, is_typing).await;
        }
        Step::none()
    }

    /// Next event fanned out by the joined room. Pends forever outside a room.
    /// If the room goes away underneath the connection, the session drops
    /// back to `Authenticated` and yields a `ROOM_RESET` error.
    pub async fn next_room_event(&mut self) -> WsMessage {
        let State::Joined { room, .. } = &mut self.state else {
            return std::future::pending().await;
        };
        let room_id = room.room_id;
        match room.events.recv().await {
            Some(event) => event,
            None => {
                warn!(connection_id = %self.connection_id, room_id = %room_id, "room event stream ended");
                self.return_to_lobby();
                ChatError::RoomReset { room_id }.to_ws_message(Some(room_id))
            }
        }
    }

    /// Idempotent. Leaves the joined room, if any, including one whose admit
    /// was interrupted before it was confirmed.
    pub async fn close(&mut self) {
        if let Some(room_id) = self.joined_room() {
            self.context.registry.remove(room_id, self.connection_id).await;
        }
        if let Some(room_id) = self.admitting.take() {
            self.context.registry.remove(room_id, self.connection_id).await;
        }
        if !matches!(self.state, State::Closed) {
            debug!(connection_id = %self.connection_id, "session closed");
        }
        self.state = State::Closed;
    }
}

fn server_frame_rejected(frame: &WsMessage) -> Step {
    Step::reply(error_frame(
        ErrorCode::InvalidMessage,
        format!("`{}` frames are only sent by the relay", frame.kind()),
        None,
    ))
}
