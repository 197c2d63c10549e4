//! Message relay: validates realtime events, persists through the chat store,
//! and fans results out through the room registry.

use crate::rooms::{ConnectionId, RoomRegistry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tradedesk_core::access::{authorize, check_access};
use tradedesk_core::*;

pub struct MessageRelay {
    store: Arc<dyn ChatStore>,
    rooms: Arc<RoomRegistry>,
}

impl MessageRelay {
    pub fn new(store: Arc<dyn ChatStore>, rooms: Arc<RoomRegistry>) -> Self {
        Self { store, rooms }
    }

    /// Handle one inbound text frame from a connection.
    pub async fn handle_frame(&self, conn: ConnectionId, frame: &str) {
        match ClientEvent::from_frame(frame) {
            Ok(event) => self.handle(conn, event).await,
            Err(e) => {
                warn!(conn = %conn, error = %e, "Rejected malformed frame");
                self.rooms.emit(conn, ServerEvent::Error(e.to_notice())).await;
            }
        }
    }

    /// Dispatch a parsed event. Failures go back to the originating connection only.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        let name = event.name();
        let outcome = match event {
            ClientEvent::JoinConversation(payload) => self.join(conn, payload).await.map(|_| ()),
            ClientEvent::LeaveConversation(payload) => self.leave(conn, payload).await,
            ClientEvent::SendMessage(payload) => self.send_message(conn, payload).await.map(|_| ()),
            ClientEvent::MarkRead(payload) => {
                self.mark_read(payload).await;
                Ok(())
            }
            ClientEvent::Typing(payload) => {
                self.typing(conn, payload).await;
                Ok(())
            }
            ClientEvent::Ping => {
                self.rooms.emit(conn, ServerEvent::Pong).await;
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(conn = %conn, event = name, error = ?e, "Event rejected");
            self.rooms.emit(conn, ServerEvent::Error(e.to_notice())).await;
        }
    }

    /// `join-conversation`: authorization-checked room entry.
    pub async fn join(
        &self,
        conn: ConnectionId,
        payload: JoinPayload,
    ) -> Result<Conversation, RelayError> {
        let request = JoinRequest::try_from(payload)?;
        let conversation =
            authorize(self.store.as_ref(), Some(request.conversation_id), &request.actor).await?;

        let room = conversation.room();
        let changed = self.rooms.join(conn, &room).await;
        info!(
            conn = %conn,
            room = %room,
            user_id = request.actor.user_id,
            admin = request.actor.is_admin,
            already_member = !changed,
            "Joined conversation"
        );
        self.rooms
            .emit(
                conn,
                ServerEvent::JoinedConversation(RoomAck {
                    conversation_id: conversation.id,
                }),
            )
            .await;
        Ok(conversation)
    }

    /// `leave-conversation`: no authorization, leaving cannot leak anything.
    pub async fn leave(&self, conn: ConnectionId, payload: LeavePayload) -> Result<(), RelayError> {
        let id = payload
            .conversation_id
            .ok_or_else(|| RelayError::missing("conversationId"))?;
        let room = room_name(id);
        if self.rooms.leave(conn, &room).await {
            info!(conn = %conn, room = %room, "Left conversation");
        }
        Ok(())
    }

    /// `send-message`: validate, authorize, persist, then broadcast.
    pub async fn send_message(
        &self,
        conn: ConnectionId,
        payload: SendMessagePayload,
    ) -> Result<Message, RelayError> {
        let new_message = NewMessage::try_from(payload)?;

        let conversation = self
            .store
            .find_conversation(new_message.conversation_id)
            .await
            .map_err(|e| RelayError::persistence("Failed to send message", e))?;
        let sender = Actor {
            user_id: new_message.sender_id,
            is_admin: new_message.sender_type == SenderType::Admin,
        };
        let conversation = check_access(conversation, &sender)?;

        let message = self
            .store
            .create_message(&new_message)
            .await
            .map_err(|e| RelayError::persistence("Failed to send message", e))?;

        self.touch_conversation_best_effort(conversation.id, message.created_at)
            .await;

        let room = conversation.room();
        let delivered = self
            .rooms
            .broadcast_to_room(&room, ServerEvent::NewMessage(message.clone()))
            .await;

        if message.sender_type == SenderType::User {
            self.rooms
                .broadcast_all(ServerEvent::AdminNotification(message.clone()))
                .await;
        }

        info!(
            conn = %conn,
            room = %room,
            message_id = message.id,
            sender_type = %message.sender_type,
            delivered,
            "Message relayed"
        );
        Ok(message)
    }

    /// Second phase of a send. The message is already stored and will be
    /// broadcast whatever happens here; failure is only logged.
    async fn touch_conversation_best_effort(&self, id: ConversationId, at: DateTime<Utc>) {
        if let Err(e) = self.store.touch_conversation(id, at).await {
            warn!(conversation_id = id, error = %e, "Failed to update conversation timestamp");
        }
    }

    /// `mark-read`: flag the counterpart's messages and tell the room.
    /// Read state is not safety-critical, so every failure is logged and dropped.
    pub async fn mark_read(&self, payload: MarkReadPayload) {
        let request = match MarkReadRequest::try_from(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring mark-read");
                return;
            }
        };
        let authored_by = request.reader.counterpart();
        match self
            .store
            .mark_read(request.conversation_id, authored_by)
            .await
        {
            Ok(updated) => {
                debug!(
                    conversation_id = request.conversation_id,
                    authored_by = %authored_by,
                    updated,
                    "Marked messages read"
                );
                self.rooms
                    .broadcast_to_room(
                        &room_name(request.conversation_id),
                        ServerEvent::MessagesRead(ReadReceipt {
                            conversation_id: request.conversation_id,
                            reader_type: request.reader,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                warn!(
                    conversation_id = request.conversation_id,
                    error = %e,
                    "Failed to mark messages read"
                );
            }
        }
    }

    /// `typing`: relayed to the other members of a room the sender has joined.
    pub async fn typing(&self, conn: ConnectionId, payload: TypingPayload) {
        let signal = match TypingSignal::try_from(payload) {
            Ok(signal) => signal,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Ignoring typing signal");
                return;
            }
        };
        let room = room_name(signal.conversation_id);
        if !self.rooms.is_member(conn, &room).await {
            debug!(conn = %conn, room = %room, "Typing signal from non-member dropped");
            return;
        }
        self.rooms
            .broadcast_to_room_except(&room, conn, ServerEvent::Typing(signal))
            .await;
    }
}
