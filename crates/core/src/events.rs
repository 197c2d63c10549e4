//! Realtime wire events.
//!
//! Every frame is a JSON text frame of the form `{"event": "<name>", "data": {...}}`.
//! Inbound payloads are deserialized into loose `*Payload` structs first and then
//! validated into typed requests, so no field is trusted before it is checked.

use crate::error::RelayError;
use crate::models::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinConversation(JoinPayload),
    LeaveConversation(LeavePayload),
    SendMessage(SendMessagePayload),
    MarkRead(MarkReadPayload),
    Typing(TypingPayload),
    Ping,
}

impl ClientEvent {
    /// Parse a text frame, rejecting unknown events and malformed payloads.
    pub fn from_frame(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text)
            .map_err(|e| RelayError::MissingField(format!("Invalid event payload: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation(_) => "join-conversation",
            ClientEvent::LeaveConversation(_) => "leave-conversation",
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::MarkRead(_) => "mark-read",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::Ping => "ping",
        }
    }

    pub fn join(conversation_id: ConversationId, actor: Actor) -> Self {
        ClientEvent::JoinConversation(JoinPayload {
            conversation_id: Some(conversation_id),
            user_id: Some(actor.user_id),
            is_admin: Some(actor.is_admin),
        })
    }

    pub fn leave(conversation_id: ConversationId) -> Self {
        ClientEvent::LeaveConversation(LeavePayload {
            conversation_id: Some(conversation_id),
        })
    }

    pub fn send(message: NewMessage) -> Self {
        ClientEvent::SendMessage(SendMessagePayload {
            conversation_id: Some(message.conversation_id),
            sender_id: Some(message.sender_id),
            sender_type: Some(message.sender_type),
            content: message.content,
            image_url: message.image_url,
        })
    }

    pub fn mark_read(conversation_id: ConversationId, reader: SenderType) -> Self {
        ClientEvent::MarkRead(MarkReadPayload {
            conversation_id: Some(conversation_id),
            sender_type: Some(reader),
        })
    }

    pub fn typing(conversation_id: ConversationId, is_typing: bool) -> Self {
        ClientEvent::Typing(TypingPayload {
            conversation_id: Some(conversation_id),
            is_typing: Some(is_typing),
        })
    }

    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPayload {
    pub conversation_id: Option<ConversationId>,
    pub user_id: Option<UserId>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeavePayload {
    pub conversation_id: Option<ConversationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessagePayload {
    pub conversation_id: Option<ConversationId>,
    pub sender_id: Option<UserId>,
    pub sender_type: Option<SenderType>,
    pub content: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarkReadPayload {
    pub conversation_id: Option<ConversationId>,
    pub sender_type: Option<SenderType>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypingPayload {
    pub conversation_id: Option<ConversationId>,
    pub is_typing: Option<bool>,
}

// ---------------------------------------------------------------------------
// Validated requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRequest {
    pub conversation_id: ConversationId,
    pub actor: Actor,
}

impl TryFrom<JoinPayload> for JoinRequest {
    type Error = RelayError;

    fn try_from(payload: JoinPayload) -> Result<Self, Self::Error> {
        let conversation_id = payload
            .conversation_id
            .ok_or_else(|| RelayError::missing("conversationId"))?;
        let is_admin = payload.is_admin.unwrap_or(false);
        let user_id = match (payload.user_id, is_admin) {
            (Some(id), _) => id,
            (None, true) => ADMIN_SENDER_ID,
            (None, false) => return Err(RelayError::missing("userId")),
        };
        Ok(Self {
            conversation_id,
            actor: Actor { user_id, is_admin },
        })
    }
}

impl TryFrom<SendMessagePayload> for NewMessage {
    type Error = RelayError;

    fn try_from(payload: SendMessagePayload) -> Result<Self, Self::Error> {
        let conversation_id = payload
            .conversation_id
            .ok_or_else(|| RelayError::missing("conversationId"))?;
        let sender_type = payload
            .sender_type
            .ok_or_else(|| RelayError::missing("senderType"))?;
        let sender_id = match sender_type {
            SenderType::User => match payload.sender_id {
                Some(id) if id > 0 => id,
                _ => {
                    return Err(RelayError::MissingField(
                        "Missing or invalid senderId for user".to_string(),
                    ))
                }
            },
            SenderType::Admin => payload.sender_id.unwrap_or(ADMIN_SENDER_ID),
        };

        let content = payload.content.filter(|c| !c.is_empty());
        let image_url = payload.image_url.filter(|u| !u.trim().is_empty());
        let has_text = content.as_deref().map_or(false, |c| !c.trim().is_empty());
        if !has_text && image_url.is_none() {
            return Err(RelayError::missing("content or imageUrl"));
        }

        Ok(Self {
            conversation_id,
            sender_id,
            sender_type,
            content,
            image_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkReadRequest {
    pub conversation_id: ConversationId,
    /// The party doing the reading; the counterpart's messages get flagged.
    pub reader: SenderType,
}

impl TryFrom<MarkReadPayload> for MarkReadRequest {
    type Error = RelayError;

    fn try_from(payload: MarkReadPayload) -> Result<Self, Self::Error> {
        Ok(Self {
            conversation_id: payload
                .conversation_id
                .ok_or_else(|| RelayError::missing("conversationId"))?,
            reader: payload
                .sender_type
                .ok_or_else(|| RelayError::missing("senderType"))?,
        })
    }
}

impl TryFrom<TypingPayload> for TypingSignal {
    type Error = RelayError;

    fn try_from(payload: TypingPayload) -> Result<Self, Self::Error> {
        Ok(Self {
            conversation_id: payload
                .conversation_id
                .ok_or_else(|| RelayError::missing("conversationId"))?,
            is_typing: payload.is_typing.unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Fan-out of a persisted message to the conversation room.
    NewMessage(Message),
    /// Same payload as `NewMessage`, sent to every connection when a user writes.
    AdminNotification(Message),
    MessagesRead(ReadReceipt),
    Typing(TypingSignal),
    JoinedConversation(RoomAck),
    Error(ErrorNotice),
    Pong,
}

impl ServerEvent {
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub reader_type: SenderType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAck {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_message_frame() {
        let frame = concat!(
            r#"{"event":"send-message","data":{"conversationId":7,"#,
            r#""senderId":0,"senderType":"admin","content":"hi"}}"#
        );
        let event = ClientEvent::from_frame(frame).unwrap();
        let ClientEvent::SendMessage(payload) = event else {
            panic!("expected send-message");
        };
        let msg = NewMessage::try_from(payload).unwrap();
        assert_eq!(msg.conversation_id, 7);
        assert_eq!(msg.sender_type, SenderType::Admin);
        assert_eq!(msg.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_ping_has_no_payload() {
        assert_eq!(
            ClientEvent::from_frame(r#"{"event":"ping"}"#).unwrap(),
            ClientEvent::Ping
        );
        assert_eq!(ServerEvent::Pong.to_frame().unwrap(), r#"{"event":"pong"}"#);
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let err =
            ClientEvent::from_frame(r#"{"event":"delete-everything","data":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::MissingField(_)));
    }

    #[test]
    fn test_wrong_field_type_is_rejected() {
        let frame = r#"{"event":"leave-conversation","data":{"conversationId":"x"}}"#;
        let err = ClientEvent::from_frame(frame).unwrap_err();
        assert!(matches!(err, RelayError::MissingField(_)));
    }

    #[test]
    fn test_user_sender_needs_positive_id() {
        let payload = SendMessagePayload {
            conversation_id: Some(7),
            sender_id: Some(0),
            sender_type: Some(SenderType::User),
            content: Some("hello".to_string()),
            image_url: None,
        };
        let err = NewMessage::try_from(payload).unwrap_err();
        assert_eq!(err.to_string(), "Missing or invalid senderId for user");
    }

    #[test]
    fn test_admin_sender_defaults_to_system_id() {
        let payload = SendMessagePayload {
            conversation_id: Some(7),
            sender_type: Some(SenderType::Admin),
            image_url: Some("https://cdn.example.com/a.png".to_string()),
            ..Default::default()
        };
        let msg = NewMessage::try_from(payload).unwrap();
        assert_eq!(msg.sender_id, ADMIN_SENDER_ID);
        assert!(msg.content.is_none());
    }

    #[test]
    fn test_send_requires_conversation_and_body() {
        let err = NewMessage::try_from(SendMessagePayload {
            sender_id: Some(42),
            sender_type: Some(SenderType::User),
            content: Some("hello".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, RelayError::missing("conversationId"));

        let err = NewMessage::try_from(SendMessagePayload {
            conversation_id: Some(7),
            sender_id: Some(42),
            sender_type: Some(SenderType::User),
            content: Some("   ".to_string()),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, RelayError::missing("content or imageUrl"));
    }

    #[test]
    fn test_join_validation() {
        let err = JoinRequest::try_from(JoinPayload::default()).unwrap_err();
        assert_eq!(err, RelayError::missing("conversationId"));

        let err = JoinRequest::try_from(JoinPayload {
            conversation_id: Some(7),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err, RelayError::missing("userId"));

        let req = JoinRequest::try_from(JoinPayload {
            conversation_id: Some(7),
            user_id: None,
            is_admin: Some(true),
        })
        .unwrap();
        assert!(req.actor.is_admin);
    }

    #[test]
    fn test_server_event_wire_names() {
        let frame = ServerEvent::MessagesRead(ReadReceipt {
            conversation_id: 7,
            reader_type: SenderType::User,
        })
        .to_frame()
        .unwrap();
        assert_eq!(
            frame,
            r#"{"event":"messages-read","data":{"conversationId":7,"readerType":"user"}}"#
        );

        let notice = ServerEvent::Error(ErrorNotice {
            message: "Access denied to this conversation".to_string(),
            error: None,
        });
        let parsed = ServerEvent::from_frame(&notice.to_frame().unwrap()).unwrap();
        assert_eq!(parsed, notice);
    }
}
