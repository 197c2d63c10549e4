use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Persistence Gateway
// ---------------------------------------------------------------------------

/// Errors that can occur talking to the chat store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Conversation and message records. The relay calls these but does not own them.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Look up a conversation by id.
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// The user's current conversation: the first one found, else a new one.
    async fn current_conversation(&self, user_id: UserId) -> Result<Conversation, StoreError>;

    /// All conversations, most recently active first, with unread user messages.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    /// Persist a message. The store assigns the id and the timestamp.
    async fn create_message(&self, message: &NewMessage) -> Result<Message, StoreError>;

    /// Set the conversation's last-message timestamp.
    async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flag every unread message written by `authored_by` as read.
    /// Returns the number of messages updated.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        authored_by: SenderType,
    ) -> Result<u64, StoreError>;

    /// Up to `limit` messages created strictly before `before` (or the newest
    /// ones when `before` is `None`), returned oldest first.
    async fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
}

// ---------------------------------------------------------------------------
// Settlement API (trading backend)
// ---------------------------------------------------------------------------

/// Errors from the trading backend's settlement endpoints.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Settlement rejected: {0}")]
    Rejected(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// A position id reported as newly closed by a settlement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledRef {
    pub id: PositionId,
}

/// Response body of `POST settle-user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default)]
    pub settled: u32,
    #[serde(default)]
    pub positions: Vec<SettledRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of `GET positions?status=CLOSED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionsResponse {
    pub success: bool,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The two settlement endpoints the poller consumes.
#[async_trait]
pub trait SettlementApi: Send + Sync {
    /// Close the user's expired open positions on `symbol` at `current_price`.
    async fn settle_user(
        &self,
        symbol: &str,
        current_price: Decimal,
    ) -> Result<SettleResponse, SettlementError>;

    /// Every closed position of the user, with full details.
    async fn closed_positions(&self) -> Result<Vec<Position>, SettlementError>;
}
