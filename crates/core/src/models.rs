use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ConversationId = i64;
pub type MessageId = i64;
pub type UserId = i64;
pub type PositionId = i64;

/// Sender id reserved for messages written by support staff as "the system".
pub const ADMIN_SENDER_ID: UserId = 0;

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

/// Which side of a support thread authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Admin,
}

impl SenderType {
    /// The other party of the conversation.
    pub fn counterpart(&self) -> Self {
        match self {
            SenderType::User => SenderType::Admin,
            SenderType::Admin => SenderType::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Admin => "admin",
        }
    }
}

impl fmt::Display for SenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(SenderType::User),
            "admin" => Ok(SenderType::Admin),
            other => Err(format!("unknown sender type: {}", other)),
        }
    }
}

/// Whoever is asking to join or post to a conversation room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversations & Messages
// ---------------------------------------------------------------------------

/// A single user's support thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn room(&self) -> String {
        room_name(self.id)
    }
}

/// Name of the realtime room that mirrors a conversation.
pub fn room_name(id: ConversationId) -> String {
    format!("conversation-{}", id)
}

/// A conversation as listed on the admin dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// User-authored messages support has not read yet.
    pub unread_count: i64,
}

/// A persisted chat message. Immutable except for `is_read`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_type: SenderType,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// A message that has been validated but not yet persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_type: SenderType,
    pub content: Option<String>,
    pub image_url: Option<String>,
}

/// Response of the chat window's opening request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// One page of older messages, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Contract positions (owned by the trading backend, read-only here)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionResult {
    Win,
    Loss,
}

/// Which way the contract bets the price will move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractDirection {
    Up,
    Down,
}

/// A binary-style contract position as reported by the trading backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub direction: ContractDirection,
    /// Stake placed on the contract.
    pub amount: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    pub status: PositionStatus,
    #[serde(default)]
    pub result: Option<PositionResult>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }
}

/// What the user is shown once a contract settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementNotice {
    pub position_id: PositionId,
    pub symbol: String,
    pub direction: ContractDirection,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub result: PositionResult,
    pub profit: Decimal,
    pub handling_fee: Decimal,
    pub settled_at: DateTime<Utc>,
}

impl SettlementNotice {
    /// Build the display payload for a closed position.
    ///
    /// Returns `None` while the position is still open or the backend has not
    /// filled in its result yet. The handling fee is charged on the stake.
    pub fn from_position(position: &Position, fee_rate: Decimal) -> Option<Self> {
        if !position.is_closed() {
            return None;
        }
        let result = position.result?;
        let exit_price = position.exit_price?;
        let handling_fee = (position.amount * fee_rate).round_dp(8);
        let profit = position.profit.unwrap_or(match result {
            PositionResult::Win => Decimal::ZERO,
            PositionResult::Loss => -position.amount,
        });

        Some(Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            direction: position.direction,
            amount: position.amount,
            entry_price: position.entry_price,
            exit_price,
            result,
            profit,
            handling_fee,
            settled_at: position.closed_at.unwrap_or(position.expires_at),
        })
    }
}
