use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tradedesk_core::{
    Conversation, ConversationId, ConversationSummary, Message, NewMessage, SenderType, UserId,
};

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

const CONVERSATION_COLUMNS: &str = "id, user_id, last_message_at, created_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, sender_type, content, image_url, is_read, created_at";

fn conversation_from_row(r: &PgRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        last_message_at: r.try_get("last_message_at")?,
        created_at: r.try_get("created_at")?,
    })
}

fn message_from_row(r: &PgRow) -> Result<Message, sqlx::Error> {
    let sender_type: String = r.try_get("sender_type")?;
    let sender_type = sender_type
        .parse::<SenderType>()
        .map_err(|e| sqlx::Error::Decode(e.into()))?;

    Ok(Message {
        id: r.try_get("id")?,
        conversation_id: r.try_get("conversation_id")?,
        sender_id: r.try_get("sender_id")?,
        sender_type,
        content: r.try_get("content")?,
        image_url: r.try_get("image_url")?,
        is_read: r.try_get("is_read")?,
        created_at: r.try_get("created_at")?,
    })
}

/// Load a single conversation.
pub async fn find_conversation(
    pool: &PgPool,
    id: ConversationId,
) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(conversation_from_row).transpose()
}

/// The user's oldest conversation, if any.
pub async fn first_conversation_for_user(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE user_id = $1
         ORDER BY id ASC
         LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(conversation_from_row).transpose()
}

/// Open a new conversation for a user.
pub async fn insert_conversation(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Conversation, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO conversations (user_id) VALUES ($1) RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    conversation_from_row(&row)
}

/// Conversations for the admin dashboard, most recently active first.
pub async fn list_conversations(pool: &PgPool) -> Result<Vec<ConversationSummary>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT c.id, c.user_id, c.last_message_at, c.created_at,
                COUNT(m.id) FILTER (WHERE m.sender_type = 'user' AND NOT m.is_read) AS unread_count
         FROM conversations c
         LEFT JOIN messages m ON m.conversation_id = c.id
         GROUP BY c.id
         ORDER BY c.last_message_at DESC NULLS LAST, c.id DESC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(ConversationSummary {
                conversation: conversation_from_row(r)?,
                unread_count: r.try_get("unread_count")?,
            })
        })
        .collect()
}

/// Insert a message and return it with its assigned id and timestamp.
pub async fn insert_message(pool: &PgPool, message: &NewMessage) -> Result<Message, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO messages (conversation_id, sender_id, sender_type, content, image_url)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(message.conversation_id)
    .bind(message.sender_id)
    .bind(message.sender_type.as_str())
    .bind(&message.content)
    .bind(&message.image_url)
    .fetch_one(pool)
    .await?;

    message_from_row(&row)
}

/// Set a conversation's last-message timestamp. Returns the rows touched.
pub async fn update_last_message_at(
    pool: &PgPool,
    id: ConversationId,
    at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE conversations SET last_message_at = $2 WHERE id = $1")
        .bind(id)
        .bind(at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Flag unread messages written by `authored_by` as read.
pub async fn mark_read(
    pool: &PgPool,
    conversation_id: ConversationId,
    authored_by: SenderType,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE messages SET is_read = TRUE
         WHERE conversation_id = $1 AND sender_type = $2 AND is_read = FALSE",
    )
    .bind(conversation_id)
    .bind(authored_by.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// A page of messages older than `before`, oldest first.
pub async fn messages_before(
    pool: &PgPool,
    conversation_id: ConversationId,
    before: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<Message>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = $1 AND ($2::timestamptz IS NULL OR created_at < $2)
         ORDER BY created_at DESC, id DESC
         LIMIT $3"
    ))
    .bind(conversation_id)
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut messages = rows
        .iter()
        .map(message_from_row)
        .collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}
