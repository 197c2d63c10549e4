pub mod db;
pub mod memory;

pub use memory::InMemoryChatStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tradedesk_core::{
    ChatStore, Conversation, ConversationId, ConversationSummary, Message, NewMessage, SenderType,
    StoreError, UserId,
};

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::DatabaseError(e.to_string())
}

/// A PostgreSQL-backed chat store.
pub struct PostgresChatStore {
    pub pool: sqlx::PgPool,
}

impl PostgresChatStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PostgresChatStore {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        db::find_conversation(&self.pool, id).await.map_err(db_error)
    }

    async fn current_conversation(&self, user_id: UserId) -> Result<Conversation, StoreError> {
        if let Some(existing) = db::first_conversation_for_user(&self.pool, user_id)
            .await
            .map_err(db_error)?
        {
            return Ok(existing);
        }
        let created = db::insert_conversation(&self.pool, user_id)
            .await
            .map_err(db_error)?;
        tracing::info!(conversation_id = created.id, user_id, "Opened support conversation");
        Ok(created)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        db::list_conversations(&self.pool).await.map_err(db_error)
    }

    async fn create_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        db::insert_message(&self.pool, message).await.map_err(db_error)
    }

    async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = db::update_last_message_at(&self.pool, id, at)
            .await
            .map_err(db_error)?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("conversation {}", id)));
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        authored_by: SenderType,
    ) -> Result<u64, StoreError> {
        db::mark_read(&self.pool, conversation_id, authored_by)
            .await
            .map_err(db_error)
    }

    async fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        db::messages_before(&self.pool, conversation_id, before, limit)
            .await
            .map_err(db_error)
    }
}
