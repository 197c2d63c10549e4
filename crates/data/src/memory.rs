//! In-process chat store for tests and database-less local runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tradedesk_core::{
    ChatStore, Conversation, ConversationId, ConversationSummary, Message, NewMessage, SenderType,
    StoreError, UserId,
};

#[derive(Default)]
struct Inner {
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: Vec<Message>,
    next_conversation_id: ConversationId,
    next_message_id: i64,
}

impl Inner {
    fn open_conversation(&mut self, user_id: UserId) -> Conversation {
        self.next_conversation_id += 1;
        let conversation = Conversation {
            id: self.next_conversation_id,
            user_id,
            last_message_at: None,
            created_at: Utc::now(),
        };
        self.conversations.insert(conversation.id, conversation.clone());
        conversation
    }

    /// Creation timestamps strictly increase at microsecond precision, like a
    /// `timestamptz` column, so pagination by time never ties.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        match self.messages.last() {
            Some(last) if last.created_at >= now => last.created_at + Duration::microseconds(1),
            _ => now,
        }
    }
}

/// Chat store kept entirely in memory.
///
/// Write failures can be switched on to exercise the relay's error paths.
#[derive(Default)]
pub struct InMemoryChatStore {
    inner: RwLock<Inner>,
    fail_message_writes: AtomicBool,
    fail_conversation_updates: AtomicBool,
    fail_read_updates: AtomicBool,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new conversation owned by `user_id`.
    pub async fn insert_conversation(&self, user_id: UserId) -> Conversation {
        self.inner.write().await.open_conversation(user_id)
    }

    /// Every message of a conversation, oldest first.
    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn set_fail_message_writes(&self, fail: bool) {
        self.fail_message_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_conversation_updates(&self, fail: bool) {
        self.fail_conversation_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_read_updates(&self, fail: bool) {
        self.fail_read_updates.store(fail, Ordering::SeqCst);
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::DatabaseError(format!("{} unavailable", what))
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().await.conversations.get(&id).cloned())
    }

    async fn current_conversation(&self, user_id: UserId) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .conversations
            .values()
            .find(|c| c.user_id == user_id)
            .cloned()
        {
            return Ok(existing);
        }
        Ok(inner.open_conversation(user_id))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .map(|c| ConversationSummary {
                conversation: c.clone(),
                unread_count: inner
                    .messages
                    .iter()
                    .filter(|m| {
                        m.conversation_id == c.id
                            && m.sender_type == SenderType::User
                            && !m.is_read
                    })
                    .count() as i64,
            })
            .collect();
        // Most recent activity first, conversations without messages last.
        summaries.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
                .then(b.conversation.id.cmp(&a.conversation.id))
        });
        Ok(summaries)
    }

    async fn create_message(&self, message: &NewMessage) -> Result<Message, StoreError> {
        if self.fail_message_writes.load(Ordering::SeqCst) {
            return Err(injected("message table"));
        }
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        inner.next_message_id += 1;
        let stored = Message {
            id: inner.next_message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_type: message.sender_type,
            content: message.content.clone(),
            image_url: message.image_url.clone(),
            is_read: false,
            created_at: inner.next_timestamp(),
        };
        inner.messages.push(stored.clone());
        Ok(stored)
    }

    async fn touch_conversation(
        &self,
        id: ConversationId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.fail_conversation_updates.load(Ordering::SeqCst) {
            return Err(injected("conversation table"));
        }
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
        conversation.last_message_at = Some(at);
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        authored_by: SenderType,
    ) -> Result<u64, StoreError> {
        if self.fail_read_updates.load(Ordering::SeqCst) {
            return Err(injected("message table"));
        }
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for message in inner.messages.iter_mut().filter(|m| {
            m.conversation_id == conversation_id && m.sender_type == authored_by && !m.is_read
        }) {
            message.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn messages_before(
        &self,
        conversation_id: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut page: Vec<Message> = inner
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .take(limit)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }
}
