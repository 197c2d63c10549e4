//! Room authorization rules.

use crate::error::RelayError;
use crate::models::*;
use crate::traits::ChatStore;

/// Admins may enter any conversation; users only their own.
pub fn can_access(conversation: &Conversation, actor: &Actor) -> bool {
    actor.is_admin || conversation.user_id == actor.user_id
}

/// Decide over an already-fetched lookup result, keeping "unknown" apart from "not yours".
pub fn check_access(
    conversation: Option<Conversation>,
    actor: &Actor,
) -> Result<Conversation, RelayError> {
    let conversation = conversation.ok_or_else(RelayError::conversation_not_found)?;
    if can_access(&conversation, actor) {
        Ok(conversation)
    } else {
        Err(RelayError::access_denied())
    }
}

/// Fetch the conversation and run [`check_access`] on it.
pub async fn authorize(
    store: &dyn ChatStore,
    conversation_id: Option<ConversationId>,
    actor: &Actor,
) -> Result<Conversation, RelayError> {
    let id = conversation_id.ok_or_else(|| RelayError::missing("conversationId"))?;
    let conversation = store
        .find_conversation(id)
        .await
        .map_err(|e| RelayError::persistence("Failed to load conversation", e))?;
    check_access(conversation, actor)
}
