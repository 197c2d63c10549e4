use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tradedesk_core::{ConversationId, Message, MessageId, SenderType, ServerEvent};

/// Message list of the currently open conversation.
///
/// Kept sorted by creation time (id breaks ties) and deduplicated by id. Events
/// for any other conversation are ignored.
#[derive(Debug, Clone)]
pub struct ChatWindow {
    conversation_id: ConversationId,
    /// Whose window this is. Unread counts are for the counterpart's messages.
    viewer: SenderType,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    has_more: bool,
    peer_typing: bool,
}

impl ChatWindow {
    pub fn new(conversation_id: ConversationId, viewer: SenderType) -> Self {
        Self {
            conversation_id,
            viewer,
            messages: Vec::new(),
            ids: HashSet::new(),
            has_more: true,
            peer_typing: false,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether older history may still exist on the server.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    /// Cursor for the next backward page.
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.created_at)
    }

    pub fn unread_count(&self) -> usize {
        let author = self.viewer.counterpart();
        self.messages
            .iter()
            .filter(|m| m.sender_type == author && !m.is_read)
            .count()
    }

    /// Replace the contents with the opening page.
    pub fn load(&mut self, messages: Vec<Message>, has_more: bool) {
        self.messages.clear();
        self.ids.clear();
        self.has_more = has_more;
        for message in messages {
            self.insert(message);
        }
    }

    /// Add one message. Returns false when it belongs elsewhere or is already held.
    pub fn insert(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || !self.ids.insert(message.id) {
            return false;
        }
        let key = (message.created_at, message.id);
        let pos = self
            .messages
            .partition_point(|m| (m.created_at, m.id) < key);
        self.messages.insert(pos, message);
        true
    }

    /// Merge an older page at the head. Returns how many messages were added
    /// above the current first one, so a view can keep its scroll anchor.
    pub fn prepend_history(&mut self, page: Vec<Message>, has_more: bool) -> usize {
        self.has_more = has_more;
        let anchor = self.messages.first().map(|m| (m.created_at, m.id));
        let mut added = 0;
        for message in page {
            let key = (message.created_at, message.id);
            if self.insert(message) && anchor.map_or(true, |a| key < a) {
                added += 1;
            }
        }
        added
    }

    /// Apply a realtime event. Returns true when the visible state changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::NewMessage(message) | ServerEvent::AdminNotification(message) => {
                self.insert(message.clone())
            }
            ServerEvent::MessagesRead(receipt)
                if receipt.conversation_id == self.conversation_id =>
            {
                self.mark_read_by(receipt.reader_type) > 0
            }
            ServerEvent::Typing(signal) if signal.conversation_id == self.conversation_id => {
                let changed = self.peer_typing != signal.is_typing;
                self.peer_typing = signal.is_typing;
                changed
            }
            _ => false,
        }
    }

    /// `reader` has read everything the other side wrote.
    fn mark_read_by(&mut self, reader: SenderType) -> usize {
        let author = reader.counterpart();
        let mut flipped = 0;
        for message in self.messages.iter_mut() {
            if message.sender_type == author && !message.is_read {
                message.is_read = true;
                flipped += 1;
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tradedesk_core::{ReadReceipt, TypingSignal};

    fn msg(
        id: MessageId,
        conversation_id: ConversationId,
        secs: i64,
        sender: SenderType,
    ) -> Message {
        Message {
            id,
            conversation_id,
            sender_id: if sender == SenderType::User { 42 } else { 0 },
            sender_type: sender,
            content: Some(format!("m{}", id)),
            image_url: None,
            is_read: false,
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
                + Duration::seconds(secs),
        }
    }

    fn ids(window: &ChatWindow) -> Vec<MessageId> {
        window.messages().iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_duplicate_delivery_is_ignored() {
        let mut window = ChatWindow::new(7, SenderType::User);
        window.load(vec![msg(1, 7, 0, SenderType::User), msg(2, 7, 1, SenderType::Admin)], false);

        assert!(!window.apply(&ServerEvent::NewMessage(msg(2, 7, 1, SenderType::Admin))));
        assert!(!window.apply(&ServerEvent::AdminNotification(msg(1, 7, 0, SenderType::User))));
        assert_eq!(ids(&window), vec![1, 2]);
    }

    #[test]
    fn test_other_conversations_are_ignored() {
        let mut window = ChatWindow::new(7, SenderType::Admin);
        assert!(!window.apply(&ServerEvent::AdminNotification(msg(3, 8, 0, SenderType::User))));
        assert!(window.is_empty());
    }

    #[test]
    fn test_out_of_order_insert_keeps_time_order() {
        let mut window = ChatWindow::new(7, SenderType::User);
        window.insert(msg(3, 7, 5, SenderType::Admin));
        window.insert(msg(1, 7, 1, SenderType::User));
        window.insert(msg(2, 7, 3, SenderType::User));
        assert_eq!(ids(&window), vec![1, 2, 3]);
        assert_eq!(window.oldest_timestamp(), Some(window.messages()[0].created_at));
    }

    #[test]
    fn test_prepend_history_reports_anchor_offset() {
        let mut window = ChatWindow::new(7, SenderType::User);
        window.load(
            vec![msg(10, 7, 10, SenderType::User), msg(11, 7, 11, SenderType::Admin)],
            true,
        );

        // Page overlaps the held head by one message.
        let page = vec![
            msg(8, 7, 8, SenderType::User),
            msg(9, 7, 9, SenderType::Admin),
            msg(10, 7, 10, SenderType::User),
        ];
        assert_eq!(window.prepend_history(page, false), 2);
        assert_eq!(ids(&window), vec![8, 9, 10, 11]);
        assert!(!window.has_more());
    }

    #[test]
    fn test_messages_read_flips_counterpart_only() {
        let mut window = ChatWindow::new(7, SenderType::User);
        window.load(vec![msg(1, 7, 0, SenderType::User), msg(2, 7, 1, SenderType::Admin)], false);
        assert_eq!(window.unread_count(), 1);

        // The admin read the user's messages; the user's own unread count is unchanged.
        let receipt = ReadReceipt { conversation_id: 7, reader_type: SenderType::Admin };
        assert!(window.apply(&ServerEvent::MessagesRead(receipt)));
        assert!(window.messages()[0].is_read);
        assert!(!window.messages()[1].is_read);
        assert_eq!(window.unread_count(), 1);

        let receipt = ReadReceipt { conversation_id: 7, reader_type: SenderType::User };
        assert!(window.apply(&ServerEvent::MessagesRead(receipt)));
        assert_eq!(window.unread_count(), 0);
    }

    #[test]
    fn test_typing_signal() {
        let mut window = ChatWindow::new(7, SenderType::User);
        let on = TypingSignal { conversation_id: 7, is_typing: true };
        assert!(window.apply(&ServerEvent::Typing(on)));
        assert!(window.peer_typing());
        assert!(!window.apply(&ServerEvent::Typing(on)));
        let elsewhere = TypingSignal { conversation_id: 8, is_typing: false };
        assert!(!window.apply(&ServerEvent::Typing(elsewhere)));
        assert!(window.peer_typing());
    }
}
