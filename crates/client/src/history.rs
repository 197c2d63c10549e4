use crate::error::ClientError;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response};
use std::time::Duration;
use tradedesk_core::{
    Actor, ConversationId, ConversationPage, ConversationSummary, ErrorNotice, HistoryPage, UserId,
};

/// HTTP client for the chat history routes.
#[derive(Clone)]
pub struct HistoryClient {
    http: Client,
    base_url: String,
}

impl HistoryClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3001`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn current_conversation(
        &self,
        user_id: UserId,
    ) -> Result<ConversationPage, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/chat/conversation", self.base_url))
            .query(&[("userId", user_id)])
            .send()
            .await?;
        decode(response).await
    }

    /// Messages strictly older than `before`, oldest first.
    pub async fn messages_before(
        &self,
        conversation_id: ConversationId,
        actor: &Actor,
        before: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<HistoryPage, ClientError> {
        let mut query = vec![
            ("userId", actor.user_id.to_string()),
            ("isAdmin", actor.is_admin.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }

        let response = self
            .http
            .get(format!(
                "{}/api/chat/conversations/{}/messages",
                self.base_url, conversation_id
            ))
            .query(&query)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/admin/conversations", self.base_url))
            .send()
            .await?;
        decode(response).await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.json::<ErrorNotice>().await {
        Ok(notice) => notice.message,
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::ChatWindow;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tradedesk_api::{AppState, RelayConfig};
    use tradedesk_core::{ChatStore, NewMessage, SenderType};
    use tradedesk_data::InMemoryChatStore;

    async fn spawn_server(store: Arc<InMemoryChatStore>, page: i64) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RelayConfig {
            history_page_size: page,
            ..Default::default()
        };
        tokio::spawn(tradedesk_api::serve(listener, Arc::new(AppState::new(store, config))));
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_scrolls_back_through_history() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;
        for i in 0..5 {
            store
                .create_message(&NewMessage {
                    conversation_id: conversation.id,
                    sender_id: 42,
                    sender_type: SenderType::User,
                    content: Some(format!("m{}", i)),
                    image_url: None,
                })
                .await
                .unwrap();
        }
        let client = HistoryClient::new(spawn_server(store, 2).await).unwrap();

        let opening = client.current_conversation(42).await.unwrap();
        assert_eq!(opening.conversation.id, conversation.id);
        let mut window = ChatWindow::new(conversation.id, SenderType::User);
        window.load(opening.messages, opening.has_more);
        assert_eq!(window.len(), 2);

        let actor = Actor::user(42);
        while window.has_more() {
            let page = client
                .messages_before(conversation.id, &actor, window.oldest_timestamp(), None)
                .await
                .unwrap();
            window.prepend_history(page.messages, page.has_more);
        }
        let contents: Vec<_> = window
            .messages()
            .iter()
            .filter_map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_denied_history_surfaces_server_message() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;
        let client = HistoryClient::new(spawn_server(store, 10).await).unwrap();

        let err = client
            .messages_before(conversation.id, &Actor::user(99), None, None)
            .await
            .unwrap_err();
        match err {
            ClientError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Access denied to this conversation");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
