//! Reconnecting realtime client.
//!
//! A background task owns the WebSocket. Callers talk to it through a command
//! channel and receive server events plus connection status on an update channel.
//! When the connection drops the task reconnects forever with capped exponential
//! backoff, re-joins every acknowledged room and retries unanswered joins once.

use crate::error::ClientError;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tradedesk_core::{
    Actor, ClientEvent, ConversationId, JoinPayload, NewMessage, SenderType, ServerEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Realtime client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:3001/ws?userId=42`.
    pub url: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    /// Bound on each connection attempt, handshake included.
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/ws".to_string(),
            reconnect_base_ms: 500,
            reconnect_max_ms: 5_000,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 25,
        }
    }
}

impl ClientConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped at `max`.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connected,
    Reconnecting { attempt: u32, delay: Duration },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Status(ClientStatus),
    Event(ServerEvent),
}

enum Command {
    Send(ClientEvent),
    Shutdown,
}

/// Handle to the background connection task.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ChatClient {
    /// Spawn the connection task. Returns the handle and the update stream.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientUpdate>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (update_tx, updates) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(config, command_rx, update_tx));
        (Self { commands, task }, updates)
    }

    pub fn join(&self, conversation_id: ConversationId, actor: Actor) -> Result<(), ClientError> {
        self.emit(ClientEvent::join(conversation_id, actor))
    }

    pub fn leave(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        self.emit(ClientEvent::leave(conversation_id))
    }

    pub fn send_message(&self, message: NewMessage) -> Result<(), ClientError> {
        self.emit(ClientEvent::send(message))
    }

    pub fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader: SenderType,
    ) -> Result<(), ClientError> {
        self.emit(ClientEvent::mark_read(conversation_id, reader))
    }

    pub fn typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), ClientError> {
        self.emit(ClientEvent::typing(conversation_id, is_typing))
    }

    /// Queue an event. Events emitted while disconnected go out after the next reconnect.
    pub fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(event))
            .map_err(|_| ClientError::Closed)
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

/// Rooms the client asked for, split by whether the server has acknowledged them.
#[derive(Debug, Default)]
struct HeldRooms {
    pending: BTreeMap<ConversationId, PendingJoin>,
    joined: BTreeMap<ConversationId, JoinPayload>,
}

/// A join with no ack yet. It is replayed on one reconnect at most, so a join
/// the server denied is not retried forever.
#[derive(Debug)]
struct PendingJoin {
    payload: JoinPayload,
    replayed: bool,
}

impl HeldRooms {
    fn track(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::JoinConversation(payload) => {
                if let Some(id) = payload.conversation_id {
                    if !self.joined.contains_key(&id) {
                        let join = PendingJoin {
                            payload: payload.clone(),
                            replayed: false,
                        };
                        self.pending.insert(id, join);
                    }
                }
            }
            ClientEvent::LeaveConversation(payload) => {
                if let Some(id) = payload.conversation_id {
                    self.pending.remove(&id);
                    self.joined.remove(&id);
                }
            }
            _ => {}
        }
    }

    fn observe(&mut self, event: &ServerEvent) {
        if let ServerEvent::JoinedConversation(ack) = event {
            if let Some(join) = self.pending.remove(&ack.conversation_id) {
                self.joined.insert(ack.conversation_id, join.payload);
            }
        }
    }

    /// Joins to send on a fresh connection. Pending joins already replayed
    /// once without an ack are dropped here.
    fn rejoin_events(&mut self) -> Vec<ClientEvent> {
        self.pending.retain(|id, join| {
            if join.replayed {
                debug!(conversation_id = id, "Dropping unacknowledged join");
            }
            !join.replayed
        });
        let mut events: Vec<_> = self
            .joined
            .values()
            .cloned()
            .map(ClientEvent::JoinConversation)
            .collect();
        for join in self.pending.values_mut() {
            join.replayed = true;
            events.push(ClientEvent::JoinConversation(join.payload.clone()));
        }
        events
    }
}

/// Joins and leaves are replayed from `HeldRooms`; pings are pointless once stale.
fn is_replayable(event: &ClientEvent) -> bool {
    !matches!(
        event,
        ClientEvent::JoinConversation(_) | ClientEvent::LeaveConversation(_) | ClientEvent::Ping
    )
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

async fn run(
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    updates: mpsc::UnboundedSender<ClientUpdate>,
) {
    let mut rooms = HeldRooms::default();
    let mut outbox: VecDeque<ClientEvent> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        match open(&config).await {
            Ok(stream) => {
                attempt = 0;
                info!(url = %config.url, "Connected to chat server");
                let _ = updates.send(ClientUpdate::Status(ClientStatus::Connected));
                let ended =
                    session(stream, &config, &mut commands, &updates, &mut rooms, &mut outbox)
                        .await;
                match ended {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => warn!(reason = %reason, "Connection lost"),
                }
            }
            Err(e) => warn!(error = %e, "Connect attempt failed"),
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect_delay(attempt, config.reconnect_base(), config.reconnect_max());
        let _ = updates.send(ClientUpdate::Status(ClientStatus::Reconnecting { attempt, delay }));

        // Keep accepting commands while waiting so nothing emitted offline is lost.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let shutdown = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => break true,
                    Some(Command::Send(event)) => {
                        rooms.track(&event);
                        if is_replayable(&event) {
                            outbox.push_back(event);
                        }
                    }
                },
            }
        };
        if shutdown {
            break;
        }
    }

    let _ = updates.send(ClientUpdate::Status(ClientStatus::Disconnected));
}

async fn open(config: &ClientConfig) -> Result<WsStream, ClientError> {
    let request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let timeout = config.connect_timeout();
    let (stream, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| ClientError::ConnectTimeout(timeout))??;
    debug!(status = %response.status(), "WebSocket handshake complete");
    Ok(stream)
}

async fn send_event(
    sink: &mut SplitSink<WsStream, WsMessage>,
    event: &ClientEvent,
) -> Result<(), String> {
    let frame = event.to_frame().map_err(|e| e.to_string())?;
    sink.send(WsMessage::Text(frame)).await.map_err(|e| e.to_string())
}

async fn session(
    stream: WsStream,
    config: &ClientConfig,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    updates: &mpsc::UnboundedSender<ClientUpdate>,
    rooms: &mut HeldRooms,
    outbox: &mut VecDeque<ClientEvent>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    for event in rooms.rejoin_events() {
        if let Err(e) = send_event(&mut write, &event).await {
            return SessionEnd::Dropped(e);
        }
    }
    while let Some(event) = outbox.pop_front() {
        if let Err(e) = send_event(&mut write, &event).await {
            outbox.push_front(event);
            return SessionEnd::Dropped(e);
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.tick().await;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(Command::Shutdown) => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                Some(Command::Send(event)) => {
                    rooms.track(&event);
                    if let Err(e) = send_event(&mut write, &event).await {
                        if is_replayable(&event) {
                            outbox.push_back(event);
                        }
                        return SessionEnd::Dropped(e);
                    }
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = send_event(&mut write, &ClientEvent::Ping).await {
                    return SessionEnd::Dropped(e);
                }
            }
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match ServerEvent::from_frame(&text) {
                    Ok(event) => {
                        rooms.observe(&event);
                        let _ = updates.send(ClientUpdate::Event(event));
                    }
                    Err(e) => warn!(error = %e, "Unrecognised server frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return SessionEnd::Dropped("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tradedesk_api::{AppState, RelayConfig};
    use tradedesk_core::RoomAck;
    use tradedesk_data::InMemoryChatStore;

    async fn next_event<F>(
        updates: &mut mpsc::UnboundedReceiver<ClientUpdate>,
        mut pred: F,
    ) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match updates.recv().await {
                    Some(ClientUpdate::Event(event)) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("update stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(5);
        assert_eq!(reconnect_delay(1, base, max), Duration::from_millis(500));
        assert_eq!(reconnect_delay(2, base, max), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(4, base, max), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(5, base, max), max);
        assert_eq!(reconnect_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_held_rooms_follow_acks_and_leaves() {
        let mut rooms = HeldRooms::default();
        rooms.track(&ClientEvent::join(7, Actor::user(42)));
        rooms.track(&ClientEvent::join(8, Actor::user(42)));
        rooms.observe(&ServerEvent::JoinedConversation(RoomAck { conversation_id: 7 }));
        assert_eq!(rooms.joined.len(), 1);
        assert_eq!(rooms.pending.len(), 1);
        assert_eq!(rooms.rejoin_events().len(), 2);

        rooms.track(&ClientEvent::leave(7));
        rooms.track(&ClientEvent::leave(8));
        assert!(rooms.rejoin_events().is_empty());
    }

    #[test]
    fn test_unacknowledged_join_is_replayed_once() {
        let mut rooms = HeldRooms::default();
        rooms.track(&ClientEvent::join(7, Actor::user(42)));
        rooms.observe(&ServerEvent::JoinedConversation(RoomAck { conversation_id: 7 }));
        // The server never acks a join it denies.
        rooms.track(&ClientEvent::join(8, Actor::user(99)));

        let first = rooms.rejoin_events();
        assert_eq!(first.len(), 2);
        assert!(first.contains(&ClientEvent::join(8, Actor::user(99))));

        let second = rooms.rejoin_events();
        assert_eq!(second, vec![ClientEvent::join(7, Actor::user(42))]);
        assert!(rooms.pending.is_empty());

        // Asking again starts over.
        rooms.track(&ClientEvent::join(8, Actor::user(99)));
        assert_eq!(rooms.rejoin_events().len(), 2);
    }

    #[test]
    fn test_only_chat_events_are_buffered() {
        assert!(!is_replayable(&ClientEvent::Ping));
        assert!(!is_replayable(&ClientEvent::leave(7)));
        assert!(is_replayable(&ClientEvent::typing(7, true)));
    }

    #[tokio::test]
    async fn test_room_delivery_through_server() {
        let store = Arc::new(InMemoryChatStore::new());
        let conversation = store.insert_conversation(42).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(store.clone(), RelayConfig::default()));
        tokio::spawn(tradedesk_api::serve(listener, state));

        let (user, mut user_updates) = ChatClient::connect(ClientConfig {
            url: format!("ws://{}/ws?userId=42", addr),
            ..Default::default()
        });
        user.join(conversation.id, Actor::user(42)).unwrap();
        next_event(&mut user_updates, |e| matches!(e, ServerEvent::JoinedConversation(_))).await;

        let (admin, mut admin_updates) = ChatClient::connect(ClientConfig {
            url: format!("ws://{}/ws?isAdmin=true", addr),
            ..Default::default()
        });
        admin.join(conversation.id, Actor::admin(0)).unwrap();
        next_event(&mut admin_updates, |e| matches!(e, ServerEvent::JoinedConversation(_))).await;

        admin
            .send_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: 0,
                sender_type: SenderType::Admin,
                content: Some("hi".to_string()),
                image_url: None,
            })
            .unwrap();

        let event =
            next_event(&mut user_updates, |e| matches!(e, ServerEvent::NewMessage(_))).await;
        match event {
            ServerEvent::NewMessage(message) => {
                assert_eq!(message.content.as_deref(), Some("hi"));
                assert_eq!(message.sender_type, SenderType::Admin);
                assert_eq!(message.conversation_id, conversation.id);
            }
            other => panic!("unexpected event {:?}", other),
        }

        user.shutdown().await;
        admin.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejoins_rooms_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        // Accepts two connections, acknowledges the first join on each, and drops the first.
        tokio::spawn(async move {
            for round in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                while let Some(Ok(frame)) = ws.next().await {
                    let WsMessage::Text(text) = frame else { continue };
                    let event = ClientEvent::from_frame(&text).unwrap();
                    if let ClientEvent::JoinConversation(payload) = &event {
                        let ack = ServerEvent::JoinedConversation(RoomAck {
                            conversation_id: payload.conversation_id.unwrap(),
                        });
                        ws.send(WsMessage::Text(ack.to_frame().unwrap())).await.unwrap();
                        seen_tx.send((round, event)).unwrap();
                        break;
                    }
                }
                if round == 0 {
                    let _ = ws.close(None).await;
                } else {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });

        let (client, mut updates) = ChatClient::connect(ClientConfig {
            url: format!("ws://{}", addr),
            reconnect_base_ms: 10,
            reconnect_max_ms: 50,
            heartbeat_interval_secs: 60,
            ..Default::default()
        });
        client.join(7, Actor::user(42)).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap();
        assert_eq!(first.map(|(round, _)| round), Some(0));

        let second = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.0, 1);
        assert_eq!(second.1, ClientEvent::join(7, Actor::user(42)));

        let mut saw_reconnecting = false;
        while let Ok(update) = updates.try_recv() {
            if let ClientUpdate::Status(ClientStatus::Reconnecting { attempt: 1, .. }) = update {
                saw_reconnecting = true;
            }
        }
        assert!(saw_reconnecting);

        client.shutdown().await;
    }
}
