use crate::config::RelayConfig;
use crate::relay::MessageRelay;
use crate::rooms::RoomRegistry;
use std::sync::Arc;
use tradedesk_core::ChatStore;

/// Shared application state accessible by all route and socket handlers.
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    /// Live connections and their rooms. One per process.
    pub rooms: Arc<RoomRegistry>,
    pub relay: MessageRelay,
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>, config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomRegistry::new());
        let relay = MessageRelay::new(store.clone(), rooms.clone());
        Self {
            store,
            rooms,
            relay,
            config,
        }
    }
}
