//! Client side of the support chat: the realtime connection, the chat window's
//! message list, chat history over HTTP, and the contract settlement poller.

pub mod error;
pub mod history;
pub mod settlement;
pub mod socket;
pub mod window;

pub use error::ClientError;
pub use history::HistoryClient;
pub use settlement::{
    HttpSettlementApi, Market, PollerHandle, SettlementConfig, SettlementPoller, TickOutcome,
};
pub use socket::{reconnect_delay, ChatClient, ClientConfig, ClientStatus, ClientUpdate};
pub use window::ChatWindow;
