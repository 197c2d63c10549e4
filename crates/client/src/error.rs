use std::time::Duration;

/// Errors raised by the realtime and history clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Client is shut down")]
    Closed,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}
