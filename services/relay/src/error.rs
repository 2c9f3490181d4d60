//! Terminal failures of a single relay session.
//!
//! None of these affect other sessions or the process. Each one is reported
//! to the client as exactly one JSON envelope before the socket is closed.

use crate::relay::protocol::ServerMessage;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Server misconfigured: missing ASR threshold env vars")]
    MissingThresholds,
    #[error("Server misconfigured: ASR env vars must be numeric")]
    InvalidThresholds,
    #[error("Missing API key")]
    MissingApiKey,
    #[error("Invalid upstream request: {0}")]
    UpstreamRequest(String),
    #[error("{0}")]
    UpstreamConnect(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SessionError {
    /// The envelope that tells the client why its session ended.
    pub fn envelope(&self) -> ServerMessage {
        let message = self.to_string();
        match self {
            SessionError::MissingApiKey => ServerMessage::Error { message },
            _ => ServerMessage::ProxyError { message },
        }
    }
}
