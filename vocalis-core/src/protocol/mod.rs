//! WebSocket protocol clients: the conversation session (dialog messages,
//! the `protocol:audio` extension) and the STT session (raw audio in,
//! transcript out).

pub mod audio_subprotocol;
pub mod conversation;
pub mod stt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http handshake error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed url: {0}")]
    Url(#[from] url::ParseError),

    #[error("malformed json message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server returned HTTP {status} during auth handshake: {body}")]
    AuthHandshakeFailed { status: u16, body: String },

    #[error("missing OAuth2 access token in configuration")]
    MissingOAuthToken,

    #[error("connection closed by peer")]
    Closed,
}
