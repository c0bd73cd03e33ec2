use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The peer closed the stream in the middle of a packet.
    #[error("Peer closed the connection mid-transfer")]
    PeerClosed,

    /// The result report never arrived during the drain phase.
    #[error("No response from server")]
    NoResponse,
}

pub type Result<T> = std::result::Result<T, Error>;
