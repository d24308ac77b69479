use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("user already online: {0}")]
    UserAlreadyOnline(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to start room {name}: {reason}")]
    ProcessStart { name: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid command token: {0}")]
    InvalidCommand(String),

    #[error("duplicate command token: {0}")]
    DuplicateCommand(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("peer disconnected")]
    Disconnected,
}

impl ChatError {
    /// Whether a handler error should be reported to the invoking client
    /// while keeping its connection open.
    ///
    /// I/O failures and peer disconnects end the session instead.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ChatError::Network(_) | ChatError::Disconnected)
    }
}
