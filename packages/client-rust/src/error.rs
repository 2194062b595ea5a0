//! Error types surfaced by the client engine.

/// Errors returned by connection, request, and handler-registration calls.
#[derive(Debug, thiserror::Error)]
pub enum AmiError {
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),
    #[error("login error: {message}")]
    Login { message: String },
    #[error("empty response or timed out")]
    EmptyOrTimedOut,
    #[error("handler not found")]
    HandlerNotFound,
    #[error("default event handler already exists")]
    DefaultHandlerExists,
    #[error("handler of event type '{name}' already exists")]
    EventHandlerExists { name: String },
    #[error("invalid connection url: {0}")]
    InvalidUrl(String),
    #[error("connection closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
