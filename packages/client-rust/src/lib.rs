//! amilink client: an asynchronous engine for line-oriented manager
//! interface sessions.
//!
//! [`AmiConnection`] logs in over any byte stream, correlates responses to
//! the actions that caused them, and routes unsolicited events to
//! registered handlers.

pub mod error;
pub mod network;
pub mod service;

pub use amilink_core::{ActionResponse, Message};
pub use error::AmiError;
pub use network::{AmiConnection, ConnectionConfig, ConnectionState};
pub use service::ResponseStream;
