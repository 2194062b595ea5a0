//! Connection configuration, lifecycle control, and the connection manager.

pub mod config;
pub mod connection;
pub mod lifecycle;

pub use config::*;
pub use connection::AmiConnection;
pub use lifecycle::{ConnectionState, InFlightGuard, Lifecycle};
