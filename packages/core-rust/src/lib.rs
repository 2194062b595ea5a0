//! `amilink` Core: manager-protocol messages, frame codec, and action ids.

pub mod codec;
pub mod ids;
pub mod message;

pub use codec::{parse, serialize, FrameCodec};
pub use ids::{ActionIdGenerator, HexActionIds, UuidActionIds};
pub use message::{ActionResponse, Fields, Message};
