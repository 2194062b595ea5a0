//! Request correlation and inbound routing.
//!
//! 1. **Registry** (`registry`): keyed handlers, request entries expire
//! 2. **Correlator** (`correlator`): send an action, collect its responses
//! 3. **Dispatcher** (`dispatcher`): route inbound frames to handlers

pub mod correlator;
pub mod dispatcher;
pub mod registry;

pub use correlator::{Correlator, ResponseStream};
pub use dispatcher::EventDispatcher;
pub use registry::{handler, Handler, HandlerKind, HandlerRegistry};
