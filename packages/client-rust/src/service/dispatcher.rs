//! Routing of inbound frames to request, named-event, and default handlers.

use std::sync::Arc;

use amilink_core::{ActionIdGenerator, Message};
use parking_lot::RwLock;
use tracing::trace;

use super::registry::{Handler, HandlerKind, HandlerRegistry};
use crate::error::AmiError;

/// Routes each inbound message.
///
/// Order per message:
/// 1. request handler keyed by `ActionID` (never suppresses later steps)
/// 2. named event handler keyed by a non-empty `Event` field
/// 3. default handler, if step 2 found nothing
///
/// A response that also carries an `Event` field therefore reaches both its
/// request handler and an event handler.
pub struct EventDispatcher {
    registry: Arc<HandlerRegistry>,
    default_handler: RwLock<Option<Handler>>,
    ids: Arc<dyn ActionIdGenerator>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, ids: Arc<dyn ActionIdGenerator>) -> Self {
        Self {
            registry,
            default_handler: RwLock::new(None),
            ids,
        }
    }

    /// Installs the catch-all handler for events without a named handler.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::DefaultHandlerExists` if one is already installed;
    /// the original stays active.
    pub fn set_default_handler<F>(&self, handler: F) -> Result<(), AmiError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut slot = self.default_handler.write();
        if slot.is_some() {
            return Err(AmiError::DefaultHandlerExists);
        }
        *slot = Some(event_handler(handler));
        Ok(())
    }

    /// Installs a handler for events named `name`.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::EventHandlerExists` if `name` already has one; the
    /// original stays active.
    pub fn set_event_handler<F>(&self, name: &str, handler: F) -> Result<(), AmiError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if self
            .registry
            .set_if_absent(HandlerKind::Event, name, event_handler(handler))
        {
            Ok(())
        } else {
            Err(AmiError::EventHandlerExists {
                name: name.to_string(),
            })
        }
    }

    /// Removes the handler for `name`. Returns `false` if none was set.
    pub fn remove_event_handler(&self, name: &str) -> bool {
        self.registry.remove(HandlerKind::Event, name).is_some()
    }

    #[must_use]
    pub fn has_default_handler(&self) -> bool {
        self.default_handler.read().is_some()
    }

    /// Routes one inbound message.
    pub fn dispatch(&self, message: &Message) {
        let action_id = message.action_id(self.ids.as_ref());
        if self
            .registry
            .dispatch(HandlerKind::Request, &action_id, message)
            .is_err()
        {
            trace!(action_id = %action_id, "no request handler");
        }

        let event = message.event_name();
        let named_found = !event.is_empty()
            && self
                .registry
                .dispatch(HandlerKind::Event, &event, message)
                .is_ok();

        if named_found {
            return;
        }

        let default = self.default_handler.read().clone();
        if let Some(default) = default {
            default(Some(message.clone()));
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registry", &self.registry)
            .field("has_default_handler", &self.has_default_handler())
            .finish_non_exhaustive()
    }
}

/// Adapts an event callback to the registry's handler shape. Event entries
/// never receive the terminal sentinel.
fn event_handler<F>(f: F) -> Handler
where
    F: Fn(Message) + Send + Sync + 'static,
{
    Arc::new(move |message: Option<Message>| {
        if let Some(message) = message {
            f(message);
        }
    })
}
