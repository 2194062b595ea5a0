use std::sync::Arc;
use std::time::Duration;

use amilink_core::Message;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::error::AmiError;

/// Callback invoked with a message, or `None` as the terminal sentinel.
pub type Handler = Arc<dyn Fn(Option<Message>) + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(Option<Message>) + Send + Sync + 'static,
{
    Arc::new(f)
}

// ---------------------------------------------------------------------------
// HandlerKind
// ---------------------------------------------------------------------------

/// Registry namespace. Keys in different namespaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Keyed by event name.
    Event,
    /// Keyed by `ActionID`; entries expire after the request timeout.
    Request,
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Keyed callback storage with timeout-driven expiry for request entries.
///
/// Backed by a `DashMap`, so lookups from concurrent dispatch tasks only
/// contend per shard. Handlers are always invoked after the map guard has
/// been released.
pub struct HandlerRegistry {
    handlers: DashMap<(HandlerKind, String), Handler>,
    request_timeout: Duration,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            handlers: DashMap::new(),
            request_timeout,
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Registers `handler`, replacing any entry under the same key.
    ///
    /// A request entry arms a one-shot expiry task: after the request
    /// timeout it hands the sentinel to the handler it was armed for and
    /// removes the key. The timer is not cancelled by [`complete`], so a
    /// completed request can observe the sentinel a second time.
    ///
    /// Must be called from within a tokio runtime when `kind` is `Request`.
    ///
    /// [`complete`]: HandlerRegistry::complete
    pub fn set(self: &Arc<Self>, kind: HandlerKind, key: &str, handler: Option<Handler>) {
        let Some(handler) = handler else {
            return;
        };
        self.handlers.insert((kind, key.to_string()), Arc::clone(&handler));
        if kind == HandlerKind::Request {
            self.arm_expiry(key.to_string(), handler);
        }
    }

    /// Registers `handler` only if no entry exists for the key.
    ///
    /// Returns `false` (leaving the existing entry active) on conflict.
    /// Event entries only; request entries go through [`set`].
    ///
    /// [`set`]: HandlerRegistry::set
    pub fn set_if_absent(&self, kind: HandlerKind, key: &str, handler: Handler) -> bool {
        match self.handlers.entry((kind, key.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handler);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, kind: HandlerKind, key: &str) -> Option<Handler> {
        self.handlers
            .get(&(kind, key.to_string()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, kind: HandlerKind, key: &str) -> Option<Handler> {
        self.handlers
            .remove(&(kind, key.to_string()))
            .map(|(_, handler)| handler)
    }

    /// Invokes the handler registered for the key with `message`.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::HandlerNotFound` if nothing is registered.
    pub fn dispatch(
        &self,
        kind: HandlerKind,
        key: &str,
        message: &Message,
    ) -> Result<(), AmiError> {
        let handler = self.get(kind, key).ok_or(AmiError::HandlerNotFound)?;
        handler(Some(message.clone()));
        Ok(())
    }

    /// Removes the entry and delivers the terminal sentinel to it.
    ///
    /// Returns `false` if nothing was registered.
    pub fn complete(&self, kind: HandlerKind, key: &str) -> bool {
        match self.remove(kind, key) {
            Some(handler) => {
                handler(None);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn arm_expiry(self: &Arc<Self>, key: String, handler: Handler) {
        let registry = Arc::clone(self);
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            trace!(action_id = %key, "request handler expired");
            handler(None);
            registry.remove(HandlerKind::Request, &key);
        });
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entries", &self.handlers.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
