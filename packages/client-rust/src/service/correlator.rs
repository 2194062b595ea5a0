//! Request/response correlation.
//!
//! Every outbound action is tagged with an `ActionID` and a handler is
//! registered under that id in the request namespace. Callers consume the
//! responses in one of three styles, all built on [`Subscription`]:
//!
//! - callback ([`Correlator::send_async`])
//! - blocking aggregation ([`Correlator::send_blocking`])
//! - pull-based stream ([`Correlator::send_streaming`])

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use amilink_core::{ActionIdGenerator, ActionResponse, Message};
use futures_util::stream::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::registry::{Handler, HandlerKind, HandlerRegistry};
use crate::error::AmiError;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Consumer of one correlated request: zero or more messages, then an end
/// marker. The end marker may arrive more than once when explicit completion
/// races the expiry timer; implementations must tolerate that.
trait Subscription: Send + Sync + 'static {
    fn on_message(&self, message: Message);
    fn on_end(&self);
}

fn into_handler<S: Subscription>(subscription: Arc<S>) -> Handler {
    Arc::new(move |message: Option<Message>| match message {
        Some(m) => subscription.on_message(m),
        None => subscription.on_end(),
    })
}

/// Caller-supplied callback, passed through unchanged.
struct Callback(Handler);

impl Subscription for Callback {
    fn on_message(&self, message: Message) {
        (self.0)(Some(message));
    }

    fn on_end(&self) {
        (self.0)(None);
    }
}

/// Collects responses in arrival order and signals on the first end marker.
struct Aggregator {
    responses: Mutex<ActionResponse>,
    done: Mutex<Option<oneshot::Sender<()>>>,
}

impl Aggregator {
    fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let aggregator = Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            done: Mutex::new(Some(tx)),
        });
        (aggregator, rx)
    }

    fn take(&self) -> ActionResponse {
        std::mem::take(&mut *self.responses.lock())
    }
}

impl Subscription for Aggregator {
    fn on_message(&self, message: Message) {
        self.responses.lock().push(message);
    }

    fn on_end(&self) {
        if let Some(done) = self.done.lock().take() {
            let _ = done.send(());
        }
    }
}

/// Feeds a [`ResponseStream`]. `None` in the sender slot is the closed flag.
struct StreamSink {
    tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
}

impl StreamSink {
    fn new() -> (Arc<Self>, ResponseStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            tx: RwLock::new(Some(tx)),
        });
        (sink, ResponseStream { rx })
    }

    fn close(&self) {
        self.tx.write().take();
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}

impl Subscription for StreamSink {
    fn on_message(&self, message: Message) {
        if let Some(tx) = self.tx.read().as_ref() {
            // The consumer may have dropped the stream; nothing to do then.
            let _ = tx.send(message);
        }
    }

    fn on_end(&self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// ResponseStream
// ---------------------------------------------------------------------------

/// Pull-based view of the responses to one action.
///
/// Ends once the request's terminal sentinel has been delivered.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ResponseStream {
    /// Next response, or `None` once the request has completed.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Stops accepting further responses. Buffered ones can still be read.
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Drains the stream to completion.
    pub async fn collect_all(mut self) -> ActionResponse {
        let mut out = Vec::new();
        while let Some(message) = self.rx.recv().await {
            out.push(message);
        }
        out
    }
}

impl Stream for ResponseStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Assigns action ids, registers response handlers, and enqueues actions
/// onto the bounded outbound queue drained by the write loop.
#[derive(Clone)]
pub struct Correlator {
    registry: Arc<HandlerRegistry>,
    outbound: mpsc::Sender<Message>,
    ids: Arc<dyn ActionIdGenerator>,
}

impl Correlator {
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        outbound: mpsc::Sender<Message>,
        ids: Arc<dyn ActionIdGenerator>,
    ) -> Self {
        Self {
            registry,
            outbound,
            ids,
        }
    }

    /// Sends `action`; `handler` receives each response, then `None`.
    ///
    /// Waits while the outbound queue is full. Returns the action id.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Closed` if the write loop has stopped. The handler
    /// stays registered and still receives its sentinel on expiry.
    pub async fn send_async<F>(&self, action: &Message, handler: F) -> Result<String, AmiError>
    where
        F: Fn(Option<Message>) + Send + Sync + 'static,
    {
        self.subscribe(action, Arc::new(Callback(Arc::new(handler))))
            .await
    }

    /// Sends `action` and waits for its request window to close.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::EmptyOrTimedOut` if no response arrived before the
    /// terminal sentinel, or `AmiError::Closed` if the write loop has stopped.
    pub async fn send_blocking(&self, action: &Message) -> Result<ActionResponse, AmiError> {
        let (aggregator, done) = Aggregator::new();
        self.subscribe(action, Arc::clone(&aggregator)).await?;

        // The expiry task holds the handler, so the sender is never dropped
        // unsent; treat a dropped sender like an empty window anyway.
        let _ = done.await;

        let responses = aggregator.take();
        if responses.is_empty() {
            return Err(AmiError::EmptyOrTimedOut);
        }
        Ok(responses)
    }

    /// Sends `action` and returns a stream of its responses.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Closed` if the write loop has stopped.
    pub async fn send_streaming(&self, action: &Message) -> Result<ResponseStream, AmiError> {
        let (sink, stream) = StreamSink::new();
        self.subscribe(action, sink).await?;
        Ok(stream)
    }

    /// Ends the request window for `action_id` early, delivering the sentinel.
    ///
    /// Returns `false` if no handler was registered.
    pub fn complete(&self, action_id: &str) -> bool {
        self.registry.complete(HandlerKind::Request, action_id)
    }

    #[must_use]
    pub fn ids(&self) -> &dyn ActionIdGenerator {
        self.ids.as_ref()
    }

    async fn subscribe<S: Subscription>(
        &self,
        action: &Message,
        subscription: Arc<S>,
    ) -> Result<String, AmiError> {
        let action_id = action.action_id(self.ids.as_ref());
        self.registry.set(
            HandlerKind::Request,
            &action_id,
            Some(into_handler(subscription)),
        );
        trace!(action_id = %action_id, action = %action.action_name(), "enqueue action");
        self.outbound.send(action.copy()).await.map_err(|_| {
            debug!(action_id = %action_id, "outbound queue closed");
            AmiError::Closed
        })?;
        Ok(action_id)
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("registry", &self.registry)
            .field("outbound_capacity", &self.outbound.max_capacity())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
