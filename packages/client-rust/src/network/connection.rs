//! Connection manager: owns the stream, runs the write and read loops, and
//! performs the login handshake.
//!
//! The write loop drains the bounded outbound queue and injects a keepalive
//! `Ping` after every idle gap. The read loop frames inbound bytes and hands
//! each message to the [`EventDispatcher`] on its own task, so a slow handler
//! never holds up the next read. Both loops stop on the shared cancellation
//! signal or a fatal stream error; there is no reconnection.

use std::sync::Arc;
use std::time::Duration;

use amilink_core::message::{
    ACTION_LOGIN, ACTION_PING, KEY_ACTION_ID, KEY_MESSAGE, KEY_RESPONSE, KEY_SECRET, KEY_USERNAME,
    RESPONSE_SUCCESS,
};
use amilink_core::{ActionIdGenerator, ActionResponse, FrameCodec, Message, UuidActionIds};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::config::ConnectionConfig;
use super::lifecycle::{ConnectionState, Lifecycle};
use crate::error::AmiError;
use crate::service::{Correlator, EventDispatcher, HandlerRegistry, ResponseStream};

/// A logged-in manager connection.
///
/// Dropping the handle signals cancellation; call [`close`] to also wait for
/// both loops to finish.
///
/// [`close`]: AmiConnection::close
pub struct AmiConnection {
    config: Arc<ConnectionConfig>,
    correlator: Correlator,
    dispatcher: Arc<EventDispatcher>,
    lifecycle: Arc<Lifecycle>,
    loops: AsyncMutex<Vec<(&'static str, JoinHandle<()>)>>,
}

/// How long `close` waits for a loop to observe cancellation before aborting
/// it.
const LOOP_STOP_GRACE: Duration = Duration::from_secs(1);

impl AmiConnection {
    /// Dials `config.host:config.port` over TCP and logs in.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Connect` if the dial fails, or `AmiError::Login` if
    /// the server rejects the credentials.
    pub async fn open(config: ConnectionConfig) -> Result<Self, AmiError> {
        let address = config.address();
        let stream = TcpStream::connect(&address)
            .await
            .map_err(AmiError::Connect)?;
        info!("connected to {}", address);
        Self::open_with_stream(stream, config).await
    }

    /// Logs in over a caller-supplied stream.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Login` if the handshake fails. The stream is shut
    /// down before returning.
    pub async fn open_with_stream<S>(stream: S, config: ConnectionConfig) -> Result<Self, AmiError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open_with_ids(stream, config, Arc::new(UuidActionIds)).await
    }

    /// Like [`open_with_stream`], with an explicit action id generator.
    ///
    /// [`open_with_stream`]: AmiConnection::open_with_stream
    ///
    /// # Errors
    ///
    /// See [`open_with_stream`](AmiConnection::open_with_stream).
    pub async fn open_with_ids<S>(
        stream: S,
        config: ConnectionConfig,
        ids: Arc<dyn ActionIdGenerator>,
    ) -> Result<Self, AmiError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = Arc::new(config.prepared());
        let lifecycle = Arc::new(Lifecycle::new());
        let registry = Arc::new(HandlerRegistry::new(config.request_timeout));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);

        let correlator = Correlator::new(Arc::clone(&registry), outbound_tx, Arc::clone(&ids));
        let dispatcher = Arc::new(EventDispatcher::new(registry, Arc::clone(&ids)));

        let (reader, writer) = tokio::io::split(stream);
        let limiter = config
            .max_concurrent_dispatches
            .map(|n| Arc::new(Semaphore::new(n)));

        let write_task = tokio::spawn(write_loop(
            FramedWrite::new(writer, FrameCodec::new()),
            outbound_rx,
            lifecycle.cancel_receiver(),
            config.keepalive_interval,
            ids,
        ));
        let read_task = tokio::spawn(read_loop(
            FramedRead::new(reader, FrameCodec::new()),
            Arc::clone(&dispatcher),
            Arc::clone(&lifecycle),
            lifecycle.cancel_receiver(),
            limiter,
        ));

        let connection = Self {
            config,
            correlator,
            dispatcher,
            lifecycle,
            loops: AsyncMutex::new(vec![("write", write_task), ("read", read_task)]),
        };

        if let Err(err) = connection.login().await {
            warn!(error = %err, "login failed");
            connection.close().await;
            return Err(err);
        }

        connection.lifecycle.advance(ConnectionState::LoggedIn);
        connection.lifecycle.advance(ConnectionState::Running);
        info!(username = %connection.config.username, "logged in");
        Ok(connection)
    }

    async fn login(&self) -> Result<(), AmiError> {
        let action = Message::action(ACTION_LOGIN)
            .with(KEY_USERNAME, self.config.username.as_str())
            .with(KEY_SECRET, self.config.secret.as_str());

        let responses = match self.correlator.send_blocking(&action).await {
            Ok(responses) => responses,
            Err(AmiError::EmptyOrTimedOut) => Vec::new(),
            Err(err) => return Err(err),
        };

        match responses.as_slice() {
            [only] if only.get(KEY_RESPONSE).as_deref() == Some(RESPONSE_SUCCESS) => Ok(()),
            [only] => Err(AmiError::Login {
                message: only
                    .get(KEY_MESSAGE)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
            _ => Err(AmiError::Login {
                message: "unknown".to_string(),
            }),
        }
    }

    /// Signals cancellation and waits for both loops to stop. Idempotent.
    ///
    /// A loop that has not stopped within a short grace period is aborted,
    /// which drops its half of the stream. Handles stay registered until they
    /// are joined, so a `close` cut short by the caller can be retried.
    ///
    /// In-flight dispatch tasks are not interrupted; see [`wait_for_drain`].
    ///
    /// [`wait_for_drain`]: AmiConnection::wait_for_drain
    pub async fn close(&self) {
        if self.lifecycle.cancel() {
            info!("closing connection");
        }
        let mut loops = self.loops.lock().await;
        while let Some((name, handle)) = loops.last_mut() {
            match tokio::time::timeout(LOOP_STOP_GRACE, &mut *handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "{} loop panicked", name),
                Err(_) => {
                    warn!("{} loop ignored cancellation, aborting", name);
                    handle.abort();
                }
            }
            loops.pop();
        }
    }

    /// Sends `action`; `handler` receives every response, then `None`.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Closed` if the connection has stopped writing.
    pub async fn send_async<F>(&self, action: &Message, handler: F) -> Result<String, AmiError>
    where
        F: Fn(Option<Message>) + Send + Sync + 'static,
    {
        self.correlator.send_async(action, handler).await
    }

    /// Sends `action` and collects its responses until the request times out.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::EmptyOrTimedOut` if nothing arrived.
    pub async fn send_blocking(&self, action: &Message) -> Result<ActionResponse, AmiError> {
        self.correlator.send_blocking(action).await
    }

    /// Sends `action` and returns its responses as a stream.
    ///
    /// # Errors
    ///
    /// Returns `AmiError::Closed` if the connection has stopped writing.
    pub async fn send_streaming(&self, action: &Message) -> Result<ResponseStream, AmiError> {
        self.correlator.send_streaming(action).await
    }

    /// Ends the request window for `action_id` before its timeout.
    pub fn complete(&self, action_id: &str) -> bool {
        self.correlator.complete(action_id)
    }

    /// # Errors
    ///
    /// Returns `AmiError::DefaultHandlerExists` if one is already set.
    pub fn set_default_handler<F>(&self, handler: F) -> Result<(), AmiError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.dispatcher.set_default_handler(handler)
    }

    /// # Errors
    ///
    /// Returns `AmiError::EventHandlerExists` if `name` already has a handler.
    pub fn set_event_handler<F>(&self, name: &str, handler: F) -> Result<(), AmiError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.dispatcher.set_event_handler(name, handler)
    }

    pub fn remove_event_handler(&self, name: &str) -> bool {
        self.dispatcher.remove_event_handler(name)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Shared lifecycle handle; `cancel()` on it stops the loops from
    /// anywhere.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    #[must_use]
    pub fn in_flight_dispatches(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    /// Waits for running dispatch tasks to finish, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_for_drain(timeout).await
    }
}

impl Drop for AmiConnection {
    fn drop(&mut self) {
        self.lifecycle.cancel();
    }
}

impl std::fmt::Debug for AmiConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiConnection")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn keepalive_action(ids: &dyn ActionIdGenerator) -> Message {
    Message::action(ACTION_PING).with(KEY_ACTION_ID, ids.generate())
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Message>,
    mut cancel: watch::Receiver<bool>,
    keepalive: Duration,
    ids: Arc<dyn ActionIdGenerator>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while !*cancel.borrow() {
        let message = tokio::select! {
            _ = cancel.changed() => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
            () = tokio::time::sleep(keepalive) => keepalive_action(ids.as_ref()),
        };

        // A peer that stops reading can park the write indefinitely.
        let written = tokio::select! {
            _ = cancel.wait_for(|cancelled| *cancelled) => break,
            written = sink.send(message) => written,
        };
        if let Err(err) = written {
            warn!(error = %err, "write failed, stopping write loop");
            break;
        }
    }

    // Unflushed bytes belong to an abandoned write; shut down without them.
    let mut writer = sink.into_inner();
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "stream shutdown failed");
    }
    debug!("write loop stopped");
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    dispatcher: Arc<EventDispatcher>,
    lifecycle: Arc<Lifecycle>,
    mut cancel: watch::Receiver<bool>,
    limiter: Option<Arc<Semaphore>>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    while !*cancel.borrow() {
        let frame = tokio::select! {
            _ = cancel.changed() => break,
            frame = frames.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(error = %err, "read failed, stopping read loop");
                break;
            }
            None => {
                debug!("stream ended");
                break;
            }
        };

        let permit = match &limiter {
            Some(semaphore) => tokio::select! {
                _ = cancel.changed() => break,
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        let guard = lifecycle.in_flight_guard();
        let dispatcher = Arc::clone(&dispatcher);
        let span = debug_span!(
            "dispatch",
            event = %message.event_name(),
            action_id = message.existing_action_id().as_deref().unwrap_or(""),
        );
        tokio::spawn(
            async move {
                dispatcher.dispatch(&message);
                drop(permit);
                drop(guard);
            }
            .instrument(span),
        );
    }

    debug!("read loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use amilink_core::message::{KEY_ACTION, KEY_EVENT};
    use parking_lot::Mutex;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::net::TcpListener;

    use super::*;
    use crate::network::config::DEFAULT_QUEUE_CAPACITY;

    type ServerFrames = FramedRead<ReadHalf<DuplexStream>, FrameCodec>;
    type ServerSink = FramedWrite<WriteHalf<DuplexStream>, FrameCodec>;

    impl AmiConnection {
        async fn loop_finished(&self, name: &str) -> bool {
            self.loops
                .lock()
                .await
                .iter()
                .any(|(loop_name, handle)| *loop_name == name && handle.is_finished())
        }
    }

    /// Answers the login on `server`, then hands both framed halves to the
    /// test so it controls what the peer does next.
    async fn accept_login(server: DuplexStream) -> (ServerFrames, ServerSink) {
        let (read_half, write_half) = tokio::io::split(server);
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut out = FramedWrite::new(write_half, FrameCodec::new());
        let login = frames.next().await.unwrap().unwrap();
        out.send(login.copy().with(KEY_RESPONSE, RESPONSE_SUCCESS))
            .await
            .unwrap();
        (frames, out)
    }

    /// Replies produced by the mock server for one inbound frame.
    type Responder = Box<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

    struct MockServer {
        push: mpsc::Sender<Message>,
        seen: Arc<Mutex<Vec<Message>>>,
    }

    impl MockServer {
        async fn push(&self, message: Message) {
            self.push.send(message).await.unwrap();
        }

        fn seen_actions(&self) -> Vec<String> {
            self.seen.lock().iter().map(Message::action_name).collect()
        }
    }

    /// Echoes each action back with a marker field, like a minimal switch.
    fn echo() -> Responder {
        Box::new(|m: &Message| {
            let reply = m.copy();
            match m.action_name().as_str() {
                ACTION_LOGIN => reply.set(KEY_RESPONSE, RESPONSE_SUCCESS),
                ACTION_PING => reply.set("Ping", "Pong"),
                _ => reply.set("test", "test"),
            }
            vec![reply]
        })
    }

    fn reject_login(reason: &'static str) -> Responder {
        Box::new(move |m: &Message| {
            let reply = Message::new()
                .with(KEY_ACTION_ID, m.get_or_empty(KEY_ACTION_ID))
                .with(KEY_RESPONSE, "Error")
                .with(KEY_MESSAGE, reason);
            vec![reply]
        })
    }

    fn spawn_mock<S>(stream: S, respond: Responder) -> MockServer
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let mut out = FramedWrite::new(write_half, FrameCodec::new());
        let (push_tx, mut push_rx) = mpsc::channel::<Message>(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = frames.next() => {
                        let Some(Ok(message)) = frame else { return };
                        log.lock().push(message.copy());
                        for reply in respond(&message) {
                            if out.send(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(pushed) = push_rx.recv() => {
                        if out.send(pushed).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        MockServer { push: push_tx, seen }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            request_timeout: Duration::from_millis(100),
            ..ConnectionConfig::default()
        }
        .with_credentials("admin", "secret")
    }

    async fn open_mock(
        respond: Responder,
        config: ConnectionConfig,
    ) -> (AmiConnection, MockServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mock = spawn_mock(server, respond);
        let connection = AmiConnection::open_with_stream(client, config)
            .await
            .expect("login should succeed");
        (connection, mock)
    }

    /// Handler that forwards everything it sees into a channel.
    fn forwarder() -> (impl Fn(Message) + Send + Sync + 'static, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |m: Message| {
            let _ = tx.send(m);
        };
        (handler, rx)
    }

    async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Message>, ms: u64) -> Option<Message> {
        tokio::time::timeout(Duration::from_millis(ms), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn open_logs_in_and_runs() {
        let (connection, mock) = open_mock(echo(), test_config()).await;

        assert_eq!(connection.state(), ConnectionState::Running);
        assert!(connection.is_running());

        let login = mock.seen.lock()[0].clone();
        assert_eq!(login.get(KEY_ACTION).as_deref(), Some(ACTION_LOGIN));
        assert_eq!(login.get(KEY_USERNAME).as_deref(), Some("admin"));
        assert_eq!(login.get(KEY_SECRET).as_deref(), Some("secret"));
        assert!(login.existing_action_id().is_some());

        connection.close().await;
    }

    #[tokio::test]
    async fn login_rejection_carries_server_message() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _mock = spawn_mock(server, reject_login("bad credentials"));

        let err = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap_err();

        assert!(matches!(err, AmiError::Login { .. }));
        assert!(err.to_string().contains("bad credentials"));
    }

    #[tokio::test]
    async fn login_without_reply_fails_unknown() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _mock = spawn_mock(server, Box::new(|_m: &Message| Vec::new()));

        let err = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Login { ref message } if message == "unknown"));
    }

    #[tokio::test]
    async fn login_with_two_replies_fails() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let _mock = spawn_mock(
            server,
            Box::new(|m: &Message| {
                let ok = m.copy().with(KEY_RESPONSE, RESPONSE_SUCCESS);
                vec![ok.copy(), ok]
            }),
        );

        let err = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, AmiError::Login { .. }));
    }

    #[tokio::test]
    async fn send_blocking_returns_single_reply() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;

        let responses = connection
            .send_blocking(&Message::action("Test"))
            .await
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].get("test").as_deref(), Some("test"));
        connection.close().await;
    }

    #[tokio::test]
    async fn send_blocking_without_reply_times_out() {
        let silent_after_login: Responder = Box::new(|m: &Message| {
            if m.action_name() == ACTION_LOGIN {
                vec![m.copy().with(KEY_RESPONSE, RESPONSE_SUCCESS)]
            } else {
                Vec::new()
            }
        });
        let (connection, _mock) = open_mock(silent_after_login, test_config()).await;

        let result = connection.send_blocking(&Message::action("Test")).await;
        assert!(matches!(result, Err(AmiError::EmptyOrTimedOut)));
        connection.close().await;
    }

    #[tokio::test]
    async fn send_async_invokes_callback_then_sentinel() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        connection
            .send_async(&Message::action("Ttt"), move |m| {
                let _ = tx.send(m);
            })
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.unwrap().get("test").as_deref(), Some("test"));

        let last = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(last.is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn send_streaming_yields_then_ends() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;

        let stream = connection
            .send_streaming(&Message::action("Ttt"))
            .await
            .unwrap();
        let responses = tokio::time::timeout(Duration::from_secs(2), stream.collect_all())
            .await
            .expect("stream should end after the request timeout");

        assert_eq!(responses.len(), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn default_handler_receives_unsolicited_event() {
        let (connection, mock) = open_mock(echo(), test_config()).await;
        let (handler, mut rx) = forwarder();
        connection.set_default_handler(handler).unwrap();

        mock.push(Message::new().with(KEY_EVENT, "Test")).await;

        let got = recv_within(&mut rx, 500).await.expect("default handler invoked");
        assert_eq!(got.event_name(), "Test");
        connection.close().await;
    }

    #[tokio::test]
    async fn named_handler_wins_over_default() {
        let (connection, mock) = open_mock(echo(), test_config()).await;
        let (named, mut named_rx) = forwarder();
        let (default, mut default_rx) = forwarder();
        connection.set_event_handler("Test", named).unwrap();
        connection.set_default_handler(default).unwrap();

        mock.push(Message::new().with(KEY_EVENT, "Test")).await;

        assert!(recv_within(&mut named_rx, 500).await.is_some());
        assert!(recv_within(&mut default_rx, 100).await.is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn echoed_event_reaches_request_and_default() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;
        let (default, mut default_rx) = forwarder();
        connection.set_default_handler(default).unwrap();

        let responses = connection
            .send_blocking(&Message::new().with(KEY_EVENT, "Test"))
            .await
            .unwrap();

        assert_eq!(responses.len(), 1);
        assert!(recv_within(&mut default_rx, 500).await.is_some());
        connection.close().await;
    }

    #[tokio::test]
    async fn duplicate_handlers_rejected() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;

        connection.set_default_handler(|_m| {}).unwrap();
        assert!(matches!(
            connection.set_default_handler(|_m| {}),
            Err(AmiError::DefaultHandlerExists)
        ));

        connection.set_event_handler("Hangup", |_m| {}).unwrap();
        assert!(matches!(
            connection.set_event_handler("Hangup", |_m| {}),
            Err(AmiError::EventHandlerExists { .. })
        ));
        connection.close().await;
    }

    #[tokio::test]
    async fn keepalive_sent_when_idle() {
        let config = ConnectionConfig {
            keepalive_interval: Duration::from_millis(40),
            ..test_config()
        };
        let (connection, mock) = open_mock(echo(), config).await;

        tokio::time::sleep(Duration::from_millis(200)).await;

        let pings = mock
            .seen
            .lock()
            .iter()
            .filter(|m| m.action_name() == ACTION_PING)
            .count();
        assert!(pings >= 1, "expected a keepalive during the idle gap");
        assert!(mock
            .seen
            .lock()
            .iter()
            .all(|m| m.existing_action_id().is_some()));
        connection.close().await;
    }

    #[tokio::test]
    async fn outbound_written_in_enqueue_order() {
        let (connection, mock) = open_mock(echo(), test_config()).await;

        for name in ["A", "B", "C", "D"] {
            connection
                .send_async(&Message::action(name), |_| {})
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let actions: Vec<String> = mock
            .seen_actions()
            .into_iter()
            .filter(|a| a != ACTION_LOGIN && a != ACTION_PING)
            .collect();
        assert_eq!(actions, vec!["A", "B", "C", "D"]);
        connection.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_writes() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;

        connection.close().await;
        connection.close().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        let result = connection.send_async(&Message::action("Late"), |_| {}).await;
        assert!(matches!(result, Err(AmiError::Closed)));
    }

    #[tokio::test]
    async fn external_cancel_stops_loops() {
        let (connection, _mock) = open_mock(echo(), test_config()).await;
        connection.lifecycle().cancel();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = connection.send_async(&Message::action("Late"), |_| {}).await;
        assert!(matches!(result, Err(AmiError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dispatch_bound_limits_concurrency() {
        let config = ConnectionConfig {
            max_concurrent_dispatches: Some(1),
            ..test_config()
        };
        let (connection, mock) = open_mock(echo(), config).await;

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let (active, peak, handled) = (active.clone(), peak.clone(), handled.clone());
            connection
                .set_event_handler("Slow", move |_m| {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    handled.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        for _ in 0..4 {
            mock.push(Message::new().with(KEY_EVENT, "Slow")).await;
        }
        assert!(connection.wait_for_drain(Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handled.load(Ordering::SeqCst), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn open_dials_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mock = spawn_mock(socket, echo());
            // Keep the push sender alive for the lifetime of the socket.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(mock);
        });

        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port,
            queue_capacity: 0,
            ..test_config()
        };
        let connection = AmiConnection::open(config).await.unwrap();
        assert!(connection.is_running());
        assert_eq!(connection.config().queue_capacity, DEFAULT_QUEUE_CAPACITY);
        connection.close().await;
    }

    #[tokio::test]
    async fn open_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..test_config()
        };
        let err = AmiConnection::open(config).await.unwrap_err();
        assert!(matches!(err, AmiError::Connect(_)));
    }

    #[tokio::test]
    async fn read_loop_stops_when_server_hangs_up() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(accept_login(server));
        let connection = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap();
        let (frames, out) = server_task.await.unwrap();

        drop(out);
        drop(frames);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !connection.loop_finished("read").await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "read loop still running after the peer hung up"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Nothing has been written since, so the writer has not noticed.
        assert!(!connection.loop_finished("write").await);
        assert_eq!(connection.in_flight_dispatches(), 0);
        connection.close().await;
    }

    #[tokio::test]
    async fn close_ends_the_stream_for_the_peer() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(accept_login(server));
        let connection = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap();
        let (mut frames, _out) = server_task.await.unwrap();

        connection.close().await;

        let next = tokio::time::timeout(Duration::from_secs(1), frames.next())
            .await
            .expect("peer should see end of stream after close");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn close_does_not_wait_on_a_stalled_write() {
        let (client, server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(accept_login(server));
        let connection = AmiConnection::open_with_stream(client, test_config())
            .await
            .unwrap();
        // Keep the peer open but never read from it again.
        let (_frames, _out) = server_task.await.unwrap();

        let padding = "x".repeat(200);
        for _ in 0..8 {
            connection
                .send_async(&Message::action("Big").with("Padding", padding.as_str()), |_| {})
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Well under the abort grace period: the write itself must yield.
        tokio::time::timeout(Duration::from_millis(500), connection.close())
            .await
            .expect("close should not wait on a write the peer never drains");
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.loops.lock().await.is_empty());
    }

    #[tokio::test]
    async fn keepalive_suppressed_while_traffic_flows() {
        let config = ConnectionConfig {
            keepalive_interval: Duration::from_millis(150),
            ..test_config()
        };
        let (connection, mock) = open_mock(echo(), config).await;

        for _ in 0..20 {
            connection
                .send_async(&Message::action("Status"), |_| {})
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        let pings = mock
            .seen
            .lock()
            .iter()
            .filter(|m| m.action_name() == ACTION_PING)
            .count();
        assert_eq!(pings, 0, "keepalive sent despite steady traffic");
        connection.close().await;
    }
}
