//! Connection: owns one physical socket per channel key and drives the
//! open/message/error/close lifecycle.
//!
//! A [`Connection`] is a cheap cloneable handle over a single driver task.
//! The driver exclusively owns the socket; consumers observe state through a
//! watch channel and decoded events through a broadcast channel, and send by
//! enqueueing onto the driver's outbound queue. Reconnection lives entirely
//! inside the driver loop, so a second pending reconnect timer is
//! unrepresentable.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::channel::ChannelDescriptor;
use crate::error::ChannelError;
use crate::frame::{DecodedEvent, FrameDecoder, RawFrame, decode_frame};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Transport established; `send` is allowed.
    Open,
    /// Consumer-initiated close in progress.
    Closing,
    /// No transport; reconnect may be pending.
    Closed,
}

impl ConnectionState {
    /// Status string as exposed to consumers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events observed by every consumer of a channel.
///
/// Consumers sharing a channel key receive the identical stream; there is no
/// per-consumer duplication of decoded events.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Transport reached the open state.
    Open,
    /// Decoded inbound frame.
    Message(DecodedEvent),
    /// Transport or decode error. Informational: the connection stays up
    /// until a close notification follows.
    Error(Arc<ChannelError>),
    /// Transport closed.
    Closed {
        /// Close code, when the peer sent one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle to a single logical channel connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    descriptor: ChannelDescriptor,
    decoder: Option<Arc<dyn FrameDecoder>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ChannelEvent>,
    shutdown_tx: watch::Sender<bool>,
    /// Outbound queue of the live socket session; `None` while not open.
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Code and reason supplied by an explicit `close()` call.
    user_close: Mutex<Option<(u16, String)>>,
    closed_by_user: AtomicBool,
    /// Bumped by every `connect` and `close`; a deferred restart only runs
    /// when no later call superseded it.
    epoch: AtomicU64,
    last_event: Mutex<Option<DecodedEvent>>,
    last_error: Mutex<Option<Arc<ChannelError>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a connection with the built-in frame decoder.
    ///
    /// The connection is inert until [`Connection::connect`] is called.
    #[must_use]
    pub fn new(descriptor: ChannelDescriptor) -> Self {
        Self::with_decoder(descriptor, None)
    }

    /// Create a connection with an optional custom frame decoder.
    #[must_use]
    pub fn with_decoder(
        descriptor: ChannelDescriptor,
        decoder: Option<Arc<dyn FrameDecoder>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                descriptor,
                decoder,
                state_tx,
                events_tx,
                shutdown_tx,
                outbound_tx: Mutex::new(None),
                user_close: Mutex::new(None),
                closed_by_user: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                last_event: Mutex::new(None),
                last_error: Mutex::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    /// Open the connection.
    ///
    /// Idempotent: a call while a driver task is already connecting or open
    /// is a no-op, so two concurrent calls cannot open two sockets. A call
    /// after [`Connection::close`] restarts the connection once the previous
    /// session finishes winding down. Must be called from within a Tokio
    /// runtime.
    pub fn connect(&self) {
        let mut driver = self.inner.driver.lock();
        let winding_down = match driver.take() {
            Some(handle) if !handle.is_finished() => {
                if !self.inner.shutdown_requested() {
                    debug!(key = %self.inner.descriptor.key, "connect ignored, already running");
                    *driver = Some(handle);
                    return;
                }
                Some(handle)
            }
            _ => None,
        };
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        if let Some(old) = winding_down {
            // A close() is still shutting the previous driver down. Restart
            // once it exits; the shutdown marks are cleared only then, so the
            // outgoing session's close frame keeps the consumer's code and
            // reason. A close or connect issued in the meantime supersedes
            // this restart.
            *driver = Some(tokio::spawn(async move {
                let _ = old.await;
                {
                    let _slot = inner.driver.lock();
                    if inner.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    inner.reset_for_connect();
                }
                run_driver(inner).await;
            }));
        } else {
            self.inner.reset_for_connect();
            self.inner.set_state(ConnectionState::Connecting);
            *driver = Some(tokio::spawn(run_driver(inner)));
        }
    }

    /// Close the connection on behalf of a consumer.
    ///
    /// Synchronously marks the close as user-initiated and cancels any
    /// pending reconnect timer, even when invoked from within an event
    /// callback. Idempotent. Defaults to code 1000 with an empty reason.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) {
        // The slot lock serializes this against a deferred restart spawned by
        // `connect`, which would otherwise swallow the close.
        let _slot = self.inner.driver.lock();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.closed_by_user.store(true, Ordering::SeqCst);
        *self.inner.user_close.lock() =
            Some((code.unwrap_or(1000), reason.unwrap_or_default().to_owned()));
        let current = *self.inner.state_tx.borrow();
        if matches!(
            current,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.inner.set_state(ConnectionState::Closing);
        }
        self.inner.shutdown_tx.send_replace(true);
    }

    /// Send a payload as a JSON-encoded text frame.
    ///
    /// Synchronous and non-blocking; returns `false` when the connection is
    /// not open or the payload fails to serialize (the serialization error
    /// is surfaced on the error surface).
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        match serde_json::to_string(payload) {
            Ok(text) => self.forward(Message::Text(text.into())),
            Err(err) => {
                self.inner.record_error(ChannelError::Encode(err.to_string()));
                false
            }
        }
    }

    /// Send a text frame verbatim, without JSON encoding.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        self.forward(Message::Text(text.into().into()))
    }

    /// Send a binary frame.
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        self.forward(Message::Binary(data.into().into()))
    }

    fn forward(&self, message: Message) -> bool {
        self.inner
            .outbound_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch receiver that observes every state transition.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to the shared event stream.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Event stream as a [`futures_util::Stream`] adapter.
    #[must_use]
    pub fn event_stream(&self) -> BroadcastStream<ChannelEvent> {
        BroadcastStream::new(self.events())
    }

    /// Most recent decoded inbound event.
    #[must_use]
    pub fn last_event(&self) -> Option<DecodedEvent> {
        self.inner.last_event.lock().clone()
    }

    /// Most recent decode or transport error, sticky until the next
    /// successful decode.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<ChannelError>> {
        self.inner.last_error.lock().clone()
    }

    /// Whether the driver task is live (connected, connecting, or waiting to
    /// reconnect).
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner
            .driver
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Identity of the underlying connection, shared by all handle clones.
    pub(crate) fn token(&self) -> ConnToken {
        ConnToken(Arc::downgrade(&self.inner))
    }

    /// Descriptor this connection was created from.
    #[must_use]
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.inner.descriptor
    }

    /// Channel key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.descriptor.key
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.inner.descriptor.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous != next {
            debug!(key = %self.descriptor.key, from = %previous, to = %next, "state transition");
            self.state_tx.send_replace(next);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No receivers is fine; events are fire-and-forget.
        let _ = self.events_tx.send(event);
    }

    fn record_error(&self, err: ChannelError) {
        let err = Arc::new(err);
        *self.last_error.lock() = Some(Arc::clone(&err));
        self.emit(ChannelEvent::Error(err));
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Clear the marks left by a previous `close()` so a new driver starts
    /// from a clean slate.
    fn reset_for_connect(&self) {
        self.closed_by_user.store(false, Ordering::SeqCst);
        self.user_close.lock().take();
        self.shutdown_tx.send_replace(false);
    }

    fn user_closed(&self) -> bool {
        self.closed_by_user.load(Ordering::SeqCst)
    }

    /// Decode one inbound frame and publish the result.
    fn handle_frame(&self, frame: RawFrame) {
        let (event, decode_err) = match &self.decoder {
            // A custom decoder is a full override: its failure surfaces as
            // an error with no fallback event.
            Some(custom) => match custom.decode(frame) {
                Ok(event) => (Some(event), None),
                Err(err) => (None, Some(err)),
            },
            None => {
                let (event, err) = decode_frame(frame);
                (Some(event), err)
            }
        };

        match decode_err {
            Some(err) => self.record_error(err),
            // Sticky until next success.
            None => {
                self.last_error.lock().take();
            }
        }

        if let Some(event) = event {
            *self.last_event.lock() = Some(event.clone());
            self.emit(ChannelEvent::Message(event));
        }
    }
}

/// Identity token for one underlying connection. Holding a token does not
/// keep the connection alive.
pub(crate) struct ConnToken(Weak<Inner>);

impl ConnToken {
    /// Whether `conn` is the same underlying connection, which is false once
    /// the tokened connection has been dropped.
    pub(crate) fn matches(&self, conn: &Connection) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| Arc::ptr_eq(&inner, &conn.inner))
    }
}

/// How one socket session ended.
struct SessionEnd {
    code: Option<u16>,
    reason: String,
    user_closed: bool,
}

/// Driver loop: connect, pump, and reschedule per the reconnect policy.
async fn run_driver(inner: Arc<Inner>) {
    let descriptor = inner.descriptor.clone();
    let mut backoff = Backoff::new(
        descriptor.reconnect_base_delay,
        descriptor.reconnect_max_delay,
    );
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        if inner.shutdown_requested() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);

        let request = match descriptor.client_request() {
            Ok(request) => request,
            Err(err) => {
                // A malformed URL cannot succeed on retry.
                warn!(key = %descriptor.key, error = %err, "unusable channel descriptor");
                inner.record_error(err);
                break;
            }
        };

        let reconnectable = tokio::select! {
            result = connect_async(request) => match result {
                Ok((mut socket, response)) => {
                    if inner.shutdown_requested() {
                        // close() raced the handshake; never surface Open.
                        let _ = socket.close(None).await;
                        inner.set_state(ConnectionState::Closed);
                        break;
                    }
                    debug!(key = %descriptor.key, status = ?response.status(), "handshake complete");
                    // The outbound queue must exist before `Open` is visible,
                    // so a `send` racing the state change cannot miss it.
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    *inner.outbound_tx.lock() = Some(outbound_tx);
                    inner.set_state(ConnectionState::Open);
                    backoff.reset();
                    inner.emit(ChannelEvent::Open);

                    let end = pump(&inner, socket, outbound_rx, &mut shutdown_rx).await;
                    inner.set_state(ConnectionState::Closed);
                    inner.emit(ChannelEvent::Closed {
                        code: end.code,
                        reason: end.reason.clone(),
                    });
                    info!(key = %descriptor.key, code = ?end.code, reason = %end.reason, user = end.user_closed, "connection closed");

                    !end.user_closed && descriptor.reconnects_on(end.code)
                }
                Err(err) => {
                    warn!(key = %descriptor.key, error = %err, "connect failed");
                    inner.record_error(ChannelError::ConnectFailed(err.to_string()));
                    inner.set_state(ConnectionState::Closed);
                    inner.emit(ChannelEvent::Closed {
                        code: None,
                        reason: "connect failed".into(),
                    });
                    descriptor.auto_reconnect && !inner.user_closed()
                }
            },
            _ = shutdown_rx.changed() => {
                inner.set_state(ConnectionState::Closed);
                false
            }
        };

        if !reconnectable {
            break;
        }

        let delay = backoff.next();
        info!(
            key = %descriptor.key,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.attempt(),
            "reconnect scheduled"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    inner.set_state(ConnectionState::Closed);
    inner.outbound_tx.lock().take();
}

/// Pump one socket session until it ends.
async fn pump(
    inner: &Arc<Inner>,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();

    let end = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let (code, reason) = inner
                    .user_close
                    .lock()
                    .take()
                    .unwrap_or((1000, String::new()));
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.clone().into(),
                };
                if let Err(err) = write.send(Message::Close(Some(frame))).await {
                    debug!(key = %inner.descriptor.key, error = %err, "close frame not delivered");
                }
                break SessionEnd {
                    code: Some(code),
                    reason,
                    user_closed: true,
                };
            }
            outbound = outbound_rx.recv() => {
                // The sender lives in `inner`, so `recv` cannot yield `None`
                // while this loop runs.
                if let Some(message) = outbound {
                    if let Err(err) = write.send(message).await {
                        inner.record_error(ChannelError::Transport(err.to_string()));
                    }
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    inner.handle_frame(RawFrame::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    inner.handle_frame(RawFrame::Binary(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), f.reason.to_string())
                    });
                    break SessionEnd { code, reason, user_closed: false };
                }
                // Ping/pong are answered by the transport.
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    // Informational; the close below drives the transition.
                    inner.record_error(ChannelError::Transport(err.to_string()));
                    break SessionEnd {
                        code: None,
                        reason: "transport error".into(),
                        user_closed: false,
                    };
                }
                None => break SessionEnd {
                    code: None,
                    reason: "stream ended".into(),
                    user_closed: false,
                },
            }
        }
    };

    inner.outbound_tx.lock().take();
    end
}
