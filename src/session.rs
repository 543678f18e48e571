//! Per-connection session shared by both transport roles.
//!
//! A session binds one TCP socket to one bus route:
//!
//! ```text
//!            bus                              socket
//! ┌──────────────────────────┐        ┌──────────────────┐
//! │ mount <route>/::<param>  │──────► │ outbound queue   │──► writer task
//! │                          │        │ (bounded)        │
//! │ send(from = route+from)  │◄────── │ FrameDecoder     │◄── owner task
//! └──────────────────────────┘        └──────────────────┘
//! ```
//!
//! The owner task is the only place teardown happens. Every other trigger
//! (explicit destroy, write failure, a full outbound queue) records a
//! [`CloseReason`] and cancels the session token; the owner observes the
//! cancellation and tears down exactly once.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::address::{contains_wildcard, Address};
use crate::bus::{handler, Bus, Delivery, MountId};
use crate::config::TransportConfig;
use crate::envelope::{prefix_from, Envelope};
use crate::error::TransportError;
use crate::framing::{encode_envelope, FrameDecoder};

/// Mount parameter naming the wire peer's destination on the server side.
pub const CLIENT_HOST_PARAM: &str = "clientHost";

/// Mount parameter naming the wire peer's destination on the client side.
pub const SERVER_HOST_PARAM: &str = "serverHost";

/// First segment of the event emitted when a session becomes active.
pub const CONNECT_EVENT: &str = "connect";

/// First segment of the event emitted when a session closes.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Which side of the connection a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a listener.
    Server,
    /// Opened by a dialer.
    Client,
}

impl Role {
    /// Name of the tail parameter captured by this role's mount.
    pub fn mount_param(self) -> &'static str {
        match self {
            Role::Server => CLIENT_HOST_PARAM,
            Role::Client => SERVER_HOST_PARAM,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Role::Server => "[Listener]",
            Role::Client => "[Dialer]",
        }
    }
}

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet forwarding (dialer still connecting).
    Pending,
    /// Forwarding in both directions.
    Active,
    /// Torn down. Terminal.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The dialer never established the connection.
    ConnectFailed(String),
    /// The peer closed its side cleanly.
    PeerEnded,
    /// The socket failed while reading.
    PeerReset(String),
    /// The peer sent a wildcard address in `to` or `from`.
    WildcardViolation(Address),
    /// The peer sent an undecodable frame.
    MalformedFrame(String),
    /// The outbound queue overflowed.
    Backpressure,
    /// Writing to the socket failed.
    WriteFailed(String),
    /// The owning side called [`SessionHandle::destroy`].
    Destroyed,
}

impl CloseReason {
    /// The error this reason represents, if it is not a clean close.
    pub fn to_error(&self) -> Option<TransportError> {
        match self {
            CloseReason::PeerEnded | CloseReason::Destroyed => None,
            CloseReason::ConnectFailed(msg) => Some(TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                msg.clone(),
            ))),
            CloseReason::PeerReset(msg) => Some(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                msg.clone(),
            ))),
            CloseReason::WriteFailed(msg) => Some(TransportError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                msg.clone(),
            ))),
            CloseReason::WildcardViolation(address) => Some(TransportError::WildcardViolation {
                address: address.clone(),
            }),
            CloseReason::MalformedFrame(msg) => Some(TransportError::MalformedFrame(msg.clone())),
            CloseReason::Backpressure => Some(TransportError::Backpressure),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            CloseReason::PeerEnded => write!(f, "peer ended"),
            CloseReason::PeerReset(msg) => write!(f, "peer reset: {msg}"),
            CloseReason::WildcardViolation(address) => {
                write!(f, "wildcard address from peer: {address}")
            }
            CloseReason::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            CloseReason::Backpressure => write!(f, "outbound queue full"),
            CloseReason::WriteFailed(msg) => write!(f, "write failed: {msg}"),
            CloseReason::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Item in a session's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Encoded frame bytes.
    Frame(Vec<u8>),
    /// Flush what is queued, then half-close the socket.
    Finish,
}

struct SessionInner {
    id: SessionId,
    role: Role,
    route: Address,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    mount: Mutex<Option<MountId>>,
    cancel: CancellationToken,
    outbound: Sender<Outbound>,
    max_frame_size: u32,
}

/// Cloneable handle to a live session.
///
/// Handles never touch the socket directly: `end` queues a half-close for
/// the writer task and `destroy` asks the owner task to tear down.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("route", &self.inner.route)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionHandle {
    /// Create a pending session and the receiving end of its outbound queue.
    pub(crate) fn new(
        role: Role,
        route: Address,
        config: &TransportConfig,
    ) -> (Self, Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue);
        let inner = SessionInner {
            id: SessionId::next(),
            role,
            route,
            state: Mutex::new(SessionState::Pending),
            close_reason: Mutex::new(None),
            mount: Mutex::new(None),
            cancel: CancellationToken::new(),
            outbound,
            max_frame_size: config.max_frame_size,
        };
        (Self { inner: Arc::new(inner) }, outbound_rx)
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Role of this session.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Bus route this session is bound to.
    pub fn route(&self) -> &Address {
        &self.inner.route
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    /// True once teardown has completed.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Why the session closed (or is closing), if known.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.inner.close_reason).clone()
    }

    /// Tear the session down immediately. Repeated calls are absorbed.
    pub fn destroy(&self) {
        self.abort(CloseReason::Destroyed);
    }

    /// Flush queued frames, then half-close the socket.
    ///
    /// The session closes once the peer closes its side. Returns `false` if
    /// the session is already gone or its queue is full.
    pub fn end(&self) -> bool {
        self.inner.outbound.try_send(Outbound::Finish).is_ok()
    }

    /// Record `reason` (first one wins) and cancel the session.
    pub(crate) fn abort(&self, reason: CloseReason) {
        {
            let mut recorded = lock(&self.inner.close_reason);
            if recorded.is_none() {
                *recorded = Some(reason);
            }
        }
        self.inner.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Move `Pending → Active`. Fails if the session was already closed.
    fn activate(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == SessionState::Pending {
            *state = SessionState::Active;
            true
        } else {
            false
        }
    }

    /// Move to `Closed`. Returns `true` only for the call that did it.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if *state == SessionState::Closed {
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    }

    /// Bus → wire: serialize a delivered message onto this session's socket.
    ///
    /// `to` is taken from the tail captured by the role's mount parameter;
    /// `from`, `body` and `options` are forwarded as delivered.
    fn deliver(&self, delivery: &Delivery) {
        let Some(to) = delivery.param(self.inner.role.mount_param()) else {
            log::warn!(
                "[Session] {} delivery without '{}' param, dropping",
                self.inner.id,
                self.inner.role.mount_param()
            );
            return;
        };

        let envelope = Envelope {
            to: to.clone(),
            from: delivery.envelope.from.clone(),
            body: delivery.envelope.body.clone(),
            options: delivery.envelope.options.clone(),
        };

        let bytes = match encode_envelope(&envelope, self.inner.max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[Session] {} cannot encode envelope for {}: {e}", self.inner.id, to);
                return;
            }
        };

        match self.inner.outbound.try_send(Outbound::Frame(bytes)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "[Session] {} outbound queue full, closing {}",
                    self.inner.id,
                    self.inner.route
                );
                self.abort(CloseReason::Backpressure);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[Session] {} writer gone, dropping frame for {}", self.inner.id, to);
            }
        }
    }
}

/// Drives one established socket until the session closes.
pub(crate) struct Session {
    pub(crate) handle: SessionHandle,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) read_buffer_size: usize,
}

impl Session {
    /// Run the session to completion and return why it closed.
    ///
    /// `decoder` may already hold bytes that arrived before the session was
    /// established; they are forwarded first. `on_active` runs once the
    /// mount is in place and the connect event has been sent.
    pub(crate) async fn run<F>(
        self,
        stream: TcpStream,
        decoder: FrameDecoder,
        outbound_rx: Receiver<Outbound>,
        on_active: F,
    ) -> CloseReason
    where
        F: FnOnce() + Send,
    {
        let Session {
            handle,
            bus,
            read_buffer_size,
        } = self;
        let route = handle.route().clone();
        let tag = handle.role().tag();

        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(write_loop(handle.clone(), writer, outbound_rx));

        if !handle.cancel_token().is_cancelled() && handle.activate() {
            let pattern = route.child(format!("::{}", handle.role().mount_param()));
            let target = handle.clone();
            let mount = bus.mount(pattern, handler(move |delivery| target.deliver(delivery)));
            *lock(&handle.inner.mount) = Some(mount);

            log::info!("{tag} Session {} connected as {}", handle.id(), route);
            bus.send(Envelope::new(route.prepend(CONNECT_EVENT)));
            on_active();

            let reason = read_loop(&handle, &*bus, reader, decoder, read_buffer_size).await;
            handle.abort(reason);
        }

        let reason = handle.close_reason().unwrap_or(CloseReason::Destroyed);
        teardown(&handle, &*bus, &reason);

        if let Err(e) = writer_task.await {
            log::error!("[Session] {} writer task failed: {e}", handle.id());
        }
        reason
    }
}

/// Unmount and emit the disconnect event, exactly once per session.
pub(crate) fn teardown(handle: &SessionHandle, bus: &dyn Bus, reason: &CloseReason) {
    handle.cancel_token().cancel();
    if !handle.mark_closed() {
        return;
    }
    if let Some(mount) = lock(&handle.inner.mount).take() {
        bus.unmount(mount);
        let route = handle.route();
        log::info!(
            "{} Session {} disconnected from {} ({reason})",
            handle.role().tag(),
            handle.id(),
            route
        );
        bus.send(Envelope::new(route.prepend(DISCONNECT_EVENT)));
    }
}

/// Wire → bus: decode frames and republish them with the route prefixed.
async fn read_loop(
    handle: &SessionHandle,
    bus: &dyn Bus,
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    read_buffer_size: usize,
) -> CloseReason {
    let cancel = handle.cancel_token().clone();

    if let Err(reason) = forward_decoded(handle, bus, &mut decoder) {
        return reason;
    }

    let mut buf = vec![0u8; read_buffer_size];
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return handle.close_reason().unwrap_or(CloseReason::Destroyed);
            }
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => return CloseReason::PeerEnded,
            Ok(n) => {
                decoder.push(&buf[..n]);
                if let Err(reason) = forward_decoded(handle, bus, &mut decoder) {
                    return reason;
                }
            }
            Err(e) => {
                log::error!("[Session] Read error for {}: {e}", handle.route());
                return CloseReason::PeerReset(e.to_string());
            }
        }
    }
}

/// Republish every complete buffered frame in order.
///
/// Each envelope is forwarded as soon as it decodes, so frames ahead of a
/// malformed or rejected one still reach the bus.
fn forward_decoded(
    handle: &SessionHandle,
    bus: &dyn Bus,
    decoder: &mut FrameDecoder,
) -> Result<(), CloseReason> {
    loop {
        match decoder.next_envelope() {
            Ok(Some(envelope)) => forward(handle, bus, envelope)?,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::error!("[Session] Frame decode error for {}: {e}", handle.route());
                return Err(CloseReason::MalformedFrame(e.to_string()));
            }
        }
    }
}

/// Guard one peer envelope and republish it with the route prefixed.
///
/// Wildcards are refused in `from` as well as `to`: replies addressed to a
/// prefixed `from` would otherwise carry the wildcard back onto the wire.
fn forward(
    handle: &SessionHandle,
    bus: &dyn Bus,
    envelope: Envelope,
) -> Result<(), CloseReason> {
    if handle.cancel_token().is_cancelled() {
        return Err(handle.close_reason().unwrap_or(CloseReason::Destroyed));
    }
    for address in [&envelope.to, &envelope.from] {
        if contains_wildcard(address) {
            log::warn!(
                "[Session] {} sent wildcard address {}, closing",
                handle.route(),
                address
            );
            return Err(CloseReason::WildcardViolation(address.clone()));
        }
    }
    log::debug!("[Session] {} -> {}", handle.route(), envelope.to);
    bus.send(prefix_from(envelope, handle.route()));
    Ok(())
}

/// Single writer for the socket: drains the outbound queue in order.
async fn write_loop(
    handle: SessionHandle,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: Receiver<Outbound>,
) {
    let cancel = handle.cancel_token().clone();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = outbound_rx.recv() => next,
        };

        match next {
            Some(Outbound::Frame(bytes)) => {
                let written = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    written = writer.write_all(&bytes) => written,
                };
                if let Err(e) = written {
                    log::error!("[Session] Write error for {}: {e}", handle.route());
                    handle.abort(CloseReason::WriteFailed(e.to_string()));
                    break;
                }
            }
            Some(Outbound::Finish) => {
                if let Err(e) = writer.shutdown().await {
                    log::debug!("[Session] Shutdown error for {}: {e}", handle.route());
                }
                break;
            }
            None => break,
        }
    }
    outbound_rx.close();
}
