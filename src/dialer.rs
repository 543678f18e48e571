//! Outbound connections: one client-role session per dial.
//!
//! [`connect`] returns a [`DialerHandle`] straight away and opens the socket
//! in a spawned task. Progress is reported on the handle's event stream:
//!
//! ```text
//! Connect ─► ... ─► [Error] ─► Close      (established)
//! Error ─► Close(ConnectFailed)           (never established)
//! ```
//!
//! `Close` is always the last event.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::bus::Bus;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::framing::FrameDecoder;
use crate::session::{CloseReason, Outbound, Role, Session, SessionHandle};

/// Lifecycle notifications for a dialed connection.
#[derive(Debug)]
pub enum DialerEvent {
    /// The socket is open, the route is mounted and the bus `connect` event
    /// has been sent.
    Connect,
    /// The connection failed or closed abnormally.
    Error(TransportError),
    /// The session is gone. Always the final event.
    Close(CloseReason),
}

/// Handle to a dialed connection.
#[derive(Debug)]
pub struct DialerHandle {
    session: SessionHandle,
    events: UnboundedReceiver<DialerEvent>,
    task: JoinHandle<()>,
}

impl DialerHandle {
    /// Bus route the connection is bound to.
    pub fn route(&self) -> &Address {
        self.session.route()
    }

    /// The underlying session.
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Next lifecycle event, or `None` once `Close` has been consumed.
    pub async fn next_event(&mut self) -> Option<DialerEvent> {
        self.events.recv().await
    }

    /// Next lifecycle event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<DialerEvent> {
        self.events.try_recv().ok()
    }

    /// Wait until the connection is established.
    ///
    /// Consumes events up to and including `Connect`.
    ///
    /// # Errors
    ///
    /// Returns the first reported error, or [`TransportError::Closed`] if
    /// the session closed without reporting one.
    pub async fn wait_connected(&mut self) -> Result<()> {
        loop {
            match self.events.recv().await {
                Some(DialerEvent::Connect) => return Ok(()),
                Some(DialerEvent::Error(e)) => return Err(e),
                Some(DialerEvent::Close(reason)) => {
                    return Err(reason.to_error().unwrap_or(TransportError::Closed));
                }
                None => return Err(TransportError::Closed),
            }
        }
    }

    /// Flush queued frames, then half-close the socket.
    pub fn end(&self) -> bool {
        self.session.end()
    }

    /// Tear the connection down immediately, including a pending connect.
    pub fn destroy(&self) {
        self.session.destroy();
    }

    /// Wait for the connection task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::error!("[Dialer] Connection task failed: {e}");
        }
    }
}

/// Start dialing `host:port` and bind the connection to `route`.
pub(crate) fn connect(
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
    route: Address,
    port: u16,
    host: Option<&str>,
) -> DialerHandle {
    let host = host.unwrap_or(&config.connect_host).to_string();
    let (session, outbound_rx) = SessionHandle::new(Role::Client, route, &config);
    let (events_tx, events) = mpsc::unbounded_channel();

    let task = tokio::spawn(dial(
        session.clone(),
        outbound_rx,
        bus,
        config,
        host,
        port,
        events_tx,
    ));

    DialerHandle {
        session,
        events,
        task,
    }
}

async fn dial(
    handle: SessionHandle,
    outbound_rx: Receiver<Outbound>,
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
    host: String,
    port: u16,
    events: UnboundedSender<DialerEvent>,
) {
    let cancel = handle.cancel_token().clone();
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            log::info!("[Dialer] Connect to {host}:{port} cancelled for {}", handle.route());
            handle.mark_closed();
            let reason = handle.close_reason().unwrap_or(CloseReason::Destroyed);
            let _ = events.send(DialerEvent::Close(reason));
            return;
        }
        opened = open(&host, port, config.connect_timeout_ms) => opened,
    };

    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("[Dialer] {e}");
            let reason = CloseReason::ConnectFailed(e.to_string());
            handle.abort(reason.clone());
            handle.mark_closed();
            let _ = events.send(DialerEvent::Error(e));
            let _ = events.send(DialerEvent::Close(reason));
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[Dialer] set_nodelay failed for {}: {e}", handle.route());
    }

    let session = Session {
        handle,
        bus,
        read_buffer_size: config.read_buffer_size,
    };
    let decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
    let connected = events.clone();
    let reason = session
        .run(stream, decoder, outbound_rx, move || {
            let _ = connected.send(DialerEvent::Connect);
        })
        .await;

    if let Some(e) = reason.to_error() {
        let _ = events.send(DialerEvent::Error(e));
    }
    let _ = events.send(DialerEvent::Close(reason));
}

async fn open(host: &str, port: u16, timeout_ms: Option<u64>) -> Result<TcpStream> {
    connect_within(
        format!("{host}:{port}"),
        timeout_ms,
        TcpStream::connect((host, port)),
    )
    .await
}

/// Drive a connect attempt, giving up after `timeout_ms` if set.
async fn connect_within<T, F>(addr: String, timeout_ms: Option<u64>, connecting: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let connected = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), connecting).await {
            Ok(connected) => connected,
            Err(_elapsed) => {
                return Err(TransportError::ConnectTimeout {
                    addr,
                    timeout_ms: ms,
                });
            }
        },
        None => connecting.await,
    };
    connected.map_err(|source| TransportError::Connect { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::session::SessionState;
    use tokio::net::TcpListener;

    fn config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::default())
    }

    #[tokio::test]
    async fn test_refused_connect_reports_error_then_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bus = Arc::new(LocalBus::new());
        let mut dialer = connect(
            bus.clone(),
            config(),
            Address::from(["tcpServer"]),
            port,
            Some("127.0.0.1"),
        );

        let first = tokio::time::timeout(Duration::from_secs(2), dialer.next_event())
            .await
            .unwrap();
        assert!(matches!(first, Some(DialerEvent::Error(TransportError::Connect { .. }))));
        let second = tokio::time::timeout(Duration::from_secs(2), dialer.next_event())
            .await
            .unwrap();
        assert!(matches!(second, Some(DialerEvent::Close(CloseReason::ConnectFailed(_)))));
        assert!(dialer.session().is_closed());
        assert_eq!(bus.mount_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_while_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let bus = Arc::new(LocalBus::new());
        let mut dialer = connect(
            bus.clone(),
            config(),
            Address::from(["tcpServer"]),
            port,
            Some("127.0.0.1"),
        );
        // The dial task has not been polled yet, so it sees the cancel first.
        dialer.destroy();

        let event = tokio::time::timeout(Duration::from_secs(2), dialer.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(DialerEvent::Close(CloseReason::Destroyed))));
        assert!(dialer.try_next_event().is_none());
        assert_eq!(bus.mount_count(), 0);
        assert_eq!(dialer.session().state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_mounts_server_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let bus = Arc::new(LocalBus::new());
        let mut dialer = connect(
            bus.clone(),
            config(),
            Address::from(["tcpServer"]),
            port,
            Some("127.0.0.1"),
        );
        let (_peer, _) = listener.accept().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), dialer.wait_connected())
            .await
            .unwrap()
            .unwrap();
        assert!(bus.has_mount(&Address::from(["tcpServer", "::serverHost"])));

        dialer.destroy();
        let event = tokio::time::timeout(Duration::from_secs(2), dialer.next_event())
            .await
            .unwrap();
        assert!(matches!(event, Some(DialerEvent::Close(CloseReason::Destroyed))));
        assert_eq!(bus.mount_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_gives_up() {
        let connecting = std::future::pending::<io::Result<()>>();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            connect_within("10.0.0.1:9".to_string(), Some(50), connecting),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(
            matches!(err, TransportError::ConnectTimeout { timeout_ms: 50, ref addr } if addr == "10.0.0.1:9"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_address() {
        let refused = async { Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused)) };
        let err = connect_within("127.0.0.1:1".to_string(), Some(1000), refused)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect { ref addr, .. } if addr == "127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_connect_without_timeout_waits_for_result() {
        let ready = async { Ok::<_, io::Error>(7) };
        assert_eq!(connect_within("x:1".to_string(), None, ready).await.unwrap(), 7);
    }
}
