//! TCP listener: one server-role session per accepted connection.
//!
//! Each accepted socket is held open while the bus allocates an id, then
//! bound to `prefix + [id]` and handed to a [`Session`]. Closing the
//! listener stops new accepts only; established sessions keep running
//! until their peer (or a [`SessionHandle`]) ends them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::bus::Bus;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::framing::FrameDecoder;
use crate::session::{Role, Session, SessionHandle, SessionId};

/// Live sessions accepted by one listener.
type SessionRegistry = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

fn registry(sessions: &SessionRegistry) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a bound listener.
///
/// Dropping the handle does not stop the listener; call
/// [`ListenerHandle::close`].
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    prefix: Address,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sessions: SessionRegistry,
}

impl ListenerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port (useful when listening on port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Route prefix assigned to accepted connections.
    pub fn prefix(&self) -> &Address {
        &self.prefix
    }

    /// Sessions currently established through this listener.
    pub fn connections(&self) -> Vec<SessionHandle> {
        let mut sessions: Vec<_> = registry(&self.sessions)
            .values()
            .filter(|session| !session.is_closed())
            .cloned()
            .collect();
        sessions.sort_by_key(SessionHandle::id);
        sessions
    }

    /// True once [`ListenerHandle::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting connections.
    ///
    /// Returns once the listening socket is released, so later connection
    /// attempts are refused. Established sessions are left alone.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[Listener] Accept task failed: {e}");
            }
        }
    }
}

/// Bind `host:port` and start accepting.
///
/// # Errors
///
/// Returns [`TransportError::Bind`] if the socket cannot be bound.
pub(crate) async fn listen(
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
    prefix: Address,
    port: u16,
    host: Option<&str>,
) -> Result<ListenerHandle> {
    let host = host.unwrap_or(&config.listen_host);
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|source| TransportError::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    log::info!("[Listener] Listening on {} for {}", local_addr, prefix);

    let cancel = CancellationToken::new();
    let sessions = SessionRegistry::default();
    let accept_task = tokio::spawn(accept_loop(
        listener,
        bus,
        config,
        prefix.clone(),
        cancel.clone(),
        Arc::clone(&sessions),
    ));

    Ok(ListenerHandle {
        local_addr,
        prefix,
        cancel,
        accept_task: Mutex::new(Some(accept_task)),
        sessions,
    })
}

/// Accept loop; the listening socket is dropped when it returns.
async fn accept_loop(
    listener: TcpListener,
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
    prefix: Address,
    cancel: CancellationToken,
    sessions: SessionRegistry,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                log::debug!("[Listener] Accepted {} for {}", peer, prefix);
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&bus),
                    Arc::clone(&config),
                    prefix.clone(),
                    Arc::clone(&sessions),
                ));
            }
            Err(e) => {
                log::error!("[Listener] Accept error: {e}");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        }
    }
    log::info!("[Listener] Stopped accepting for {}", prefix);
}

/// Allocate the connection's route, then run its session.
async fn serve_connection(
    mut stream: TcpStream,
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
    prefix: Address,
    sessions: SessionRegistry,
) {
    let mut decoder = FrameDecoder::with_max_frame_size(config.max_frame_size);
    let Some(id) = await_id(&*bus, &mut stream, &mut decoder, &config).await else {
        return;
    };

    let (handle, outbound_rx) = SessionHandle::new(Role::Server, prefix.child(id), &config);
    registry(&sessions).insert(handle.id(), handle.clone());

    let session = Session {
        handle: handle.clone(),
        bus,
        read_buffer_size: config.read_buffer_size,
    };
    session.run(stream, decoder, outbound_rx, || {}).await;

    registry(&sessions).remove(&handle.id());
}

/// Wait for the bus to allocate an id while watching the socket.
///
/// Bytes that arrive meanwhile are buffered, not forwarded, up to
/// `max_frame_size`. Returns `None` if the socket closes or fails first, or
/// if the peer sends more than that before it has an address; in each case
/// nothing was registered.
async fn await_id(
    bus: &dyn Bus,
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
    config: &TransportConfig,
) -> Option<String> {
    let mut uid = bus.uid();
    let limit = config.max_frame_size as usize;
    let mut buf = vec![0u8; config.read_buffer_size];

    loop {
        let room = limit.saturating_sub(decoder.buffered_len()).clamp(1, buf.len());
        let read = tokio::select! {
            biased;
            id = &mut uid => return Some(id),
            read = stream.read(&mut buf[..room]) => read,
        };

        match read {
            Ok(0) => {
                log::info!("[Listener] Connection closed before an id was allocated");
                return None;
            }
            Ok(n) if decoder.buffered_len() + n > limit => {
                log::warn!(
                    "[Listener] Peer sent over {limit} bytes before an id was allocated, closing"
                );
                return None;
            }
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                log::error!("[Listener] Read error before an id was allocated: {e}");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Handler, ListenerId, LocalBus, MountId};
    use crate::envelope::Envelope;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_close_releases_port() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        let handle = listen(
            bus,
            Arc::new(TransportConfig::default()),
            Address::from(["tcpClient"]),
            0,
            Some("127.0.0.1"),
        )
        .await
        .unwrap();
        assert_ne!(handle.port(), 0);
        assert!(handle.local_addr().ip().is_loopback());
        assert!(!handle.is_closed());

        handle.close().await;
        handle.close().await;
        assert!(handle.is_closed());
        assert!(TcpStream::connect(handle.local_addr()).await.is_err());
    }

    /// Bus whose id allocation never completes.
    struct NeverBus(LocalBus);

    #[async_trait::async_trait]
    impl Bus for NeverBus {
        fn mount(&self, pattern: Address, handler: Handler) -> MountId {
            self.0.mount(pattern, handler)
        }
        fn unmount(&self, mount: MountId) {
            self.0.unmount(mount);
        }
        fn send(&self, envelope: Envelope) {
            self.0.send(envelope);
        }
        fn on(&self, address: Address, handler: Handler) -> ListenerId {
            self.0.on(address, handler)
        }
        fn remove_listener(&self, listener: ListenerId) {
            self.0.remove_listener(listener);
        }
        async fn uid(&self) -> String {
            std::future::pending::<String>().await
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn pending_id(server: &mut TcpStream, max_frame_size: u32) -> Option<String> {
        let bus = NeverBus(LocalBus::new());
        let config = TransportConfig {
            max_frame_size,
            read_buffer_size: 8,
            ..TransportConfig::default()
        };
        let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
        let id = tokio::time::timeout(
            Duration::from_secs(2),
            await_id(&bus, server, &mut decoder, &config),
        )
        .await
        .unwrap();
        assert_eq!(bus.0.mount_count(), 0);
        id
    }

    #[tokio::test]
    async fn test_await_id_gives_up_on_closed_socket() {
        let (client, mut server) = socket_pair().await;
        drop(client);
        assert!(pending_id(&mut server, 1024).await.is_none());
    }

    #[tokio::test]
    async fn test_await_id_notices_close_with_full_buffer() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(&[7u8; 16]).await.unwrap();
        client.shutdown().await.unwrap();
        assert!(pending_id(&mut server, 16).await.is_none());
    }

    #[tokio::test]
    async fn test_await_id_rejects_overflowing_peer() {
        let (mut client, mut server) = socket_pair().await;
        client.write_all(&[7u8; 17]).await.unwrap();
        assert!(pending_id(&mut server, 16).await.is_none());
        drop(client);
    }
}
