//! Composition root binding TCP sockets into a bus.

use std::fmt;
use std::sync::Arc;

use crate::address::Address;
use crate::bus::Bus;
use crate::config::TransportConfig;
use crate::dialer::{self, DialerHandle};
use crate::error::{Result, TransportError};
use crate::listener::{self, ListenerHandle};

/// Conventional prefix for connections accepted by a listener.
pub const DEFAULT_SERVER_PREFIX: &str = "tcpClient";

/// Conventional route for a dialed connection.
pub const DEFAULT_CLIENT_ROUTE: &str = "tcpServer";

/// TCP transport for one bus.
///
/// Cheap to clone; every listener and dialer created from it shares the
/// same bus and configuration.
#[derive(Clone)]
pub struct TcpTransport {
    bus: Arc<dyn Bus>,
    config: Arc<TransportConfig>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Transport with the default configuration.
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            config: Arc::new(TransportConfig::default()),
        }
    }

    /// Transport with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] if the configuration is invalid.
    pub fn with_config(bus: Arc<dyn Bus>, config: TransportConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| TransportError::Config(format!("{e:#}")))?;
        Ok(Self {
            bus,
            config: Arc::new(config),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The bus connections are bound into.
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Accept connections on `host:port`, binding each to `prefix + [id]`.
    ///
    /// `host` defaults to [`TransportConfig::listen_host`]. Port 0 picks a
    /// free port; see [`ListenerHandle::port`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the socket cannot be bound.
    pub async fn listen(
        &self,
        prefix: impl Into<Address>,
        port: u16,
        host: Option<&str>,
    ) -> Result<ListenerHandle> {
        listener::listen(
            Arc::clone(&self.bus),
            Arc::clone(&self.config),
            prefix.into(),
            port,
            host,
        )
        .await
    }

    /// Dial `host:port` and bind the connection to `route`.
    ///
    /// Returns immediately. `host` defaults to
    /// [`TransportConfig::connect_host`].
    pub fn connect(&self, route: impl Into<Address>, port: u16, host: Option<&str>) -> DialerHandle {
        dialer::connect(
            Arc::clone(&self.bus),
            Arc::clone(&self.config),
            route.into(),
            port,
            host,
        )
    }
}
