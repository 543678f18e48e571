//! bustcp - TCP transport for a hierarchical address bus.
//!
//! Turns TCP connections into addressable endpoints of a message bus.
//! Every connection gets a route; messages arriving on the socket are
//! republished on the bus with that route prefixed to their `from`, and bus
//! messages sent under the route are written back to the socket.
//!
//! # Architecture
//!
//! - **TcpTransport** - Composition root holding the bus and configuration
//! - **Listener** - Accepts sockets, one server-role session per connection
//!   bound to `prefix + [uid]`
//! - **Dialer** - Opens one socket, one client-role session bound to a
//!   caller-chosen route
//! - **Session** - Owns a socket, forwards both ways, tears down once
//! - **Bus** - The routing fabric the transport binds into ([`LocalBus`] is
//!   an in-process implementation)
//!
//! # Bus conventions
//!
//! | Address                         | Meaning                             |
//! |---------------------------------|-------------------------------------|
//! | `<route>/::clientHost`          | server-side mount, bus → wire       |
//! | `<route>/::serverHost`          | client-side mount, bus → wire       |
//! | `connect/<route>`               | session became active               |
//! | `disconnect/<route>`            | session closed                      |
//!
//! Peers may not send wildcard segments (`*`, `**`) in `to` or `from`; a
//! session that tries is closed.
//!
//! # Modules
//!
//! - [`address`] - Address values and the wildcard guard
//! - [`envelope`] - Messages and `from` rewriting
//! - [`framing`] - Length-prefixed wire codec
//! - [`config`] - Configuration loading
//! - [`bus`] - Bus capability trait and reference bus

pub mod address;
pub mod bus;
pub mod config;
pub mod dialer;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod listener;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use address::{contains_wildcard, Address};
pub use bus::{handler, Bus, Delivery, LocalBus};
pub use config::TransportConfig;
pub use dialer::{DialerEvent, DialerHandle};
pub use envelope::{prefix_from, Envelope};
pub use error::{Result, TransportError};
pub use listener::ListenerHandle;
pub use session::{CloseReason, Role, SessionHandle, SessionState};
pub use transport::{TcpTransport, DEFAULT_CLIENT_ROUTE, DEFAULT_SERVER_PREFIX};
