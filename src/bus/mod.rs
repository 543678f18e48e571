//! Capability interface the transport needs from the routing bus.
//!
//! The transport never owns the bus. It receives an `Arc<dyn Bus>` and uses
//! exactly these operations:
//!
//! | Operation         | Used for                                            |
//! |-------------------|-----------------------------------------------------|
//! | `mount`/`unmount` | per-session `<route>/::clientHost` binding          |
//! | `send`            | republishing wire envelopes, connect/disconnect     |
//! | `on`              | callers observing lifecycle events                  |
//! | `uid`             | allocating the address of each accepted connection  |
//!
//! [`LocalBus`] is an in-process implementation used by the tests and
//! demos.

pub mod local;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::address::Address;
use crate::envelope::Envelope;

pub use local::LocalBus;

/// Parameters captured by a mount pattern, keyed by name.
///
/// `:name` captures a single segment, `::name` the remaining segments; both
/// are stored as an [`Address`].
pub type Params = HashMap<String, Address>;

/// A message delivered to a mount or listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The message as sent.
    pub envelope: Envelope,
    /// Parameters captured by the matching pattern.
    pub params: Params,
}

impl Delivery {
    /// Captured parameter `name`, if the pattern declared it.
    pub fn param(&self, name: &str) -> Option<&Address> {
        self.params.get(name)
    }
}

/// Callback invoked for each matching message.
///
/// Handlers run on the sender's thread and must not block.
pub type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Token identifying a registered mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(pub u64);

/// Token identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount_{}", self.0)
    }
}

/// Address-keyed publish/subscribe fabric the transport binds into.
///
/// Implementations must be safe to call concurrently from many sessions.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Register `handler` for messages matching `pattern`.
    fn mount(&self, pattern: Address, handler: Handler) -> MountId;

    /// Remove a mount. Unknown or already removed mounts are a no-op.
    fn unmount(&self, mount: MountId);

    /// Publish a message to every matching mount and listener.
    fn send(&self, envelope: Envelope);

    /// Register an event listener for messages matching `address`.
    fn on(&self, address: Address, handler: Handler) -> ListenerId;

    /// Remove a listener. Unknown listeners are a no-op.
    fn remove_listener(&self, listener: ListenerId);

    /// Allocate a fresh unique identifier.
    async fn uid(&self) -> String;
}

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Delivery) + Send + Sync + 'static,
{
    Arc::new(f)
}
