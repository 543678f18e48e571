//! In-process reference bus.
//!
//! Pattern segments:
//! - literal: exact match
//! - `*`: any one segment
//! - `**`: any remaining segments (zero or more)
//! - `:name`: any one segment, captured as `name`
//! - `::name`: the remaining segments (one or more), captured as `name`
//!
//! Wildcards also work from the sending side: a `*` segment in the sent
//! address matches any one pattern segment and `**` matches the rest of the
//! pattern. That is what makes wildcard sends a broadcast, and why the
//! transport refuses them from remote peers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Bus, Delivery, Handler, ListenerId, MountId, Params};
use crate::address::Address;
use crate::envelope::Envelope;

struct Registration {
    id: u64,
    pattern: Address,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    mounts: Vec<Registration>,
    listeners: Vec<Registration>,
}

/// Thread-safe in-memory [`Bus`].
///
/// `send` dispatches synchronously on the caller's thread. The registry lock
/// is released before handlers run, so handlers may freely mount, unmount or
/// send.
#[derive(Default)]
pub struct LocalBus {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("LocalBus")
            .field("mounts", &registry.mounts.len())
            .field("listeners", &registry.listeners.len())
            .finish_non_exhaustive()
    }
}

impl LocalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mounts.
    pub fn mount_count(&self) -> usize {
        self.registry().mounts.len()
    }

    /// True if some mount pattern equals `pattern` exactly.
    pub fn has_mount(&self, pattern: &Address) -> bool {
        self.registry().mounts.iter().any(|r| &r.pattern == pattern)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn mount(&self, pattern: Address, handler: Handler) -> MountId {
        let id = self.next_id();
        log::debug!("[Bus] mount {} as mount_{}", pattern, id);
        self.registry().mounts.push(Registration { id, pattern, handler });
        MountId(id)
    }

    fn unmount(&self, mount: MountId) {
        self.registry().mounts.retain(|r| r.id != mount.0);
    }

    fn send(&self, envelope: Envelope) {
        let matched: Vec<(Handler, Params)> = {
            let registry = self.registry();
            registry
                .mounts
                .iter()
                .chain(registry.listeners.iter())
                .filter_map(|r| {
                    match_address(&r.pattern, &envelope.to)
                        .map(|params| (Arc::clone(&r.handler), params))
                })
                .collect()
        };

        if matched.is_empty() {
            log::debug!("[Bus] no route for {}", envelope.to);
            return;
        }

        for (handler, params) in matched {
            let delivery = Delivery {
                envelope: envelope.clone(),
                params,
            };
            handler(&delivery);
        }
    }

    fn on(&self, address: Address, handler: Handler) -> ListenerId {
        let id = self.next_id();
        self.registry().listeners.push(Registration {
            id,
            pattern: address,
            handler,
        });
        ListenerId(id)
    }

    fn remove_listener(&self, listener: ListenerId) {
        self.registry().listeners.retain(|r| r.id != listener.0);
    }

    async fn uid(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Match `address` against `pattern`, returning captured parameters.
pub fn match_address(pattern: &Address, address: &Address) -> Option<Params> {
    let mut params = Params::new();
    match_segments(pattern.segments(), address.segments(), &mut params).then_some(params)
}

fn match_segments(pattern: &[String], address: &[String], params: &mut Params) -> bool {
    let Some((head, pattern_rest)) = pattern.split_first() else {
        return address.is_empty() || address.first().is_some_and(|a| a == "**");
    };

    if head == "**" {
        return true;
    }
    if let Some(name) = head.strip_prefix("::") {
        if address.is_empty() {
            return false;
        }
        params.insert(name.to_string(), Address::from(address.to_vec()));
        return true;
    }

    let Some((segment, address_rest)) = address.split_first() else {
        return false;
    };
    if segment == "**" {
        return true;
    }

    if let Some(name) = head.strip_prefix(':') {
        params.insert(name.to_string(), Address::new([segment.as_str()]));
    } else if head != "*" && segment != "*" && head != segment {
        return false;
    }

    match_segments(pattern_rest, address_rest, params)
}
