//! Routed message record and the ingress address rewrite.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::address::Address;

/// Open key/value map carried alongside a message body.
pub type Options = Map<String, Value>;

/// A routed bus message: `{to, from, body, options}`.
///
/// This is also the document carried in every envelope frame on the wire.
/// Missing `from`, `body` and `options` decode to their empty values so a
/// minimal peer only has to send `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Destination address.
    pub to: Address,
    /// Origin address.
    #[serde(default)]
    pub from: Address,
    /// Opaque payload, forwarded unmodified.
    #[serde(default)]
    pub body: Value,
    /// Open options map, forwarded unmodified.
    #[serde(default)]
    pub options: Options,
}

impl Envelope {
    /// Envelope addressed to `to` with empty origin, null body and no options.
    pub fn new(to: impl Into<Address>) -> Self {
        Self {
            to: to.into(),
            from: Address::empty(),
            body: Value::Null,
            options: Options::new(),
        }
    }

    /// Set the origin address.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<Address>) -> Self {
        self.from = from.into();
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    /// Set one option key.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Rewrite `envelope.from` to `prefix + envelope.from`.
///
/// `to`, `body` and `options` pass through unchanged. Applied to every
/// envelope crossing from the wire onto the bus so the origin is always
/// reachable through the session that delivered it.
#[must_use]
pub fn prefix_from(envelope: Envelope, prefix: &Address) -> Envelope {
    Envelope {
        from: prefix.join(&envelope.from),
        ..envelope
    }
}
