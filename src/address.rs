//! Hierarchical bus addresses.
//!
//! An [`Address`] is an ordered list of string segments such as
//! `["tcpClient", "f3a1"]`. Addresses are values: [`Address::join`] and
//! [`Address::child`] build new addresses and never touch the receiver, so a
//! stored route prefix can be shared freely with message `from` fields.
//!
//! Segments starting with `*` are wildcard markers (`*` for one segment,
//! `**` for any suffix). Only the trusted bus side may address them; see
//! [`contains_wildcard`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// First character of a wildcard segment.
pub const WILDCARD_PREFIX: char = '*';

/// An immutable sequence of address segments.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Vec<String>);

impl Address {
    /// The empty address.
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build an address from anything yielding string-like segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Segments as a slice.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the address has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenate `self` and `suffix` into a new address.
    #[must_use]
    pub fn join(&self, suffix: &Address) -> Address {
        let mut segments = Vec::with_capacity(self.0.len() + suffix.0.len());
        segments.extend(self.0.iter().cloned());
        segments.extend(suffix.0.iter().cloned());
        Address(segments)
    }

    /// New address with one extra trailing segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Address {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.extend(self.0.iter().cloned());
        segments.push(segment.into());
        Address(segments)
    }

    /// New address with `segment` in front, e.g. `["connect"] + route`.
    #[must_use]
    pub fn prepend(&self, segment: impl Into<String>) -> Address {
        let mut segments = Vec::with_capacity(self.0.len() + 1);
        segments.push(segment.into());
        segments.extend(self.0.iter().cloned());
        Address(segments)
    }

    /// True if `prefix` matches the leading segments of `self`.
    pub fn starts_with(&self, prefix: &Address) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Address made of the segments from `index` onward.
    #[must_use]
    pub fn tail(&self, index: usize) -> Address {
        Address(self.0.get(index..).map(<[String]>::to_vec).unwrap_or_default())
    }
}

/// True iff any segment of `address` begins with `*`.
///
/// Covers both the single-segment (`*`) and recursive (`**`) markers.
pub fn contains_wildcard(address: &Address) -> bool {
    address
        .segments()
        .iter()
        .any(|segment| segment.starts_with(WILDCARD_PREFIX))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

impl From<Vec<String>> for Address {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for Address {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for Address {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl<S: Into<String>> FromIterator<S> for Address {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leaves_operands_untouched() {
        let route = Address::from(["tcpClient", "f3a1"]);
        let from = Address::from(["funds"]);
        let joined = route.join(&from);

        assert_eq!(joined, Address::from(["tcpClient", "f3a1", "funds"]));
        assert_eq!(route, Address::from(["tcpClient", "f3a1"]));
        assert_eq!(from, Address::from(["funds"]));
    }

    #[test]
    fn test_join_with_empty() {
        let route = Address::from(["tcpServer"]);
        assert_eq!(route.join(&Address::empty()), route);
        assert_eq!(Address::empty().join(&route), route);
    }

    #[test]
    fn test_prepend_and_child() {
        let route = Address::from(["tcpClient", "abc"]);
        assert_eq!(
            route.prepend("disconnect"),
            Address::from(["disconnect", "tcpClient", "abc"])
        );
        assert_eq!(
            route.child("::clientHost"),
            Address::from(["tcpClient", "abc", "::clientHost"])
        );
    }

    #[test]
    fn test_tail_past_end_is_empty() {
        let addr = Address::from(["a", "b"]);
        assert_eq!(addr.tail(1), Address::from(["b"]));
        assert!(addr.tail(2).is_empty());
        assert!(addr.tail(5).is_empty());
    }

    #[test]
    fn test_contains_wildcard() {
        assert!(contains_wildcard(&Address::from(["*"])));
        assert!(contains_wildcard(&Address::from(["foo", "**"])));
        assert!(contains_wildcard(&Address::from(["foo", "*bar"])));
        assert!(!contains_wildcard(&Address::from(["foo", "b*r"])));
        assert!(!contains_wildcard(&Address::from(["foo", "bar"])));
        assert!(!contains_wildcard(&Address::empty()));
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let addr = Address::from(["tcpServer", "foo"]);
        let json = serde_json::to_value(&addr).unwrap();
        assert_eq!(json, serde_json::json!(["tcpServer", "foo"]));

        let back: Address = serde_json::from_value(json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_display_uses_slashes() {
        assert_eq!(Address::from(["a", "b", "c"]).to_string(), "a/b/c");
    }
}
