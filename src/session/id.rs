//! Identities: clients, owning principals and bound endpoints.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Stable client identity. Compares case-insensitively; displays as given.
#[derive(Clone, Debug)]
pub struct ClientId {
    display: Arc<str>,
    key: Arc<str>,
}

impl ClientId {
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref();
        Self {
            display: Arc::from(id),
            key: Arc::from(id.to_lowercase()),
        }
    }

    /// Identifier as originally supplied.
    pub fn as_str(&self) -> &str {
        &self.display
    }
}

impl PartialEq for ClientId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ClientId {}

impl Hash for ClientId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Caller identity recorded as a session's owner.
///
/// The empty name is the anonymous sentinel: a session owned by it accepts any caller.
#[derive(Clone, Debug, Default)]
pub struct Principal(Arc<str>);

impl Principal {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn anonymous() -> Self {
        Self(Arc::from(""))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when `caller` may use a session owned by `self`.
    pub fn admits(&self, caller: &Principal) -> bool {
        self.is_anonymous() || self.0.eq_ignore_ascii_case(&caller.0)
    }
}

impl PartialEq for Principal {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Principal {}

/// Handle of a collaborator bound to a session (e.g. a duplex callback channel).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn client_ids_ignore_case_but_keep_display() {
        let a = ClientId::new("Client-A");
        let b = ClientId::new("client-a");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Client-A");

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn anonymous_owner_admits_everyone() {
        let owner = Principal::anonymous();
        assert!(owner.admits(&Principal::new("alice")));

        let owner = Principal::new("Alice");
        assert!(owner.admits(&Principal::new("alice")));
        assert!(!owner.admits(&Principal::new("bob")));
        assert!(!owner.admits(&Principal::anonymous()));
    }
}
