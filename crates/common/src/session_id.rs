//! Logical session identifiers
//!
//! A session is either a top-level client session or a child session derived
//! from one (used for internal transactions that run on behalf of a parent).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a logical client session.
///
/// Ordering is lexicographic over (parent, child) and is used as the stable
/// secondary key wherever transactions need a deterministic order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    parent: Uuid,
    child: Option<Uuid>,
}

impl SessionId {
    /// Generate a new top-level session id
    pub fn new() -> Self {
        Self {
            parent: Uuid::new_v4(),
            child: None,
        }
    }

    /// Create from an existing UUID (for testing/deserialization)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self {
            parent: uuid,
            child: None,
        }
    }

    /// Derive a fresh child session of this session's top-level session
    pub fn new_child(&self) -> Self {
        self.child_with(Uuid::new_v4())
    }

    /// Derive the child session identified by `child`
    pub fn child_with(&self, child: Uuid) -> Self {
        Self {
            parent: self.parent,
            child: Some(child),
        }
    }

    /// The top-level session this id belongs to (itself if already top-level)
    pub fn parent(&self) -> Self {
        Self {
            parent: self.parent,
            child: None,
        }
    }

    pub fn is_child(&self) -> bool {
        self.child.is_some()
    }

    /// True if `self` is `ancestor` or a child session of it.
    pub fn belongs_to(&self, ancestor: &SessionId) -> bool {
        if ancestor.is_child() {
            self == ancestor
        } else {
            self.parent == ancestor.parent
        }
    }

    /// Fixed-width encoding: 16 parent bytes, a child flag byte, 16 child bytes
    /// (zeroed for top-level sessions). Encodings sort like the ids themselves.
    pub fn to_bytes(&self) -> [u8; 33] {
        let mut bytes = [0u8; 33];
        bytes[..16].copy_from_slice(self.parent.as_bytes());
        if let Some(child) = self.child {
            bytes[16] = 1;
            bytes[17..].copy_from_slice(child.as_bytes());
        }
        bytes
    }

    /// Decode the encoding produced by [`SessionId::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != 33 {
            return Err(format!("Invalid session id length: {}", bytes.len()));
        }

        let parent = Uuid::from_slice(&bytes[..16]).map_err(|e| e.to_string())?;
        let child = match bytes[16] {
            0 => None,
            1 => Some(Uuid::from_slice(&bytes[17..]).map_err(|e| e.to_string())?),
            flag => return Err(format!("Invalid child flag: {}", flag)),
        };

        Ok(Self { parent, child })
    }

    /// Parse from string representation (`parent` or `parent/child`)
    pub fn parse(s: &str) -> Result<Self, String> {
        let (parent, child) = match s.split_once('/') {
            Some((parent, child)) => (parent, Some(child)),
            None => (s, None),
        };

        let parent =
            Uuid::parse_str(parent).map_err(|e| format!("Invalid session id: {}", e))?;
        let child = child
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| format!("Invalid child session id: {}", e))?;

        Ok(Self { parent, child })
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.child {
            Some(child) => write!(f, "{}/{}", self.parent, child),
            None => write!(f, "{}", self.parent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        let parent = SessionId::new();
        let child = parent.new_child();

        assert_eq!(SessionId::parse(&parent.to_string()).unwrap(), parent);
        assert_eq!(SessionId::parse(&child.to_string()).unwrap(), child);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let parent = SessionId::new();
        let child = parent.new_child();

        assert_eq!(SessionId::from_bytes(&parent.to_bytes()).unwrap(), parent);
        assert_eq!(SessionId::from_bytes(&child.to_bytes()).unwrap(), child);
        assert!(SessionId::from_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_hierarchy() {
        let parent = SessionId::new();
        let child = parent.new_child();
        let other = SessionId::new();

        assert!(child.is_child());
        assert!(!parent.is_child());
        assert_eq!(child.parent(), parent);

        assert!(child.belongs_to(&parent));
        assert!(parent.belongs_to(&parent));
        assert!(!parent.belongs_to(&child));
        assert!(!child.belongs_to(&other));
    }

    #[test]
    fn test_ordering_matches_byte_order() {
        let a = SessionId::from_uuid(Uuid::from_u128(1));
        let b = SessionId::from_uuid(Uuid::from_u128(2));
        let a_child = a.child_with(Uuid::from_u128(9));

        assert!(a < a_child);
        assert!(a_child < b);
        assert!(a.to_bytes() < a_child.to_bytes());
        assert!(a_child.to_bytes() < b.to_bytes());
    }
}
