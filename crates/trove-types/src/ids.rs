//! Identifiers for objects, clients, result sets, and subscriptions.
//!
//! Objects are addressed by `(type, id)`: the type tag is part of identity so
//! that a lookup with the wrong type is a miss, never a silent cross-type hit.
//! The numeric id is assigned by the store and never reused.
//!
//! Client, result-set, and subscription ids are plain counters minted by the
//! server; they are only meaningful within one server process.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a stored object: type tag plus store-assigned id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Type tag (`"dir"`, `"file"`, `"audio"`, ...).
    #[serde(rename = "type")]
    pub object_type: String,
    /// Store-assigned id, stable for the object's lifetime.
    pub id: i64,
}

impl ObjectKey {
    pub fn new(object_type: impl Into<String>, id: i64) -> Self {
        Self {
            object_type: object_type.into(),
            id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

macro_rules! impl_counter_id {
    ($T:ident, $prefix:literal) => {
        impl $T {
            /// Wrap a raw counter value.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw counter value.
            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($T), "({})"), self.0)
            }
        }
    };
}

/// A connected client, one per server-side session.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

/// A query result set held by the server on behalf of one client.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSetId(u64);

/// A live monitor subscription.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl_counter_id!(ClientId, "client-");
impl_counter_id!(ResultSetId, "rs-");
impl_counter_id!(SubscriptionId, "sub-");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_display() {
        let key = ObjectKey::new("audio", 42);
        assert_eq!(key.to_string(), "audio:42");
    }

    #[test]
    fn object_key_serializes_type_field() {
        let key = ObjectKey::new("dir", 1);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"type":"dir","id":1}"#);
    }

    #[test]
    fn keys_of_different_types_differ() {
        assert_ne!(ObjectKey::new("dir", 7), ObjectKey::new("file", 7));
    }

    #[test]
    fn counter_ids_are_transparent() {
        let id = SubscriptionId::new(9);
        assert_eq!(serde_json::to_string(&id).unwrap(), "9");
        assert_eq!(id.to_string(), "sub-9");
        assert_eq!(format!("{id:?}"), "SubscriptionId(9)");
    }
}
