//! Stored objects and their typed attribute values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::ObjectKey;
use crate::schema::ValueKind;

/// A typed attribute value.
///
/// No float variant: values must be `Eq + Hash + Ord`. Durations are stored
/// as integer milliseconds.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

impl AttrValue {
    /// The schema kind this value belongs to.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Int(_) => ValueKind::Int,
            Self::Bool(_) => ValueKind::Bool,
            Self::List(_) => ValueKind::List,
        }
    }

    /// Text rendering used for pattern matching and index keys.
    ///
    /// Lists render as their items joined by a single space.
    pub fn as_match_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(items) => items.join(" "),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_match_text())
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Attribute name → value. Ordered so serialized forms are deterministic.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Parse outcome recorded on an object.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObjectState {
    /// Attributes reflect the last successful parse (or nothing was parsed yet).
    #[default]
    Ok,
    /// The last parse failed; attributes are left as they were and the object
    /// is not retried until its mtime moves again.
    Unparseable,
}

/// One file, directory, or derived media entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub key: ObjectKey,
    /// Parent identity. `None` for mount roots.
    pub parent: Option<ObjectKey>,
    /// Absolute filesystem path.
    pub path: PathBuf,
    /// Volume identity of the mount this object lives on, if any.
    pub volume: Option<String>,
    /// Last-known filesystem mtime (Unix milliseconds). `None` = never scanned.
    pub mtime: Option<i64>,
    /// Incremented on every successful write to this object.
    pub revision: u64,
    pub state: ObjectState,
    /// False while the object's mountpoint is detached.
    pub reachable: bool,
    pub attributes: Attributes,
}

impl Object {
    /// Object name: last path component.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
