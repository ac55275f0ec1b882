//! Query predicates.
//!
//! A [`Query`] is an immutable set of predicates plus an optional directory
//! anchor. Two queries with the same predicates in a different order are the
//! same logical query: [`Query::new`] sorts and dedups its predicates so that
//! equality and hashing see one canonical form.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::ObjectKey;
use crate::mount::normalize_path;
use crate::object::AttrValue;

/// Pseudo-attribute naming the object type. Always queryable, always indexed.
pub const ATTR_TYPE: &str = "type";
/// Pseudo-attribute naming the object's last path component. Always searchable.
pub const ATTR_NAME: &str = "name";
/// Pseudo-attribute naming the object's absolute path. Always searchable.
pub const ATTR_PATH: &str = "path";

/// Pattern syntax for [`Predicate::Pattern`]. Both forms match the whole
/// value (anchored), never a substring.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternExpr {
    Regex(String),
    Glob(String),
}

/// One filter predicate.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// Attribute equals value.
    Eq { attr: String, value: AttrValue },
    /// Attribute's text form matches the anchored pattern.
    Pattern { attr: String, pattern: PatternExpr },
    /// Attribute is present.
    Exists { attr: String },
    /// Object's parent is exactly `(type, id)`.
    Parent { parent: ObjectKey },
}

impl Predicate {
    pub fn eq(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::Eq {
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn regex(attr: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Pattern {
            attr: attr.into(),
            pattern: PatternExpr::Regex(pattern.into()),
        }
    }

    pub fn glob(attr: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Pattern {
            attr: attr.into(),
            pattern: PatternExpr::Glob(pattern.into()),
        }
    }

    pub fn exists(attr: impl Into<String>) -> Self {
        Self::Exists { attr: attr.into() }
    }

    pub fn parent(parent: ObjectKey) -> Self {
        Self::Parent { parent }
    }

    /// The attribute this predicate reads, if any.
    pub fn attr(&self) -> Option<&str> {
        match self {
            Self::Eq { attr, .. } | Self::Pattern { attr, .. } | Self::Exists { attr } => {
                Some(attr)
            }
            Self::Parent { .. } => None,
        }
    }
}

/// An immutable query.
///
/// Every constructor, deserialization included, yields the canonical form:
/// predicates sorted and deduplicated, anchor normalized.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(from = "QueryFrame")]
pub struct Query {
    predicates: Vec<Predicate>,
    dirname: Option<PathBuf>,
}

/// Wire shape of a [`Query`] before canonicalization.
#[derive(Deserialize)]
struct QueryFrame {
    #[serde(default)]
    predicates: Vec<Predicate>,
    #[serde(default)]
    dirname: Option<PathBuf>,
}

impl From<QueryFrame> for Query {
    fn from(frame: QueryFrame) -> Self {
        let query = Self::new(frame.predicates);
        match frame.dirname {
            Some(dir) => query.anchored(dir),
            None => query,
        }
    }
}

impl Query {
    /// Build a query from predicates in any order.
    pub fn new(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut predicates: Vec<Predicate> = predicates.into_iter().collect();
        predicates.sort();
        predicates.dedup();
        Self {
            predicates,
            dirname: None,
        }
    }

    /// A query for the children of one directory.
    pub fn dirname(path: impl Into<PathBuf>) -> Self {
        Self::default().anchored(path)
    }

    /// Builder: anchor on a directory. `/m/`, `/m/.` and `/m` anchor alike.
    pub fn anchored(mut self, path: impl Into<PathBuf>) -> Self {
        self.dirname = Some(normalize_path(&path.into()));
        self
    }

    /// Builder: add a predicate, keeping canonical order.
    pub fn and(self, predicate: Predicate) -> Self {
        let dirname = self.dirname;
        let mut q = Self::new(self.predicates.into_iter().chain(std::iter::once(predicate)));
        q.dirname = dirname;
        q
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn dirname_anchor(&self) -> Option<&Path> {
        self.dirname.as_deref()
    }

    /// The object type pinned by an `Eq(type, ..)` predicate, if any.
    pub fn pinned_type(&self) -> Option<&str> {
        self.predicates.iter().find_map(|p| match p {
            Predicate::Eq { attr, value } if attr == ATTR_TYPE => value.as_text(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_order_does_not_change_identity() {
        let a = Query::new([Predicate::eq("type", "audio"), Predicate::eq("artist", "Foo")]);
        let b = Query::new([Predicate::eq("artist", "Foo"), Predicate::eq("type", "audio")]);
        assert_eq!(a, b);
    }

    #[test]
    fn pinned_type_reads_type_predicate() {
        let q = Query::new([Predicate::eq("artist", "Foo")]).and(Predicate::eq("type", "audio"));
        assert_eq!(q.pinned_type(), Some("audio"));
        assert_eq!(Query::dirname("/m").pinned_type(), None);
    }

    #[test]
    fn and_keeps_anchor() {
        let q = Query::dirname("/music").and(Predicate::exists("artist"));
        assert_eq!(q.dirname_anchor(), Some(Path::new("/music")));
        assert_eq!(q.predicates().len(), 1);
    }

    #[test]
    fn anchor_spelling_does_not_change_identity() {
        let plain = Query::dirname("/music/albums");
        assert_eq!(Query::dirname("/music/albums/"), plain);
        assert_eq!(Query::dirname("/music/albums/."), plain);
        assert_eq!(Query::dirname("/music/./albums"), plain);
        assert_eq!(plain.dirname_anchor(), Some(Path::new("/music/albums")));
    }

    #[test]
    fn decoded_queries_are_canonical() {
        let json = r#"{
            "predicates": [
                {"kind": "eq", "attr": "type", "value": {"text": "audio"}},
                {"kind": "exists", "attr": "artist"},
                {"kind": "exists", "attr": "artist"}
            ],
            "dirname": "/music/"
        }"#;
        let decoded: Query = serde_json::from_str(json).unwrap();
        let built = Query::new([Predicate::exists("artist"), Predicate::eq("type", "audio")]).anchored("/music");
        assert_eq!(decoded, built);

        let bare: Query = serde_json::from_str("{}").unwrap();
        assert_eq!(bare, Query::default());
    }

    #[test]
    fn predicate_json_is_tagged() {
        let json = serde_json::to_value(Predicate::exists("title")).unwrap();
        assert_eq!(json["kind"], "exists");
        assert_eq!(json["attr"], "title");
    }

    #[test]
    fn parent_predicate_has_no_attr() {
        assert_eq!(Predicate::parent(ObjectKey::new("dir", 1)).attr(), None);
        assert_eq!(Predicate::glob("name", "*.mp3").attr(), Some("name"));
    }
}
