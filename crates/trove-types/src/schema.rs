//! Attribute schema vocabulary.
//!
//! Every attribute of every object type is declared with an indexing class
//! and a value kind. The class decides what the query engine accepts:
//!
//! | Class        | Stored | `Eq`/`Pattern`/`Exists` | Secondary index | Token search |
//! |--------------|--------|-------------------------|-----------------|--------------|
//! | `simple`     | yes    | no                      | no              | no           |
//! | `searchable` | yes    | yes                     | no              | no           |
//! | `indexed`    | yes    | yes                     | yes             | no           |
//! | `keywords`   | yes    | yes                     | no              | yes          |

use serde::{Deserialize, Serialize};

/// How an attribute participates in indexing.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttrClass {
    Simple,
    Searchable,
    Indexed,
    Keywords,
}

impl AttrClass {
    /// Whether predicates may reference attributes of this class.
    pub fn is_queryable(self) -> bool {
        !matches!(self, Self::Simple)
    }
}

/// Value type of an attribute.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
    strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValueKind {
    Text,
    Int,
    Bool,
    List,
}

/// One schema entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSpec {
    pub name: String,
    pub class: AttrClass,
    pub kind: ValueKind,
    /// Whether `Eq` and `Pattern` compare case-sensitively. Declared per
    /// attribute, never inferred from the data.
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_case_sensitive() -> bool {
    true
}

impl AttrSpec {
    pub fn new(name: impl Into<String>, class: AttrClass, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            class,
            kind,
            case_sensitive: true,
        }
    }

    /// Builder: compare case-insensitively.
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_is_not_queryable() {
        assert!(!AttrClass::Simple.is_queryable());
        assert!(AttrClass::Searchable.is_queryable());
        assert!(AttrClass::Indexed.is_queryable());
        assert!(AttrClass::Keywords.is_queryable());
    }

    #[test]
    fn class_round_trips_through_strings() {
        for class in [AttrClass::Simple, AttrClass::Searchable, AttrClass::Indexed, AttrClass::Keywords] {
            assert_eq!(class.to_string().parse::<AttrClass>().unwrap(), class);
        }
    }

    #[test]
    fn case_sensitive_defaults_on_in_toml_like_input() {
        let spec: AttrSpec =
            serde_json::from_str(r#"{"name":"artist","class":"indexed","kind":"text"}"#).unwrap();
        assert!(spec.case_sensitive);
        assert_eq!(spec.class, AttrClass::Indexed);
    }
}
