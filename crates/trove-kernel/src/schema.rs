//! Attribute schema registry.
//!
//! Maps `object type → attribute name → AttrSpec`. Loaded once when the store
//! opens (built-in defaults merged with config overrides), persisted in the
//! `attr_schema` table, and consulted before any query is accepted.
//!
//! # Built-in schema
//!
//! Three pseudo-attributes exist on every type and are computed from the
//! object itself rather than stored:
//!
//! | Attribute | Class        | Kind | Case        |
//! |-----------|--------------|------|-------------|
//! | `type`    | `indexed`    | text | sensitive   |
//! | `name`    | `searchable` | text | insensitive |
//! | `path`    | `searchable` | text | sensitive   |
//!
//! Stored attributes per type:
//!
//! | Types                          | Attribute     | Class        | Kind | Case        |
//! |--------------------------------|---------------|--------------|------|-------------|
//! | file, audio, video, image      | `extension`   | `indexed`    | text | insensitive |
//! | file, audio, video, image      | `size`        | `searchable` | int  |             |
//! | audio, video                   | `title`       | `searchable` | text | insensitive |
//! | audio, video                   | `duration_ms` | `simple`     | int  |             |
//! | audio                          | `artist`      | `indexed`    | text | insensitive |
//! | audio                          | `album`       | `indexed`    | text | insensitive |
//! | audio                          | `genre`       | `keywords`   | list | insensitive |
//! | audio                          | `track`       | `searchable` | int  |             |
//! | audio                          | `bitrate`     | `simple`     | int  |             |
//! | video, image                   | `width`       | `searchable` | int  |             |
//! | video, image                   | `height`      | `searchable` | int  |             |
//! | image                          | `camera`      | `indexed`    | text | insensitive |
//!
//! `dir` carries only the pseudo-attributes.

use std::collections::BTreeMap;

use trove_types::query::{ATTR_NAME, ATTR_PATH, ATTR_TYPE};
use trove_types::{AttrClass, AttrSpec, AttrValue, Predicate, Query, ValueKind};

use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult};

pub const TYPE_AUDIO: &str = "audio";
pub const TYPE_VIDEO: &str = "video";
pub const TYPE_IMAGE: &str = "image";

/// Whether `attr` is computed from the object rather than stored.
pub fn is_pseudo(attr: &str) -> bool {
    matches!(attr, ATTR_TYPE | ATTR_NAME | ATTR_PATH)
}

fn pseudo_spec(attr: &str) -> Option<AttrSpec> {
    match attr {
        ATTR_TYPE => Some(AttrSpec::new(ATTR_TYPE, AttrClass::Indexed, ValueKind::Text)),
        ATTR_NAME => Some(
            AttrSpec::new(ATTR_NAME, AttrClass::Searchable, ValueKind::Text).case_insensitive(),
        ),
        ATTR_PATH => Some(AttrSpec::new(ATTR_PATH, AttrClass::Searchable, ValueKind::Text)),
        _ => None,
    }
}

/// An attribute resolved against the schema for one query.
#[derive(Debug, Clone)]
pub struct ResolvedAttr {
    pub name: String,
    /// Spec per object type that can satisfy a predicate on this attribute.
    pub per_type: BTreeMap<String, AttrSpec>,
    /// Class shared by every entry in `per_type`, if they agree.
    pub uniform_class: Option<AttrClass>,
}

impl ResolvedAttr {
    pub fn spec_for(&self, object_type: &str) -> Option<&AttrSpec> {
        self.per_type.get(object_type)
    }
}

/// Schema registry. See the module docs for the built-in table.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRegistry {
    types: BTreeMap<String, BTreeMap<String, AttrSpec>>,
    generation: i64,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaRegistry {
    /// Registry with only `dir` and `file` declared.
    pub fn minimal() -> Self {
        let mut reg = Self {
            types: BTreeMap::new(),
            generation: 0,
        };
        reg.types.insert(trove_types::TYPE_DIR.to_string(), BTreeMap::new());
        reg.declare_file_attrs(trove_types::TYPE_FILE);
        reg
    }

    /// The built-in media schema.
    pub fn builtin() -> Self {
        let mut reg = Self::minimal();
        for t in [TYPE_AUDIO, TYPE_VIDEO, TYPE_IMAGE] {
            reg.declare_file_attrs(t);
        }

        for t in [TYPE_AUDIO, TYPE_VIDEO] {
            reg.put(t, AttrSpec::new("title", AttrClass::Searchable, ValueKind::Text).case_insensitive());
            reg.put(t, AttrSpec::new("duration_ms", AttrClass::Simple, ValueKind::Int));
        }
        reg.put(TYPE_AUDIO, AttrSpec::new("artist", AttrClass::Indexed, ValueKind::Text).case_insensitive());
        reg.put(TYPE_AUDIO, AttrSpec::new("album", AttrClass::Indexed, ValueKind::Text).case_insensitive());
        reg.put(TYPE_AUDIO, AttrSpec::new("genre", AttrClass::Keywords, ValueKind::List).case_insensitive());
        reg.put(TYPE_AUDIO, AttrSpec::new("track", AttrClass::Searchable, ValueKind::Int));
        reg.put(TYPE_AUDIO, AttrSpec::new("bitrate", AttrClass::Simple, ValueKind::Int));

        for t in [TYPE_VIDEO, TYPE_IMAGE] {
            reg.put(t, AttrSpec::new("width", AttrClass::Searchable, ValueKind::Int));
            reg.put(t, AttrSpec::new("height", AttrClass::Searchable, ValueKind::Int));
        }
        reg.put(TYPE_IMAGE, AttrSpec::new("camera", AttrClass::Indexed, ValueKind::Text).case_insensitive());
        reg
    }

    /// Built-in schema merged with the config's overrides.
    pub fn from_config(config: &IndexConfig) -> IndexResult<Self> {
        let mut reg = Self::builtin();
        for (object_type, specs) in &config.schema {
            for spec in specs {
                reg.declare(object_type, spec.clone())?;
            }
        }
        Ok(reg)
    }

    fn declare_file_attrs(&mut self, object_type: &str) {
        self.put(object_type, AttrSpec::new("extension", AttrClass::Indexed, ValueKind::Text).case_insensitive());
        self.put(object_type, AttrSpec::new("size", AttrClass::Searchable, ValueKind::Int));
    }

    fn put(&mut self, object_type: &str, spec: AttrSpec) {
        self.types
            .entry(object_type.to_string())
            .or_default()
            .insert(spec.name.clone(), spec);
    }

    /// Declare (or redeclare) an attribute. Declaring on an unknown type
    /// registers the type.
    pub fn declare(&mut self, object_type: &str, spec: AttrSpec) -> IndexResult<()> {
        if is_pseudo(&spec.name) {
            return Err(IndexError::config(format!(
                "`{}` is built in and cannot be redeclared",
                spec.name
            )));
        }
        if spec.class == AttrClass::Keywords && !matches!(spec.kind, ValueKind::Text | ValueKind::List) {
            return Err(IndexError::config(format!(
                "keywords attribute `{}` must be text or list",
                spec.name
            )));
        }
        self.put(object_type, spec);
        Ok(())
    }

    pub fn has_type(&self, object_type: &str) -> bool {
        self.types.contains_key(object_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// The spec for one attribute of one type, pseudo-attributes included.
    pub fn spec(&self, object_type: &str, attr: &str) -> Option<AttrSpec> {
        if !self.has_type(object_type) {
            return None;
        }
        pseudo_spec(attr).or_else(|| self.types.get(object_type)?.get(attr).cloned())
    }

    /// Stored (non-pseudo) declarations, in a stable order.
    pub fn entries(&self) -> Vec<(String, AttrSpec)> {
        self.types
            .iter()
            .flat_map(|(t, attrs)| attrs.values().map(move |s| (t.clone(), s.clone())))
            .collect()
    }

    /// Current schema generation. Bumped whenever the persisted schema
    /// differs from the one the store was opened with.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: i64) {
        self.generation = generation;
    }

    /// Resolve `attr` for a query that pins `pinned` as its type (or none).
    ///
    /// With a pinned type the attribute must be queryable for that type.
    /// Without one it must be queryable for at least one registered type;
    /// only those types can match.
    pub fn resolve(&self, pinned: Option<&str>, attr: &str) -> IndexResult<ResolvedAttr> {
        let mut per_type = BTreeMap::new();
        match pinned {
            Some(t) => {
                if !self.has_type(t) {
                    return Err(IndexError::invalid_predicate(format!("unknown object type `{t}`")));
                }
                match self.spec(t, attr) {
                    Some(spec) if spec.class.is_queryable() => {
                        per_type.insert(t.to_string(), spec);
                    }
                    Some(_) => {
                        return Err(IndexError::invalid_predicate(format!(
                            "`{attr}` is not searchable on `{t}`"
                        )));
                    }
                    None => {
                        return Err(IndexError::invalid_predicate(format!(
                            "`{attr}` is not declared on `{t}`"
                        )));
                    }
                }
            }
            None => {
                for t in self.types() {
                    if let Some(spec) = self.spec(t, attr).filter(|s| s.class.is_queryable()) {
                        per_type.insert(t.to_string(), spec);
                    }
                }
                if per_type.is_empty() {
                    return Err(IndexError::invalid_predicate(format!(
                        "`{attr}` is not searchable on any type"
                    )));
                }
            }
        }

        let mut classes = per_type.values().map(|s| s.class);
        let first = classes.next();
        let uniform_class = first.filter(|c| classes.all(|other| other == *c));
        Ok(ResolvedAttr {
            name: attr.to_string(),
            per_type,
            uniform_class,
        })
    }

    /// Check every predicate of `query` before it is accepted.
    pub fn validate_query(&self, query: &Query) -> IndexResult<()> {
        let pinned = query.pinned_type();
        for predicate in query.predicates() {
            let Some(attr) = predicate.attr() else {
                continue;
            };
            let resolved = self.resolve(pinned, attr)?;
            if let Predicate::Eq { value, .. } = predicate {
                check_value_kind(&resolved, value)?;
            }
        }
        Ok(())
    }
}

/// `Eq` values must fit the declared kind of at least one candidate type.
/// Lists and keyword attributes also accept a single text value (membership).
fn check_value_kind(resolved: &ResolvedAttr, value: &AttrValue) -> IndexResult<()> {
    let fits = resolved.per_type.values().any(|spec| {
        let kind = value.kind();
        kind == spec.kind
            || (kind == ValueKind::Text && spec.kind == ValueKind::List)
            || (spec.class == AttrClass::Keywords && matches!(kind, ValueKind::Text | ValueKind::List))
    });
    if fits {
        Ok(())
    } else {
        Err(IndexError::invalid_predicate(format!(
            "`{}` cannot be compared with a {} value",
            resolved.name,
            value.kind()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_attrs_exist_on_every_type() {
        let reg = SchemaRegistry::builtin();
        for t in reg.types() {
            assert_eq!(reg.spec(t, "type").unwrap().class, AttrClass::Indexed);
            assert!(!reg.spec(t, "name").unwrap().case_sensitive);
        }
    }

    #[test]
    fn simple_attr_rejected_for_pinned_type() {
        let reg = SchemaRegistry::builtin();
        let err = reg.resolve(Some("audio"), "bitrate").unwrap_err();
        assert!(matches!(err, IndexError::InvalidPredicate(_)));
    }

    #[test]
    fn undeclared_attr_rejected_everywhere() {
        let reg = SchemaRegistry::builtin();
        assert!(matches!(
            reg.resolve(None, "nonsense"),
            Err(IndexError::InvalidPredicate(_))
        ));
        assert!(matches!(
            reg.resolve(Some("dir"), "artist"),
            Err(IndexError::InvalidPredicate(_))
        ));
    }

    #[test]
    fn unknown_pinned_type_rejected() {
        let reg = SchemaRegistry::builtin();
        assert!(reg.resolve(Some("spreadsheet"), "name").is_err());
    }

    #[test]
    fn unpinned_resolution_collects_types() {
        let reg = SchemaRegistry::builtin();
        let title = reg.resolve(None, "title").unwrap();
        assert_eq!(title.per_type.keys().collect::<Vec<_>>(), ["audio", "video"]);
        assert_eq!(title.uniform_class, Some(AttrClass::Searchable));
    }

    #[test]
    fn value_kind_checked() {
        let reg = SchemaRegistry::builtin();
        let bad = Query::new([Predicate::eq("type", "audio"), Predicate::eq("track", "three")]);
        assert!(matches!(reg.validate_query(&bad), Err(IndexError::InvalidPredicate(_))));

        let good = Query::new([Predicate::eq("type", "audio"), Predicate::eq("track", 3)]);
        reg.validate_query(&good).unwrap();

        let keyword = Query::new([Predicate::eq("genre", "rock")]);
        reg.validate_query(&keyword).unwrap();
    }

    #[test]
    fn overrides_merge_and_pseudo_is_protected() {
        let mut config = IndexConfig::default();
        config.schema.insert(
            "audio".into(),
            vec![AttrSpec::new("bitrate", AttrClass::Searchable, ValueKind::Int)],
        );
        let reg = SchemaRegistry::from_config(&config).unwrap();
        assert_eq!(reg.spec("audio", "bitrate").unwrap().class, AttrClass::Searchable);

        let mut reg = SchemaRegistry::minimal();
        assert!(reg.declare("file", AttrSpec::new("type", AttrClass::Simple, ValueKind::Text)).is_err());
    }
}
