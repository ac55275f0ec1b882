//! Query engine: compiles predicates against the schema.
//!
//! Compilation fails fast with `InvalidPredicate`; a compiled query never
//! fails at evaluation time. Evaluation happens in two steps: the store
//! fetches candidates according to the query's [`Plan`] (secondary index,
//! keyword table, child list, type scan), then [`CompiledQuery::matches`]
//! applies every predicate to each candidate.
//!
//! Matching rules:
//! - `Eq` compares the stored value with the declared case sensitivity of the
//!   attribute for the candidate's type. A text value against a list attribute
//!   tests membership. On `keywords` attributes every token of the value must
//!   appear among the stored tokens.
//! - `Pattern` is anchored: regexes are wrapped in `^(?:...)$`, globs match the
//!   whole text. Lists match against their items joined by a single space.
//! - `Exists` tests presence. Pseudo-attributes are always present.

use std::borrow::Cow;
use std::path::PathBuf;

use globset::{GlobBuilder, GlobMatcher};
use regex::{Regex, RegexBuilder};
use trove_types::query::{ATTR_NAME, ATTR_PATH, ATTR_TYPE};
use trove_types::{AttrClass, AttrSpec, AttrValue, Object, ObjectKey, PatternExpr, Predicate, Query};

use crate::error::{IndexError, IndexResult};
use crate::schema::{ResolvedAttr, SchemaRegistry, is_pseudo};

// ============================================================================
// Value helpers shared with the store
// ============================================================================

fn fold(s: &str, case_sensitive: bool) -> Cow<'_, str> {
    if case_sensitive {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(s.to_lowercase())
    }
}

/// Secondary-index keys for a value of an `indexed` attribute.
pub(crate) fn index_keys(spec: &AttrSpec, value: &AttrValue) -> Vec<String> {
    match value {
        AttrValue::Text(s) => vec![fold(s, spec.case_sensitive).into_owned()],
        AttrValue::Int(n) => vec![n.to_string()],
        AttrValue::Bool(b) => vec![b.to_string()],
        AttrValue::List(items) => items
            .iter()
            .map(|s| fold(s, spec.case_sensitive).into_owned())
            .collect(),
    }
}

/// Tokens of a value of a `keywords` attribute.
pub(crate) fn tokenize(value: &AttrValue, case_sensitive: bool) -> Vec<String> {
    let text = value.as_match_text();
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| fold(t, case_sensitive).into_owned())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Read an attribute, computing pseudo-attributes from the object.
pub fn attr_value<'a>(obj: &'a Object, attr: &str) -> Option<Cow<'a, AttrValue>> {
    match attr {
        ATTR_TYPE => Some(Cow::Owned(AttrValue::Text(obj.key.object_type.clone()))),
        ATTR_NAME => Some(Cow::Owned(AttrValue::Text(obj.name()))),
        ATTR_PATH => Some(Cow::Owned(AttrValue::Text(
            obj.path.to_string_lossy().into_owned(),
        ))),
        _ => obj.attributes.get(attr).map(Cow::Borrowed),
    }
}

// ============================================================================
// Candidate plans
// ============================================================================

/// How the store fetches candidates for a compiled query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Children of the directory at `path`, in recorded scan order.
    Dir { path: PathBuf },
    /// Children of one parent, in insertion order.
    Children { parent: ObjectKey },
    /// Secondary-index lookup on an `indexed` attribute.
    Indexed { attr: String, key: String },
    /// Token lookup on a `keywords` attribute.
    Keyword { attr: String, token: String },
    /// All objects of one type.
    Type(String),
    /// All reachable objects.
    Scan,
}

// ============================================================================
// Matchers
// ============================================================================

#[derive(Debug, Clone)]
enum TextMatcher {
    Regex(Regex),
    Glob(GlobMatcher),
}

impl TextMatcher {
    fn compile(expr: &PatternExpr, case_sensitive: bool) -> IndexResult<Self> {
        match expr {
            PatternExpr::Regex(pattern) => RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(!case_sensitive)
                .build()
                .map(Self::Regex)
                .map_err(|e| IndexError::invalid_predicate(format!("bad regex `{pattern}`: {e}"))),
            PatternExpr::Glob(pattern) => GlobBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .literal_separator(false)
                .build()
                .map(|g| Self::Glob(g.compile_matcher()))
                .map_err(|e| IndexError::invalid_predicate(format!("bad glob `{pattern}`: {e}"))),
        }
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(text),
            Self::Glob(glob) => glob.is_match(text),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Eq {
        attr: ResolvedAttr,
        value: AttrValue,
    },
    Pattern {
        attr: ResolvedAttr,
        sensitive: Option<TextMatcher>,
        insensitive: Option<TextMatcher>,
    },
    Exists {
        attr: ResolvedAttr,
    },
    Parent(ObjectKey),
}

impl Matcher {
    fn matches(&self, obj: &Object) -> bool {
        let object_type = obj.key.object_type.as_str();
        match self {
            Self::Parent(parent) => obj.parent.as_ref() == Some(parent),
            Self::Exists { attr } => {
                attr.spec_for(object_type).is_some() && attr_value(obj, &attr.name).is_some()
            }
            Self::Eq { attr, value } => {
                let Some(spec) = attr.spec_for(object_type) else {
                    return false;
                };
                attr_value(obj, &attr.name).is_some_and(|stored| eq_value(spec, &stored, value))
            }
            Self::Pattern {
                attr,
                sensitive,
                insensitive,
            } => {
                let Some(spec) = attr.spec_for(object_type) else {
                    return false;
                };
                let matcher = if spec.case_sensitive { sensitive } else { insensitive };
                match (matcher, attr_value(obj, &attr.name)) {
                    (Some(m), Some(stored)) => m.is_match(&stored.as_match_text()),
                    _ => false,
                }
            }
        }
    }
}

fn eq_value(spec: &AttrSpec, stored: &AttrValue, wanted: &AttrValue) -> bool {
    let cs = spec.case_sensitive;
    if spec.class == AttrClass::Keywords {
        let wanted = tokenize(wanted, cs);
        if wanted.is_empty() {
            return false;
        }
        let stored = tokenize(stored, cs);
        return wanted.iter().all(|t| stored.binary_search(t).is_ok());
    }
    match (stored, wanted) {
        (AttrValue::Text(a), AttrValue::Text(b)) => fold(a, cs) == fold(b, cs),
        (AttrValue::List(items), AttrValue::Text(b)) => {
            let b = fold(b, cs);
            items.iter().any(|a| fold(a, cs) == b)
        }
        (AttrValue::List(a), AttrValue::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| fold(x, cs) == fold(y, cs))
        }
        (a, b) => a == b,
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Stateless compiler from [`Query`] to [`CompiledQuery`].
pub struct QueryEngine;

impl QueryEngine {
    /// Validate and compile `query`.
    pub fn compile(schema: &SchemaRegistry, query: &Query) -> IndexResult<CompiledQuery> {
        schema.validate_query(query)?;
        let pinned = query.pinned_type();

        let mut matchers = Vec::with_capacity(query.predicates().len());
        for predicate in query.predicates() {
            let matcher = match predicate {
                Predicate::Parent { parent } => Matcher::Parent(parent.clone()),
                Predicate::Exists { attr } => Matcher::Exists {
                    attr: schema.resolve(pinned, attr)?,
                },
                Predicate::Eq { attr, value } => Matcher::Eq {
                    attr: schema.resolve(pinned, attr)?,
                    value: value.clone(),
                },
                Predicate::Pattern { attr, pattern } => {
                    let attr = schema.resolve(pinned, attr)?;
                    let needs_cs = attr.per_type.values().any(|s| s.case_sensitive);
                    let needs_ci = attr.per_type.values().any(|s| !s.case_sensitive);
                    Matcher::Pattern {
                        sensitive: needs_cs.then(|| TextMatcher::compile(pattern, true)).transpose()?,
                        insensitive: needs_ci.then(|| TextMatcher::compile(pattern, false)).transpose()?,
                        attr,
                    }
                }
            };
            matchers.push(matcher);
        }

        let plan = choose_plan(query, &matchers);
        Ok(CompiledQuery {
            query: query.clone(),
            matchers,
            plan,
        })
    }
}

fn uniform_spec(attr: &ResolvedAttr) -> Option<&AttrSpec> {
    let mut specs = attr.per_type.values();
    let first = specs.next()?;
    specs
        .all(|s| s.case_sensitive == first.case_sensitive)
        .then_some(first)
}

fn choose_plan(query: &Query, matchers: &[Matcher]) -> Plan {
    if let Some(dir) = query.dirname_anchor() {
        return Plan::Dir {
            path: dir.to_path_buf(),
        };
    }
    for m in matchers {
        if let Matcher::Parent(parent) = m {
            return Plan::Children {
                parent: parent.clone(),
            };
        }
    }
    for m in matchers {
        let Matcher::Eq { attr, value } = m else {
            continue;
        };
        if is_pseudo(&attr.name) {
            continue;
        }
        let Some(spec) = uniform_spec(attr) else {
            continue;
        };
        match attr.uniform_class {
            Some(AttrClass::Indexed) => {
                if let Some(key) = index_keys(spec, value).into_iter().next() {
                    return Plan::Indexed {
                        attr: attr.name.clone(),
                        key,
                    };
                }
            }
            Some(AttrClass::Keywords) => {
                if let Some(token) = tokenize(value, spec.case_sensitive).into_iter().next() {
                    return Plan::Keyword {
                        attr: attr.name.clone(),
                        token,
                    };
                }
            }
            _ => {}
        }
    }
    match query.pinned_type() {
        Some(t) => Plan::Type(t.to_string()),
        None => Plan::Scan,
    }
}

/// A validated query ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    query: Query,
    matchers: Vec<Matcher>,
    plan: Plan,
}

impl CompiledQuery {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Whether a reachable object satisfies every predicate.
    pub fn matches(&self, obj: &Object) -> bool {
        obj.reachable && self.matchers.iter().all(|m| m.matches(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use trove_types::{Attributes, ObjectState};

    fn audio(id: i64, name: &str, attrs: &[(&str, AttrValue)]) -> Object {
        Object {
            key: ObjectKey::new("audio", id),
            parent: Some(ObjectKey::new("dir", 1)),
            path: PathBuf::from(format!("/music/{name}")),
            volume: Some("vol".into()),
            mtime: Some(0),
            revision: 1,
            state: ObjectState::Ok,
            reachable: true,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Attributes>(),
        }
    }

    fn compile(predicates: impl IntoIterator<Item = Predicate>) -> IndexResult<CompiledQuery> {
        QueryEngine::compile(&SchemaRegistry::builtin(), &Query::new(predicates))
    }

    #[test]
    fn case_insensitive_eq_on_indexed_attr() {
        let q = compile([Predicate::eq("type", "audio"), Predicate::eq("artist", "foo")]).unwrap();
        assert_eq!(
            q.plan(),
            &Plan::Indexed {
                attr: "artist".into(),
                key: "foo".into()
            }
        );
        assert!(q.matches(&audio(2, "a.mp3", &[("artist", "Foo".into())])));
        assert!(!q.matches(&audio(3, "b.mp3", &[("artist", "Bar".into())])));
    }

    #[test]
    fn type_names_are_case_sensitive() {
        let err = compile([Predicate::eq("type", "Audio")]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidPredicate(_)));
    }

    #[test]
    fn patterns_are_anchored() {
        let q = compile([Predicate::regex("name", "b")]).unwrap();
        assert!(!q.matches(&audio(2, "abc.mp3", &[])));

        let q = compile([Predicate::regex("name", r"a.*\.MP3")]).unwrap();
        assert!(q.matches(&audio(2, "abc.mp3", &[])), "name is case-insensitive");

        let q = compile([Predicate::glob("path", "/music/*.mp3")]).unwrap();
        assert!(q.matches(&audio(2, "abc.mp3", &[])));
        let q = compile([Predicate::glob("path", "/MUSIC/*.mp3")]).unwrap();
        assert!(!q.matches(&audio(2, "abc.mp3", &[])), "path is case-sensitive");
    }

    #[test]
    fn bad_regex_is_invalid_predicate() {
        let err = compile([Predicate::regex("name", "(")]).unwrap_err();
        assert!(matches!(err, IndexError::InvalidPredicate(_)));
    }

    #[test]
    fn keywords_need_every_token() {
        let genre = AttrValue::List(vec!["Progressive Rock".into(), "Live".into()]);
        let obj = audio(2, "a.mp3", &[("genre", genre)]);

        let q = compile([Predicate::eq("genre", "rock live")]).unwrap();
        assert_eq!(
            q.plan(),
            &Plan::Keyword {
                attr: "genre".into(),
                token: "live".into()
            }
        );
        assert!(q.matches(&obj));
        assert!(!compile([Predicate::eq("genre", "rock jazz")]).unwrap().matches(&obj));
    }

    #[test]
    fn exists_and_parent() {
        let obj = audio(2, "a.mp3", &[("title", "A".into())]);
        assert!(compile([Predicate::exists("title")]).unwrap().matches(&obj));
        assert!(!compile([Predicate::exists("album")]).unwrap().matches(&obj));

        let q = compile([Predicate::parent(ObjectKey::new("dir", 1))]).unwrap();
        assert_eq!(
            q.plan(),
            &Plan::Children {
                parent: ObjectKey::new("dir", 1)
            }
        );
        assert!(q.matches(&obj));
    }

    #[test]
    fn unreachable_objects_never_match() {
        let mut obj = audio(2, "a.mp3", &[]);
        obj.reachable = false;
        assert!(!compile([]).unwrap().matches(&obj));
    }

    #[test]
    fn dirname_anchor_plans_scan_order() {
        let q = QueryEngine::compile(&SchemaRegistry::builtin(), &Query::dirname("/music")).unwrap();
        assert_eq!(
            q.plan(),
            &Plan::Dir {
                path: PathBuf::from("/music")
            }
        );
    }

    #[test]
    fn attrs_only_match_declaring_types() {
        let mut file = audio(4, "notes.txt", &[("title", "x".into())]);
        file.key = ObjectKey::new("file", 4);
        let q = compile([Predicate::eq("title", "x")]).unwrap();
        assert!(!q.matches(&file));
    }
}
