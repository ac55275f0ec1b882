//! SQLite object store.
//!
//! One row per object plus two side tables feeding the query engine:
//! `attr_index` (secondary index for `indexed` attributes) and `keywords`
//! (token table for `keywords` attributes). Both are rewritten in the same
//! transaction as the object row, so a reader sees either the old or the new
//! index, never a mix.
//!
//! The attribute schema is persisted in `attr_schema`. When the schema the
//! store is opened with differs from the persisted one, the schema generation
//! is bumped. Objects carry the generation they were last indexed under;
//! index lookups also consider objects from older generations, and every
//! write re-indexes under the current one. No rescan is needed.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Row, params};
use trove_types::{AttrSpec, Attributes, Object, ObjectKey, ObjectState, Query};

use crate::error::{IndexError, IndexResult};
use crate::query::{CompiledQuery, Plan, QueryEngine, index_keys, tokenize};
use crate::schema::SchemaRegistry;

const SCHEMA: &str = r#"
-- Objects (one per file, directory, or derived entity)
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL,
    parent_type TEXT,
    parent_id INTEGER,
    path TEXT NOT NULL,
    volume TEXT NOT NULL DEFAULT '',
    mtime INTEGER,
    revision INTEGER NOT NULL DEFAULT 1,
    state TEXT NOT NULL DEFAULT 'ok',
    reachable INTEGER NOT NULL DEFAULT 1,
    attributes TEXT NOT NULL DEFAULT '{}',
    schema_gen INTEGER NOT NULL DEFAULT 0,
    scan_pos INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_objects_volume_path ON objects(volume, path);
CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects(parent_type, parent_id, scan_pos);
CREATE INDEX IF NOT EXISTS idx_objects_type ON objects(type);
CREATE INDEX IF NOT EXISTS idx_objects_path ON objects(path);

-- Secondary index for `indexed` attributes
CREATE TABLE IF NOT EXISTS attr_index (
    attr TEXT NOT NULL,
    value TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    PRIMARY KEY (attr, value, object_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_attr_index_object ON attr_index(object_id);

-- Token table for `keywords` attributes
CREATE TABLE IF NOT EXISTS keywords (
    attr TEXT NOT NULL,
    token TEXT NOT NULL,
    object_id INTEGER NOT NULL,
    PRIMARY KEY (attr, token, object_id)
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_keywords_object ON keywords(object_id);

-- Persisted attribute schema
CREATE TABLE IF NOT EXISTS attr_schema (
    object_type TEXT NOT NULL,
    name TEXT NOT NULL,
    class TEXT NOT NULL,
    kind TEXT NOT NULL,
    case_sensitive INTEGER NOT NULL,
    PRIMARY KEY (object_type, name)
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

const COLUMNS: &str =
    "id, type, parent_type, parent_id, path, volume, mtime, revision, state, reachable, attributes";

const META_SCHEMA_GENERATION: &str = "schema_generation";

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<Object> {
    let id: i64 = row.get(0)?;
    let object_type: String = row.get(1)?;
    let parent_type: Option<String> = row.get(2)?;
    let parent_id: Option<i64> = row.get(3)?;
    let path: String = row.get(4)?;
    let volume: String = row.get(5)?;
    let revision: i64 = row.get(7)?;
    let state: String = row.get(8)?;
    let attributes: String = row.get(10)?;

    Ok(Object {
        key: ObjectKey::new(object_type, id),
        parent: parent_type.zip(parent_id).map(|(t, id)| ObjectKey::new(t, id)),
        path: PathBuf::from(path),
        volume: (!volume.is_empty()).then_some(volume),
        mtime: row.get(6)?,
        revision: revision.max(0) as u64,
        state: state.parse().map_err(|e| conversion_error(8, e))?,
        reachable: row.get(9)?,
        attributes: serde_json::from_str(&attributes).map_err(|e| conversion_error(10, e))?,
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Rewrite the index rows of one object under the current schema.
fn write_index_rows(
    conn: &Connection,
    schema: &SchemaRegistry,
    id: i64,
    object_type: &str,
    attributes: &Attributes,
) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM attr_index WHERE object_id = ?1", [id])?;
    conn.execute("DELETE FROM keywords WHERE object_id = ?1", [id])?;

    let mut index_stmt = conn.prepare(
        "INSERT OR IGNORE INTO attr_index (attr, value, object_id) VALUES (?1, ?2, ?3)",
    )?;
    let mut keyword_stmt = conn.prepare(
        "INSERT OR IGNORE INTO keywords (attr, token, object_id) VALUES (?1, ?2, ?3)",
    )?;
    for (name, value) in attributes {
        let Some(spec) = schema.spec(object_type, name) else {
            continue;
        };
        match spec.class {
            trove_types::AttrClass::Indexed => {
                for key in index_keys(&spec, value) {
                    index_stmt.execute(params![name, key, id])?;
                }
            }
            trove_types::AttrClass::Keywords => {
                for token in tokenize(value, spec.case_sensitive) {
                    keyword_stmt.execute(params![name, token, id])?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Fields of an object the store has not assigned an id to yet.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub object_type: String,
    pub parent: Option<ObjectKey>,
    pub path: PathBuf,
    pub volume: String,
    pub mtime: Option<i64>,
    pub scan_pos: i64,
    pub attributes: Attributes,
}

impl NewObject {
    pub fn new(object_type: impl Into<String>, path: impl Into<PathBuf>, volume: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            parent: None,
            path: path.into(),
            volume: volume.into(),
            mtime: None,
            scan_pos: 0,
            attributes: Attributes::new(),
        }
    }

    pub fn with_parent(mut self, parent: ObjectKey) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn at_position(mut self, scan_pos: i64) -> Self {
        self.scan_pos = scan_pos;
        self
    }
}

/// Persistent object store.
pub struct ObjectStore {
    conn: Connection,
    schema: SchemaRegistry,
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("schema_generation", &self.schema.generation())
            .finish()
    }
}

impl ObjectStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, schema: SchemaRegistry) -> IndexResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(conn, schema)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(schema: SchemaRegistry) -> IndexResult<Self> {
        Self::init(Connection::open_in_memory()?, schema)
    }

    fn init(conn: Connection, schema: SchemaRegistry) -> IndexResult<Self> {
        conn.execute_batch(SCHEMA)?;
        let mut store = Self { conn, schema };
        store.sync_schema()?;
        Ok(store)
    }

    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn sync_schema(&mut self) -> IndexResult<()> {
        let persisted: Vec<(String, AttrSpec)> = {
            let mut stmt = self.conn.prepare(
                "SELECT object_type, name, class, kind, case_sensitive FROM attr_schema
                 ORDER BY object_type, name",
            )?;
            let rows = stmt.query_map([], |row| {
                let object_type: String = row.get(0)?;
                let class: String = row.get(2)?;
                let kind: String = row.get(3)?;
                Ok((
                    object_type,
                    AttrSpec {
                        name: row.get(1)?,
                        class: class.parse().map_err(|e| conversion_error(2, e))?,
                        kind: kind.parse().map_err(|e| conversion_error(3, e))?,
                        case_sensitive: row.get(4)?,
                    },
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut generation: i64 = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [META_SCHEMA_GENERATION],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let current = self.schema.entries();
        if persisted != current {
            generation += 1;
            let tx = self.conn.transaction()?;
            tx.execute("DELETE FROM attr_schema", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO attr_schema (object_type, name, class, kind, case_sensitive)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (object_type, spec) in &current {
                    stmt.execute(params![
                        object_type,
                        spec.name,
                        spec.class.to_string(),
                        spec.kind.to_string(),
                        spec.case_sensitive
                    ])?;
                }
            }
            tx.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![META_SCHEMA_GENERATION, generation],
            )?;
            tx.commit()?;
            tracing::info!(
                generation,
                attributes = current.len(),
                "attribute schema changed, objects re-index on next write"
            );
        }
        self.schema.set_generation(generation);
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn select<P: rusqlite::Params>(&self, clause: &str, params: P) -> IndexResult<Vec<Object>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {COLUMNS} FROM objects {clause}"))?;
        let rows = stmt.query_map(params, row_to_object)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn select_one<P: rusqlite::Params>(&self, clause: &str, params: P) -> IndexResult<Option<Object>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM objects {clause}"),
                params,
                row_to_object,
            )
            .optional()?)
    }

    /// Look up an object by identity. Unreachable objects are returned too.
    pub fn get(&self, key: &ObjectKey) -> IndexResult<Object> {
        self.try_get(key)?
            .ok_or_else(|| IndexError::not_found(key.to_string()))
    }

    pub fn try_get(&self, key: &ObjectKey) -> IndexResult<Option<Object>> {
        self.select_one("WHERE id = ?1 AND type = ?2", params![key.id, key.object_type])
    }

    /// Evaluate a query. An empty result is not an error.
    pub fn query(&self, query: &Query) -> IndexResult<Vec<Object>> {
        let compiled = QueryEngine::compile(&self.schema, query)?;
        self.execute(&compiled)
    }

    /// Evaluate an already compiled query.
    pub fn execute(&self, query: &CompiledQuery) -> IndexResult<Vec<Object>> {
        let generation = self.schema.generation();
        let candidates = match query.plan() {
            Plan::Dir { path } => match self.find_reachable_dir(path)? {
                Some(dir) => self.children_of(&dir.key)?,
                None => Vec::new(),
            },
            Plan::Children { parent } => self.select(
                "WHERE parent_type = ?1 AND parent_id = ?2 AND reachable = 1 ORDER BY id",
                params![parent.object_type, parent.id],
            )?,
            Plan::Indexed { attr, key } => self.select(
                "WHERE reachable = 1 AND (id IN (SELECT object_id FROM attr_index
                   WHERE attr = ?1 AND value = ?2) OR schema_gen < ?3) ORDER BY id",
                params![attr, key, generation],
            )?,
            Plan::Keyword { attr, token } => self.select(
                "WHERE reachable = 1 AND (id IN (SELECT object_id FROM keywords
                   WHERE attr = ?1 AND token = ?2) OR schema_gen < ?3) ORDER BY id",
                params![attr, token, generation],
            )?,
            Plan::Type(object_type) => self.select(
                "WHERE type = ?1 AND reachable = 1 ORDER BY id",
                [object_type],
            )?,
            Plan::Scan => self.select("WHERE reachable = 1 ORDER BY id", [])?,
        };
        Ok(candidates.into_iter().filter(|o| query.matches(o)).collect())
    }

    /// Reachable children, in the order recorded at the last directory scan.
    ///
    /// Errors with `NotFound` if the parent itself does not exist.
    pub fn children_of(&self, parent: &ObjectKey) -> IndexResult<Vec<Object>> {
        self.get(parent)?;
        self.select(
            "WHERE parent_type = ?1 AND parent_id = ?2 AND reachable = 1 ORDER BY scan_pos, id",
            params![parent.object_type, parent.id],
        )
    }

    /// Every child, reachable or not.
    pub fn all_children_of(&self, parent: &ObjectKey) -> IndexResult<Vec<Object>> {
        self.select(
            "WHERE parent_type = ?1 AND parent_id = ?2 ORDER BY scan_pos, id",
            params![parent.object_type, parent.id],
        )
    }

    pub fn find_by_path(&self, volume: &str, path: &Path) -> IndexResult<Option<Object>> {
        self.select_one("WHERE volume = ?1 AND path = ?2", params![volume, path_str(path)])
    }

    /// The reachable directory at `path`, on whichever volume is attached there.
    pub fn find_reachable_dir(&self, path: &Path) -> IndexResult<Option<Object>> {
        self.select_one(
            "WHERE path = ?1 AND reachable = 1 AND type = ?2 ORDER BY id LIMIT 1",
            params![path_str(path), trove_types::TYPE_DIR],
        )
    }

    /// The root object recorded for a volume, if it was ever attached.
    pub fn find_root(&self, volume: &str) -> IndexResult<Option<Object>> {
        self.select_one(
            "WHERE volume = ?1 AND parent_id IS NULL ORDER BY id LIMIT 1",
            [volume],
        )
    }

    /// Objects whose parent no longer exists.
    pub fn orphans(&self) -> IndexResult<Vec<ObjectKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.type, o.id FROM objects o
             WHERE o.parent_id IS NOT NULL AND NOT EXISTS (
                 SELECT 1 FROM objects p WHERE p.id = o.parent_id AND p.type = o.parent_type
             )
             ORDER BY o.id",
        )?;
        let rows = stmt.query_map([], |r| Ok(ObjectKey::new(r.get::<_, String>(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn object_count(&self) -> IndexResult<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create an object with a fresh id. A non-root object's parent must exist.
    pub fn insert(&mut self, new: NewObject) -> IndexResult<Object> {
        let tx = self.conn.transaction()?;
        if let Some(parent) = &new.parent {
            let exists: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM objects WHERE id = ?1 AND type = ?2)",
                params![parent.id, parent.object_type],
                |r| r.get(0),
            )?;
            if !exists {
                return Err(IndexError::not_found(format!("parent {parent}")));
            }
        }
        tx.execute(
            "INSERT INTO objects (type, parent_type, parent_id, path, volume, mtime,
                                  attributes, schema_gen, scan_pos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.object_type,
                new.parent.as_ref().map(|p| p.object_type.as_str()),
                new.parent.as_ref().map(|p| p.id),
                path_str(&new.path),
                new.volume,
                new.mtime,
                serde_json::to_string(&new.attributes)?,
                self.schema.generation(),
                new.scan_pos,
            ],
        )?;
        let id = tx.last_insert_rowid();
        write_index_rows(&tx, &self.schema, id, &new.object_type, &new.attributes)?;
        tx.commit()?;
        self.get(&ObjectKey::new(new.object_type, id))
    }

    /// Upsert by identity and bump the revision. Index rows are rewritten
    /// atomically with the object row.
    pub fn put(&mut self, object: &Object) -> IndexResult<Object> {
        let tx = self.conn.transaction()?;
        let existing_type: Option<String> = tx
            .query_row("SELECT type FROM objects WHERE id = ?1", [object.key.id], |r| r.get(0))
            .optional()?;
        if let Some(existing) = &existing_type
            && existing != &object.key.object_type
        {
            return Err(IndexError::invalid_request(format!(
                "id {} belongs to a `{existing}`, not a `{}`",
                object.key.id, object.key.object_type
            )));
        }
        tx.execute(
            "INSERT INTO objects (id, type, parent_type, parent_id, path, volume, mtime,
                                  state, reachable, attributes, schema_gen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 parent_type = excluded.parent_type,
                 parent_id = excluded.parent_id,
                 path = excluded.path,
                 volume = excluded.volume,
                 mtime = excluded.mtime,
                 revision = objects.revision + 1,
                 state = excluded.state,
                 reachable = excluded.reachable,
                 attributes = excluded.attributes,
                 schema_gen = excluded.schema_gen",
            params![
                object.key.id,
                object.key.object_type,
                object.parent.as_ref().map(|p| p.object_type.as_str()),
                object.parent.as_ref().map(|p| p.id),
                path_str(&object.path),
                object.volume.as_deref().unwrap_or(""),
                object.mtime,
                object.state.to_string(),
                object.reachable,
                serde_json::to_string(&object.attributes)?,
                self.schema.generation(),
            ],
        )?;
        write_index_rows(&tx, &self.schema, object.key.id, &object.key.object_type, &object.attributes)?;
        tx.commit()?;
        self.get(&object.key)
    }

    /// Record a parse outcome: new mtime and state, attributes untouched.
    pub fn set_mtime_and_state(
        &mut self,
        key: &ObjectKey,
        mtime: Option<i64>,
        state: ObjectState,
    ) -> IndexResult<Object> {
        let mut object = self.get(key)?;
        object.mtime = mtime;
        object.state = state;
        self.put(&object)
    }

    /// Record directory scan order. Not a content change: no revision bump.
    pub fn set_scan_pos(&mut self, key: &ObjectKey, scan_pos: i64) -> IndexResult<()> {
        self.conn.execute(
            "UPDATE objects SET scan_pos = ?1 WHERE id = ?2 AND type = ?3",
            params![scan_pos, key.id, key.object_type],
        )?;
        Ok(())
    }

    /// Delete one object and its index rows. Children are left in place
    /// (and become orphans).
    pub fn remove(&mut self, key: &ObjectKey) -> IndexResult<bool> {
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "DELETE FROM objects WHERE id = ?1 AND type = ?2",
            params![key.id, key.object_type],
        )?;
        tx.execute("DELETE FROM attr_index WHERE object_id = ?1", [key.id])?;
        tx.execute("DELETE FROM keywords WHERE object_id = ?1", [key.id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Delete an object and everything below its path on the same volume.
    /// Returns the removed identities.
    pub fn remove_subtree(&mut self, key: &ObjectKey) -> IndexResult<Vec<ObjectKey>> {
        let Some(root) = self.try_get(key)? else {
            return Ok(Vec::new());
        };
        let volume = root.volume.clone().unwrap_or_default();
        let root_path = path_str(&root.path);
        let tx = self.conn.transaction()?;
        let keys: Vec<ObjectKey> = {
            let mut stmt = tx.prepare(
                "SELECT type, id FROM objects
                 WHERE volume = ?1 AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
            )?;
            let rows = stmt.query_map(params![volume, root_path], |r| {
                Ok(ObjectKey::new(r.get::<_, String>(0)?, r.get(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        for k in &keys {
            tx.execute("DELETE FROM objects WHERE id = ?1", [k.id])?;
            tx.execute("DELETE FROM attr_index WHERE object_id = ?1", [k.id])?;
            tx.execute("DELETE FROM keywords WHERE object_id = ?1", [k.id])?;
        }
        tx.commit()?;
        Ok(keys)
    }

    /// Soft attach/detach: flip reachability of every object on a volume.
    pub fn mark_volume_reachable(&mut self, volume: &str, reachable: bool) -> IndexResult<usize> {
        Ok(self.conn.execute(
            "UPDATE objects SET reachable = ?1 WHERE volume = ?2",
            params![reachable, volume],
        )?)
    }

    /// Detach every volume. At startup nothing counts as mounted until its
    /// mountpoint is reported again.
    pub fn mark_all_unreachable(&mut self) -> IndexResult<usize> {
        Ok(self.conn.execute("UPDATE objects SET reachable = 0 WHERE reachable = 1", [])?)
    }

    /// Rewrite the path prefix of a volume's objects after it was re-attached
    /// somewhere else.
    pub fn relocate_volume(&mut self, volume: &str, old_root: &Path, new_root: &Path) -> IndexResult<usize> {
        let old = path_str(old_root);
        let new = path_str(new_root);
        if old == new {
            return Ok(0);
        }
        Ok(self.conn.execute(
            "UPDATE objects SET path = ?3 || substr(path, length(?2) + 1)
             WHERE volume = ?1 AND (path = ?2 OR substr(path, 1, length(?2) + 1) = ?2 || '/')",
            params![volume, old, new],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_types::{AttrClass, AttrValue, Predicate, ValueKind};

    fn store() -> ObjectStore {
        ObjectStore::in_memory(SchemaRegistry::builtin()).unwrap()
    }

    fn music_tree(store: &mut ObjectStore) -> (Object, Object, Object) {
        let root = store.insert(NewObject::new("dir", "/music", "vol1")).unwrap();
        let a = store
            .insert(NewObject::new("audio", "/music/A.mp3", "vol1").with_parent(root.key.clone()).at_position(1))
            .unwrap();
        let b = store
            .insert(NewObject::new("audio", "/music/B.mp3", "vol1").with_parent(root.key.clone()).at_position(0))
            .unwrap();
        (root, a, b)
    }

    #[test]
    fn get_requires_matching_type() {
        let mut store = store();
        let (root, a, _) = music_tree(&mut store);
        assert_eq!(store.get(&a.key).unwrap().path, PathBuf::from("/music/A.mp3"));
        assert_eq!(a.parent, Some(root.key.clone()));
        assert_eq!(a.revision, 1);
        assert!(matches!(
            store.get(&ObjectKey::new("file", a.key.id)),
            Err(IndexError::NotFound(_))
        ));
    }

    #[test]
    fn insert_requires_existing_parent() {
        let mut store = store();
        let err = store
            .insert(NewObject::new("audio", "/x.mp3", "v").with_parent(ObjectKey::new("dir", 99)))
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[test]
    fn put_bumps_revision_and_reindexes() {
        let mut store = store();
        let (_, mut a, _) = music_tree(&mut store);
        a.attributes.insert("artist".into(), "Foo".into());
        let a = store.put(&a).unwrap();
        assert_eq!(a.revision, 2);

        let foo = Query::new([Predicate::eq("type", "audio"), Predicate::eq("artist", "foo")]);
        assert_eq!(store.query(&foo).unwrap().len(), 1);

        let mut a = a;
        a.attributes.insert("artist".into(), "Bar".into());
        store.put(&a).unwrap();
        assert!(store.query(&foo).unwrap().is_empty());
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let mut store = store();
        music_tree(&mut store);
        let q = Query::new([Predicate::eq("type", "audio"), Predicate::eq("artist", "Foo")]);
        assert!(store.query(&q).unwrap().is_empty());
    }

    #[test]
    fn unsearchable_attr_fails_even_with_data() {
        let mut store = store();
        let (_, mut a, _) = music_tree(&mut store);
        a.attributes.insert("bitrate".into(), AttrValue::Int(320));
        store.put(&a).unwrap();
        let q = Query::new([Predicate::eq("type", "audio"), Predicate::eq("bitrate", 320)]);
        assert!(matches!(store.query(&q), Err(IndexError::InvalidPredicate(_))));
    }

    #[test]
    fn children_follow_scan_order_and_queries_follow_insertion() {
        let mut store = store();
        let (root, a, b) = music_tree(&mut store);
        let children: Vec<_> = store.children_of(&root.key).unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(children, vec![b.key.clone(), a.key.clone()]);

        let anchored = store.query(&Query::dirname("/music")).unwrap();
        assert_eq!(anchored[0].key, b.key);

        let all_audio = store.query(&Query::new([Predicate::eq("type", "audio")])).unwrap();
        assert_eq!(all_audio[0].key, a.key);
    }

    #[test]
    fn orphans_are_detected_but_still_gettable() {
        let mut store = store();
        let (root, a, _) = music_tree(&mut store);
        assert!(store.orphans().unwrap().is_empty());
        store.remove(&root.key).unwrap();

        assert_eq!(store.orphans().unwrap().len(), 2);
        assert!(store.get(&a.key).is_ok());
        assert!(matches!(store.children_of(&root.key), Err(IndexError::NotFound(_))));
    }

    #[test]
    fn unreachable_objects_leave_queries_but_not_lookups() {
        let mut store = store();
        let (_, a, _) = music_tree(&mut store);
        assert_eq!(store.mark_volume_reachable("vol1", false).unwrap(), 3);
        assert!(store.query(&Query::new([Predicate::eq("type", "audio")])).unwrap().is_empty());
        assert!(store.query(&Query::dirname("/music")).unwrap().is_empty());
        assert!(!store.get(&a.key).unwrap().reachable);

        store.mark_volume_reachable("vol1", true).unwrap();
        assert_eq!(store.query(&Query::dirname("/music")).unwrap().len(), 2);

        assert_eq!(store.mark_all_unreachable().unwrap(), 3);
        assert_eq!(store.mark_all_unreachable().unwrap(), 0);
    }

    #[test]
    fn relocate_rewrites_prefix_only() {
        let mut store = store();
        let (root, a, _) = music_tree(&mut store);
        store.insert(NewObject::new("dir", "/musical", "vol1")).unwrap();

        assert_eq!(store.relocate_volume("vol1", Path::new("/music"), Path::new("/media/usb")).unwrap(), 3);
        assert_eq!(store.get(&root.key).unwrap().path, PathBuf::from("/media/usb"));
        assert_eq!(store.get(&a.key).unwrap().path, PathBuf::from("/media/usb/A.mp3"));
        assert!(store.find_by_path("vol1", Path::new("/musical")).unwrap().is_some());
    }

    #[test]
    fn remove_subtree_stays_within_volume_and_prefix() {
        let mut store = store();
        let (root, _, _) = music_tree(&mut store);
        let other = store.insert(NewObject::new("dir", "/music", "vol2")).unwrap();
        let removed = store.remove_subtree(&root.key).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(store.object_count().unwrap(), 1);
        assert!(store.get(&other.key).is_ok());
    }

    #[test]
    fn schema_change_reindexes_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("index.db");

        let key = {
            let mut store = ObjectStore::open(&db, SchemaRegistry::builtin()).unwrap();
            let mut obj = store.insert(NewObject::new("audio", "/m/a.mp3", "v")).unwrap();
            obj.attributes.insert("composer".into(), "Bach".into());
            store.put(&obj).unwrap().key
        };

        let mut schema = SchemaRegistry::builtin();
        schema
            .declare("audio", AttrSpec::new("composer", AttrClass::Indexed, ValueKind::Text))
            .unwrap();
        let mut store = ObjectStore::open(&db, schema.clone()).unwrap();
        let first_generation = store.schema().generation();

        let q = Query::new([Predicate::eq("type", "audio"), Predicate::eq("composer", "Bach")]);
        assert_eq!(store.query(&q).unwrap()[0].key, key, "found before re-index");

        let obj = store.get(&key).unwrap();
        store.put(&obj).unwrap();
        assert_eq!(store.query(&q).unwrap().len(), 1, "found through the index after re-index");

        drop(store);
        let store = ObjectStore::open(&db, schema).unwrap();
        assert_eq!(store.schema().generation(), first_generation, "unchanged schema keeps generation");
    }

    #[test]
    fn corrupt_state_column_is_an_error() {
        let mut store = store();
        let (_, a, _) = music_tree(&mut store);
        store
            .conn
            .execute("UPDATE objects SET state = 'sideways' WHERE id = ?1", [a.key.id])
            .unwrap();
        assert!(matches!(store.get(&a.key), Err(IndexError::Db(_))));
    }
}
