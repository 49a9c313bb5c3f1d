//! SQLite Object Store
//!
//! [`SqliteDb`] owns the connection and the raw row operations on the
//! `Objects` table; [`SqliteMapper`] turns rows into [`Node`] trees and
//! back.
//!
//! Writes open a transaction lazily; nothing is durable until
//! [`Mapper::commit`] runs. Dropping the mapper discards pending writes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::MapperError;
use crate::object::{ClassRegistry, Node, ObjectId};

use super::{name_prefix, validate_key, validate_tree, Criteria, Mapper};

const SELECT: &str = "SELECT id, parent_id, name, classname, value FROM Objects WHERE ";

/// Time a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of the `Objects` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRow {
    pub id: ObjectId,
    pub parent_id: Option<ObjectId>,
    pub name: Option<String>,
    pub class_name: String,
    pub value: Option<String>,
}

impl ObjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            name: row.get(2)?,
            class_name: row.get(3)?,
            value: row.get(4)?,
        })
    }
}

/// Connection plus the raw statements on the `Objects` table.
#[derive(Debug)]
pub struct SqliteDb {
    conn: Connection,
}

impl SqliteDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MapperError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MapperError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, MapperError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self { conn };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), MapperError> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS Objects (
              id        INTEGER PRIMARY KEY AUTOINCREMENT,
              parent_id INTEGER REFERENCES Objects(id),
              name      TEXT,
              classname TEXT,
              value     TEXT DEFAULT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_objects_parent ON Objects(parent_id);
            "#,
        )?;
        Ok(())
    }

    /// Opens a transaction unless one is already pending.
    fn begin(&self) -> Result<(), MapperError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<(), MapperError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Inserts one row and returns its id.
    pub fn insert_object(
        &self,
        name: &str,
        class_name: &str,
        value: Option<&str>,
        parent_id: Option<ObjectId>,
    ) -> Result<ObjectId, MapperError> {
        self.begin()?;
        self.conn.execute(
            "INSERT INTO Objects (parent_id, name, classname, value) VALUES (?1, ?2, ?3, ?4)",
            params![parent_id, name, class_name, value],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_object(
        &self,
        id: ObjectId,
        name: &str,
        class_name: &str,
        value: Option<&str>,
        parent_id: Option<ObjectId>,
    ) -> Result<(), MapperError> {
        self.begin()?;
        let changed = self.conn.execute(
            "UPDATE Objects SET parent_id = ?1, name = ?2, classname = ?3, value = ?4 WHERE id = ?5",
            params![parent_id, name, class_name, value, id],
        )?;
        if changed == 0 {
            return Err(MapperError::NotFound(id));
        }
        Ok(())
    }

    pub fn delete_object(&self, id: ObjectId) -> Result<(), MapperError> {
        self.begin()?;
        self.conn
            .execute("DELETE FROM Objects WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Deletes every row whose name starts with `<prefix>.`.
    pub fn delete_descendants(&self, prefix: &str) -> Result<usize, MapperError> {
        self.begin()?;
        let deleted = self.conn.execute(
            "DELETE FROM Objects WHERE parent_id IS NOT NULL AND name LIKE ?1",
            params![format!("{}.%", prefix)],
        )?;
        Ok(deleted)
    }

    pub fn select_object_by_id(&self, id: ObjectId) -> Result<Option<ObjectRow>, MapperError> {
        let row = self
            .conn
            .query_row(&format!("{SELECT}id = ?1"), params![id], ObjectRow::from_row)
            .optional()?;
        Ok(row)
    }

    /// Rows owned by `parent_id`, or roots when `None`.
    pub fn select_objects_by_parent(
        &self,
        parent_id: Option<ObjectId>,
    ) -> Result<Vec<ObjectRow>, MapperError> {
        match parent_id {
            Some(id) => self.query(
                &format!("{SELECT}parent_id = ?1 ORDER BY id"),
                vec![SqlValue::Integer(id)],
            ),
            None => self.query(&format!("{SELECT}parent_id IS NULL ORDER BY id"), Vec::new()),
        }
    }

    /// Every row of the subtree below `prefix`, owners first.
    pub fn select_objects_by_ancestor(&self, prefix: &str) -> Result<Vec<ObjectRow>, MapperError> {
        self.query(
            &format!("{SELECT}parent_id IS NOT NULL AND name LIKE ?1 ORDER BY id"),
            vec![SqlValue::Text(format!("{}.%", prefix))],
        )
    }

    pub fn select_objects_by(&self, criteria: &Criteria) -> Result<Vec<ObjectRow>, MapperError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if criteria.roots_only {
            clauses.push("parent_id IS NULL".to_string());
        }
        if let Some(parent_id) = criteria.parent_id {
            values.push(SqlValue::Integer(parent_id));
            clauses.push(format!("parent_id = ?{}", values.len()));
        }
        if let Some(name) = &criteria.name {
            values.push(SqlValue::Text(name.clone()));
            clauses.push(format!("name = ?{}", values.len()));
        }
        if let Some(class_name) = &criteria.class_name {
            values.push(SqlValue::Text(class_name.clone()));
            clauses.push(format!("classname = ?{}", values.len()));
        }
        if let Some(value) = &criteria.value {
            values.push(SqlValue::Text(value.clone()));
            clauses.push(format!("value = ?{}", values.len()));
        }

        let where_str = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        self.query(&format!("{SELECT}{where_str} ORDER BY id"), values)
    }

    pub fn count_objects(&self) -> Result<i64, MapperError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM Objects", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query(&self, sql: &str, values: Vec<SqlValue>) -> Result<Vec<ObjectRow>, MapperError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), ObjectRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// [`Mapper`] backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteMapper {
    db: SqliteDb,
    registry: ClassRegistry,
}

impl SqliteMapper {
    pub fn open(path: impl AsRef<Path>, registry: ClassRegistry) -> Result<Self, MapperError> {
        let path = path.as_ref();
        debug!("Opening object store: {}", path.display());
        Ok(Self {
            db: SqliteDb::open(path)?,
            registry,
        })
    }

    pub fn open_in_memory(registry: ClassRegistry) -> Result<Self, MapperError> {
        Ok(Self {
            db: SqliteDb::open_in_memory()?,
            registry,
        })
    }

    pub fn db(&self) -> &SqliteDb {
        &self.db
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClassRegistry {
        &mut self.registry
    }

    fn insert_tree(
        &mut self,
        node: &mut Node,
        parent_prefix: Option<&str>,
    ) -> Result<ObjectId, MapperError> {
        if let Some(id) = node.id() {
            return Err(MapperError::AlreadyStored(id));
        }

        let id = self.db.insert_object(
            node.name(),
            node.class_name(),
            node.value(),
            node.parent_id(),
        )?;
        node.assign_id(id);

        let prefix = match parent_prefix {
            Some(p) => format!("{}.{}", p, id),
            None => id.to_string(),
        };
        self.insert_children(node, &prefix)?;
        Ok(id)
    }

    fn insert_children(&mut self, node: &mut Node, prefix: &str) -> Result<(), MapperError> {
        let owner_id = node.id();
        for (key, child) in node.storable_fields_mut() {
            child.set_name(format!("{}.{}", prefix, key));
            child.set_parent_id(owner_id);
            self.insert_tree(child, Some(prefix))?;
        }
        Ok(())
    }

    fn update_tree(&mut self, node: &mut Node) -> Result<(), MapperError> {
        let id = node
            .id()
            .ok_or_else(|| MapperError::NotStored(node.class_name().to_string()))?;
        self.db.update_object(
            id,
            node.name(),
            node.class_name(),
            node.value(),
            node.parent_id(),
        )?;

        let prefix = name_prefix(node)?;
        for (key, child) in node.storable_fields_mut() {
            if child.id().is_none() {
                child.set_name(format!("{}.{}", prefix, key));
                child.set_parent_id(Some(id));
                self.insert_tree(child, Some(&prefix))?;
            } else {
                self.update_tree(child)?;
            }
        }
        Ok(())
    }

    fn load(&self, id: ObjectId, visiting: &mut HashSet<ObjectId>) -> Result<Node, MapperError> {
        let row = self
            .db
            .select_object_by_id(id)?
            .ok_or(MapperError::NotFound(id))?;
        self.hydrate(row, visiting)
    }

    fn hydrate(&self, row: ObjectRow, visiting: &mut HashSet<ObjectId>) -> Result<Node, MapperError> {
        let id = row.id;
        visiting.insert(id);

        let mut node = self.registry.build(&row.class_name)?;
        self.fill_row(&mut node, row, visiting)?;
        self.fill_children(&mut node, visiting)?;

        visiting.remove(&id);
        Ok(node)
    }

    fn fill_row(
        &self,
        node: &mut Node,
        row: ObjectRow,
        visiting: &mut HashSet<ObjectId>,
    ) -> Result<(), MapperError> {
        node.fill_meta(row.id, row.parent_id, row.name.unwrap_or_default(), row.value);

        let Some(target_id) = node.target_id() else {
            return Ok(());
        };
        if visiting.contains(&target_id) {
            debug!("Pointer {} -> {} left unresolved (already loading)", row.id, target_id);
            return Ok(());
        }
        match self.load(target_id, visiting) {
            Ok(target) => node.set_target(target),
            Err(MapperError::NotFound(missing)) => {
                warn!("Pointer {} references missing object {}", row.id, missing);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Rebuilds the owned subtree of `root` from one prefix query.
    fn fill_children(&self, root: &mut Node, visiting: &mut HashSet<ObjectId>) -> Result<(), MapperError> {
        let root_id = root
            .id()
            .ok_or_else(|| MapperError::NotStored(root.class_name().to_string()))?;
        let prefix = name_prefix(root)?;
        let rows = self.db.select_objects_by_ancestor(&prefix)?;

        // Key path from the root for every node materialized so far.
        let mut paths: HashMap<ObjectId, Vec<String>> = HashMap::new();
        paths.insert(root_id, Vec::new());

        for row in rows {
            let name = row.name.clone().unwrap_or_default();
            let mut parts = name.rsplitn(3, '.');
            let key = parts.next().unwrap_or_default().to_string();
            let owner_id: ObjectId = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| {
                    MapperError::Corruption(format!("object {} has malformed name '{}'", row.id, name))
                })?;

            if row.parent_id != Some(owner_id) {
                return Err(MapperError::Corruption(format!(
                    "object {} is named under {} but owned by {:?}",
                    row.id, owner_id, row.parent_id
                )));
            }

            let owner_path = paths.get(&owner_id).cloned().ok_or_else(|| {
                MapperError::Corruption(format!(
                    "object {} visited before its owner {}",
                    row.id, owner_id
                ))
            })?;

            let child_id = row.id;
            let mut child = self.registry.build(&row.class_name)?;
            self.fill_row(&mut child, row, visiting)?;

            let owner = root.descend_mut(&owner_path).ok_or_else(|| {
                MapperError::Corruption(format!("owner {} lost while loading {}", owner_id, child_id))
            })?;
            if owner.has_field(&key) {
                return Err(MapperError::Corruption(format!(
                    "object {} duplicates key '{}' under {}",
                    child_id, key, owner_id
                )));
            }
            owner.set_field(key.clone(), child);

            let mut child_path = owner_path;
            child_path.push(key);
            paths.insert(child_id, child_path);
        }
        Ok(())
    }

    fn objects_from_rows(&self, rows: Vec<ObjectRow>) -> Result<Vec<Node>, MapperError> {
        rows.into_iter()
            .map(|row| self.hydrate(row, &mut HashSet::new()))
            .collect()
    }
}

impl Mapper for SqliteMapper {
    fn insert(&mut self, node: &mut Node) -> Result<ObjectId, MapperError> {
        validate_tree(node)?;
        let id = self.insert_tree(node, None)?;
        debug!("Inserted {} with id {}", node.class_name(), id);
        Ok(id)
    }

    fn insert_child(
        &mut self,
        parent: &Node,
        key: &str,
        node: &mut Node,
    ) -> Result<ObjectId, MapperError> {
        validate_key(key)?;
        validate_tree(node)?;
        let prefix = name_prefix(parent)?;
        node.set_name(format!("{}.{}", prefix, key));
        node.set_parent_id(parent.id());
        self.insert_tree(node, Some(&prefix))
    }

    fn update(&mut self, node: &mut Node) -> Result<(), MapperError> {
        if node.id().is_none() {
            self.insert(node)?;
            return Ok(());
        }
        validate_tree(node)?;
        self.update_tree(node)
    }

    fn get(&self, id: ObjectId) -> Result<Node, MapperError> {
        self.load(id, &mut HashSet::new())
    }

    fn select(&self, criteria: &Criteria) -> Result<Vec<Node>, MapperError> {
        let rows = self.db.select_objects_by(criteria)?;
        self.objects_from_rows(rows)
    }

    fn get_all(&self) -> Result<Vec<Node>, MapperError> {
        let rows = self.db.select_objects_by_parent(None)?;
        self.objects_from_rows(rows)
    }

    fn delete(&mut self, node: &Node) -> Result<(), MapperError> {
        let id = node
            .id()
            .ok_or_else(|| MapperError::NotStored(node.class_name().to_string()))?;
        let prefix = name_prefix(node)?;
        let removed = self.db.delete_descendants(&prefix)?;
        self.db.delete_object(id)?;
        debug!("Deleted object {} and {} owned rows", id, removed);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), MapperError> {
        self.db.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{BuiltinClass, ClassKind};
    use tempfile::tempdir;

    fn registry() -> ClassRegistry {
        let mut registry = ClassRegistry::new();
        registry.register("Microscope", ClassKind::Composite);
        registry.register("SetOfMicrographs", ClassKind::Composite);
        registry
    }

    fn micrograph_set() -> Node {
        let mut files = Node::list();
        files.push_item(Node::string("mic1.mrc"));
        files.push_item(Node::string("mic2.mrc"));

        Node::new("SetOfMicrographs")
            .with_field("samplingRate", Node::float(1.237))
            .with_field("tiltPairs", Node::boolean(false))
            .with_field(
                "microscope",
                Node::new("Microscope")
                    .with_field("voltage", Node::integer(300))
                    .with_field("sphericalAberration", Node::float(2.26)),
            )
            .with_field("files", files)
    }

    #[test]
    fn test_insert_assigns_ids_and_names() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut set = micrograph_set();
        let id = mapper.insert(&mut set).unwrap();

        assert_eq!(set.id(), Some(id));
        let voltage = set.field("microscope").and_then(|m| m.field("voltage")).unwrap();
        let microscope_id = set.field("microscope").and_then(Node::id).unwrap();
        assert_eq!(voltage.parent_id(), Some(microscope_id));
        assert_eq!(voltage.name(), format!("{}.{}.voltage", id, microscope_id));
    }

    #[test]
    fn test_graph_round_trip_with_pointer() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();

        let mut dataset = micrograph_set();
        let dataset_id = mapper.insert(&mut dataset).unwrap();

        let mut owner = Node::new("Object")
            .with_field("label", Node::string("preprocess"))
            .with_field("input", Node::pointer_to(&dataset))
            .with_field(
                "options",
                Node::new("Object").with_field("downFactor", Node::integer(2)),
            );
        let owner_id = mapper.insert(&mut owner).unwrap();
        mapper.commit().unwrap();

        let rows_before = mapper.db().count_objects().unwrap();

        let loaded = mapper.get(owner_id).unwrap();
        assert_eq!(loaded.class_name(), "Object");
        assert_eq!(loaded.field("label").and_then(Node::as_str), Some("preprocess"));
        let options = loaded.field("options").unwrap();
        assert_eq!(options.class_name(), "Object");
        assert_eq!(options.field("downFactor").and_then(Node::as_i64), Some(2));

        let pointer = loaded.field("input").unwrap();
        assert!(pointer.is_pointer());
        assert_eq!(pointer.target_id(), Some(dataset_id));
        let target = pointer.target().unwrap();
        assert!(!target.is_storable());
        assert_eq!(target.class_name(), "SetOfMicrographs");
        assert_eq!(
            target.field("microscope").and_then(|m| m.field("voltage")).and_then(Node::as_i64),
            Some(300)
        );
        let files: Vec<&str> = target
            .field("files")
            .unwrap()
            .items()
            .filter_map(Node::as_str)
            .collect();
        assert_eq!(files, vec!["mic1.mrc", "mic2.mrc"]);

        // Re-saving the owner must not duplicate the referenced tree.
        let mut loaded = loaded;
        mapper.update(&mut loaded).unwrap();
        mapper.commit().unwrap();
        assert_eq!(mapper.db().count_objects().unwrap(), rows_before);

        // Deleting the owner leaves the referenced tree intact.
        mapper.delete(&loaded).unwrap();
        mapper.commit().unwrap();
        assert!(matches!(mapper.get(owner_id), Err(MapperError::NotFound(_))));
        let dataset = mapper.get(dataset_id).unwrap();
        assert_eq!(dataset.field("samplingRate").and_then(Node::as_f64), Some(1.237));
    }

    #[test]
    fn test_update_inserts_new_children_and_rewrites_values() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut set = micrograph_set();
        let id = mapper.insert(&mut set).unwrap();

        set.field_mut("samplingRate").unwrap().set_float(2.474);
        set.field_mut("files").unwrap().push_item(Node::string("mic3.mrc"));
        set.set_field("comment", Node::string("downsampled"));
        mapper.update(&mut set).unwrap();
        mapper.commit().unwrap();

        let loaded = mapper.get(id).unwrap();
        assert_eq!(loaded.field("samplingRate").and_then(Node::as_f64), Some(2.474));
        assert_eq!(loaded.field("files").unwrap().len_items(), 3);
        assert_eq!(loaded.field("comment").and_then(Node::as_str), Some("downsampled"));
    }

    #[test]
    fn test_insert_child_under_stored_parent() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object").with_field("steps", Node::list());
        let root_id = mapper.insert(&mut root).unwrap();

        let list = root.field("steps").unwrap().clone();
        let mut item = Node::new("Object").with_field("status", Node::string("finished"));
        mapper.insert_child(&list, "__item__000001", &mut item).unwrap();

        let loaded = mapper.get(root_id).unwrap();
        let items: Vec<&Node> = loaded.field("steps").unwrap().items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].field("status").and_then(Node::as_str), Some("finished"));
    }

    #[test]
    fn test_insert_twice_is_rejected() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut node = Node::integer(1);
        mapper.insert(&mut node).unwrap();
        assert!(matches!(mapper.insert(&mut node), Err(MapperError::AlreadyStored(_))));
    }

    #[test]
    fn test_get_unknown_id() {
        let mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        assert!(matches!(mapper.get(42), Err(MapperError::NotFound(42))));
    }

    #[test]
    fn test_get_unregistered_class() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("objects.sqlite");

        let id = {
            let mut mapper = SqliteMapper::open(&db_path, registry()).unwrap();
            let id = mapper.insert(&mut micrograph_set()).unwrap();
            mapper.commit().unwrap();
            id
        };

        let mapper = SqliteMapper::open(&db_path, ClassRegistry::new()).unwrap();
        assert!(matches!(
            mapper.get(id),
            Err(MapperError::ClassNotFound(name)) if name == "SetOfMicrographs"
        ));
    }

    #[test]
    fn test_broken_id_chain_is_corruption() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object").with_field("a", Node::integer(1));
        let root_id = mapper.insert(&mut root).unwrap();
        let mut other = Node::new("Object");
        let other_id = mapper.insert(&mut other).unwrap();

        // Named inside root's subtree but owned by an object outside it.
        mapper
            .db()
            .insert_object(
                &format!("{}.{}.x", root_id, other_id),
                BuiltinClass::Integer.as_str(),
                Some("5"),
                Some(other_id),
            )
            .unwrap();

        assert!(matches!(mapper.get(root_id), Err(MapperError::Corruption(_))));
    }

    #[test]
    fn test_name_and_owner_mismatch_is_corruption() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object").with_field("a", Node::integer(1));
        let root_id = mapper.insert(&mut root).unwrap();

        mapper
            .db()
            .insert_object(&format!("{}.777.x", root_id), "Integer", Some("5"), Some(root_id))
            .unwrap();

        assert!(matches!(mapper.get(root_id), Err(MapperError::Corruption(_))));
    }

    #[test]
    fn test_duplicate_key_under_owner_is_corruption() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object").with_field("a", Node::integer(1));
        let root_id = mapper.insert(&mut root).unwrap();

        // Second row claiming the same (owner, key) slot.
        mapper
            .db()
            .insert_object(&format!("{}.a", root_id), "Integer", Some("9"), Some(root_id))
            .unwrap();
        mapper.commit().unwrap();

        let result = mapper.get(root_id);
        assert!(matches!(result, Err(MapperError::Corruption(msg)) if msg.contains("'a'")));
    }

    #[test]
    fn test_dotted_key_is_rejected_before_writing() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object")
            .with_field("label", Node::string("run"))
            .with_field("outputs", Node::new("Object").with_field("set.v2", Node::integer(7)));

        let result = mapper.insert(&mut root);
        assert!(matches!(result, Err(MapperError::InvalidKey(k)) if k == "set.v2"));
        assert!(root.id().is_none());
        assert_eq!(mapper.db().count_objects().unwrap(), 0);
    }

    #[test]
    fn test_dotted_key_rejected_on_update_and_insert_child() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut root = Node::new("Object").with_field("outputs", Node::new("Object"));
        let root_id = mapper.insert(&mut root).unwrap();
        mapper.commit().unwrap();
        let rows = mapper.db().count_objects().unwrap();

        root.field_mut("outputs")
            .unwrap()
            .set_field("set.v2", Node::integer(7));
        assert!(matches!(mapper.update(&mut root), Err(MapperError::InvalidKey(_))));

        let holder = root.field("outputs").unwrap().clone();
        let mut child = Node::integer(3);
        assert!(matches!(
            mapper.insert_child(&holder, "a.b", &mut child),
            Err(MapperError::InvalidKey(_))
        ));

        assert_eq!(mapper.db().count_objects().unwrap(), rows);
        root.field_mut("outputs").unwrap().remove_field("set.v2");
        assert!(mapper.get(root_id).is_ok());
    }

    #[test]
    fn test_select_and_get_all() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        mapper.insert(&mut micrograph_set()).unwrap();
        mapper.insert(&mut micrograph_set()).unwrap();
        mapper.insert(&mut Node::new("Object")).unwrap();

        let roots = mapper.get_all().unwrap();
        assert_eq!(roots.len(), 3);

        let sets = mapper
            .select(&Criteria::new().class_name("SetOfMicrographs"))
            .unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|s| s.field("microscope").is_some()));

        let voltages = mapper
            .select(&Criteria::new().class_name("Integer").value("300"))
            .unwrap();
        assert_eq!(voltages.len(), 2);
        assert!(voltages.iter().all(|v| v.parent_id().is_some()));
    }

    #[test]
    fn test_delete_removes_owned_subtree() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut set = micrograph_set();
        mapper.insert(&mut set).unwrap();
        let mut keep = Node::new("Object").with_field("x", Node::integer(1));
        mapper.insert(&mut keep).unwrap();
        let kept_rows = 2;

        mapper.delete(&set).unwrap();
        mapper.commit().unwrap();

        assert_eq!(mapper.db().count_objects().unwrap(), kept_rows);
    }

    #[test]
    fn test_uncommitted_writes_are_lost() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("objects.sqlite");

        let (kept, lost) = {
            let mut mapper = SqliteMapper::open(&db_path, registry()).unwrap();
            let kept = mapper.insert(&mut Node::string("kept")).unwrap();
            mapper.commit().unwrap();
            let lost = mapper.insert(&mut Node::string("lost")).unwrap();
            assert!(mapper.db().has_pending_writes());
            (kept, lost)
        };

        let mapper = SqliteMapper::open(&db_path, registry()).unwrap();
        assert_eq!(mapper.get(kept).unwrap().as_str(), Some("kept"));
        assert!(matches!(mapper.get(lost), Err(MapperError::NotFound(_))));
    }

    #[test]
    fn test_non_storable_fields_are_skipped() {
        let mut mapper = SqliteMapper::open_in_memory(registry()).unwrap();
        let mut cache = Node::string("transient");
        cache.set_storable(false);
        let mut node = Node::new("Object")
            .with_field("kept", Node::integer(1))
            .with_field("cache", cache);
        let id = mapper.insert(&mut node).unwrap();

        let loaded = mapper.get(id).unwrap();
        assert!(loaded.field("kept").is_some());
        assert!(loaded.field("cache").is_none());
    }
}
