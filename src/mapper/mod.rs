//! Persistence Mapper
//!
//! Stores [`Node`] trees in a single generic table of
//! `(id, parent_id, name, classname, value)` rows. A node's `name` encodes
//! the chain of its owners' ids, so a whole owned subtree is fetched with
//! one prefix query.
//!
//! The store assumes a single writer. `commit` flushes every pending write
//! of the store, not only the subtree that was last touched.

pub mod sqlite;

pub use sqlite::{SqliteDb, SqliteMapper};

use crate::error::MapperError;
use crate::object::{Node, ObjectId};

/// Equality filters for top-level selects, combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub parent_id: Option<ObjectId>,
    pub roots_only: bool,
    pub name: Option<String>,
    pub class_name: Option<String>,
    pub value: Option<String>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parent_id(mut self, parent_id: ObjectId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Only objects without an owner.
    pub fn roots(mut self) -> Self {
        self.roots_only = true;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Durable store for node trees.
pub trait Mapper {
    /// Inserts a new root tree, assigning ids to every storable node.
    fn insert(&mut self, node: &mut Node) -> Result<ObjectId, MapperError>;

    /// Inserts `node` as the `key` field of an already stored `parent`.
    fn insert_child(
        &mut self,
        parent: &Node,
        key: &str,
        node: &mut Node,
    ) -> Result<ObjectId, MapperError>;

    /// Rewrites a stored tree in place, inserting children that have no id yet.
    fn update(&mut self, node: &mut Node) -> Result<(), MapperError>;

    /// Inserts when `node` was never stored, updates otherwise.
    fn store(&mut self, node: &mut Node) -> Result<ObjectId, MapperError> {
        match node.id() {
            Some(id) => {
                self.update(node)?;
                Ok(id)
            }
            None => self.insert(node),
        }
    }

    /// Loads the tree rooted at `id`, resolving pointers.
    fn get(&self, id: ObjectId) -> Result<Node, MapperError>;

    /// Loads every object matching `criteria`.
    fn select(&self, criteria: &Criteria) -> Result<Vec<Node>, MapperError>;

    /// Loads every root object.
    fn get_all(&self) -> Result<Vec<Node>, MapperError> {
        self.select(&Criteria::new().roots())
    }

    /// Deletes a stored node and its owned subtree. Pointer targets are kept.
    fn delete(&mut self, node: &Node) -> Result<(), MapperError>;

    /// Makes every pending write durable.
    fn commit(&mut self) -> Result<(), MapperError>;
}

/// Field keys become segments of dotted names.
pub fn validate_key(key: &str) -> Result<(), MapperError> {
    if key.is_empty() || key.contains('.') {
        return Err(MapperError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Checks every storable key of a tree before anything is written.
pub(crate) fn validate_tree(node: &Node) -> Result<(), MapperError> {
    for (key, child) in node.storable_fields() {
        validate_key(key)?;
        validate_tree(child)?;
    }
    Ok(())
}

/// Prefix shared by the names of every node owned by `node`.
///
/// Roots use their own id; owned nodes replace the last segment of their
/// name (the key under their owner) with their id.
pub fn name_prefix(node: &Node) -> Result<String, MapperError> {
    let id = node
        .id()
        .ok_or_else(|| MapperError::NotStored(node.class_name().to_string()))?;

    if node.parent_id().is_none() {
        return Ok(id.to_string());
    }

    match node.name().rfind('.') {
        Some(dot) => Ok(format!("{}.{}", &node.name()[..dot], id)),
        None => Ok(id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criteria_builder() {
        let criteria = Criteria::new().class_name("Protocol").roots();
        assert_eq!(criteria.class_name.as_deref(), Some("Protocol"));
        assert!(criteria.roots_only);
        assert!(criteria.parent_id.is_none());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("outputSet").is_ok());
        assert!(validate_key("__item__000001").is_ok());
        assert!(matches!(validate_key("set.v2"), Err(MapperError::InvalidKey(k)) if k == "set.v2"));
        assert!(matches!(validate_key(""), Err(MapperError::InvalidKey(_))));
    }

    #[test]
    fn test_validate_tree_skips_non_storable() {
        let mut cache = Node::integer(1);
        cache.set_storable(false);
        let node = Node::new("Object")
            .with_field("ok", Node::integer(1))
            .with_field("tmp.cache", cache);
        assert!(validate_tree(&node).is_ok());

        let nested = Node::new("Object")
            .with_field("outputs", Node::new("Object").with_field("set.v2", Node::integer(7)));
        assert!(matches!(validate_tree(&nested), Err(MapperError::InvalidKey(_))));
    }

    #[test]
    fn test_name_prefix_requires_id() {
        let node = Node::new("Object");
        assert!(matches!(name_prefix(&node), Err(MapperError::NotStored(_))));
    }

    #[test]
    fn test_name_prefix_for_root_and_child() {
        let mut root = Node::new("Object").with_name("my.protocol");
        root.assign_id(4);
        assert_eq!(name_prefix(&root).unwrap(), "4");

        let mut child = Node::integer(1);
        child.fill_meta(9, Some(4), "4.steps".to_string(), None);
        assert_eq!(name_prefix(&child).unwrap(), "4.9");

        let mut grandchild = Node::integer(1);
        grandchild.fill_meta(11, Some(9), "4.9.__item__000001".to_string(), None);
        assert_eq!(name_prefix(&grandchild).unwrap(), "4.9.11");
    }
}
