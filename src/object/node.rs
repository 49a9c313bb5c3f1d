//! Persisted Object Tree
//!
//! A [`Node`] is the unit of persistence. Composite nodes own their
//! children as an ordered list of named fields; the order is fixed by the
//! builder calls made at construction and is also the storage order.
//!
//! Pointer nodes do not own anything: their value is the id of an
//! independently stored node. A resolved copy of that node may be attached
//! for convenience, but it is always marked non-storable.

use super::registry::BuiltinClass;

/// Identifier assigned by the store on first insert.
pub type ObjectId = i64;

/// Prefix used for the keys of list items.
pub const ITEM_PREFIX: &str = "__item__";

/// Returns the storage key of the list item at a 1-based position.
pub fn item_key(position: usize) -> String {
    format!("{}{:06}", ITEM_PREFIX, position)
}

/// Parses a list item key back into its 1-based position.
pub fn item_position(key: &str) -> Option<usize> {
    key.strip_prefix(ITEM_PREFIX)?.parse().ok()
}

/// In-memory representation of any persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: Option<ObjectId>,
    parent_id: Option<ObjectId>,
    name: String,
    class_name: String,
    value: Option<String>,
    pointer: bool,
    storable: bool,
    fields: Vec<(String, Node)>,
    target: Option<Box<Node>>,
}

impl Node {
    /// Creates an empty composite node of the given class.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            id: None,
            parent_id: None,
            name: String::new(),
            class_name: class_name.into(),
            value: None,
            pointer: false,
            storable: true,
            fields: Vec::new(),
            target: None,
        }
    }

    /// Creates a scalar node of the given class holding no value.
    pub fn null(class: BuiltinClass) -> Self {
        Self::new(class.as_str())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::null(BuiltinClass::String).with_value(Some(value.into()))
    }

    pub fn integer(value: i64) -> Self {
        Self::null(BuiltinClass::Integer).with_value(Some(value.to_string()))
    }

    pub fn float(value: f64) -> Self {
        Self::null(BuiltinClass::Float).with_value(Some(value.to_string()))
    }

    pub fn boolean(value: bool) -> Self {
        Self::null(BuiltinClass::Boolean).with_value(Some(value.to_string()))
    }

    /// Creates an empty ordered collection.
    pub fn list() -> Self {
        Self::null(BuiltinClass::List)
    }

    /// Creates a pointer holding the id of a referenced node, if any.
    pub fn pointer(target_id: Option<ObjectId>) -> Self {
        Self::null(BuiltinClass::Pointer)
            .as_pointer()
            .with_value(target_id.map(|id| id.to_string()))
    }

    /// Flags this node as a reference: its value is another node's id.
    pub fn as_pointer(mut self) -> Self {
        self.pointer = true;
        self
    }

    /// Creates a pointer referencing an already stored node.
    pub fn pointer_to(target: &Node) -> Self {
        let mut node = Self::pointer(None);
        node.set_target(target.clone());
        node
    }

    /// Appends a field at construction time.
    ///
    /// Declaring the same key twice replaces the earlier field in place.
    pub fn with_field(mut self, key: impl Into<String>, field: Node) -> Self {
        self.set_field(key, field);
        self
    }

    pub fn with_value(mut self, value: Option<String>) -> Self {
        self.value = value;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.id
    }

    pub fn str_id(&self) -> String {
        match self.id {
            Some(id) => id.to_string(),
            None => "None".to_string(),
        }
    }

    pub fn parent_id(&self) -> Option<ObjectId> {
        self.parent_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer
    }

    pub fn is_storable(&self) -> bool {
        self.storable
    }

    /// Includes or excludes this node (and its subtree) from persistence.
    pub fn set_storable(&mut self, storable: bool) {
        self.storable = storable;
    }

    /// Raw stored value of a scalar or pointer.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn set_value(&mut self, value: Option<String>) {
        self.value = value;
    }

    pub fn set_string(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
    }

    pub fn set_integer(&mut self, value: i64) {
        self.value = Some(value.to_string());
    }

    pub fn set_float(&mut self, value: f64) {
        self.value = Some(value.to_string());
    }

    pub fn set_boolean(&mut self, value: bool) {
        self.value = Some(value.to_string());
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value()?.trim().parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value()?.trim().parse().ok()
    }

    /// Boolean view: `true`/`1` (case-insensitive) are true.
    pub fn as_bool(&self) -> Option<bool> {
        let v = self.value()?.trim().to_lowercase();
        Some(v == "true" || v == "1")
    }

    pub fn field(&self, key: &str) -> Option<&Node> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    pub fn field_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.fields.iter_mut().find(|(k, _)| k == key).map(|(_, n)| n)
    }

    /// Sets a field, keeping its position when the key already exists.
    pub fn set_field(&mut self, key: impl Into<String>, field: Node) {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = field,
            None => self.fields.push((key, field)),
        }
    }

    pub fn remove_field(&mut self, key: &str) -> Option<Node> {
        let index = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(index).1)
    }

    pub fn has_field(&self, key: &str) -> bool {
        self.field(key).is_some()
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields.iter().map(|(k, n)| (k.as_str(), n))
    }

    /// Fields that take part in persistence, in declaration order.
    pub fn storable_fields(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields().filter(|(_, n)| n.storable)
    }

    pub(crate) fn storable_fields_mut(&mut self) -> impl Iterator<Item = (&str, &mut Node)> {
        self.fields
            .iter_mut()
            .filter(|(_, n)| n.storable)
            .map(|(k, n)| (k.as_str(), n))
    }

    /// Appends an item to a list node.
    pub fn push_item(&mut self, item: Node) {
        let key = item_key(self.len_items() + 1);
        self.fields.push((key, item));
    }

    pub fn len_items(&self) -> usize {
        self.fields
            .iter()
            .filter(|(k, _)| k.starts_with(ITEM_PREFIX))
            .count()
    }

    /// List items in order.
    pub fn items(&self) -> impl Iterator<Item = &Node> {
        self.fields
            .iter()
            .filter(|(k, _)| k.starts_with(ITEM_PREFIX))
            .map(|(_, n)| n)
    }

    /// Detaches every list item, returning them with their keys.
    pub fn take_items(&mut self) -> Vec<(String, Node)> {
        let (items, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.fields)
            .into_iter()
            .partition(|(k, _)| k.starts_with(ITEM_PREFIX));
        self.fields = rest;
        items
    }

    /// Id of the node referenced by a pointer.
    pub fn target_id(&self) -> Option<ObjectId> {
        if !self.pointer {
            return None;
        }
        self.as_i64()
    }

    /// Resolved copy of the referenced node, when loaded.
    pub fn target(&self) -> Option<&Node> {
        self.target.as_deref()
    }

    /// Points at `target`. The attached copy is never persisted from here.
    pub fn set_target(&mut self, mut target: Node) {
        self.value = target.id.map(|id| id.to_string());
        target.storable = false;
        self.target = Some(Box::new(target));
    }

    /// Walks a chain of field keys from this node.
    pub(crate) fn descend_mut(&mut self, path: &[String]) -> Option<&mut Node> {
        let mut current = self;
        for key in path {
            current = current.field_mut(key)?;
        }
        Some(current)
    }

    pub(crate) fn assign_id(&mut self, id: ObjectId) {
        debug_assert!(self.id.is_none(), "object id is immutable once assigned");
        self.id = Some(id);
    }

    pub(crate) fn set_parent_id(&mut self, parent_id: Option<ObjectId>) {
        self.parent_id = parent_id;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Fills the row-level attributes of a freshly built node.
    pub(crate) fn fill_meta(
        &mut self,
        id: ObjectId,
        parent_id: Option<ObjectId>,
        name: String,
        value: Option<String>,
    ) {
        self.id = Some(id);
        self.parent_id = parent_id;
        self.name = name;
        self.value = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(Node::integer(42).as_i64(), Some(42));
        assert_eq!(Node::float(1.237).as_f64(), Some(1.237));
        assert_eq!(Node::boolean(true).as_bool(), Some(true));
        assert_eq!(Node::string("abc").as_str(), Some("abc"));
        assert_eq!(Node::null(BuiltinClass::String).as_str(), None);
    }

    #[test]
    fn test_boolean_parsing_accepts_one_and_case() {
        let mut node = Node::null(BuiltinClass::Boolean);
        node.set_string("TRUE");
        assert_eq!(node.as_bool(), Some(true));
        node.set_string("1");
        assert_eq!(node.as_bool(), Some(true));
        node.set_string("no");
        assert_eq!(node.as_bool(), Some(false));
    }

    #[test]
    fn test_fields_keep_declaration_order() {
        let node = Node::new("Object")
            .with_field("zeta", Node::integer(1))
            .with_field("alpha", Node::integer(2))
            .with_field("mid", Node::integer(3));

        let keys: Vec<&str> = node.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_set_field_replaces_in_place() {
        let mut node = Node::new("Object")
            .with_field("a", Node::integer(1))
            .with_field("b", Node::integer(2));
        node.set_field("a", Node::integer(10));

        let keys: Vec<&str> = node.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(node.field("a").and_then(Node::as_i64), Some(10));
    }

    #[test]
    fn test_storable_fields_skip_transient() {
        let mut cache = Node::string("cached");
        cache.set_storable(false);
        let node = Node::new("Object")
            .with_field("kept", Node::integer(1))
            .with_field("cache", cache);

        let keys: Vec<&str> = node.storable_fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["kept"]);
    }

    #[test]
    fn test_list_items() {
        let mut list = Node::list();
        list.push_item(Node::integer(1));
        list.push_item(Node::integer(2));

        assert_eq!(list.len_items(), 2);
        let keys: Vec<&str> = list.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["__item__000001", "__item__000002"]);

        let taken = list.take_items();
        assert_eq!(taken.len(), 2);
        assert_eq!(list.len_items(), 0);
    }

    #[test]
    fn test_item_key_round_trip() {
        assert_eq!(item_key(3), "__item__000003");
        assert_eq!(item_position("__item__000003"), Some(3));
        assert_eq!(item_position("status"), None);
    }

    #[test]
    fn test_pointer_target_is_not_storable() {
        let mut target = Node::new("Object");
        target.assign_id(12);

        let pointer = Node::pointer_to(&target);
        assert!(pointer.is_pointer());
        assert_eq!(pointer.target_id(), Some(12));
        assert!(!pointer.target().unwrap().is_storable());
    }

    #[test]
    fn test_pointer_to_unstored_has_no_value() {
        let pointer = Node::pointer_to(&Node::new("Object"));
        assert_eq!(pointer.target_id(), None);
        assert!(!pointer.has_value());
    }

    #[test]
    fn test_target_id_only_for_pointers() {
        assert_eq!(Node::integer(5).target_id(), None);
    }

    #[test]
    fn test_descend_mut() {
        let mut root = Node::new("Object")
            .with_field("inner", Node::new("Object").with_field("leaf", Node::integer(1)));

        let path = vec!["inner".to_string(), "leaf".to_string()];
        root.descend_mut(&path).unwrap().set_integer(9);
        assert_eq!(
            root.field("inner").and_then(|n| n.field("leaf")).and_then(Node::as_i64),
            Some(9)
        );
        assert!(root.descend_mut(&["missing".to_string()]).is_none());
    }
}
