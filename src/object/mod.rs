//! Object Model
//!
//! Generic in-memory representation of every persisted entity: scalar
//! values, composite records, ordered lists and non-owning pointers.
//!
//! - [`node`]: the [`Node`] tree and its ordered-field builder
//! - [`registry`]: class name to node shape resolution used on load

pub mod node;
pub mod registry;

pub use node::{item_key, item_position, Node, ObjectId, ITEM_PREFIX};
pub use registry::{BuiltinClass, ClassKind, ClassRegistry};
