//! Class Registry
//!
//! Maps stored class names back to an empty in-memory node of the right
//! shape. Built-in classes come from a fixed enumeration; protocol kinds
//! are registered explicitly by name before their objects are loaded.

use std::collections::HashMap;

use crate::error::MapperError;

use super::node::Node;

/// Storage shape of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Scalar,
    List,
    Pointer,
    Composite,
}

/// Classes known to the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinClass {
    Integer,
    Float,
    String,
    Boolean,
    Pointer,
    List,
    Object,
    Step,
    FunctionStep,
    RunJobStep,
    Protocol,
}

impl BuiltinClass {
    pub const ALL: [BuiltinClass; 11] = [
        BuiltinClass::Integer,
        BuiltinClass::Float,
        BuiltinClass::String,
        BuiltinClass::Boolean,
        BuiltinClass::Pointer,
        BuiltinClass::List,
        BuiltinClass::Object,
        BuiltinClass::Step,
        BuiltinClass::FunctionStep,
        BuiltinClass::RunJobStep,
        BuiltinClass::Protocol,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "Integer",
            Self::Float => "Float",
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::Pointer => "Pointer",
            Self::List => "List",
            Self::Object => "Object",
            Self::Step => "Step",
            Self::FunctionStep => "FunctionStep",
            Self::RunJobStep => "RunJobStep",
            Self::Protocol => "Protocol",
        }
    }

    pub fn kind(&self) -> ClassKind {
        match self {
            Self::Integer | Self::Float | Self::String | Self::Boolean => ClassKind::Scalar,
            Self::Pointer => ClassKind::Pointer,
            Self::List => ClassKind::List,
            _ => ClassKind::Composite,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

/// Explicit factory map from class name to storage shape.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassKind>,
}

impl ClassRegistry {
    /// Creates a registry holding the built-in classes.
    pub fn new() -> Self {
        let classes = BuiltinClass::ALL
            .iter()
            .map(|c| (c.as_str().to_string(), c.kind()))
            .collect();
        Self { classes }
    }

    /// Registers an additional class, typically a protocol kind.
    pub fn register(&mut self, class_name: impl Into<String>, kind: ClassKind) {
        self.classes.insert(class_name.into(), kind);
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name)
    }

    pub fn kind_of(&self, class_name: &str) -> Option<ClassKind> {
        self.classes.get(class_name).copied()
    }

    /// Builds an empty node for a stored class name.
    pub fn build(&self, class_name: &str) -> Result<Node, MapperError> {
        let kind = self
            .kind_of(class_name)
            .ok_or_else(|| MapperError::ClassNotFound(class_name.to_string()))?;

        Ok(match kind {
            ClassKind::Pointer => Node::new(class_name).as_pointer(),
            ClassKind::Scalar | ClassKind::List | ClassKind::Composite => Node::new(class_name),
        })
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ClassRegistry::new();
        for class in BuiltinClass::ALL {
            assert!(registry.contains(class.as_str()));
        }
    }

    #[test]
    fn test_build_unknown_class() {
        let registry = ClassRegistry::new();
        let result = registry.build("ProtImportMicrographs");
        assert!(matches!(result, Err(MapperError::ClassNotFound(name)) if name == "ProtImportMicrographs"));
    }

    #[test]
    fn test_build_registered_class() {
        let mut registry = ClassRegistry::new();
        registry.register("ProtImportMicrographs", ClassKind::Composite);

        let node = registry.build("ProtImportMicrographs").unwrap();
        assert_eq!(node.class_name(), "ProtImportMicrographs");
        assert!(!node.is_pointer());
    }

    #[test]
    fn test_build_pointer() {
        let registry = ClassRegistry::new();
        let node = registry.build("Pointer").unwrap();
        assert!(node.is_pointer());
    }

    #[test]
    fn test_builtin_from_name() {
        assert_eq!(BuiltinClass::from_name("List"), Some(BuiltinClass::List));
        assert_eq!(BuiltinClass::from_name("list"), None);
        assert_eq!(BuiltinClass::FunctionStep.kind(), ClassKind::Composite);
    }
}
