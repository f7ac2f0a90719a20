use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type category of a persistent field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Array,
    List,
    Set,
    Map,
    /// Arbitrary mutable user type; copied through a registered strategy.
    Object,
    /// Relation to another managed instance.
    Reference,
}

impl FieldKind {
    /// Kinds whose values can be changed in place and therefore need a deep
    /// copy to be snapshotted.
    pub fn is_mutable(&self) -> bool {
        matches!(
            self,
            FieldKind::Date
                | FieldKind::Array
                | FieldKind::List
                | FieldKind::Set
                | FieldKind::Map
                | FieldKind::Object
        )
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            FieldKind::Array | FieldKind::List | FieldKind::Set | FieldKind::Map
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FieldKind::Boolean => "boolean",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Text => "text",
            FieldKind::Date => "date",
            FieldKind::Array => "array",
            FieldKind::List => "list",
            FieldKind::Set => "set",
            FieldKind::Map => "map",
            FieldKind::Object => "object",
            FieldKind::Reference => "reference",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub kind: FieldKind,
    pub primary_key: bool,
    pub version: bool,
    /// Follow this relation (or collection of relations) when attaching.
    pub cascade_attach: bool,
}

impl FieldMeta {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            primary_key: false,
            version: false,
            cascade_attach: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub fn cascade_attach(mut self) -> Self {
        self.cascade_attach = true;
        self
    }
}

/// Metadata of a managed class: its ordered persistent fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMeta {
    pub name: String,
    pub fields: Vec<FieldMeta>,
}

impl ClassMeta {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_meta(&self, index: usize) -> Option<&FieldMeta> {
        self.fields.get(index)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn primary_key_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
    }

    pub fn version_field(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.version)
    }
}
