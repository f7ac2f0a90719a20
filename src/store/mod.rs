// ============================================================================
// Store Interface
// ============================================================================
//
// What the kernel consumes from the data store: record loading, identity
// assignment, version comparison and flushing. Records are held in a
// context-independent form (`StoredValue`) so several persistence contexts
// can share one store.
//
// ============================================================================

mod memory;

pub use memory::InMemoryStore;

use crate::core::{ClassMeta, FieldSet, ManagedObject, ObjectId, Result, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Result of comparing one version against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionOrdering {
    Same,
    Later,
    Earlier,
    /// Versions that are not ordered relative to each other.
    Different,
}

impl VersionOrdering {
    /// Ordering of `a` relative to `b` for monotonically increasing versions.
    pub fn compare(a: Version, b: Version) -> Self {
        match a.cmp(&b) {
            std::cmp::Ordering::Equal => VersionOrdering::Same,
            std::cmp::Ordering::Greater => VersionOrdering::Later,
            std::cmp::Ordering::Less => VersionOrdering::Earlier,
        }
    }
}

impl fmt::Display for VersionOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionOrdering::Same => write!(f, "same"),
            VersionOrdering::Later => write!(f, "later"),
            VersionOrdering::Earlier => write!(f, "earlier"),
            VersionOrdering::Different => write!(f, "different"),
        }
    }
}

/// Field value as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(DateTime<Utc>),
    Array(Vec<StoredValue>),
    List(Vec<StoredValue>),
    Set(Vec<StoredValue>),
    Map(BTreeMap<String, StoredValue>),
    Object {
        type_name: String,
        data: serde_json::Value,
    },
    /// Reference to another stored record.
    Ref { class: String, object_id: ObjectId },
    /// Embedded instance stored inline with its owner.
    Embedded {
        class: String,
        values: Vec<StoredValue>,
    },
}

/// A record handed back by `load`.
#[derive(Debug, Clone)]
pub struct LoadedRecord {
    pub class: Arc<ClassMeta>,
    pub values: Vec<StoredValue>,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub enum FlushOp {
    Insert {
        class: Arc<ClassMeta>,
        object_id: ObjectId,
        values: Vec<StoredValue>,
    },
    Update {
        class: String,
        object_id: ObjectId,
        values: Vec<(usize, StoredValue)>,
        /// Version the update is based on; checked when present.
        expected: Option<Version>,
    },
    Delete {
        class: String,
        object_id: ObjectId,
        expected: Option<Version>,
    },
    CheckVersion {
        class: String,
        object_id: ObjectId,
        expected: Version,
    },
    BumpVersion {
        class: String,
        object_id: ObjectId,
        expected: Option<Version>,
    },
}

impl FlushOp {
    pub fn object_id(&self) -> &ObjectId {
        match self {
            FlushOp::Insert { object_id, .. }
            | FlushOp::Update { object_id, .. }
            | FlushOp::Delete { object_id, .. }
            | FlushOp::CheckVersion { object_id, .. }
            | FlushOp::BumpVersion { object_id, .. } => object_id,
        }
    }
}

/// Per-op flush result: the record's version after the op, if it exists.
pub type FlushOutcome = Result<Option<Version>>;

/// Store collaborator of a persistence context. `context` identifies the
/// calling context's transaction.
pub trait StoreManager: Send + Sync + fmt::Debug {
    fn compare_version(&self, a: Version, b: Version) -> VersionOrdering {
        VersionOrdering::compare(a, b)
    }

    /// Load the requested fields of a record; other fields come back `Null`.
    fn load(&self, class: &str, oid: &ObjectId, fields: &FieldSet) -> Result<Option<LoadedRecord>>;

    /// Load a whole record.
    fn find(&self, class: &str, oid: &ObjectId) -> Result<Option<LoadedRecord>> {
        let Some(meta) = self.class_meta(class) else {
            return Ok(None);
        };
        self.load(class, oid, &FieldSet::full(meta.field_count()))
    }

    fn class_meta(&self, class: &str) -> Option<Arc<ClassMeta>>;

    fn current_version(&self, class: &str, oid: &ObjectId) -> Result<Option<Version>>;

    /// Permanent identity for a new instance.
    fn assign_object_id(&self, object: &ManagedObject) -> Result<ObjectId>;

    fn begin(&self, context: Uuid) -> Result<()>;

    fn commit(&self, context: Uuid) -> Result<()>;

    fn rollback(&self, context: Uuid) -> Result<()>;

    /// Apply `ops` in order. Every op gets an outcome; a failed op does not
    /// stop later ones.
    fn flush(&self, context: Uuid, ops: Vec<FlushOp>) -> Vec<FlushOutcome>;
}
