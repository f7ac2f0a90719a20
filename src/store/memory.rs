use super::{FlushOp, FlushOutcome, LoadedRecord, StoreManager, StoredValue};
use crate::core::{
    ClassMeta, FailedObject, FieldKind, FieldSet, FieldValue, KernelError, ManagedObject, ObjectId,
    Result, Version,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

type RecordKey = (String, ObjectId);

#[derive(Debug, Clone)]
struct StoredRecord {
    values: Vec<StoredValue>,
    version: Version,
}

#[derive(Debug)]
struct Undo {
    key: RecordKey,
    previous: Option<StoredRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    classes: HashMap<String, Arc<ClassMeta>>,
    records: HashMap<RecordKey, StoredRecord>,
    undo: HashMap<Uuid, Vec<Undo>>,
    next_id: i64,
}

impl Inner {
    fn remember(&mut self, context: Uuid, key: &RecordKey) {
        let previous = self.records.get(key).cloned();
        if let Some(log) = self.undo.get_mut(&context) {
            log.push(Undo {
                key: key.clone(),
                previous,
            });
        }
    }

    fn existing(&self, key: &RecordKey, expected: Option<Version>) -> Result<Version> {
        let conflict = |message: String| KernelError::OptimisticConflict {
            failed: FailedObject::Identity(key.1.clone()),
            message,
        };
        let record = self
            .records
            .get(key)
            .ok_or_else(|| conflict(format!("{} {} no longer exists", key.0, key.1)))?;
        if let Some(expected) = expected {
            if expected != record.version {
                return Err(conflict(format!(
                    "expected version {} but the store holds {}",
                    expected, record.version
                )));
            }
        }
        Ok(record.version)
    }

    fn apply(&mut self, context: Uuid, op: FlushOp) -> FlushOutcome {
        match op {
            FlushOp::Insert {
                class,
                object_id,
                values,
            } => {
                let key = (class.name.clone(), object_id);
                if self.records.contains_key(&key) {
                    return Err(KernelError::DuplicateObjectId {
                        object_id: key.1.clone(),
                        existing: format!("stored {}", key.0),
                        attempted: "insert".to_string(),
                    });
                }
                if let ObjectId::Long(n) = key.1 {
                    self.next_id = self.next_id.max(n);
                }
                self.classes.insert(class.name.clone(), class);
                self.remember(context, &key);
                let version = Version(1);
                self.records.insert(key, StoredRecord { values, version });
                Ok(Some(version))
            }
            FlushOp::Update {
                class,
                object_id,
                values,
                expected,
            } => {
                let key = (class, object_id);
                let current = self.existing(&key, expected)?;
                self.remember(context, &key);
                let version = Version(current.0 + 1);
                if let Some(record) = self.records.get_mut(&key) {
                    for (field, value) in values {
                        if let Some(slot) = record.values.get_mut(field) {
                            *slot = value;
                        }
                    }
                    record.version = version;
                }
                Ok(Some(version))
            }
            FlushOp::Delete {
                class,
                object_id,
                expected,
            } => {
                let key = (class, object_id);
                self.existing(&key, expected)?;
                self.remember(context, &key);
                self.records.remove(&key);
                Ok(None)
            }
            FlushOp::CheckVersion {
                class,
                object_id,
                expected,
            } => {
                let key = (class, object_id);
                self.existing(&key, Some(expected)).map(Some)
            }
            FlushOp::BumpVersion {
                class,
                object_id,
                expected,
            } => {
                let key = (class, object_id);
                let current = self.existing(&key, expected)?;
                self.remember(context, &key);
                let version = Version(current.0 + 1);
                if let Some(record) = self.records.get_mut(&key) {
                    record.version = version;
                }
                Ok(Some(version))
            }
        }
    }
}

/// Thread-safe in-memory record store with per-context undo logs.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_class(&self, class: Arc<ClassMeta>) {
        self.inner.lock().classes.insert(class.name.clone(), class);
    }

    /// Seed a committed record at version 1.
    pub fn insert_record(&self, class: &Arc<ClassMeta>, oid: ObjectId, values: Vec<StoredValue>) {
        let mut inner = self.inner.lock();
        inner.classes.insert(class.name.clone(), Arc::clone(class));
        if let ObjectId::Long(n) = oid {
            inner.next_id = inner.next_id.max(n);
        }
        inner.records.insert(
            (class.name.clone(), oid),
            StoredRecord {
                values,
                version: Version(1),
            },
        );
    }

    pub fn record(&self, class: &str, oid: &ObjectId) -> Option<(Vec<StoredValue>, Version)> {
        self.inner
            .lock()
            .records
            .get(&(class.to_string(), oid.clone()))
            .map(|r| (r.values.clone(), r.version))
    }

    /// Simulate a concurrent committed update by bumping the version.
    pub fn bump_version(&self, class: &str, oid: &ObjectId) -> Option<Version> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&(class.to_string(), oid.clone()))?;
        record.version = Version(record.version.0 + 1);
        Some(record.version)
    }

    /// Simulate a concurrent committed delete.
    pub fn remove_record(&self, class: &str, oid: &ObjectId) -> bool {
        self.inner
            .lock()
            .records
            .remove(&(class.to_string(), oid.clone()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Object ids of every stored record of `class`, in ascending order.
    pub fn object_ids(&self, class: &str) -> Vec<ObjectId> {
        let inner = self.inner.lock();
        let mut ids: Vec<ObjectId> = inner
            .records
            .keys()
            .filter(|(c, _)| c == class)
            .map(|(_, oid)| oid.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl StoreManager for InMemoryStore {
    fn load(&self, class: &str, oid: &ObjectId, fields: &FieldSet) -> Result<Option<LoadedRecord>> {
        let inner = self.inner.lock();
        let Some(meta) = inner.classes.get(class).cloned() else {
            return Ok(None);
        };
        let Some(record) = inner.records.get(&(class.to_string(), oid.clone())) else {
            return Ok(None);
        };
        let values = record
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                if fields.contains(i) {
                    v.clone()
                } else {
                    StoredValue::Null
                }
            })
            .collect();
        Ok(Some(LoadedRecord {
            class: meta,
            values,
            version: record.version,
        }))
    }

    fn class_meta(&self, class: &str) -> Option<Arc<ClassMeta>> {
        self.inner.lock().classes.get(class).cloned()
    }

    fn current_version(&self, class: &str, oid: &ObjectId) -> Result<Option<Version>> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&(class.to_string(), oid.clone()))
            .map(|r| r.version))
    }

    fn assign_object_id(&self, object: &ManagedObject) -> Result<ObjectId> {
        let keys: Vec<usize> = object.class.primary_key_fields().collect();
        if let [field] = keys.as_slice() {
            match object.get(*field) {
                Some(FieldValue::Integer(v)) => return Ok(ObjectId::Long(*v)),
                Some(FieldValue::Text(v)) => return Ok(ObjectId::Text(v.clone())),
                Some(FieldValue::Null) | None => {}
                Some(other) => {
                    return Err(KernelError::Store(format!(
                        "unsupported primary key type '{}' for {}",
                        other.type_name(),
                        object.class.name
                    )));
                }
            }
            let kind = object.class.field_meta(*field).map(|m| m.kind);
            if kind != Some(FieldKind::Integer) {
                return Err(KernelError::Store(format!(
                    "cannot generate a primary key of kind {:?} for {}",
                    kind, object.class.name
                )));
            }
        }

        let mut inner = self.inner.lock();
        loop {
            inner.next_id += 1;
            let candidate = ObjectId::Long(inner.next_id);
            if !inner
                .records
                .contains_key(&(object.class.name.clone(), candidate.clone()))
            {
                return Ok(candidate);
            }
        }
    }

    fn begin(&self, context: Uuid) -> Result<()> {
        self.inner.lock().undo.insert(context, Vec::new());
        Ok(())
    }

    fn commit(&self, context: Uuid) -> Result<()> {
        self.inner.lock().undo.remove(&context);
        Ok(())
    }

    fn rollback(&self, context: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(log) = inner.undo.remove(&context) else {
            return Ok(());
        };
        let undone = log.len();
        for entry in log.into_iter().rev() {
            match entry.previous {
                Some(record) => {
                    inner.records.insert(entry.key, record);
                }
                None => {
                    inner.records.remove(&entry.key);
                }
            }
        }
        event!(Level::DEBUG, context = %context, undone, "store rollback");
        Ok(())
    }

    fn flush(&self, context: Uuid, ops: Vec<FlushOp>) -> Vec<FlushOutcome> {
        let mut inner = self.inner.lock();
        let count = ops.len();
        let outcomes: Vec<FlushOutcome> = ops.into_iter().map(|op| inner.apply(context, op)).collect();
        event!(
            Level::DEBUG,
            context = %context,
            ops = count,
            failed = outcomes.iter().filter(|o| o.is_err()).count(),
            "store flush"
        );
        outcomes
    }
}
