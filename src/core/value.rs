use crate::core::{ClassMeta, DetachedKey, FieldKind, InstanceId, KernelError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A mutable field payload with optional change tracking.
///
/// Tracking plays the role of a second-class-object proxy: once switched on,
/// every write access bumps a counter, so a savepoint can tell whether the
/// value was touched without intercepting each mutation explicitly.
pub struct Tracked<T> {
    value: RwLock<T>,
    tracking: AtomicBool,
    changes: AtomicU64,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
            tracking: AtomicBool::new(false),
            changes: AtomicU64::new(0),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.value.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        if self.tracking.load(Ordering::Acquire) {
            self.changes.fetch_add(1, Ordering::AcqRel);
        }
        self.value.write()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.write();
        f(&mut guard)
    }

    pub fn start_tracking(&self) {
        self.tracking.store(true, Ordering::Release);
    }

    pub fn stop_tracking(&self) {
        self.tracking.store(false, Ordering::Release);
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Acquire)
    }

    pub fn change_count(&self) -> u64 {
        self.changes.load(Ordering::Acquire)
    }
}

impl<T: fmt::Debug> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.read().fmt(f)
    }
}

pub type Shared<T> = Arc<Tracked<T>>;

pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Tracked::new(value))
}

/// Instance of a user-defined mutable type. The payload is kept as JSON and
/// copied through the strategy registered for `type_name`.
#[derive(Debug, Clone)]
pub struct CustomValue {
    pub type_name: String,
    pub data: Shared<serde_json::Value>,
}

/// Value of one persistent field.
///
/// Cloning a `FieldValue` aliases mutable payloads, the same way copying a
/// reference does; use the copy registry for a deep copy.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Date(Shared<DateTime<Utc>>),
    Array(Shared<Vec<FieldValue>>),
    List(Shared<Vec<FieldValue>>),
    Set(Shared<Vec<FieldValue>>),
    Map(Shared<BTreeMap<String, FieldValue>>),
    Object(CustomValue),
    Managed(InstanceId),
    Detached(DetachedKey),
}

impl FieldValue {
    pub fn text(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }

    pub fn date(value: DateTime<Utc>) -> Self {
        FieldValue::Date(shared(value))
    }

    pub fn array(values: Vec<FieldValue>) -> Self {
        FieldValue::Array(shared(values))
    }

    pub fn list(values: Vec<FieldValue>) -> Self {
        FieldValue::List(shared(values))
    }

    /// Set semantics: later duplicates are dropped.
    pub fn set(values: Vec<FieldValue>) -> Self {
        let mut unique: Vec<FieldValue> = Vec::with_capacity(values.len());
        for value in values {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        FieldValue::Set(shared(unique))
    }

    pub fn map(entries: BTreeMap<String, FieldValue>) -> Self {
        FieldValue::Map(shared(entries))
    }

    pub fn object(type_name: &str, data: serde_json::Value) -> Self {
        FieldValue::Object(CustomValue {
            type_name: type_name.to_string(),
            data: shared(data),
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Array(_) => "array",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Map(_) => "map",
            Self::Object(custom) => &custom.type_name,
            Self::Managed(_) => "managed",
            Self::Detached(_) => "detached",
        }
    }

    /// Kind this value belongs to, `None` for `Null`.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(FieldKind::Boolean),
            Self::Integer(_) => Some(FieldKind::Integer),
            Self::Float(_) => Some(FieldKind::Float),
            Self::Text(_) => Some(FieldKind::Text),
            Self::Date(_) => Some(FieldKind::Date),
            Self::Array(_) => Some(FieldKind::Array),
            Self::List(_) => Some(FieldKind::List),
            Self::Set(_) => Some(FieldKind::Set),
            Self::Map(_) => Some(FieldKind::Map),
            Self::Object(_) => Some(FieldKind::Object),
            Self::Managed(_) | Self::Detached(_) => Some(FieldKind::Reference),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_managed(&self) -> Option<InstanceId> {
        match self {
            Self::Managed(id) => Some(*id),
            _ => None,
        }
    }

    /// Elements of an array, list or set, cloned (aliasing nested payloads).
    pub fn elements(&self) -> Option<Vec<FieldValue>> {
        match self {
            Self::Array(v) | Self::List(v) | Self::Set(v) => Some(v.read().clone()),
            _ => None,
        }
    }

    /// True when both values point at the same mutable payload.
    pub fn same_handle(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (Self::Date(a), Self::Date(b)) => Arc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b))
            | (Self::List(a), Self::List(b))
            | (Self::Set(a), Self::Set(b)) => Arc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => Arc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(&a.data, &b.data),
            _ => false,
        }
    }

    /// Change counter of the mutable payload, if any.
    pub fn change_count(&self) -> Option<u64> {
        match self {
            Self::Date(v) => Some(v.change_count()),
            Self::Array(v) | Self::List(v) | Self::Set(v) => Some(v.change_count()),
            Self::Map(v) => Some(v.change_count()),
            Self::Object(v) => Some(v.data.change_count()),
            _ => None,
        }
    }

    pub fn set_tracking(&self, on: bool) {
        fn toggle<T>(t: &Tracked<T>, on: bool) {
            if on {
                t.start_tracking()
            } else {
                t.stop_tracking()
            }
        }
        match self {
            Self::Date(v) => toggle(v, on),
            Self::Array(v) | Self::List(v) | Self::Set(v) => toggle(v, on),
            Self::Map(v) => toggle(v, on),
            Self::Object(v) => toggle(&v.data, on),
            _ => {}
        }
    }

    pub fn is_tracking(&self) -> bool {
        match self {
            Self::Date(v) => v.is_tracking(),
            Self::Array(v) | Self::List(v) | Self::Set(v) => v.is_tracking(),
            Self::Map(v) => v.is_tracking(),
            Self::Object(v) => v.data.is_tracking(),
            _ => false,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        if self.same_handle(other) {
            return true;
        }
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => *a.read() == *b.read(),
            (Self::Array(a), Self::Array(b)) | (Self::List(a), Self::List(b)) => {
                *a.read() == *b.read()
            }
            (Self::Set(a), Self::Set(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().all(|v| b.contains(v))
            }
            (Self::Map(a), Self::Map(b)) => *a.read() == *b.read(),
            (Self::Object(a), Self::Object(b)) => {
                a.type_name == b.type_name && *a.data.read() == *b.data.read()
            }
            (Self::Managed(a), Self::Managed(b)) => a == b,
            (Self::Detached(a), Self::Detached(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

/// The data of one domain object: its class and one value per field.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    pub class: Arc<ClassMeta>,
    pub values: Vec<FieldValue>,
}

impl ManagedObject {
    pub fn new(class: Arc<ClassMeta>) -> Self {
        let values = vec![FieldValue::Null; class.field_count()];
        Self { class, values }
    }

    /// Builder-style setter by field name.
    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Result<Self> {
        let index = self.index_of(field)?;
        self.values[index] = value.into();
        Ok(self)
    }

    pub fn index_of(&self, field: &str) -> Result<usize> {
        self.class
            .field_index(field)
            .ok_or_else(|| KernelError::UnknownField {
                class: self.class.name.clone(),
                field: field.to_string(),
            })
    }

    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: FieldValue) -> Result<()> {
        let slot = self
            .values
            .get_mut(index)
            .ok_or_else(|| KernelError::UnknownField {
                class: self.class.name.clone(),
                field: index.to_string(),
            })?;
        *slot = value;
        Ok(())
    }

    /// Primary key values in field order.
    pub fn primary_key(&self) -> Vec<FieldValue> {
        self.class
            .primary_key_fields()
            .map(|i| self.values[i].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_aliases_mutable_payload() {
        let list = FieldValue::list(vec![1i64.into(), 2i64.into()]);
        let alias = list.clone();
        assert!(list.same_handle(&alias));

        if let FieldValue::List(inner) = &alias {
            inner.write().push(3i64.into());
        }
        assert_eq!(list.elements().map(|v| v.len()), Some(3));
    }

    #[test]
    fn test_tracking_counts_writes_only_when_enabled() {
        let list = FieldValue::list(vec![]);
        if let FieldValue::List(inner) = &list {
            inner.write().push(1i64.into());
            assert_eq!(inner.change_count(), 0);

            list.set_tracking(true);
            inner.write().push(2i64.into());
            assert_eq!(inner.change_count(), 1);
            assert!(list.is_tracking());
        }
    }

    #[test]
    fn test_set_deduplicates_and_compares_unordered() {
        let a = FieldValue::set(vec![1i64.into(), 2i64.into(), 1i64.into()]);
        let b = FieldValue::set(vec![2i64.into(), 1i64.into()]);
        assert_eq!(a.elements().map(|v| v.len()), Some(2));
        assert_eq!(a, b);
    }
}
