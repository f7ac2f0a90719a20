use crate::core::{CustomValue, FieldValue, shared};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Deep-copy strategy for a user-defined mutable type. Returning `None`
/// means the value cannot be copied.
pub type CustomCopy = Arc<dyn Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + Sync>;

lazy_static! {
    static ref DEFAULT_REGISTRY: Arc<CopyRegistry> = Arc::new(CopyRegistry::new());
}

/// Copy strategies keyed by field kind, with custom types keyed by name.
///
/// Immutable values copy shallowly. Dates, arrays, lists, sets and maps are
/// always deep-copyable. Custom objects are copyable only when a strategy is
/// registered for their type name.
#[derive(Clone, Default)]
pub struct CopyRegistry {
    custom: HashMap<String, CustomCopy>,
}

impl CopyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry with only the built-in strategies.
    pub fn global() -> Arc<CopyRegistry> {
        Arc::clone(&DEFAULT_REGISTRY)
    }

    pub fn register_custom(
        &mut self,
        type_name: &str,
        copy: impl Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + Sync + 'static,
    ) {
        self.custom.insert(type_name.to_string(), Arc::new(copy));
    }

    /// Register a custom type whose JSON payload is copied structurally.
    pub fn register_cloneable(&mut self, type_name: &str) {
        self.register_custom(type_name, |data| Some(data.clone()));
    }

    pub fn supports(&self, value: &FieldValue) -> bool {
        match value {
            FieldValue::Object(custom) => self.custom.contains_key(&custom.type_name),
            FieldValue::Array(v) | FieldValue::List(v) | FieldValue::Set(v) => {
                v.read().iter().all(|e| self.supports(e))
            }
            FieldValue::Map(m) => m.read().values().all(|e| self.supports(e)),
            _ => true,
        }
    }

    /// Copy `value` so the result shares no mutable payload with it.
    pub fn copy(&self, value: &FieldValue) -> Option<FieldValue> {
        let copied = match value {
            FieldValue::Date(d) => FieldValue::Date(shared(*d.read())),
            FieldValue::Array(v) => FieldValue::Array(shared(self.copy_all(&v.read())?)),
            FieldValue::List(v) => FieldValue::List(shared(self.copy_all(&v.read())?)),
            FieldValue::Set(v) => FieldValue::Set(shared(self.copy_all(&v.read())?)),
            FieldValue::Map(m) => {
                let source = m.read();
                let mut entries = std::collections::BTreeMap::new();
                for (key, entry) in source.iter() {
                    entries.insert(key.clone(), self.copy(entry)?);
                }
                FieldValue::Map(shared(entries))
            }
            FieldValue::Object(custom) => {
                let strategy = self.custom.get(&custom.type_name)?;
                let data = strategy(&custom.data.read())?;
                FieldValue::Object(CustomValue {
                    type_name: custom.type_name.clone(),
                    data: shared(data),
                })
            }
            FieldValue::Null
            | FieldValue::Boolean(_)
            | FieldValue::Integer(_)
            | FieldValue::Float(_)
            | FieldValue::Text(_)
            | FieldValue::Managed(_)
            | FieldValue::Detached(_) => value.clone(),
        };
        Some(copied)
    }

    fn copy_all(&self, values: &[FieldValue]) -> Option<Vec<FieldValue>> {
        values.iter().map(|v| self.copy(v)).collect()
    }
}

impl fmt::Debug for CopyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("CopyRegistry").field("custom", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_copy_breaks_aliasing() {
        let registry = CopyRegistry::new();
        let inner = FieldValue::list(vec![FieldValue::Integer(1)]);
        let outer = FieldValue::list(vec![inner.clone()]);

        let copy = registry.copy(&outer).unwrap();
        assert_eq!(copy, outer);
        assert!(!copy.same_handle(&outer));

        let copied_inner = copy.elements().unwrap().remove(0);
        assert!(!copied_inner.same_handle(&inner));
    }

    #[test]
    fn test_custom_object_needs_strategy() {
        let mut registry = CopyRegistry::new();
        let money = FieldValue::object("Money", json!({"amount": 5}));
        assert!(registry.copy(&money).is_none());
        assert!(!registry.supports(&FieldValue::list(vec![money.clone()])));

        registry.register_cloneable("Money");
        let copy = registry.copy(&money).unwrap();
        assert_eq!(copy.type_name(), "Money");
        assert!(!copy.same_handle(&money));
    }

    #[test]
    fn test_global_registry_is_shared() {
        let a = CopyRegistry::global();
        let b = CopyRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
