use super::CopyRegistry;
use crate::config::RestoreState;
use crate::core::{FieldSet, FieldValue, ManagedObject};
use std::sync::Arc;

/// Transaction-scoped snapshot of original field values.
///
/// Fields are saved lazily, the first time they are about to change, so
/// untouched instances cost nothing. A field that cannot be saved is
/// remembered as unloaded and comes back unloaded on restore.
#[derive(Debug, Clone)]
pub struct SaveFieldManager {
    policy: RestoreState,
    registry: Arc<CopyRegistry>,
    saved: FieldSet,
    unloaded: FieldSet,
    values: Vec<Option<FieldValue>>,
}

impl SaveFieldManager {
    pub fn new(field_count: usize, policy: RestoreState, registry: Arc<CopyRegistry>) -> Self {
        Self {
            policy,
            registry,
            saved: FieldSet::new(),
            unloaded: FieldSet::new(),
            values: vec![None; field_count],
        }
    }

    /// Snapshot `field` before it changes. Returns true if a value was saved.
    pub fn save_field(&mut self, field: usize, object: &ManagedObject, loaded: &FieldSet) -> bool {
        if field >= self.values.len() {
            return false;
        }
        if !loaded.contains(field) {
            self.unloaded.insert(field);
            return false;
        }
        if self.saved.contains(field) || self.unloaded.contains(field) {
            return false;
        }

        let mutable = object
            .class
            .field_meta(field)
            .map(|meta| meta.kind.is_mutable())
            .unwrap_or(false);

        let skip = match self.policy {
            RestoreState::None => true,
            RestoreState::Immutable => mutable,
            RestoreState::All => false,
        };
        if skip {
            self.unloaded.insert(field);
            return false;
        }

        let Some(current) = object.get(field) else {
            return false;
        };
        let snapshot = if mutable {
            match self.registry.copy(current) {
                Some(copy) => copy,
                None => {
                    self.unloaded.insert(field);
                    return false;
                }
            }
        } else {
            current.clone()
        };

        self.values[field] = Some(snapshot);
        self.saved.insert(field);
        true
    }

    /// Put saved values back in ascending field order and unload fields that
    /// could not be saved. Both sets are consumed, so a second call is a
    /// no-op.
    pub fn restore(&mut self, object: &mut ManagedObject, loaded: &mut FieldSet) -> FieldSet {
        let mut restored = FieldSet::new();
        let fields: Vec<usize> = self.saved.iter().collect();
        for field in fields {
            if let Some(value) = self.values[field].take() {
                if object.set(field, value).is_ok() {
                    loaded.insert(field);
                    restored.insert(field);
                }
            }
            self.saved.remove(field);
        }

        let unloaded = std::mem::take(&mut self.unloaded);
        for field in unloaded.iter() {
            if object.set(field, FieldValue::Null).is_ok() {
                loaded.remove(field);
            }
        }
        restored
    }

    /// Compare the saved original of `field` with `current`. Unsaved fields
    /// are never equal.
    pub fn is_field_equal(&self, field: usize, current: &FieldValue) -> bool {
        match self.values.get(field) {
            Some(Some(saved)) => saved == current,
            _ => false,
        }
    }

    pub fn is_saved(&self, field: usize) -> bool {
        self.saved.contains(field)
    }

    pub fn is_unloaded(&self, field: usize) -> bool {
        self.unloaded.contains(field)
    }

    pub fn saved_fields(&self) -> &FieldSet {
        &self.saved
    }

    pub fn unloaded_fields(&self) -> &FieldSet {
        &self.unloaded
    }

    pub fn policy(&self) -> RestoreState {
        self.policy
    }
}
