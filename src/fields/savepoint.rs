use super::CopyRegistry;
use crate::context::StateManager;
use crate::core::{FieldSet, FieldValue, KernelError, Result, Version};
use crate::state::PcState;
use std::sync::Arc;

/// Captured handle of a live mutable value and its change count at capture.
#[derive(Debug, Clone)]
struct LiveValue {
    value: FieldValue,
    changes: u64,
    was_tracking: bool,
}

/// Eager snapshot of one instance taken when a savepoint is set.
///
/// Every loaded field is copied. Live mutable values get change tracking
/// switched on so a rollback can tell which of them were touched without
/// intercepting each mutation.
#[derive(Debug, Clone)]
pub struct SavepointFieldManager {
    state: PcState,
    loaded: FieldSet,
    dirty: FieldSet,
    flushed: FieldSet,
    version: Option<Version>,
    load_version: Option<Version>,
    flushed_flag: bool,
    flushed_dirty_flag: bool,
    values: Vec<Option<FieldValue>>,
    live: Vec<Option<LiveValue>>,
    registry: Arc<CopyRegistry>,
}

impl SavepointFieldManager {
    pub fn capture(sm: &StateManager, registry: Arc<CopyRegistry>) -> Result<Self> {
        let object = sm.object();
        let count = object.values.len();
        let mut values = vec![None; count];
        let mut live = vec![None; count];

        for field in sm.loaded().iter() {
            let Some(current) = object.get(field) else {
                continue;
            };
            let mutable = current.kind().map(|k| k.is_mutable()).unwrap_or(false);
            if !mutable {
                values[field] = Some(current.clone());
                continue;
            }

            let copy = registry.copy(current).ok_or_else(|| KernelError::UnsupportedCopy {
                field: object
                    .class
                    .field_meta(field)
                    .map(|m| m.name.clone())
                    .unwrap_or_else(|| field.to_string()),
                type_name: current.type_name().to_string(),
            })?;
            values[field] = Some(copy);

            let was_tracking = current.is_tracking();
            current.set_tracking(true);
            live[field] = Some(LiveValue {
                value: current.clone(),
                changes: current.change_count().unwrap_or(0),
                was_tracking,
            });
        }

        let flags = sm.flags();
        Ok(Self {
            state: sm.state(),
            loaded: sm.loaded().clone(),
            dirty: sm.dirty().clone(),
            flushed: sm.flushed_fields().clone(),
            version: sm.version(),
            load_version: sm.load_version(),
            flushed_flag: flags.flushed,
            flushed_dirty_flag: flags.flushed_dirty,
            values,
            live,
            registry,
        })
    }

    pub fn state(&self) -> PcState {
        self.state
    }

    pub fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Whether `field` must be written back on rollback given its current
    /// value. A mutable value still held by the instance and untouched since
    /// capture is left alone.
    pub fn needs_restore(&self, field: usize, current: Option<&FieldValue>) -> bool {
        if self.values.get(field).map(|v| v.is_none()).unwrap_or(true) {
            return false;
        }
        match (self.live.get(field).and_then(|l| l.as_ref()), current) {
            (Some(live), Some(current)) => {
                !(live.value.same_handle(current)
                    && current.change_count() == Some(live.changes))
            }
            _ => true,
        }
    }

    /// Roll `sm` back to the captured state. The snapshot is copied again on
    /// every call, so the same savepoint can be restored repeatedly.
    pub fn restore(&self, sm: &mut StateManager) -> FieldSet {
        let mut restored = FieldSet::new();
        for field in 0..sm.object.values.len() {
            if !self.loaded.contains(field) {
                sm.object.values[field] = FieldValue::Null;
                continue;
            }
            if !self.needs_restore(field, sm.object.get(field)) {
                continue;
            }
            let Some(Some(snapshot)) = self.values.get(field) else {
                continue;
            };
            let value = match self.registry.copy(snapshot) {
                Some(copy) => copy,
                None => continue,
            };
            if self.live[field].is_some() {
                value.set_tracking(true);
            }
            sm.object.values[field] = value;
            restored.insert(field);
        }

        sm.state = self.state;
        sm.loaded = self.loaded.clone();
        sm.dirty = self.dirty.clone();
        sm.flushed = self.flushed.clone();
        sm.version = self.version;
        sm.load_version = self.load_version;
        sm.flags.flushed = self.flushed_flag;
        sm.flags.flushed_dirty = self.flushed_dirty_flag;
        restored
    }

    /// Switch tracking back off on values that were untracked before capture.
    pub fn release(&self) {
        for live in self.live.iter().flatten() {
            if !live.was_tracking {
                live.value.set_tracking(false);
            }
        }
    }
}
