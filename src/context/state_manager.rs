use crate::cache::CacheKey;
use crate::core::{FailedObject, FieldSet, FieldValue, InstanceId, ManagedObject, ObjectId, Version};
use crate::fields::SaveFieldManager;
use crate::lock::LockLevel;
use crate::state::{PcState, TransitionFlags};

/// Per-instance bookkeeping flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmFlags {
    /// Flushed at least once in the current transaction.
    pub flushed: bool,
    /// Written again after the last flush.
    pub flushed_dirty: bool,
    /// Verify the version at flush even if unchanged (read lock).
    pub version_check: bool,
    /// Increment the version at flush even if unchanged (write lock).
    pub version_update: bool,
    /// The store has assigned the permanent object id.
    pub oid_assigned: bool,
    /// Field writes go through the context; otherwise found by dirty check.
    pub intercepting: bool,
}

impl Default for SmFlags {
    fn default() -> Self {
        Self {
            flushed: false,
            flushed_dirty: false,
            version_check: false,
            version_update: false,
            oid_assigned: false,
            intercepting: true,
        }
    }
}

impl SmFlags {
    /// Reset everything that is scoped to one transaction.
    pub fn end_transaction(&mut self) {
        self.flushed = false;
        self.flushed_dirty = false;
        self.version_check = false;
        self.version_update = false;
    }
}

/// Owns the data and lifecycle bookkeeping of one managed instance.
#[derive(Debug, Clone)]
pub struct StateManager {
    pub(crate) id: InstanceId,
    pub(crate) object: ManagedObject,
    pub(crate) state: PcState,
    pub(crate) object_id: ObjectId,
    /// Key the managed cache currently files this instance under.
    pub(crate) cache_key: CacheKey,
    pub(crate) version: Option<Version>,
    pub(crate) load_version: Option<Version>,
    pub(crate) loaded: FieldSet,
    pub(crate) dirty: FieldSet,
    pub(crate) flushed: FieldSet,
    pub(crate) flags: SmFlags,
    pub(crate) lock_level: LockLevel,
    pub(crate) saved: Option<SaveFieldManager>,
    /// Owning instance and field of an embedded instance. Never owns.
    pub(crate) owner: Option<(InstanceId, usize)>,
    /// Dirty-check reference values for non-intercepting instances.
    pub(crate) baseline: Option<Vec<Option<FieldValue>>>,
}

impl StateManager {
    pub(crate) fn new(id: InstanceId, object: ManagedObject, object_id: ObjectId) -> Self {
        let cache_key = CacheKey::new(&object.class.name, object_id.clone());
        Self {
            id,
            object,
            state: PcState::Transient,
            cache_key,
            object_id,
            version: None,
            load_version: None,
            loaded: FieldSet::new(),
            dirty: FieldSet::new(),
            flushed: FieldSet::new(),
            flags: SmFlags::default(),
            lock_level: LockLevel::None,
            saved: None,
            owner: None,
            baseline: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn object(&self) -> &ManagedObject {
        &self.object
    }

    pub fn class_name(&self) -> &str {
        &self.object.class.name
    }

    pub fn state(&self) -> PcState {
        self.state
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn load_version(&self) -> Option<Version> {
        self.load_version
    }

    pub fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    pub fn flushed_fields(&self) -> &FieldSet {
        &self.flushed
    }

    pub fn flags(&self) -> SmFlags {
        self.flags
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock_level
    }

    pub fn owner(&self) -> Option<(InstanceId, usize)> {
        self.owner
    }

    pub fn saved_fields(&self) -> Option<&SaveFieldManager> {
        self.saved.as_ref()
    }

    pub fn is_loaded(&self, field: usize) -> bool {
        self.loaded.contains(field)
    }

    pub fn is_intercepting(&self) -> bool {
        self.flags.intercepting
    }

    pub fn is_new(&self) -> bool {
        self.state.is_new()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    pub fn is_persistent(&self) -> bool {
        self.state.is_persistent()
    }

    pub fn is_transactional(&self) -> bool {
        self.state.is_transactional()
    }

    pub fn is_embedded(&self) -> bool {
        self.state.is_embedded()
    }

    /// Unflushed changes exist.
    pub fn has_unflushed_changes(&self) -> bool {
        self.dirty.iter().any(|f| !self.flushed.contains(f))
    }

    pub fn transition_flags(&self, auto_clear_all: bool, active: bool) -> TransitionFlags {
        TransitionFlags {
            flushed: self.flags.flushed,
            flushed_dirty: self.flags.flushed_dirty,
            has_dirty_fields: !self.dirty.is_empty(),
            auto_clear_all,
            active,
        }
    }

    pub fn is_version_check_required(&self) -> bool {
        self.state
            .is_version_check_required(&self.transition_flags(false, true))
    }

    /// Record a change to `field`.
    pub(crate) fn mark_dirty(&mut self, field: usize) {
        self.loaded.insert(field);
        self.dirty.insert(field);
        if self.flags.flushed {
            self.flags.flushed_dirty = true;
            self.flushed.remove(field);
        }
    }

    /// Unload every field except the primary key.
    pub(crate) fn clear_fields(&mut self) {
        let keys: Vec<usize> = self.object.class.primary_key_fields().collect();
        for field in 0..self.object.values.len() {
            if keys.contains(&field) {
                continue;
            }
            self.object.values[field] = FieldValue::Null;
            self.loaded.remove(field);
        }
    }

    pub(crate) fn set_tracking(&self, on: bool) {
        for field in self.loaded.iter() {
            if let Some(value) = self.object.get(field) {
                value.set_tracking(on);
            }
        }
    }

    /// Error payload naming this instance. Temporary ids are left out.
    pub fn failed_object(&self) -> FailedObject {
        FailedObject::Managed {
            instance: self.id,
            object_id: (!self.object_id.is_temporary()).then(|| self.object_id.clone()),
        }
    }

    /// Identity string used in error messages.
    pub fn describe(&self) -> String {
        format!("{}[{}, {}]", self.object.class.name, self.id, self.object_id)
    }
}
