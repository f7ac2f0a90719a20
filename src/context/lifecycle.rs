use super::{ExtentIterator, LifecycleEvent, PersistenceContext};
use crate::cache::{CacheKey, StateLookup};
use crate::core::{
    FieldSet, FieldValue, InstanceId, KernelError, ManagedObject, ObjectId, Result,
};
use crate::fields::CopyRegistry;
use crate::state::{Event, PcState};
use crate::store::{LoadedRecord, StoredValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Identity taken from a single integer or text primary key. Anything else
/// gets a temporary id until the store assigns one at flush.
pub(crate) fn identity_of(object: &ManagedObject) -> ObjectId {
    let keys: Vec<usize> = object.class.primary_key_fields().collect();
    if let [field] = keys.as_slice() {
        match object.get(*field) {
            Some(FieldValue::Integer(v)) => return ObjectId::Long(*v),
            Some(FieldValue::Text(v)) => return ObjectId::Text(v.clone()),
            _ => {}
        }
    }
    ObjectId::temporary()
}

fn key_value(oid: &ObjectId) -> Option<FieldValue> {
    match oid {
        ObjectId::Long(v) => Some(FieldValue::Integer(*v)),
        ObjectId::Text(v) => Some(FieldValue::Text(v.clone())),
        ObjectId::Temp(_) => None,
    }
}

/// Copies of the loaded fields, compared against at dirty check.
pub(crate) fn baseline_of(
    object: &ManagedObject,
    loaded: &FieldSet,
    registry: &CopyRegistry,
) -> Vec<Option<FieldValue>> {
    (0..object.values.len())
        .map(|field| {
            if loaded.contains(field) {
                object.get(field).and_then(|v| registry.copy(v))
            } else {
                None
            }
        })
        .collect()
}

impl PersistenceContext {
    pub(crate) fn allocate(
        &mut self,
        object: ManagedObject,
        object_id: ObjectId,
        loaded: FieldSet,
    ) -> InstanceId {
        self.next_id += 1;
        let id = InstanceId(self.next_id);
        let mut sm = super::StateManager::new(id, object, object_id);
        sm.loaded = loaded;
        self.instances.insert(id, sm);
        id
    }

    fn require_write(&self) -> Result<()> {
        if self.active || self.config.nontransactional_write {
            Ok(())
        } else {
            Err(KernelError::NoTransaction)
        }
    }

    fn field_index(&self, id: InstanceId, field: &str) -> Result<usize> {
        self.sm(id)?.object.index_of(field)
    }

    // ------------------------------------------------------------------------
    // Persist / delete
    // ------------------------------------------------------------------------

    /// Make `object` persistent and return its handle.
    pub fn persist(&mut self, object: ManagedObject) -> Result<InstanceId> {
        self.require_write()?;
        let count = object.values.len();
        let oid = identity_of(&object);
        let id = self.allocate(object, oid, FieldSet::full(count));
        if let Err(err) = self.persist_instance(id) {
            if self.state(id).map(|s| s == PcState::Transient).unwrap_or(false) {
                self.instances.remove(&id);
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Hand out a handle for an unmanaged object. It becomes managed through
    /// `persist_instance`, `transactional` or by being reachable at flush.
    pub fn transient(&mut self, object: ManagedObject) -> InstanceId {
        let count = object.values.len();
        let oid = identity_of(&object);
        self.allocate(object, oid, FieldSet::full(count))
    }

    /// Persist an instance that already has a handle. Persisting a deleted
    /// instance revives it; persisting a persistent one is a no-op.
    pub fn persist_instance(&mut self, id: InstanceId) -> Result<()> {
        self.require_write()?;
        let sm = self.sm(id)?;
        let state = sm.state;
        if state.is_persistent() || state.is_embedded() {
            self.apply(id, Event::Persist)?;
            return Ok(());
        }

        let key = sm.cache_key.clone();
        if !key.is_temporary() {
            let existing = self
                .cache
                .read(|c| c.get_by_id(&key, true, &self.instances))
                .filter(|e| *e != id && !self.instances.is_deleted(*e));
            if let Some(existing) = existing {
                return Err(KernelError::DuplicateObjectId {
                    object_id: key.id,
                    existing: self.instances.describe(existing),
                    attempted: sm.describe(),
                });
            }
        }

        self.fire_for(LifecycleEvent::BeforePersist, id)?;
        if state == PcState::Transient {
            let sm = self.sm_mut(id)?;
            sm.loaded = FieldSet::full(sm.object.values.len());
        }
        if self.active {
            self.apply(id, Event::Persist)?;
        } else {
            self.enter(id, PcState::PNonTransNew)?;
        }
        self.fire_for(LifecycleEvent::AfterPersist, id)
    }

    /// Delete `id` together with the embedded instances it owns.
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        if self.sm(id)?.state.is_persistent() {
            self.require_write()?;
        }
        let owned: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|sm| {
                sm.owner.map(|(owner, _)| owner) == Some(id)
                    && sm.state.is_embedded()
                    && !sm.state.is_deleted()
            })
            .map(|sm| sm.id)
            .collect();

        self.apply(id, Event::Delete)?;
        for child in owned {
            self.apply(child, Event::Delete)?;
        }
        self.fire_for(LifecycleEvent::AfterDelete, id)
    }

    pub fn transactional(&mut self, id: InstanceId) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        self.apply(id, Event::Transactional).map(|_| ())
    }

    pub fn nontransactional(&mut self, id: InstanceId) -> Result<()> {
        self.apply(id, Event::Nontransactional).map(|_| ())
    }

    /// Stop managing `id`; its values stay with the handle.
    pub fn release(&mut self, id: InstanceId) -> Result<()> {
        self.apply(id, Event::Release).map(|_| ())
    }

    /// Unload `id` so its fields are read again from the store.
    pub fn evict(&mut self, id: InstanceId) -> Result<()> {
        self.apply(id, Event::Evict).map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Lookup and loading
    // ------------------------------------------------------------------------

    /// Find the instance stored under `oid`, loading it when not cached.
    /// Instances deleted in this context are not found.
    pub fn find(&mut self, class: &str, oid: &ObjectId) -> Result<Option<InstanceId>> {
        let key = CacheKey::new(class, oid.clone());
        let cached = self
            .cache
            .read(|c| c.get_by_id(&key, true, &self.instances));
        if let Some(id) = cached {
            if self.sm(id)?.state.is_deleted() {
                return Ok(None);
            }
            self.before_read(id)?;
            self.load_missing(id)?;
            return Ok(Some(id));
        }

        if !self.active && !self.config.nontransactional_read {
            return Err(KernelError::NoTransaction);
        }
        let Some(record) = self.store.find(class, oid)? else {
            return Ok(None);
        };
        let id = self.materialize(oid, record)?;
        self.before_read(id)?;
        self.load_missing(id)?;
        Ok(Some(id))
    }

    fn materialize(&mut self, oid: &ObjectId, record: LoadedRecord) -> Result<InstanceId> {
        let count = record.class.field_count();
        let object = ManagedObject::new(Arc::clone(&record.class));
        let id = self.allocate(object, oid.clone(), FieldSet::new());
        if let Err(err) = self.enter(id, PcState::Hollow) {
            self.discard(id);
            return Err(err);
        }
        let sm = self.sm_mut(id)?;
        sm.version = Some(record.version);
        sm.load_version = Some(record.version);
        self.load_into(id, &record.values, &FieldSet::full(count))?;
        event!(Level::DEBUG, instance = %id, oid = %oid, version = %record.version, "loaded from store");
        Ok(id)
    }

    /// Handle for `oid` without loading it. The instance is hollow until a
    /// field is read.
    pub fn reference(&mut self, class: &str, oid: &ObjectId) -> Result<InstanceId> {
        let key = CacheKey::new(class, oid.clone());
        if let Some(id) = self
            .cache
            .read(|c| c.get_by_id(&key, true, &self.instances))
        {
            return Ok(id);
        }

        let meta = self
            .store
            .class_meta(class)
            .ok_or_else(|| KernelError::Store(format!("Unknown class '{}'", class)))?;
        let mut object = ManagedObject::new(meta);
        let mut loaded = FieldSet::new();
        let keys: Vec<usize> = object.class.primary_key_fields().collect();
        if let ([pk], Some(value)) = (keys.as_slice(), key_value(oid)) {
            object.set(*pk, value)?;
            loaded.insert(*pk);
        }

        let id = self.allocate(object, oid.clone(), loaded);
        if let Err(err) = self.enter(id, PcState::Hollow) {
            self.discard(id);
            return Err(err);
        }
        Ok(id)
    }

    pub(crate) fn before_read(&mut self, id: InstanceId) -> Result<()> {
        let state = self.sm(id)?.state;
        if !state.is_persistent() {
            return Ok(());
        }
        let event = if !self.active {
            if !self.config.nontransactional_read {
                return Err(KernelError::NoTransaction);
            }
            Event::BeforeNontransactionalRead
        } else if self.config.optimistic {
            Event::BeforeOptimisticRead
        } else {
            Event::BeforeRead
        };
        let next = self.apply(id, event)?;
        if self.active && next.is_transactional() {
            self.lock_at(id, self.config.read_lock_level)?;
        }
        Ok(())
    }

    pub(crate) fn ensure_loaded(&mut self, id: InstanceId, field: usize) -> Result<()> {
        if self.sm(id)?.loaded.contains(field) {
            return Ok(());
        }
        self.load_missing(id)
    }

    /// Load every unloaded field of a persistent instance from the store.
    pub(crate) fn load_missing(&mut self, id: InstanceId) -> Result<()> {
        let sm = self.sm(id)?;
        let state = sm.state;
        if !state.is_persistent() || state.is_new() || state.is_embedded() {
            return Ok(());
        }
        let mut missing = FieldSet::full(sm.object.values.len());
        missing.difference_with(&sm.loaded);
        if missing.is_empty() {
            return Ok(());
        }

        let class = sm.class_name().to_string();
        let oid = sm.object_id.clone();
        let failed = sm.failed_object();
        let record = self
            .store
            .load(&class, &oid, &missing)?
            .ok_or(KernelError::ObjectNotFound(failed))?;
        self.load_into(id, &record.values, &missing)?;

        let sm = self.sm_mut(id)?;
        let untouched = sm.dirty.is_empty()
            && !sm.flags.flushed
            && !sm.flags.version_check
            && !sm.flags.version_update;
        if sm.version.is_none() || untouched {
            sm.version = Some(record.version);
            sm.load_version = Some(record.version);
        }
        event!(Level::TRACE, instance = %id, fields = missing.len(), "fields loaded");
        Ok(())
    }

    pub(crate) fn load_into(
        &mut self,
        id: InstanceId,
        values: &[StoredValue],
        fields: &FieldSet,
    ) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        for field in fields.iter() {
            let Some(stored) = values.get(field) else {
                continue;
            };
            let value = self.materialize_value(id, field, stored)?;
            let sm = self.sm_mut(id)?;
            if let Some(baseline) = sm.baseline.as_mut() {
                if let Some(slot) = baseline.get_mut(field) {
                    *slot = registry.copy(&value);
                }
            }
            sm.object.set(field, value)?;
            sm.loaded.insert(field);
        }
        Ok(())
    }

    fn materialize_value(
        &mut self,
        owner: InstanceId,
        field: usize,
        value: &StoredValue,
    ) -> Result<FieldValue> {
        Ok(match value {
            StoredValue::Null => FieldValue::Null,
            StoredValue::Boolean(v) => FieldValue::Boolean(*v),
            StoredValue::Integer(v) => FieldValue::Integer(*v),
            StoredValue::Float(v) => FieldValue::Float(*v),
            StoredValue::Text(v) => FieldValue::Text(v.clone()),
            StoredValue::Date(v) => FieldValue::date(*v),
            StoredValue::Array(items) => {
                FieldValue::array(self.materialize_all(owner, field, items)?)
            }
            StoredValue::List(items) => FieldValue::list(self.materialize_all(owner, field, items)?),
            StoredValue::Set(items) => FieldValue::set(self.materialize_all(owner, field, items)?),
            StoredValue::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, entry) in entries {
                    map.insert(key.clone(), self.materialize_value(owner, field, entry)?);
                }
                FieldValue::map(map)
            }
            StoredValue::Object { type_name, data } => FieldValue::object(type_name, data.clone()),
            StoredValue::Ref { class, object_id } => {
                FieldValue::Managed(self.reference(class, object_id)?)
            }
            StoredValue::Embedded { class, values } => {
                FieldValue::Managed(self.load_embedded(owner, field, class, values)?)
            }
        })
    }

    fn materialize_all(
        &mut self,
        owner: InstanceId,
        field: usize,
        items: &[StoredValue],
    ) -> Result<Vec<FieldValue>> {
        items
            .iter()
            .map(|item| self.materialize_value(owner, field, item))
            .collect()
    }

    fn load_embedded(
        &mut self,
        owner: InstanceId,
        field: usize,
        class: &str,
        values: &[StoredValue],
    ) -> Result<InstanceId> {
        let meta = self
            .store
            .class_meta(class)
            .ok_or_else(|| KernelError::Store(format!("Unknown class '{}'", class)))?;
        let count = meta.field_count();
        let id = self.allocate(ManagedObject::new(meta), ObjectId::temporary(), FieldSet::new());
        self.sm_mut(id)?.owner = Some((owner, field));
        self.load_into(id, values, &FieldSet::full(count))?;
        let state = if self.active {
            PcState::EClean
        } else {
            PcState::ENonTrans
        };
        self.enter(id, state)?;
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------------

    /// Read a field, loading it first if needed. Mutable payloads are shared
    /// with the managed instance; change them through `mutate_field`.
    pub fn read_field(&mut self, id: InstanceId, field: &str) -> Result<FieldValue> {
        let index = self.field_index(id, field)?;
        self.before_read(id)?;
        self.ensure_loaded(id, index)?;
        Ok(self
            .sm(id)?
            .object
            .get(index)
            .cloned()
            .unwrap_or(FieldValue::Null))
    }

    pub fn write_field(&mut self, id: InstanceId, field: &str, value: FieldValue) -> Result<()> {
        let index = self.field_index(id, field)?;
        self.write_field_at(id, index, value)
    }

    pub(crate) fn write_field_at(
        &mut self,
        id: InstanceId,
        index: usize,
        value: FieldValue,
    ) -> Result<()> {
        let managed = self.before_write(id, index, false)?;
        let sm = self.sm_mut(id)?;
        sm.object.set(index, value)?;
        if managed {
            sm.mark_dirty(index);
            self.propagate_to_owner(id)?;
        } else {
            sm.loaded.insert(index);
        }
        Ok(())
    }

    /// Change a mutable field in place. `f` gets the live value; the
    /// original is saved for rollback before `f` runs.
    pub fn mutate_field<R>(
        &mut self,
        id: InstanceId,
        field: &str,
        f: impl FnOnce(&FieldValue) -> R,
    ) -> Result<R> {
        let index = self.field_index(id, field)?;
        self.ensure_loaded(id, index)?;
        let managed = self.before_write(id, index, true)?;
        let value = self
            .sm(id)?
            .object
            .get(index)
            .cloned()
            .unwrap_or(FieldValue::Null);
        let result = f(&value);
        if managed {
            self.sm_mut(id)?.mark_dirty(index);
            self.propagate_to_owner(id)?;
        }
        Ok(result)
    }

    /// Transition for a write and save the field's original value. Returns
    /// false for unmanaged instances, whose writes are not tracked.
    pub(super) fn before_write(&mut self, id: InstanceId, index: usize, mutate: bool) -> Result<bool> {
        let state = self.sm(id)?.state;
        if matches!(state, PcState::Transient | PcState::ECopy) {
            return Ok(false);
        }
        if state.is_persistent() && !self.active && !self.config.nontransactional_write {
            return Err(KernelError::NoTransaction);
        }

        let event = if !self.active {
            Event::BeforeNontransactionalWrite { mutate }
        } else if self.config.optimistic {
            Event::BeforeOptimisticWrite { mutate }
        } else {
            Event::BeforeWrite { mutate }
        };
        let next = self.apply(id, event)?;
        if self.active && next.is_persistent() {
            self.lock_at(id, self.config.write_lock_level)?;
        }

        let sm = self.sm_mut(id)?;
        if let Some(saved) = sm.saved.as_mut() {
            saved.save_field(index, &sm.object, &sm.loaded);
        }
        Ok(true)
    }

    /// A change to an embedded instance dirties the owner's field too.
    fn propagate_to_owner(&mut self, id: InstanceId) -> Result<()> {
        let Some((owner, field)) = self.sm(id)?.owner else {
            return Ok(());
        };
        if !self.instances.contains_key(&owner) {
            return Ok(());
        }
        if self.before_write(owner, field, true)? {
            self.sm_mut(owner)?.mark_dirty(field);
            self.propagate_to_owner(owner)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Field interception
    // ------------------------------------------------------------------------

    /// Switch field interception for `id`. Without it, changes made through
    /// `untracked_object_mut` are found by comparing against a baseline at
    /// flush.
    pub fn set_intercepting(&mut self, id: InstanceId, on: bool) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let sm = self.sm_mut(id)?;
        if sm.flags.intercepting == on {
            return Ok(());
        }
        sm.flags.intercepting = on;
        if on {
            sm.baseline = None;
        } else {
            sm.baseline = Some(baseline_of(&sm.object, &sm.loaded, &registry));
            // Writes will not be seen until flush, so originals are saved now.
            if let Some(saved) = sm.saved.as_mut() {
                for field in sm.loaded.iter() {
                    saved.save_field(field, &sm.object, &sm.loaded);
                }
            }
        }

        let state = sm.state;
        let key = sm.cache_key.clone();
        if !matches!(state, PcState::Transient | PcState::ECopy) {
            self.cache.with(|c| {
                c.remove(id, &key);
                c.add(id, &self.instances)
            })?;
        }
        Ok(())
    }

    /// Direct access to a non-intercepting instance's values.
    pub fn untracked_object_mut(&mut self, id: InstanceId) -> Option<&mut ManagedObject> {
        self.instances
            .get_mut(&id)
            .filter(|sm| !sm.flags.intercepting)
            .map(|sm| &mut sm.object)
    }

    // ------------------------------------------------------------------------
    // Embedded instances
    // ------------------------------------------------------------------------

    /// Store `object` inline in `owner`'s `field`, replacing and deleting the
    /// embedded instance held there before.
    pub fn embed(&mut self, owner: InstanceId, field: &str, object: ManagedObject) -> Result<InstanceId> {
        let index = self.field_index(owner, field)?;
        self.embed_at(owner, index, object)
    }

    pub(crate) fn embed_at(
        &mut self,
        owner: InstanceId,
        index: usize,
        object: ManagedObject,
    ) -> Result<InstanceId> {
        let previous = self
            .sm(owner)?
            .object
            .get(index)
            .and_then(|v| v.as_managed());

        let count = object.values.len();
        let id = self.allocate(object, ObjectId::temporary(), FieldSet::full(count));
        self.sm_mut(id)?.owner = Some((owner, index));
        let state = if self.active {
            PcState::EClean
        } else {
            PcState::ENonTrans
        };
        if let Err(err) = self.enter(id, state) {
            self.discard(id);
            return Err(err);
        }
        if let Err(err) = self.write_field_at(owner, index, FieldValue::Managed(id)) {
            self.discard(id);
            return Err(err);
        }

        if let Some(old) = previous {
            let owned = self
                .instances
                .get(&old)
                .map(|sm| {
                    sm.owner == Some((owner, index))
                        && sm.state.is_embedded()
                        && sm.state != PcState::ECopy
                        && !sm.state.is_deleted()
                })
                .unwrap_or(false);
            if owned {
                self.apply(old, Event::Delete)?;
            }
        }
        Ok(id)
    }

    /// Unowned deep copy of `id`, for handing values across owners.
    /// Fields that cannot be copied are left unloaded.
    pub fn embedded_copy(&mut self, id: InstanceId) -> Result<InstanceId> {
        self.load_missing(id)?;
        let sm = self.sm(id)?;
        let mut object = ManagedObject::new(Arc::clone(&sm.object.class));
        let mut loaded = FieldSet::new();
        for field in sm.loaded.iter() {
            let copy = sm.object.get(field).and_then(|v| self.registry.copy(v));
            if let (Some(copy), Some(slot)) = (copy, object.values.get_mut(field)) {
                *slot = copy;
                loaded.insert(field);
            }
        }
        let copy = self.allocate(object, ObjectId::temporary(), loaded);
        self.enter(copy, PcState::ECopy)?;
        Ok(copy)
    }

    // ------------------------------------------------------------------------
    // Extents
    // ------------------------------------------------------------------------

    /// Iterate the persistent, non-deleted instances of `class` managed by
    /// this context, in handle order.
    pub fn extent(&self, class: &str) -> ExtentIterator {
        let ids = self
            .instances
            .values()
            .filter(|sm| {
                sm.class_name() == class
                    && sm.state.is_persistent()
                    && !sm.state.is_embedded()
                    && !sm.state.is_deleted()
            })
            .map(|sm| sm.id)
            .collect();
        ExtentIterator::new(ids, self.extents.register())
    }

    /// Close every extent iterator still open. Returns how many were closed.
    pub fn close_all_extents(&self) -> usize {
        let closed = self.extents.close_all();
        event!(Level::DEBUG, context = %self.uuid, closed, "extents closed");
        closed
    }

    pub fn open_extents(&self) -> usize {
        self.extents.open_count()
    }
}
