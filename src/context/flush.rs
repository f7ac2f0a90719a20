use super::PersistenceContext;
use super::lifecycle::baseline_of;
use crate::cache::CacheKey;
use crate::core::{
    AggregateError, FailedObject, FieldValue, InstanceId, KernelError, ObjectId, Result, Version,
};
use crate::state::{Event, PcState};
use crate::store::{FlushOp, StoredValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event, info_span};

use super::LifecycleEvent;

/// One failure is returned as is; several are wrapped in an aggregate.
pub(crate) fn collect_failures(
    mut failures: Vec<(FailedObject, KernelError)>,
    attempted: usize,
) -> KernelError {
    if failures.len() == 1 {
        if let Some((_, err)) = failures.pop() {
            return err;
        }
    }
    KernelError::Aggregate(AggregateError {
        attempted,
        failures,
        results: Vec::new(),
    })
}

/// Store conflicts name the record; callers want the managed instance.
fn attribute(err: KernelError, failed: FailedObject) -> KernelError {
    match err {
        KernelError::OptimisticConflict { message, .. } => {
            KernelError::OptimisticConflict { failed, message }
        }
        other => other,
    }
}

fn collect_references(value: &FieldValue, out: &mut Vec<InstanceId>) {
    match value {
        FieldValue::Managed(id) => out.push(*id),
        FieldValue::Array(items) | FieldValue::List(items) | FieldValue::Set(items) => {
            for item in items.read().iter() {
                collect_references(item, out);
            }
        }
        FieldValue::Map(entries) => {
            for entry in entries.read().values() {
                collect_references(entry, out);
            }
        }
        _ => {}
    }
}

impl PersistenceContext {
    /// Write pending changes of the active transaction to the store.
    pub fn flush(&mut self) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        if let Some(savepoint) = self.savepoints.last() {
            return Err(KernelError::SavepointActive(savepoint.name.clone()));
        }
        let span = info_span!("context.flush", context = %self.uuid);
        let _enter = span.enter();
        self.flush_internal()
    }

    pub(crate) fn flush_internal(&mut self) -> Result<()> {
        self.dirty_check()?;
        self.persist_reachable()?;

        let ids: Vec<InstanceId> = self.transactional.iter().copied().collect();
        for id in &ids {
            self.apply(*id, Event::BeforeFlush { logical: false })?;
        }

        // Identities first, so references to new instances can be written.
        let mut failures: Vec<(FailedObject, KernelError)> = Vec::new();
        for id in &ids {
            let sm = self.sm(*id)?;
            if sm.state == PcState::PNew && !sm.flags.flushed && !sm.flags.oid_assigned {
                if let Err(err) = self.assign_identity(*id) {
                    failures.push((self.sm(*id)?.failed_object(), err));
                }
            }
        }
        if !failures.is_empty() {
            let attempted = failures.len();
            return Err(collect_failures(failures, attempted));
        }

        let mut plan: Vec<(InstanceId, bool)> = Vec::new();
        let mut ops = Vec::new();
        for id in &ids {
            if let Some(op) = self.delete_op(*id)? {
                plan.push((*id, true));
                ops.push(op);
            }
        }
        for id in &ids {
            if let Some(op) = self.write_op(*id)? {
                plan.push((*id, false));
                ops.push(op);
            }
        }
        if ops.is_empty() {
            return Ok(());
        }

        let attempted = ops.len();
        event!(Level::DEBUG, context = %self.uuid, ops = attempted, "flushing");
        let outcomes = self.store.flush(self.uuid, ops);
        for ((id, delete), outcome) in plan.into_iter().zip(outcomes) {
            match outcome {
                Ok(version) => self.after_flush(id, delete, version)?,
                Err(err) => {
                    let failed = self.sm(id)?.failed_object();
                    event!(Level::DEBUG, instance = %id, error = %err, "flush op failed");
                    failures.push((failed.clone(), attribute(err, failed)));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(collect_failures(failures, attempted))
        }
    }

    /// Compare non-intercepting instances against their baseline and record
    /// what changed as ordinary writes.
    fn dirty_check(&mut self) -> Result<()> {
        let untracked = self.cache.read(|c| c.untracked());
        for id in untracked {
            let Some(sm) = self.instances.get(&id) else {
                continue;
            };
            let Some(baseline) = sm.baseline.as_ref() else {
                continue;
            };
            let changed: Vec<usize> = sm
                .loaded
                .iter()
                .filter(|f| match (baseline.get(*f), sm.object.get(*f)) {
                    (Some(Some(before)), Some(now)) => before != now,
                    _ => false,
                })
                .collect();
            if changed.is_empty() {
                continue;
            }

            event!(Level::TRACE, instance = %id, fields = changed.len(), "dirty check found changes");
            for field in changed {
                if self.before_write(id, field, true)? {
                    self.sm_mut(id)?.mark_dirty(field);
                }
            }
            let registry = Arc::clone(&self.registry);
            let sm = self.sm_mut(id)?;
            sm.baseline = Some(baseline_of(&sm.object, &sm.loaded, &registry));
        }
        Ok(())
    }

    /// Transient instances referenced from new or dirty ones are persisted
    /// provisionally, then made permanent for this flush.
    fn persist_reachable(&mut self) -> Result<()> {
        let mut pending: Vec<InstanceId> = self
            .transactional
            .iter()
            .copied()
            .filter(|id| {
                self.instances
                    .get(id)
                    .map(|sm| matches!(sm.state, PcState::PNew | PcState::PDirty))
                    .unwrap_or(false)
            })
            .collect();

        while let Some(id) = pending.pop() {
            let mut targets = Vec::new();
            let sm = self.sm(id)?;
            for field in sm.loaded.iter() {
                if let Some(value) = sm.object.get(field) {
                    collect_references(value, &mut targets);
                }
            }
            for target in targets {
                let transient = self
                    .instances
                    .get(&target)
                    .map(|sm| sm.state == PcState::Transient)
                    .unwrap_or(false);
                if !transient {
                    continue;
                }
                self.enter(target, PcState::PNewProvisional)?;
                self.apply(target, Event::Nonprovisional { logical: true })?;
                event!(Level::DEBUG, instance = %target, from = %id, "persisted by reachability");
                pending.push(target);
            }
        }
        Ok(())
    }

    fn assign_identity(&mut self, id: InstanceId) -> Result<()> {
        let sm = self.sm(id)?;
        let oid = self.store.assign_object_id(&sm.object)?;
        let old_key = sm.cache_key.clone();
        let old_oid = sm.object_id.clone();

        let sm = self.sm_mut(id)?;
        let keys: Vec<usize> = sm.object.class.primary_key_fields().collect();
        if let [pk] = keys.as_slice() {
            let unset = sm.object.get(*pk).map(|v| v.is_null()).unwrap_or(false);
            let value = match &oid {
                ObjectId::Long(v) => Some(FieldValue::Integer(*v)),
                ObjectId::Text(v) => Some(FieldValue::Text(v.clone())),
                ObjectId::Temp(_) => None,
            };
            if let (true, Some(value)) = (unset, value) {
                sm.object.set(*pk, value)?;
            }
        }
        sm.cache_key = CacheKey::new(&sm.object.class.name, oid.clone());
        sm.object_id = oid;
        sm.flags.oid_assigned = true;
        event!(Level::TRACE, instance = %id, key = %sm.cache_key, "object id assigned");

        let assigned = self
            .cache
            .with(|c| c.assign_object_id(id, &old_key, &self.instances));
        if let Err(err) = assigned {
            let sm = self.sm_mut(id)?;
            sm.cache_key = old_key.clone();
            sm.object_id = old_oid;
            sm.flags.oid_assigned = false;
            self.cache.with(|c| c.persistent_new(id, old_key));
            return Err(err);
        }
        Ok(())
    }

    fn delete_op(&self, id: InstanceId) -> Result<Option<FlushOp>> {
        let sm = self.sm(id)?;
        if !matches!(sm.state, PcState::PNewFlushedDeleted | PcState::PDeleted) {
            return Ok(None);
        }
        let expected = if sm.is_version_check_required() {
            sm.version
        } else {
            None
        };
        Ok(Some(FlushOp::Delete {
            class: sm.class_name().to_string(),
            object_id: sm.object_id.clone(),
            expected,
        }))
    }

    fn write_op(&self, id: InstanceId) -> Result<Option<FlushOp>> {
        let sm = self.sm(id)?;
        let class = sm.class_name().to_string();
        let expected = if sm.is_version_check_required() {
            sm.version
        } else {
            None
        };

        match sm.state {
            PcState::PNew if !sm.flags.flushed => {
                return Ok(Some(FlushOp::Insert {
                    class: Arc::clone(&sm.object.class),
                    object_id: sm.object_id.clone(),
                    values: self.to_stored_all(&sm.object.values)?,
                }));
            }
            PcState::PNew | PcState::PDirty if sm.has_unflushed_changes() => {
                let mut values = Vec::new();
                for field in sm.dirty.iter().filter(|f| !sm.flushed.contains(*f)) {
                    if let Some(value) = sm.object.get(field) {
                        values.push((field, self.to_stored(value)?));
                    }
                }
                return Ok(Some(FlushOp::Update {
                    class,
                    object_id: sm.object_id.clone(),
                    values,
                    expected,
                }));
            }
            _ => {}
        }

        if !sm.state.is_persistent()
            || sm.state.is_new()
            || sm.state.is_deleted()
            || sm.state.is_embedded()
        {
            return Ok(None);
        }
        if sm.flags.version_update {
            return Ok(Some(FlushOp::BumpVersion {
                class,
                object_id: sm.object_id.clone(),
                expected: sm.version,
            }));
        }
        match (sm.flags.version_check, sm.version) {
            (true, Some(expected)) => Ok(Some(FlushOp::CheckVersion {
                class,
                object_id: sm.object_id.clone(),
                expected,
            })),
            _ => Ok(None),
        }
    }

    fn after_flush(&mut self, id: InstanceId, delete: bool, version: Option<Version>) -> Result<()> {
        if delete {
            self.sm_mut(id)?.flags.flushed = true;
            self.apply(id, Event::Flush)?;
            return Ok(());
        }
        let sm = self.sm_mut(id)?;
        if let Some(version) = version {
            sm.version = Some(version);
        }
        sm.flags.flushed = true;
        sm.flags.flushed_dirty = false;
        sm.flags.version_update = false;
        let dirty = sm.dirty.clone();
        sm.flushed.union_with(&dirty);
        self.fire_for(LifecycleEvent::AfterStore, id)
    }

    pub(crate) fn to_stored(&self, value: &FieldValue) -> Result<StoredValue> {
        Ok(match value {
            FieldValue::Null => StoredValue::Null,
            FieldValue::Boolean(v) => StoredValue::Boolean(*v),
            FieldValue::Integer(v) => StoredValue::Integer(*v),
            FieldValue::Float(v) => StoredValue::Float(*v),
            FieldValue::Text(v) => StoredValue::Text(v.clone()),
            FieldValue::Date(v) => StoredValue::Date(*v.read()),
            FieldValue::Array(items) => StoredValue::Array(self.to_stored_all(&items.read())?),
            FieldValue::List(items) => StoredValue::List(self.to_stored_all(&items.read())?),
            FieldValue::Set(items) => StoredValue::Set(self.to_stored_all(&items.read())?),
            FieldValue::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, entry) in entries.read().iter() {
                    map.insert(key.clone(), self.to_stored(entry)?);
                }
                StoredValue::Map(map)
            }
            FieldValue::Object(custom) => StoredValue::Object {
                type_name: custom.type_name.clone(),
                data: custom.data.read().clone(),
            },
            FieldValue::Managed(target) => {
                let sm = self.sm(*target)?;
                if sm.state.is_embedded() {
                    StoredValue::Embedded {
                        class: sm.class_name().to_string(),
                        values: self.to_stored_all(&sm.object.values)?,
                    }
                } else if sm.state == PcState::Transient || sm.object_id.is_temporary() {
                    return Err(KernelError::ObjectNotFound(sm.failed_object()));
                } else {
                    StoredValue::Ref {
                        class: sm.class_name().to_string(),
                        object_id: sm.object_id.clone(),
                    }
                }
            }
            FieldValue::Detached(key) => {
                return Err(KernelError::ObjectNotFound(FailedObject::Detached {
                    key: *key,
                    object_id: None,
                }));
            }
        })
    }

    fn to_stored_all(&self, values: &[FieldValue]) -> Result<Vec<StoredValue>> {
        values.iter().map(|v| self.to_stored(v)).collect()
    }
}
