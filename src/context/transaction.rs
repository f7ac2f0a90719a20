use super::PersistenceContext;
use crate::config::RestoreState;
use crate::core::{InstanceId, KernelError, Result};
use crate::fields::SavepointFieldManager;
use crate::lock::LockLevel;
use crate::state::{Event, PcState};
use im::OrdSet;
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// Named snapshot of the transaction taken by `set_savepoint`.
#[derive(Debug)]
pub(crate) struct Savepoint {
    pub(crate) name: String,
    snapshots: BTreeMap<InstanceId, SavepointFieldManager>,
    transactional: OrdSet<InstanceId>,
    dirty: OrdSet<InstanceId>,
}

impl Savepoint {
    fn release(&self) {
        for snapshot in self.snapshots.values() {
            snapshot.release();
        }
    }
}

impl PersistenceContext {
    pub fn begin(&mut self) -> Result<()> {
        if self.active {
            return Err(KernelError::TransactionActive);
        }
        self.store.begin(self.uuid)?;
        self.lock_manager.begin_transaction();
        self.active = true;

        let pending: Vec<InstanceId> = self.pending.iter().copied().collect();
        for id in &pending {
            self.apply(*id, Event::Transactional)?;
        }
        event!(Level::DEBUG, context = %self.uuid, enlisted = pending.len(), "transaction begun");
        Ok(())
    }

    /// Flush and commit. A failed flush rolls the transaction back and
    /// returns the flush error.
    pub fn commit(&mut self) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        let span = info_span!("context.commit", context = %self.uuid);
        let _enter = span.enter();

        for savepoint in self.savepoints.drain(..) {
            savepoint.release();
        }
        if let Err(err) = self.flush_internal() {
            event!(Level::DEBUG, context = %self.uuid, error = %err, "flush failed, rolling back");
            if let Err(rollback) = self.rollback() {
                warn!("Rollback after failed flush also failed: context='{}', error='{}'", self.uuid, rollback);
            }
            return Err(err);
        }

        self.release_locks();
        self.store.commit(self.uuid)?;
        self.lock_manager.end_transaction();

        let event = if self.config.retain_state {
            Event::CommitRetain
        } else {
            Event::Commit
        };
        let ids: Vec<InstanceId> = self.transactional.iter().copied().collect();
        let mut settled_new = Vec::new();
        for id in &ids {
            let sm = self.sm(*id)?;
            if sm.state.is_new() && !sm.state.is_deleted() && !sm.state.is_embedded() {
                settled_new.push((*id, sm.cache_key.clone()));
            }
            self.apply(*id, event)?;
            self.end_transaction_for(*id, false);
        }
        for (id, old_key) in settled_new {
            if self.state(id)? == PcState::Transient {
                continue;
            }
            self.cache.with(|c| c.commit_new(id, &old_key, &self.instances))?;
        }
        self.cache.with(|c| c.clear_new());

        self.rebuild_sets();
        self.active = false;
        event!(Level::DEBUG, context = %self.uuid, instances = ids.len(), "transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        let span = info_span!("context.rollback", context = %self.uuid);
        let _enter = span.enter();

        for savepoint in self.savepoints.drain(..) {
            savepoint.release();
        }
        let store_result = self.store.rollback(self.uuid);
        self.release_locks();
        self.lock_manager.end_transaction();

        let event = self.rollback_event();
        let ids: Vec<InstanceId> = self.transactional.iter().copied().collect();
        let mut first_error = None;
        for id in &ids {
            if let Err(err) = self.apply(*id, event) {
                warn!("Rollback transition failed: instance='{}', error='{}'", id, err);
                first_error.get_or_insert(err);
            }
            self.end_transaction_for(*id, true);
        }
        self.cache.with(|c| c.clear_new());

        self.rebuild_sets();
        self.active = false;
        event!(Level::DEBUG, context = %self.uuid, instances = ids.len(), "transaction rolled back");
        store_result?;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn rollback_event(&self) -> Event {
        if self.config.restore_state == RestoreState::None {
            Event::Rollback
        } else {
            Event::RollbackRestore
        }
    }

    /// Reset per-transaction bookkeeping. Rolled-back instances fall back to
    /// the version they had when loaded.
    fn end_transaction_for(&mut self, id: InstanceId, rolled_back: bool) {
        let Some(sm) = self.instances.get_mut(&id) else {
            return;
        };
        sm.flags.end_transaction();
        sm.dirty.clear();
        sm.flushed.clear();
        sm.saved = None;
        sm.lock_level = LockLevel::None;
        if rolled_back {
            sm.version = sm.load_version;
        } else {
            sm.load_version = sm.version;
        }
    }

    fn rebuild_sets(&mut self) {
        self.transactional = self
            .instances
            .values()
            .filter(|sm| sm.state.is_transactional())
            .map(|sm| sm.id)
            .collect();
        self.pending = self
            .instances
            .values()
            .filter(|sm| sm.state.is_pending_transactional())
            .map(|sm| sm.id)
            .collect();
        self.dirty = OrdSet::new();
    }

    // ------------------------------------------------------------------------
    // Savepoints
    // ------------------------------------------------------------------------

    /// Snapshot every transactional instance under `name`.
    pub fn set_savepoint(&mut self, name: &str) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        if self.savepoints.iter().any(|s| s.name == name) {
            return Err(KernelError::DuplicateSavepoint(name.to_string()));
        }

        let mut snapshots = BTreeMap::new();
        for id in self.transactional.iter() {
            let Some(sm) = self.instances.get(id) else {
                continue;
            };
            match SavepointFieldManager::capture(sm, Arc::clone(&self.registry)) {
                Ok(snapshot) => {
                    snapshots.insert(*id, snapshot);
                }
                Err(err) => {
                    for snapshot in snapshots.values() {
                        snapshot.release();
                    }
                    return Err(err);
                }
            }
        }

        event!(Level::DEBUG, savepoint = name, instances = snapshots.len(), "savepoint set");
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            snapshots,
            transactional: self.transactional.clone(),
            dirty: self.dirty.clone(),
        });
        Ok(())
    }

    /// Put every instance back the way it was when `name` was set. Later
    /// savepoints are dropped; `name` itself stays and can be rolled back to
    /// again.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        let index = self.savepoint_index(name)?;
        let span = info_span!("context.rollback_to_savepoint", savepoint = name);
        let _enter = span.enter();

        for later in self.savepoints.drain(index + 1..) {
            later.release();
        }
        let Some(savepoint) = self.savepoints.pop() else {
            return Err(KernelError::SavepointNotFound(name.to_string()));
        };
        let result = self.restore_savepoint(&savepoint);
        self.savepoints.push(savepoint);
        result
    }

    fn restore_savepoint(&mut self, savepoint: &Savepoint) -> Result<()> {
        let event = self.rollback_event();
        let enlisted_later: Vec<InstanceId> = self
            .transactional
            .iter()
            .copied()
            .filter(|id| !savepoint.snapshots.contains_key(id))
            .collect();
        for id in enlisted_later {
            self.apply(id, event)?;
            self.end_transaction_for(id, true);
        }

        for (id, snapshot) in &savepoint.snapshots {
            let Some(sm) = self.instances.get_mut(id) else {
                continue;
            };
            let before = sm.state;
            let restored = snapshot.restore(sm);
            let after = sm.state;
            let key = sm.cache_key.clone();
            if before == PcState::Transient && after != PcState::Transient {
                if after.is_new() {
                    self.cache.with(|c| c.persistent_new(*id, key));
                } else {
                    self.cache.with(|c| c.add(*id, &self.instances))?;
                }
            }
            event!(Level::TRACE, instance = %id, fields = restored.len(), state = %after, "restored to savepoint");
        }

        self.transactional = savepoint.transactional.clone();
        self.dirty = savepoint.dirty.clone();
        Ok(())
    }

    /// Forget `name` and every savepoint set after it.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        let index = self.savepoint_index(name)?;
        for savepoint in self.savepoints.drain(index..) {
            savepoint.release();
        }
        event!(Level::DEBUG, savepoint = name, "savepoint released");
        Ok(())
    }

    pub fn savepoint_names(&self) -> Vec<String> {
        self.savepoints.iter().map(|s| s.name.clone()).collect()
    }

    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| KernelError::SavepointNotFound(name.to_string()))
    }
}
