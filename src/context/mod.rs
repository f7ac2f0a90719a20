// ============================================================================
// Persistence Context
// ============================================================================
//
// The context owns every state manager in an arena keyed by `InstanceId`.
// All lifecycle changes go through `apply`, which resolves the event against
// the state table, performs the returned effects in order, then brings the
// transaction sets and the managed cache in line with the new state.
//
//   lifecycle.rs    persist, delete, find, field access, embedding
//   flush.rs        dirty check, identity assignment, flush plan
//   transaction.rs  begin, commit, rollback, savepoints
//   detach.rs       detach and attach entry points
//
// ============================================================================

mod detach;
mod events;
mod extent;
mod flush;
mod lifecycle;
mod state_manager;
mod transaction;

pub use events::{EventSource, LifecycleEvent, LifecycleListener};
pub use extent::ExtentIterator;
pub use state_manager::{SmFlags, StateManager};

use crate::cache::{CacheHandle, CacheKey, EntryStatus, SharedCache, StateLookup};
use crate::config::KernelConfig;
use crate::core::{FailedObject, InstanceId, KernelError, ObjectId, Result, Version};
use crate::fields::{CopyRegistry, SaveFieldManager};
use crate::lock::{LockContext, LockLevel, LockManager, VersionLockManager};
use crate::state::{self, Effect, Event, PcState};
use crate::store::{StoreManager, VersionOrdering};
use extent::ExtentRegistry;
use im::OrdSet;
use log::warn;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};
use transaction::Savepoint;
use uuid::Uuid;

impl StateLookup for BTreeMap<InstanceId, StateManager> {
    fn status(&self, id: InstanceId) -> Option<EntryStatus> {
        self.get(&id).map(|sm| EntryStatus {
            state: sm.state,
            key: sm.cache_key.clone(),
            intercepting: sm.flags.intercepting,
        })
    }

    fn describe(&self, id: InstanceId) -> String {
        match self.get(&id) {
            Some(sm) => sm.describe(),
            None => id.to_string(),
        }
    }
}

/// A unit of work over managed instances, bound to one store.
pub struct PersistenceContext {
    uuid: Uuid,
    config: KernelConfig,
    instances: BTreeMap<InstanceId, StateManager>,
    next_id: u64,
    cache: CacheHandle,
    transactional: OrdSet<InstanceId>,
    /// Changed outside a transaction, enlisted by the next `begin`.
    pending: OrdSet<InstanceId>,
    dirty: OrdSet<InstanceId>,
    active: bool,
    store: Arc<dyn StoreManager>,
    lock_manager: Arc<dyn LockManager>,
    registry: Arc<CopyRegistry>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    savepoints: Vec<Savepoint>,
    extents: ExtentRegistry,
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("uuid", &self.uuid)
            .field("active", &self.active)
            .field("instances", &self.instances.len())
            .field("transactional", &self.transactional.len())
            .field("lock_manager", &self.lock_manager.name())
            .field("listeners", &self.listeners.len())
            .field("savepoints", &self.savepoints.len())
            .finish()
    }
}

impl PersistenceContext {
    pub fn new(config: KernelConfig, store: Arc<dyn StoreManager>) -> Result<Self> {
        config.validate()?;
        let cache = CacheHandle::new(config.multithreaded);
        Ok(Self {
            uuid: Uuid::new_v4(),
            config,
            instances: BTreeMap::new(),
            next_id: 0,
            cache,
            transactional: OrdSet::new(),
            pending: OrdSet::new(),
            dirty: OrdSet::new(),
            active: false,
            store,
            lock_manager: Arc::new(VersionLockManager::default()),
            registry: CopyRegistry::global(),
            listeners: Vec::new(),
            savepoints: Vec::new(),
            extents: ExtentRegistry::default(),
        })
    }

    pub fn with_lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = manager;
        self
    }

    pub fn with_copy_registry(mut self, registry: Arc<CopyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StoreManager> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CopyRegistry> {
        &self.registry
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn get(&self, id: InstanceId) -> Result<&StateManager> {
        self.sm(id)
    }

    pub fn state(&self, id: InstanceId) -> Result<PcState> {
        Ok(self.sm(id)?.state)
    }

    /// Every instance the cache currently manages, ascending.
    pub fn managed_instances(&self) -> Vec<InstanceId> {
        self.cache.read(|c| c.copy())
    }

    /// Cache lookup without touching the store. Deleted and new instances
    /// are returned as well.
    pub fn find_cached(&self, class: &str, oid: &ObjectId) -> Option<InstanceId> {
        let key = CacheKey::new(class, oid.clone());
        self.cache.read(|c| c.get_by_id(&key, true, &self.instances))
    }

    /// New instance parked under an id whose deleted owner has not been
    /// committed yet.
    pub fn conflict(&self, class: &str, oid: &ObjectId) -> Option<InstanceId> {
        let key = CacheKey::new(class, oid.clone());
        self.cache.read(|c| c.conflict(&key))
    }

    pub fn is_cached(&self, id: InstanceId) -> bool {
        self.cache.read(|c| c.contains(id))
    }

    /// The cache behind its reentrant lock, when configured multithreaded.
    pub fn shared_cache(&self) -> Option<SharedCache> {
        self.cache.shared()
    }

    pub fn transactional_instances(&self) -> Vec<InstanceId> {
        self.transactional.iter().copied().collect()
    }

    pub fn pending_instances(&self) -> Vec<InstanceId> {
        self.pending.iter().copied().collect()
    }

    pub fn dirty_instances(&self) -> Vec<InstanceId> {
        self.dirty.iter().copied().collect()
    }

    pub(crate) fn sm(&self, id: InstanceId) -> Result<&StateManager> {
        self.instances
            .get(&id)
            .ok_or(KernelError::UnknownInstance(id))
    }

    pub(crate) fn sm_mut(&mut self, id: InstanceId) -> Result<&mut StateManager> {
        self.instances
            .get_mut(&id)
            .ok_or(KernelError::UnknownInstance(id))
    }

    /// Resolve `event` for `id` and carry out the result.
    pub(crate) fn apply(&mut self, id: InstanceId, event: Event) -> Result<PcState> {
        let sm = self.sm(id)?;
        let from = sm.state;
        let flags = sm.transition_flags(self.config.is_auto_clear_all(), self.active);
        let transition =
            state::transition(from, event, flags).map_err(|source| KernelError::InvalidState {
                source,
                instance: sm.describe(),
            })?;

        let next = transition.next;
        let (callbacks, effects): (Vec<Effect>, Vec<Effect>) = transition
            .effects
            .into_iter()
            .partition(Effect::notifies_listeners);
        // A vetoing listener leaves the instance untouched.
        for effect in callbacks {
            self.perform(id, effect)?;
        }

        self.sm_mut(id)?.state = next;
        for effect in effects {
            if let Err(err) = self.perform(id, effect) {
                if let Ok(sm) = self.sm_mut(id) {
                    sm.state = from;
                }
                return Err(err);
            }
        }
        if next != from {
            self.sync_membership(id, from, next)?;
        }
        event!(
            Level::DEBUG,
            instance = %id,
            from = %from,
            to = %next,
            event = %event,
            "state transition"
        );
        Ok(next)
    }

    /// Put `id` straight into `state`, running only its initialization.
    pub(crate) fn enter(&mut self, id: InstanceId, state: PcState) -> Result<()> {
        let from = self.sm(id)?.state;
        self.sm_mut(id)?.state = state;
        for effect in state::initialize_effects(state) {
            self.perform(id, *effect)?;
        }
        if from != state {
            self.sync_membership(id, from, state)?;
        }
        event!(Level::DEBUG, instance = %id, from = %from, to = %state, "state entered");
        Ok(())
    }

    fn perform(&mut self, id: InstanceId, effect: Effect) -> Result<()> {
        match effect {
            Effect::SaveFields => {
                let policy = self.config.restore_state;
                let registry = Arc::clone(&self.registry);
                let sm = self.sm_mut(id)?;
                if sm.saved.is_none() {
                    sm.saved = Some(SaveFieldManager::new(
                        sm.object.values.len(),
                        policy,
                        registry,
                    ));
                }
            }
            Effect::RestoreFields => {
                let sm = self.sm_mut(id)?;
                if let Some(mut saved) = sm.saved.take() {
                    let restored = saved.restore(&mut sm.object, &mut sm.loaded);
                    event!(Level::TRACE, instance = %id, fields = restored.len(), "fields restored");
                }
            }
            Effect::ClearSavedFields => self.sm_mut(id)?.saved = None,
            Effect::ClearFields => self.sm_mut(id)?.clear_fields(),
            Effect::ProxyFields => self.sm(id)?.set_tracking(true),
            Effect::UnproxyFields => self.sm(id)?.set_tracking(false),
            Effect::PreDelete => self.fire_for(LifecycleEvent::BeforeDelete, id)?,
            // A logical pre-flush only settles state; store callbacks run on
            // the real one.
            Effect::PreFlush { logical } => {
                if !logical {
                    self.fire_for(LifecycleEvent::BeforeStore, id)?;
                }
            }
            Effect::SetDirty => {
                self.dirty.insert(id);
            }
            Effect::EraseFlush => {
                let sm = self.sm_mut(id)?;
                sm.flags.flushed = false;
                sm.flags.flushed_dirty = false;
                sm.flushed.clear();
            }
            Effect::Unmanage => self.unmanage(id)?,
        }
        Ok(())
    }

    fn unmanage(&mut self, id: InstanceId) -> Result<()> {
        let key = self.sm(id)?.cache_key.clone();
        self.cache.with(|c| c.remove(id, &key));
        self.transactional.remove(&id);
        self.pending.remove(&id);
        self.dirty.remove(&id);

        let sm = self.sm_mut(id)?;
        sm.flags = SmFlags {
            intercepting: sm.flags.intercepting,
            ..SmFlags::default()
        };
        sm.lock_level = LockLevel::None;
        sm.version = None;
        sm.load_version = None;
        sm.dirty.clear();
        sm.flushed.clear();
        sm.baseline = None;
        Ok(())
    }

    fn sync_membership(&mut self, id: InstanceId, from: PcState, to: PcState) -> Result<()> {
        if to.is_transactional() {
            self.transactional.insert(id);
        } else {
            self.transactional.remove(&id);
        }
        if to.is_pending_transactional() {
            self.pending.insert(id);
        } else {
            self.pending.remove(&id);
        }
        if !to.is_dirty() {
            self.dirty.remove(&id);
        }

        if matches!(to, PcState::Transient | PcState::ECopy) {
            return Ok(());
        }
        let key = self.sm(id)?.cache_key.clone();
        if from == PcState::Transient {
            if to.is_new() {
                self.cache.with(|c| c.persistent_new(id, key));
            } else {
                self.cache.with(|c| c.add(id, &self.instances))?;
            }
        } else if to.is_new() && !from.is_new() {
            self.cache.with(|c| c.persistent_new(id, key));
        }
        Ok(())
    }

    /// Drop an instance that never became managed.
    pub(crate) fn discard(&mut self, id: InstanceId) {
        if let Some(sm) = self.instances.remove(&id) {
            self.cache.with(|c| c.remove(id, &sm.cache_key));
            self.transactional.remove(&id);
            self.pending.remove(&id);
            self.dirty.remove(&id);
        }
    }

    pub(crate) fn fire(&self, event: LifecycleEvent, source: &EventSource) -> Result<()> {
        let mode = self.config.callback_mode;
        for listener in &self.listeners {
            let Err(message) = listener.on_event(event, source) else {
                continue;
            };
            if mode.ignore {
                continue;
            }
            if mode.log && !mode.fail_fast {
                warn!(
                    "Lifecycle listener failed: listener='{}', event='{}', object='{}', message='{}'",
                    listener.name(),
                    event,
                    source.to_failed(),
                    message
                );
                continue;
            }
            return Err(KernelError::Callback {
                listener: listener.name().to_string(),
                failed: source.to_failed(),
                message,
            });
        }
        Ok(())
    }

    pub(crate) fn fire_for(&self, event: LifecycleEvent, id: InstanceId) -> Result<()> {
        if self.listeners.is_empty() {
            return Ok(());
        }
        let sm = self.sm(id)?;
        self.fire(event, &EventSource::managed(sm.class_name(), id, &sm.object_id))
    }

    // ------------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------------

    pub fn lock(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        self.sm(id)?;
        let manager = Arc::clone(&self.lock_manager);
        let timeout = self.config.lock_timeout_ms;
        manager.lock(self, id, level, timeout)
    }

    pub fn lock_all(&mut self, ids: &[InstanceId], level: LockLevel) -> Result<()> {
        if !self.active {
            return Err(KernelError::NoTransaction);
        }
        let manager = Arc::clone(&self.lock_manager);
        let timeout = self.config.lock_timeout_ms;
        manager.lock_all(self, ids, level, timeout)
    }

    /// Re-verify the lock `id` already holds.
    pub fn refresh_lock(&mut self, id: InstanceId) -> Result<()> {
        let level = self.sm(id)?.lock_level;
        let manager = Arc::clone(&self.lock_manager);
        let timeout = self.config.lock_timeout_ms;
        manager.refresh_lock(self, id, level, timeout)
    }

    pub fn lock_level(&self, id: InstanceId) -> Result<LockLevel> {
        self.lock_manager.lock_level(self, id)
    }

    /// Lock taken implicitly by a transactional read or write.
    fn lock_at(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        if level == LockLevel::None || self.sm(id)?.state.is_embedded() {
            return Ok(());
        }
        let manager = Arc::clone(&self.lock_manager);
        let timeout = self.config.lock_timeout_ms;
        manager.lock(self, id, level, timeout)
    }

    fn release_locks(&mut self) {
        let locked: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|sm| sm.lock_level != LockLevel::None)
            .map(|sm| sm.id)
            .collect();
        let manager = Arc::clone(&self.lock_manager);
        for id in locked {
            if let Err(err) = manager.release(self, id) {
                warn!("Failed to release lock: instance='{}', error='{}'", id, err);
            }
        }
    }

    /// Take on a newer version than the one held and verify it at flush.
    pub(crate) fn adopt_version(&mut self, id: InstanceId, version: Version) -> Result<()> {
        self.sm_mut(id)?.version = Some(version);
        LockContext::enlist(self, id, false)
    }
}

impl LockContext for PersistenceContext {
    fn lock_level(&self, id: InstanceId) -> Result<LockLevel> {
        Ok(self.sm(id)?.lock_level)
    }

    fn set_lock_level(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        self.sm_mut(id)?.lock_level = level;
        Ok(())
    }

    fn is_new(&self, id: InstanceId) -> Result<bool> {
        Ok(self.sm(id)?.state.is_new())
    }

    fn is_transactional(&self, id: InstanceId) -> Result<bool> {
        Ok(self.sm(id)?.state.is_transactional())
    }

    fn version(&self, id: InstanceId) -> Result<Option<Version>> {
        Ok(self.sm(id)?.version)
    }

    fn current_store_version(&self, id: InstanceId) -> Result<Option<Version>> {
        let sm = self.sm(id)?;
        self.store.current_version(sm.class_name(), &sm.object_id)
    }

    fn compare_version(&self, a: Version, b: Version) -> VersionOrdering {
        self.store.compare_version(a, b)
    }

    fn enlist(&mut self, id: InstanceId, update_version: bool) -> Result<()> {
        let sm = self.sm_mut(id)?;
        if update_version {
            sm.flags.version_update = true;
        } else {
            sm.flags.version_check = true;
        }
        if !sm.state.is_transactional() {
            self.apply(id, Event::Transactional)?;
        }
        Ok(())
    }

    fn describe(&self, id: InstanceId) -> FailedObject {
        match self.instances.get(&id) {
            Some(sm) => sm.failed_object(),
            None => FailedObject::Managed {
                instance: id,
                object_id: None,
            },
        }
    }
}
