// ============================================================================
// Managed Instance Cache
// ============================================================================
//
// Per-context index of managed instances, partitioned by identity status:
//
//   main       permanent key -> instance
//   conflicts  permanent key -> new instance reusing a deleted id
//   news       temporary or unassigned key -> new instance
//   embeds     embedded and transient-transactional instances
//   untracked  instances whose fields are not intercepted (dirty-checked)
//
// The cache never stores lifecycle status itself. It asks the owning context
// through `StateLookup` so there is a single source of truth.
//
// ============================================================================

use crate::core::{InstanceId, KernelError, ObjectId, Result};
use crate::state::PcState;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

/// Object identity qualified by class, so equal ids of different classes
/// never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub class: String,
    pub id: ObjectId,
}

impl CacheKey {
    pub fn new(class: &str, id: ObjectId) -> Self {
        Self {
            class: class.to_string(),
            id,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

/// What the cache needs to know about an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStatus {
    pub state: PcState,
    /// Current identity; temporary until the store assigns one.
    pub key: CacheKey,
    /// Field access is intercepted; otherwise changes are found by dirty check.
    pub intercepting: bool,
}

impl EntryStatus {
    pub fn new(state: PcState, key: CacheKey) -> Self {
        Self {
            state,
            key,
            intercepting: true,
        }
    }

    pub fn untracked(mut self) -> Self {
        self.intercepting = false;
        self
    }
}

pub trait StateLookup {
    fn status(&self, id: InstanceId) -> Option<EntryStatus>;

    fn is_deleted(&self, id: InstanceId) -> bool {
        self.status(id).map(|s| s.state.is_deleted()).unwrap_or(false)
    }

    fn describe(&self, id: InstanceId) -> String {
        match self.status(id) {
            Some(status) => format!("{}[{}]", id, status.key),
            None => id.to_string(),
        }
    }
}

impl StateLookup for HashMap<InstanceId, EntryStatus> {
    fn status(&self, id: InstanceId) -> Option<EntryStatus> {
        self.get(&id).cloned()
    }
}

#[derive(Debug, Default, Clone)]
pub struct ManagedCache {
    main: HashMap<CacheKey, InstanceId>,
    conflicts: HashMap<CacheKey, InstanceId>,
    news: HashMap<CacheKey, InstanceId>,
    embeds: HashSet<InstanceId>,
    untracked: HashSet<InstanceId>,
}

impl ManagedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the instance for `oid`.
    ///
    /// A new instance reusing the id of a deleted one wins over the deleted
    /// entry. The new partition is consulted only when `allow_new` is set.
    pub fn get_by_id(
        &self,
        oid: &CacheKey,
        allow_new: bool,
        lookup: &impl StateLookup,
    ) -> Option<InstanceId> {
        let found = self.main.get(oid).copied();
        if let Some(id) = found {
            if lookup.is_deleted(id) {
                if let Some(conflict) = self.conflicts.get(oid) {
                    return Some(*conflict);
                }
            }
            return Some(id);
        }
        if allow_new {
            return self.news.get(oid).copied();
        }
        None
    }

    /// Register a freshly initialized instance.
    pub fn add(&mut self, id: InstanceId, lookup: &impl StateLookup) -> Result<()> {
        let status = lookup
            .status(id)
            .ok_or(KernelError::UnknownInstance(id))?;

        if !status.intercepting {
            self.untracked.insert(id);
        }

        if !status.state.is_persistent() || status.state.is_embedded() {
            event!(Level::TRACE, instance = %id, "cache add: embedded");
            self.embeds.insert(id);
            return Ok(());
        }

        if status.state.is_new() {
            event!(Level::TRACE, instance = %id, key = %status.key, "cache add: new");
            self.news.insert(status.key, id);
            return Ok(());
        }

        let oid = status.key;
        match self.main.insert(oid.clone(), id) {
            Some(orig) if orig != id => {
                self.main.insert(oid.clone(), orig);
                if lookup.is_deleted(orig) {
                    event!(Level::TRACE, instance = %id, oid = %oid, "cache add: conflict with deleted entry");
                    self.conflicts.insert(oid, id);
                    return Ok(());
                }
                Err(KernelError::DuplicateLoad {
                    object_id: oid.id.clone(),
                    existing: lookup.describe(orig),
                    attempted: lookup.describe(id),
                })
            }
            _ => {
                event!(Level::TRACE, instance = %id, oid = %oid, "cache add: main");
                Ok(())
            }
        }
    }

    /// An embedded or transient instance became persistent-new.
    pub fn persistent_new(&mut self, id: InstanceId, key: CacheKey) {
        self.embeds.remove(&id);
        event!(Level::TRACE, instance = %id, key = %key, "cache persist-new");
        self.news.insert(key, id);
    }

    /// Move a new instance from its temporary key to its permanent id.
    ///
    /// A collision with a deleted entry parks the instance in the conflict
    /// partition. A collision with a live entry is a duplicate id error.
    pub fn assign_object_id(
        &mut self,
        id: InstanceId,
        old_key: &CacheKey,
        lookup: &impl StateLookup,
    ) -> Result<()> {
        let status = lookup
            .status(id)
            .ok_or(KernelError::UnknownInstance(id))?;
        let oid = status.key;

        if let Some(orig) = self.news.remove(old_key) {
            if orig != id {
                self.news.insert(old_key.clone(), orig);
            }
        }

        match self.main.insert(oid.clone(), id) {
            Some(orig) if orig != id => {
                self.main.insert(oid.clone(), orig);
                if !lookup.is_deleted(orig) {
                    return Err(KernelError::DuplicateObjectId {
                        object_id: oid.id.clone(),
                        existing: lookup.describe(orig),
                        attempted: lookup.describe(id),
                    });
                }
                event!(Level::TRACE, instance = %id, oid = %oid, "cache assign: conflict with deleted entry");
                self.conflicts.insert(oid, id);
                Ok(())
            }
            _ => {
                event!(Level::TRACE, instance = %id, from = %old_key, to = %oid, "cache assign");
                Ok(())
            }
        }
    }

    /// Settle a committed new instance into the main partition.
    ///
    /// `old_key` is the key the instance was cached under before commit. When
    /// it equals the current id the instance may be waiting in the conflict
    /// partition.
    pub fn commit_new(
        &mut self,
        id: InstanceId,
        old_key: &CacheKey,
        lookup: &impl StateLookup,
    ) -> Result<()> {
        let status = lookup
            .status(id)
            .ok_or(KernelError::UnknownInstance(id))?;
        let oid = status.key;

        if &oid == old_key {
            match self.conflicts.remove(&oid) {
                Some(orig) if orig == id => {
                    if let Some(prev) = self.main.insert(oid.clone(), id) {
                        if prev != id && !lookup.is_deleted(prev) {
                            self.main.insert(oid.clone(), prev);
                            self.conflicts.insert(oid.clone(), id);
                            return Err(KernelError::DuplicateObjectId {
                                object_id: oid.id.clone(),
                                existing: lookup.describe(prev),
                                attempted: lookup.describe(id),
                            });
                        }
                    }
                    event!(Level::TRACE, instance = %id, oid = %oid, "cache commit-new: conflict resolved");
                }
                Some(orig) => {
                    self.conflicts.insert(oid, orig);
                }
                None => {}
            }
            return Ok(());
        }

        if let Some(orig) = self.news.remove(old_key) {
            if orig != id {
                self.news.insert(old_key.clone(), orig);
            }
        }

        match self.main.insert(oid.clone(), id) {
            Some(orig) if orig != id && !lookup.is_deleted(orig) => {
                self.main.insert(oid.clone(), orig);
                Err(KernelError::DuplicateObjectId {
                    object_id: oid.id.clone(),
                    existing: lookup.describe(orig),
                    attempted: lookup.describe(id),
                })
            }
            _ => {
                event!(Level::TRACE, instance = %id, oid = %oid, "cache commit-new");
                Ok(())
            }
        }
    }

    /// Drop an instance cached under `key`. Another occupant of the same key
    /// is put back untouched.
    pub fn remove(&mut self, id: InstanceId, key: &CacheKey) {
        if !key.is_temporary() {
            match self.main.remove(key) {
                Some(orig) if orig == id => {}
                other => {
                    if let Some(orig) = other {
                        self.main.insert(key.clone(), orig);
                    }
                    if let Some(orig) = self.conflicts.remove(key) {
                        if orig != id {
                            self.conflicts.insert(key.clone(), orig);
                        }
                    }
                }
            }
            if self.news.get(key) == Some(&id) {
                self.news.remove(key);
            }
            self.embeds.remove(&id);
        } else if !self.embeds.remove(&id) {
            if let Some(orig) = self.news.remove(key) {
                if orig != id {
                    self.news.insert(key.clone(), orig);
                }
            }
        }
        self.untracked.remove(&id);
        event!(Level::TRACE, instance = %id, key = %key, "cache remove");
    }

    /// Every managed instance, in ascending handle order.
    pub fn copy(&self) -> Vec<InstanceId> {
        let all: BTreeSet<InstanceId> = self
            .main
            .values()
            .chain(self.conflicts.values())
            .chain(self.news.values())
            .chain(self.embeds.iter())
            .copied()
            .collect();
        all.into_iter().collect()
    }

    /// Instances that need an explicit dirty check before flush.
    pub fn untracked(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.untracked.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.main.values().any(|v| *v == id)
            || self.conflicts.values().any(|v| *v == id)
            || self.news.values().any(|v| *v == id)
            || self.embeds.contains(&id)
    }

    pub fn conflict(&self, oid: &CacheKey) -> Option<InstanceId> {
        self.conflicts.get(oid).copied()
    }

    pub fn clear(&mut self) {
        self.main.clear();
        self.conflicts.clear();
        self.news.clear();
        self.embeds.clear();
        self.untracked.clear();
    }

    pub fn clear_new(&mut self) {
        self.news.clear();
    }

    pub fn len(&self) -> usize {
        self.copy().len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
            && self.conflicts.is_empty()
            && self.news.is_empty()
            && self.embeds.is_empty()
    }
}

pub type SharedCache = Arc<ReentrantMutex<RefCell<ManagedCache>>>;

/// Cache access strategy chosen once from configuration. Single-threaded
/// contexts skip locking entirely.
#[derive(Debug)]
pub enum CacheHandle {
    Unsynchronized(ManagedCache),
    Synchronized(SharedCache),
}

impl CacheHandle {
    pub fn new(multithreaded: bool) -> Self {
        if multithreaded {
            CacheHandle::Synchronized(Arc::new(ReentrantMutex::new(RefCell::new(
                ManagedCache::new(),
            ))))
        } else {
            CacheHandle::Unsynchronized(ManagedCache::new())
        }
    }

    /// Run one cache operation, holding the lock for its whole duration when
    /// synchronized.
    pub fn with<R>(&mut self, f: impl FnOnce(&mut ManagedCache) -> R) -> R {
        match self {
            CacheHandle::Unsynchronized(cache) => f(cache),
            CacheHandle::Synchronized(shared) => {
                let guard = shared.lock();
                let mut cache = guard.borrow_mut();
                f(&mut cache)
            }
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&ManagedCache) -> R) -> R {
        match self {
            CacheHandle::Unsynchronized(cache) => f(cache),
            CacheHandle::Synchronized(shared) => {
                let guard = shared.lock();
                let cache = guard.borrow();
                f(&cache)
            }
        }
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self, CacheHandle::Synchronized(_))
    }

    pub fn shared(&self) -> Option<SharedCache> {
        match self {
            CacheHandle::Unsynchronized(_) => None,
            CacheHandle::Synchronized(shared) => Some(Arc::clone(shared)),
        }
    }
}
