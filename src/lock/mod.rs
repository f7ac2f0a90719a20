// ============================================================================
// Lock Managers
// ============================================================================
//
// Locking here is bookkeeping layered on optimistic versioning: acquiring a
// lock widens the set of instances the transaction verifies or bumps at
// flush. Lock levels only grow within a transaction.
//
// ============================================================================

mod none;
mod version;

pub use none::NoneLockManager;
pub use version::VersionLockManager;

use crate::core::{FailedObject, InstanceId, Result, Version};
use crate::store::VersionOrdering;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{Level, event};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    #[default]
    None,
    Read,
    Write,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockLevel::None => write!(f, "none"),
            LockLevel::Read => write!(f, "read"),
            LockLevel::Write => write!(f, "write"),
        }
    }
}

/// The view of managed instances a lock manager works against.
pub trait LockContext {
    fn lock_level(&self, id: InstanceId) -> Result<LockLevel>;

    fn set_lock_level(&mut self, id: InstanceId, level: LockLevel) -> Result<()>;

    fn is_new(&self, id: InstanceId) -> Result<bool>;

    fn is_transactional(&self, id: InstanceId) -> Result<bool>;

    /// Version the instance was loaded or last flushed with.
    fn version(&self, id: InstanceId) -> Result<Option<Version>>;

    /// Version currently held by the store.
    fn current_store_version(&self, id: InstanceId) -> Result<Option<Version>>;

    fn compare_version(&self, a: Version, b: Version) -> VersionOrdering;

    /// Register the instance with the transaction, asking for a version
    /// increment (`update_version`) or a version check at flush.
    fn enlist(&mut self, id: InstanceId, update_version: bool) -> Result<()>;

    fn describe(&self, id: InstanceId) -> FailedObject;
}

pub trait LockManager: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Acquire the lock once the level has been raised. Errors leave the
    /// level reverted by `lock`.
    fn lock_internal(
        &self,
        ctx: &mut dyn LockContext,
        id: InstanceId,
        level: LockLevel,
        timeout_ms: Option<u64>,
    ) -> Result<()>;

    /// Lock `id` at `level`.
    ///
    /// Nothing happens for `LockLevel::None`, new instances, or instances
    /// already holding at least `level`. On failure the previous level is put
    /// back and the error returned unchanged.
    fn lock(
        &self,
        ctx: &mut dyn LockContext,
        id: InstanceId,
        level: LockLevel,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        if level == LockLevel::None || ctx.is_new(id)? {
            return Ok(());
        }
        let held = ctx.lock_level(id)?;
        if held >= level {
            return Ok(());
        }

        ctx.set_lock_level(id, level)?;
        match self.lock_internal(ctx, id, level, timeout_ms) {
            Ok(()) => {
                event!(Level::TRACE, instance = %id, level = %level, manager = self.name(), "lock acquired");
                Ok(())
            }
            Err(err) => {
                ctx.set_lock_level(id, held)?;
                Err(err)
            }
        }
    }

    fn lock_all(
        &self,
        ctx: &mut dyn LockContext,
        ids: &[InstanceId],
        level: LockLevel,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        for id in ids {
            self.lock(ctx, *id, level, timeout_ms)?;
        }
        Ok(())
    }

    /// Re-verify a lock already held, e.g. on refresh.
    fn refresh_lock(
        &self,
        _ctx: &mut dyn LockContext,
        _id: InstanceId,
        _level: LockLevel,
        _timeout_ms: Option<u64>,
    ) -> Result<()> {
        Ok(())
    }

    fn release(&self, ctx: &mut dyn LockContext, id: InstanceId) -> Result<()> {
        ctx.set_lock_level(id, LockLevel::None)
    }

    fn lock_level(&self, ctx: &dyn LockContext, id: InstanceId) -> Result<LockLevel> {
        ctx.lock_level(id)
    }

    fn begin_transaction(&self) {}

    fn end_transaction(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::core::{KernelError, ObjectId};
    use crate::store::VersionOrdering;
    use std::collections::BTreeMap;

    /// In-memory lock context for exercising managers in isolation.
    #[derive(Debug, Default)]
    pub struct FakeLockContext {
        pub levels: BTreeMap<InstanceId, LockLevel>,
        pub new: Vec<InstanceId>,
        pub versions: BTreeMap<InstanceId, Version>,
        pub store_versions: BTreeMap<InstanceId, Version>,
        pub enlisted: Vec<(InstanceId, bool)>,
        pub fail_enlist: bool,
    }

    impl LockContext for FakeLockContext {
        fn lock_level(&self, id: InstanceId) -> Result<LockLevel> {
            Ok(self.levels.get(&id).copied().unwrap_or_default())
        }

        fn set_lock_level(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
            self.levels.insert(id, level);
            Ok(())
        }

        fn is_new(&self, id: InstanceId) -> Result<bool> {
            Ok(self.new.contains(&id))
        }

        fn is_transactional(&self, id: InstanceId) -> Result<bool> {
            Ok(self.enlisted.iter().any(|(e, _)| *e == id))
        }

        fn version(&self, id: InstanceId) -> Result<Option<Version>> {
            Ok(self.versions.get(&id).copied())
        }

        fn current_store_version(&self, id: InstanceId) -> Result<Option<Version>> {
            Ok(self.store_versions.get(&id).copied())
        }

        fn compare_version(&self, a: Version, b: Version) -> VersionOrdering {
            VersionOrdering::compare(a, b)
        }

        fn enlist(&mut self, id: InstanceId, update_version: bool) -> Result<()> {
            if self.fail_enlist {
                return Err(KernelError::LockError(format!("cannot enlist {}", id)));
            }
            self.enlisted.push((id, update_version));
            Ok(())
        }

        fn describe(&self, id: InstanceId) -> FailedObject {
            FailedObject::Managed {
                instance: id,
                object_id: Some(ObjectId::Long(id.as_u64() as i64)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLockContext;
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(LockLevel::None < LockLevel::Read);
        assert!(LockLevel::Read < LockLevel::Write);
    }

    #[test]
    fn test_lock_is_monotonic() {
        let manager = NoneLockManager;
        let mut ctx = FakeLockContext::default();
        let id = InstanceId(1);

        manager.lock(&mut ctx, id, LockLevel::Write, None).unwrap();
        manager.lock(&mut ctx, id, LockLevel::Read, None).unwrap();
        assert_eq!(ctx.lock_level(id).unwrap(), LockLevel::Write);
    }

    #[test]
    fn test_new_instances_are_not_locked() {
        let manager = NoneLockManager;
        let mut ctx = FakeLockContext {
            new: vec![InstanceId(2)],
            ..Default::default()
        };
        manager.lock(&mut ctx, InstanceId(2), LockLevel::Write, None).unwrap();
        assert_eq!(ctx.lock_level(InstanceId(2)).unwrap(), LockLevel::None);
    }

    #[test]
    fn test_failed_lock_reverts_level() {
        let manager = VersionLockManager::default();
        let mut ctx = FakeLockContext {
            fail_enlist: true,
            ..Default::default()
        };
        let id = InstanceId(3);
        ctx.set_lock_level(id, LockLevel::Read).unwrap();

        let err = manager.lock(&mut ctx, id, LockLevel::Write, None).unwrap_err();
        assert!(err.to_string().contains("cannot enlist"));
        assert_eq!(ctx.lock_level(id).unwrap(), LockLevel::Read);
    }

    #[test]
    fn test_release_drops_level() {
        let manager = NoneLockManager;
        let mut ctx = FakeLockContext::default();
        manager.lock(&mut ctx, InstanceId(4), LockLevel::Read, None).unwrap();
        manager.release(&mut ctx, InstanceId(4)).unwrap();
        assert_eq!(manager.lock_level(&ctx, InstanceId(4)).unwrap(), LockLevel::None);
    }
}
