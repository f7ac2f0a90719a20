use super::{LockContext, LockLevel, LockManager};
use crate::core::{InstanceId, KernelError, Result};
use crate::store::VersionOrdering;
use tracing::{Level, event};

/// Implements locks through version checks.
///
/// A read lock makes the transaction verify the instance's version at flush;
/// a write lock makes it increment the version. Both enlist the instance
/// with the owning context.
#[derive(Debug, Clone, Copy)]
pub struct VersionLockManager {
    /// Compare against the store as soon as a read lock is taken.
    pub version_check_on_read_lock: bool,
    /// Increment the version at flush for write locks.
    pub version_update_on_write_lock: bool,
}

impl Default for VersionLockManager {
    fn default() -> Self {
        Self {
            version_check_on_read_lock: true,
            version_update_on_write_lock: true,
        }
    }
}

impl VersionLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_check_on_read_lock(mut self, check: bool) -> Self {
        self.version_check_on_read_lock = check;
        self
    }

    pub fn version_update_on_write_lock(mut self, update: bool) -> Self {
        self.version_update_on_write_lock = update;
        self
    }

    /// Fail when the store holds a different version than the instance.
    fn verify(&self, ctx: &dyn LockContext, id: InstanceId) -> Result<()> {
        let (Some(ours), stored) = (ctx.version(id)?, ctx.current_store_version(id)?) else {
            return Ok(());
        };
        let conflict = match stored {
            None => Some("object was deleted in the store".to_string()),
            Some(theirs) => match ctx.compare_version(ours, theirs) {
                VersionOrdering::Same => None,
                ordering => Some(format!(
                    "locked version {} is {} than stored version {}",
                    ours, ordering, theirs
                )),
            },
        };
        match conflict {
            None => Ok(()),
            Some(message) => {
                event!(Level::DEBUG, instance = %id, %message, "version lock conflict");
                Err(KernelError::OptimisticConflict {
                    failed: ctx.describe(id),
                    message,
                })
            }
        }
    }
}

impl LockManager for VersionLockManager {
    fn name(&self) -> &'static str {
        "version"
    }

    fn lock_internal(
        &self,
        ctx: &mut dyn LockContext,
        id: InstanceId,
        level: LockLevel,
        _timeout_ms: Option<u64>,
    ) -> Result<()> {
        if level >= LockLevel::Write {
            return ctx.enlist(id, self.version_update_on_write_lock);
        }
        if self.version_check_on_read_lock {
            self.verify(ctx, id)?;
        }
        ctx.enlist(id, false)
    }

    fn refresh_lock(
        &self,
        ctx: &mut dyn LockContext,
        id: InstanceId,
        level: LockLevel,
        _timeout_ms: Option<u64>,
    ) -> Result<()> {
        if level >= LockLevel::Read && ctx.lock_level(id)? >= LockLevel::Read {
            self.verify(ctx, id)?;
        }
        Ok(())
    }
}
