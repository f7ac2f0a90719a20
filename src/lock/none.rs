use super::{LockContext, LockLevel, LockManager};
use crate::core::{InstanceId, Result};

/// Records lock levels without enforcing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneLockManager;

impl LockManager for NoneLockManager {
    fn name(&self) -> &'static str {
        "none"
    }

    fn lock_internal(
        &self,
        _ctx: &mut dyn LockContext,
        _id: InstanceId,
        _level: LockLevel,
        _timeout_ms: Option<u64>,
    ) -> Result<()> {
        Ok(())
    }
}
