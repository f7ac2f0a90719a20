use crate::core::{DetachedKey, InstanceId, ObjectId};
use crate::state::StateError;
use std::fmt;
use thiserror::Error;

/// The object an error is about: a managed instance, a detached instance
/// handed to attach, or a bare identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedObject {
    Managed {
        instance: InstanceId,
        object_id: Option<ObjectId>,
    },
    Detached {
        key: DetachedKey,
        object_id: Option<ObjectId>,
    },
    Identity(ObjectId),
}

impl FailedObject {
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            Self::Managed { object_id, .. } | Self::Detached { object_id, .. } => {
                object_id.as_ref()
            }
            Self::Identity(oid) => Some(oid),
        }
    }

    pub fn detached_key(&self) -> Option<DetachedKey> {
        match self {
            Self::Detached { key, .. } => Some(*key),
            _ => None,
        }
    }
}

impl fmt::Display for FailedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed {
                instance,
                object_id: Some(oid),
            } => write!(f, "{}[{}]", instance, oid),
            Self::Managed { instance, .. } => write!(f, "{}", instance),
            Self::Detached {
                key,
                object_id: Some(oid),
            } => write!(f, "{}[{}]", key, oid),
            Self::Detached { key, .. } => write!(f, "{}", key),
            Self::Identity(oid) => write!(f, "{}", oid),
        }
    }
}

/// Failures collected by a bulk operation.
#[derive(Debug)]
pub struct AggregateError {
    /// Number of batch members that were processed before returning.
    pub attempted: usize,
    pub failures: Vec<(FailedObject, KernelError)>,
    /// Per-member outcome of a batch that yields instances, in batch order.
    /// `None` marks a failed or skipped member. Empty for flush failures.
    pub results: Vec<Option<InstanceId>>,
}

impl AggregateError {
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.failures.len(),
            self.attempted
        )?;
        for (failed, err) in &self.failures {
            write!(f, "; {}: {}", failed, err)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("{source} (instance {instance})")]
    InvalidState {
        #[source]
        source: StateError,
        instance: String,
    },

    #[error("Duplicate load of object id {object_id}: already managing {existing}, attempted {attempted}")]
    DuplicateLoad {
        object_id: ObjectId,
        existing: String,
        attempted: String,
    },

    #[error("Object id {object_id} assigned to {attempted} is already in use by {existing}")]
    DuplicateObjectId {
        object_id: ObjectId,
        existing: String,
        attempted: String,
    },

    #[error("Optimistic conflict on {failed}: {message}")]
    OptimisticConflict {
        failed: FailedObject,
        message: String,
    },

    #[error("No copy strategy for field '{field}' of type '{type_name}'")]
    UnsupportedCopy { field: String, type_name: String },

    #[error("Lifecycle listener '{listener}' failed for {failed}: {message}")]
    Callback {
        listener: String,
        failed: FailedObject,
        message: String,
    },

    #[error("{0}")]
    Aggregate(AggregateError),

    #[error("Object not found: {0}")]
    ObjectNotFound(FailedObject),

    #[error("Unknown managed instance {0}")]
    UnknownInstance(InstanceId),

    #[error("Class '{class}' has no field {field}")]
    UnknownField { class: String, field: String },

    #[error("No active transaction")]
    NoTransaction,

    #[error("A transaction is already active")]
    TransactionActive,

    #[error("Savepoint '{0}' not found")]
    SavepointNotFound(String),

    #[error("Savepoint '{0}' already exists")]
    DuplicateSavepoint(String),

    #[error("Cannot flush while savepoint '{0}' is set")]
    SavepointActive(String),

    #[error("Lock timeout on {0}")]
    LockTimeout(FailedObject),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    /// Usage and internal errors that abort the operation outright.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::DuplicateLoad { .. }
                | Self::DuplicateObjectId { .. }
                | Self::UnsupportedCopy { .. }
                | Self::UnknownInstance(_)
                | Self::UnknownField { .. }
                | Self::DuplicateSavepoint(_)
                | Self::SavepointActive(_)
                | Self::LockError(_)
        )
    }

    /// Errors a caller may handle and carry on with the batch or transaction.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::OptimisticConflict { .. }
            | Self::ObjectNotFound(_)
            | Self::LockTimeout(_)
            | Self::Callback { .. } => true,
            Self::Aggregate(agg) => agg.failures.iter().all(|(_, e)| e.is_recoverable()),
            _ => false,
        }
    }

    pub fn is_optimistic_conflict(&self) -> bool {
        matches!(self, Self::OptimisticConflict { .. })
    }

    /// Every failed object this error carries, aggregate members included.
    pub fn failed_objects(&self) -> Vec<FailedObject> {
        match self {
            Self::OptimisticConflict { failed, .. }
            | Self::Callback { failed, .. }
            | Self::ObjectNotFound(failed)
            | Self::LockTimeout(failed) => vec![failed.clone()],
            Self::Aggregate(agg) => agg.failures.iter().map(|(f, _)| f.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_collects_failed_objects() {
        let conflict = KernelError::OptimisticConflict {
            failed: FailedObject::Identity(ObjectId::Long(7)),
            message: "stale".into(),
        };
        let agg = KernelError::Aggregate(AggregateError {
            attempted: 3,
            failures: vec![(FailedObject::Identity(ObjectId::Long(7)), conflict)],
            results: Vec::new(),
        });

        assert!(agg.is_recoverable());
        assert!(!agg.is_fatal());
        assert_eq!(
            agg.failed_objects(),
            vec![FailedObject::Identity(ObjectId::Long(7))]
        );
        assert!(agg.to_string().starts_with("1 of 3 operations failed"));
    }

    #[test]
    fn test_duplicate_identity_is_fatal() {
        let err = KernelError::DuplicateLoad {
            object_id: ObjectId::Long(1),
            existing: "a".into(),
            attempted: "b".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
    }
}
