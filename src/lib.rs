// ============================================================================
// rustmemodb-orm
// ============================================================================
//
// Persistence-context kernel. A `PersistenceContext` manages the lifecycle
// of domain objects against a store: every instance moves through the
// `PcState` machine, is indexed by identity in the managed cache, has its
// original field values saved for rollback and savepoints, is locked through
// a pluggable `LockManager`, and can be detached and attached back.
//
// ============================================================================

pub mod attach;
pub mod cache;
pub mod config;
pub mod context;
pub mod core;
pub mod fields;
pub mod lock;
pub mod state;
pub mod store;

pub use attach::{
    AttachManager, AttachStrategy, CallbackAction, CascadeAll, DetachedGraph, DetachedObject,
    DetachedState, OpCallbacks,
};
pub use cache::{CacheKey, ManagedCache};
pub use config::{AutoClear, CallbackMode, KernelConfig, RestoreState};
pub use context::{
    EventSource, ExtentIterator, LifecycleEvent, LifecycleListener, PersistenceContext,
    StateManager,
};
pub use core::{
    AggregateError, ClassMeta, DetachedKey, FailedObject, FieldKind, FieldMeta, FieldSet,
    FieldValue, InstanceId, KernelError, ManagedObject, ObjectId, Result, Version,
};
pub use fields::{CopyRegistry, SaveFieldManager, SavepointFieldManager};
pub use lock::{LockLevel, LockManager, NoneLockManager, VersionLockManager};
pub use state::{Effect, Event, PcState, Transition, TransitionFlags};
pub use store::{InMemoryStore, StoreManager, StoredValue, VersionOrdering};
