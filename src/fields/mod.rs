// ============================================================================
// Field Snapshots
// ============================================================================
//
// Two snapshot strategies share one copy registry:
//
//   SaveFieldManager       lazy, transaction scoped, drives rollback
//   SavepointFieldManager  eager, captured per savepoint
//
// Immutable values are copied shallowly. Mutable values (dates, arrays,
// lists, sets, maps, custom objects) are deep-copied so the snapshot never
// shares state with the live instance.
//
// ============================================================================

mod copy;
mod save;
mod savepoint;

pub use copy::{CopyRegistry, CustomCopy};
pub use save::SaveFieldManager;
pub use savepoint::SavepointFieldManager;
