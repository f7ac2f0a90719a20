pub mod error;
pub mod meta;
pub mod types;
pub mod value;

pub use error::{AggregateError, FailedObject, KernelError, Result};
pub use meta::{ClassMeta, FieldKind, FieldMeta};
pub use types::{DetachedKey, FieldSet, InstanceId, ObjectId, Version};
pub use value::{CustomValue, FieldValue, ManagedObject, Shared, Tracked, shared};
