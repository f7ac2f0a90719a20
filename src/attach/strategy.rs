use super::DetachedObject;
use crate::context::PersistenceContext;
use crate::core::{ClassMeta, FailedObject, FieldSet, InstanceId, KernelError, ManagedObject, Result};
use crate::store::VersionOrdering;
use std::sync::Arc;

/// How one detached object is matched to a managed instance.
pub trait AttachStrategy {
    fn name(&self) -> &'static str;

    /// Look up or create the managed counterpart of `object`.
    fn resolve(&self, ctx: &mut PersistenceContext, object: &DetachedObject) -> Result<InstanceId>;

    /// Fields whose detached values are copied onto the managed instance.
    /// Key and version fields are never copied.
    fn fields_to_copy(&self, class: &ClassMeta, object: &DetachedObject) -> FieldSet;

    /// Whether copied values get their own payload instead of sharing the
    /// detached one.
    fn copy_values(&self, copy_new: bool) -> bool;
}

fn unknown_class(class: &str) -> KernelError {
    KernelError::Store(format!("Unknown class '{}'", class))
}

fn without_keys(mut fields: FieldSet, class: &ClassMeta) -> FieldSet {
    for pk in class.primary_key_fields() {
        fields.remove(pk);
    }
    if let Some(version) = class.version_field() {
        fields.remove(version);
    }
    fields
}

/// Objects detached while new, or built by hand: persisted as new instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct NewInstanceStrategy;

impl AttachStrategy for NewInstanceStrategy {
    fn name(&self) -> &'static str {
        "new-instance"
    }

    fn resolve(&self, ctx: &mut PersistenceContext, object: &DetachedObject) -> Result<InstanceId> {
        let class = ctx
            .store()
            .class_meta(&object.class)
            .ok_or_else(|| unknown_class(&object.class))?;
        let mut managed = ManagedObject::new(Arc::clone(&class));
        for pk in class.primary_key_fields() {
            if let (Some(value), Some(slot)) = (object.values.get(pk), managed.values.get_mut(pk)) {
                *slot = value.clone();
            }
        }
        ctx.persist(managed)
    }

    fn fields_to_copy(&self, class: &ClassMeta, object: &DetachedObject) -> FieldSet {
        without_keys(FieldSet::full(object.values.len()), class)
    }

    fn copy_values(&self, copy_new: bool) -> bool {
        copy_new
    }
}

/// Objects that carry detached state: matched to the stored record and
/// version checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedStateStrategy;

impl AttachStrategy for DetachedStateStrategy {
    fn name(&self) -> &'static str {
        "detached-state"
    }

    fn resolve(&self, ctx: &mut PersistenceContext, object: &DetachedObject) -> Result<InstanceId> {
        let state = object
            .state
            .as_ref()
            .ok_or(KernelError::ObjectNotFound(FailedObject::Detached {
                key: object.key,
                object_id: None,
            }))?;
        let failed = FailedObject::Detached {
            key: object.key,
            object_id: Some(state.object_id.clone()),
        };

        let id = ctx
            .find(&object.class, &state.object_id)?
            .ok_or_else(|| KernelError::OptimisticConflict {
                failed: failed.clone(),
                message: "object was deleted after it was detached".to_string(),
            })?;

        let (Some(detached), Some(current)) = (state.version, ctx.get(id)?.version()) else {
            return Ok(id);
        };
        match ctx.store().compare_version(detached, current) {
            VersionOrdering::Same => {}
            VersionOrdering::Later => ctx.adopt_version(id, detached)?,
            ordering @ (VersionOrdering::Earlier | VersionOrdering::Different) => {
                return Err(KernelError::OptimisticConflict {
                    failed,
                    message: format!(
                        "detached version {} is {} than managed version {}",
                        detached, ordering, current
                    ),
                });
            }
        }
        Ok(id)
    }

    fn fields_to_copy(&self, class: &ClassMeta, object: &DetachedObject) -> FieldSet {
        match object.state.as_ref() {
            Some(state) => without_keys(state.loaded.clone(), class),
            None => FieldSet::new(),
        }
    }

    fn copy_values(&self, _copy_new: bool) -> bool {
        true
    }
}
