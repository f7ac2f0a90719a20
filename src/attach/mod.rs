// ============================================================================
// Attach
// ============================================================================
//
// Merges detached graphs back into a persistence context. Each detached
// object is resolved to a managed instance by a strategy chosen from what it
// carries: detached state means an existing record, none means a new one.
// The manager keeps one identity map per operation so shared and cyclic
// references resolve to a single managed instance.
//
// ============================================================================

mod detached;
mod strategy;

pub use detached::{DetachedGraph, DetachedObject, DetachedState};
pub use strategy::{AttachStrategy, DetachedStateStrategy, NewInstanceStrategy};

use crate::context::{EventSource, LifecycleEvent, PersistenceContext};
use crate::core::{
    AggregateError, ClassMeta, DetachedKey, FailedObject, FieldValue, InstanceId, KernelError,
    ManagedObject, Result,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// What to do with one argument of an attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Leave it detached.
    Skip,
    /// Attach it without following its relations.
    Run,
    /// Attach it and cascade through relations marked for attach.
    Cascade,
}

/// Per-argument hook consulted before each object is attached.
pub trait OpCallbacks: Send + Sync {
    fn process_argument(&self, object: &DetachedObject) -> CallbackAction;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CascadeAll;

impl OpCallbacks for CascadeAll {
    fn process_argument(&self, _object: &DetachedObject) -> CallbackAction {
        CallbackAction::Cascade
    }
}

fn lookup(graph: &DetachedGraph, key: DetachedKey) -> Result<&DetachedObject> {
    graph.get(key).ok_or(KernelError::ObjectNotFound(FailedObject::Detached {
        key,
        object_id: None,
    }))
}

fn contains_detached(value: &FieldValue) -> bool {
    match value {
        FieldValue::Detached(_) => true,
        FieldValue::Array(items) | FieldValue::List(items) | FieldValue::Set(items) => {
            items.read().iter().any(contains_detached)
        }
        FieldValue::Map(entries) => entries.read().values().any(contains_detached),
        _ => false,
    }
}

fn field_name(class: &ClassMeta, field: usize) -> String {
    class
        .field_meta(field)
        .map(|m| m.name.clone())
        .unwrap_or_else(|| field.to_string())
}

pub struct AttachManager {
    copy_new: bool,
    callbacks: Arc<dyn OpCallbacks>,
    attached: HashMap<DetachedKey, InstanceId>,
}

impl fmt::Debug for AttachManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachManager")
            .field("copy_new", &self.copy_new)
            .field("attached", &self.attached.len())
            .finish()
    }
}

impl AttachManager {
    pub fn new(copy_new: bool) -> Self {
        Self {
            copy_new,
            callbacks: Arc::new(CascadeAll),
            attached: HashMap::new(),
        }
    }

    pub fn for_context(ctx: &PersistenceContext) -> Self {
        Self::new(ctx.config().copy_on_attach)
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn OpCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn copy_new(&self) -> bool {
        self.copy_new
    }

    /// Managed instance a detached key was attached as, if any.
    pub fn attached(&self, key: DetachedKey) -> Option<InstanceId> {
        self.attached.get(&key).copied()
    }

    /// Attach the object under `key`, notifying listeners around the whole
    /// operation.
    pub fn attach(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        key: DetachedKey,
    ) -> Result<Option<InstanceId>> {
        let object = lookup(graph, key)?;
        let source = EventSource::detached(&object.class, key, object.object_id().cloned());
        ctx.fire(LifecycleEvent::BeforeAttach, &source)?;
        let attached = self.attach_object(ctx, graph, key)?;
        if let Some(id) = attached {
            ctx.fire_for(LifecycleEvent::AfterAttach, id)?;
        }
        Ok(attached)
    }

    /// Attach every key in order. Failures are collected into one aggregate
    /// error that still carries the instances attached so far; with
    /// fail-fast callbacks the batch stops at the first failure.
    pub fn attach_all(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        keys: &[DetachedKey],
    ) -> Result<Vec<Option<InstanceId>>> {
        let span = info_span!("context.attach_all", context = %ctx.uuid(), roots = keys.len());
        let _enter = span.enter();

        let fail_fast = ctx.config().callback_mode.fail_fast;
        let mut results = Vec::with_capacity(keys.len());
        let mut failures = Vec::new();
        let mut attempted = 0;
        for key in keys {
            attempted += 1;
            match self.attach(ctx, graph, *key) {
                Ok(id) => results.push(id),
                Err(err) => {
                    let failed = err.failed_objects().into_iter().next().unwrap_or_else(|| {
                        FailedObject::Detached {
                            key: *key,
                            object_id: graph.get(*key).and_then(|o| o.object_id().cloned()),
                        }
                    });
                    event!(Level::DEBUG, detached = %key, error = %err, "attach failed");
                    failures.push((failed, err));
                    results.push(None);
                    if fail_fast {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(results)
        } else {
            Err(KernelError::Aggregate(AggregateError {
                attempted,
                failures,
                results,
            }))
        }
    }

    fn attach_object(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        key: DetachedKey,
    ) -> Result<Option<InstanceId>> {
        if let Some(id) = self.attached.get(&key) {
            return Ok(Some(*id));
        }
        let object = lookup(graph, key)?;
        let action = self.callbacks.process_argument(object);
        if action == CallbackAction::Skip {
            return Ok(None);
        }

        let strategy: &dyn AttachStrategy = if object.state.is_some() {
            &DetachedStateStrategy
        } else {
            &NewInstanceStrategy
        };
        let id = strategy.resolve(ctx, object)?;
        self.attached.insert(key, id);
        event!(Level::TRACE, detached = %key, instance = %id, strategy = strategy.name(), "attach resolved");

        let cascade = action == CallbackAction::Cascade;
        let copy = strategy.copy_values(self.copy_new);
        let class = Arc::clone(&ctx.get(id)?.object().class);
        for field in strategy.fields_to_copy(&class, object).iter() {
            let Some(value) = object.values.get(field) else {
                continue;
            };
            let follow = cascade
                && class
                    .field_meta(field)
                    .map(|m| m.cascade_attach)
                    .unwrap_or(false);

            if let FieldValue::Detached(inner) = value {
                if let Some(inner) = graph.get(*inner).filter(|o| o.embedded) {
                    self.attach_embedded(ctx, graph, id, field, inner, cascade)?;
                    continue;
                }
            }

            let name = field_name(&class, field);
            let resolved = self.resolve_value(ctx, graph, &name, value, follow, copy)?;
            let current = ctx.get(id)?.object().get(field).cloned();
            let dirty = object
                .state
                .as_ref()
                .map(|s| s.dirty.contains(field))
                .unwrap_or(false);
            if dirty || current.as_ref() != Some(&resolved) {
                ctx.write_field_at(id, field, resolved)?;
            }
        }
        Ok(Some(id))
    }

    fn attach_embedded(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        owner: InstanceId,
        field: usize,
        inner: &DetachedObject,
        cascade: bool,
    ) -> Result<()> {
        let class = ctx
            .store()
            .class_meta(&inner.class)
            .ok_or_else(|| KernelError::Store(format!("Unknown class '{}'", inner.class)))?;
        let mut object = ManagedObject::new(Arc::clone(&class));
        for (index, value) in inner.values.iter().enumerate() {
            let follow = cascade
                && class
                    .field_meta(index)
                    .map(|m| m.cascade_attach)
                    .unwrap_or(false);
            let name = field_name(&class, index);
            let resolved = self.resolve_value(ctx, graph, &name, value, follow, true)?;
            if let Some(slot) = object.values.get_mut(index) {
                *slot = resolved;
            }
        }
        let id = ctx.embed_at(owner, field, object)?;
        self.attached.insert(inner.key, id);
        Ok(())
    }

    /// Managed counterpart of a detached value. References follow the
    /// identity map, then cascade, then fall back to a plain reference.
    /// A copied value never shares storage with the detached graph.
    fn resolve_value(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        field: &str,
        value: &FieldValue,
        follow: bool,
        copy: bool,
    ) -> Result<FieldValue> {
        if !contains_detached(value) {
            if copy {
                return ctx
                    .registry()
                    .copy(value)
                    .ok_or_else(|| KernelError::UnsupportedCopy {
                        field: field.to_string(),
                        type_name: value.type_name().to_string(),
                    });
            }
            return Ok(value.clone());
        }
        Ok(match value {
            FieldValue::Detached(key) => self.resolve_reference(ctx, graph, *key, follow)?,
            FieldValue::Array(items) | FieldValue::List(items) | FieldValue::Set(items) => {
                let source = items.read().clone();
                let mut out = Vec::with_capacity(source.len());
                for item in &source {
                    out.push(self.resolve_value(ctx, graph, field, item, follow, copy)?);
                }
                match value {
                    FieldValue::Array(_) => FieldValue::array(out),
                    FieldValue::List(_) => FieldValue::list(out),
                    _ => FieldValue::set(out),
                }
            }
            FieldValue::Map(entries) => {
                let source = entries.read().clone();
                let mut out = BTreeMap::new();
                for (key, entry) in &source {
                    out.insert(
                        key.clone(),
                        self.resolve_value(ctx, graph, field, entry, follow, copy)?,
                    );
                }
                FieldValue::map(out)
            }
            other => other.clone(),
        })
    }

    fn resolve_reference(
        &mut self,
        ctx: &mut PersistenceContext,
        graph: &DetachedGraph,
        key: DetachedKey,
        follow: bool,
    ) -> Result<FieldValue> {
        if let Some(id) = self.attached.get(&key) {
            return Ok(FieldValue::Managed(*id));
        }
        if follow {
            if let Some(id) = self.attach_object(ctx, graph, key)? {
                return Ok(FieldValue::Managed(id));
            }
        }
        let object = lookup(graph, key)?;
        match &object.state {
            Some(state) => Ok(FieldValue::Managed(
                ctx.reference(&object.class, &state.object_id)?,
            )),
            None => Err(KernelError::ObjectNotFound(FailedObject::Detached {
                key,
                object_id: None,
            })),
        }
    }
}
