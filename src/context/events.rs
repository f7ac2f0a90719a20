use crate::core::{DetachedKey, FailedObject, InstanceId, ObjectId};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforePersist,
    AfterPersist,
    BeforeDelete,
    AfterDelete,
    BeforeStore,
    AfterStore,
    BeforeAttach,
    AfterAttach,
    BeforeDetach,
    AfterDetach,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEvent::BeforePersist => "before-persist",
            LifecycleEvent::AfterPersist => "after-persist",
            LifecycleEvent::BeforeDelete => "before-delete",
            LifecycleEvent::AfterDelete => "after-delete",
            LifecycleEvent::BeforeStore => "before-store",
            LifecycleEvent::AfterStore => "after-store",
            LifecycleEvent::BeforeAttach => "before-attach",
            LifecycleEvent::AfterAttach => "after-attach",
            LifecycleEvent::BeforeDetach => "before-detach",
            LifecycleEvent::AfterDetach => "after-detach",
        };
        write!(f, "{}", name)
    }
}

/// The instance a lifecycle event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub class: String,
    pub instance: Option<InstanceId>,
    pub object_id: Option<ObjectId>,
    pub detached: Option<DetachedKey>,
}

impl EventSource {
    pub fn managed(class: &str, instance: InstanceId, object_id: &ObjectId) -> Self {
        Self {
            class: class.to_string(),
            instance: Some(instance),
            object_id: Some(object_id.clone()),
            detached: None,
        }
    }

    pub fn detached(class: &str, key: DetachedKey, object_id: Option<ObjectId>) -> Self {
        Self {
            class: class.to_string(),
            instance: None,
            object_id,
            detached: Some(key),
        }
    }

    pub fn to_failed(&self) -> FailedObject {
        match (self.instance, self.detached) {
            (Some(instance), _) => FailedObject::Managed {
                instance,
                object_id: self.object_id.clone(),
            },
            (None, Some(key)) => FailedObject::Detached {
                key,
                object_id: self.object_id.clone(),
            },
            (None, None) => match &self.object_id {
                Some(oid) => FailedObject::Identity(oid.clone()),
                None => FailedObject::Identity(ObjectId::Text(self.class.clone())),
            },
        }
    }
}

/// Receives lifecycle notifications. Returning an error reports a failed
/// callback; how it is handled depends on the configured callback mode.
pub trait LifecycleListener: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(
        &self,
        event: LifecycleEvent,
        source: &EventSource,
    ) -> std::result::Result<(), String>;
}
