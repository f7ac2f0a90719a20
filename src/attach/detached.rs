use crate::core::{DetachedKey, FieldSet, FieldValue, ObjectId, Version};
use std::collections::BTreeMap;

/// Identity and bookkeeping carried by an instance that was persistent when
/// it was detached. Instances detached while new carry none.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedState {
    pub object_id: ObjectId,
    pub version: Option<Version>,
    pub loaded: FieldSet,
    pub dirty: FieldSet,
}

/// One instance disconnected from its persistence context.
///
/// Values never alias the managed original. Relations to other detached
/// instances are `FieldValue::Detached` keys into the same graph.
#[derive(Debug, Clone)]
pub struct DetachedObject {
    pub key: DetachedKey,
    pub class: String,
    pub values: Vec<FieldValue>,
    pub state: Option<DetachedState>,
    /// Stored inline with its owner rather than under its own identity.
    pub embedded: bool,
}

impl DetachedObject {
    /// Detached instance with no detached state; attaching it persists a new
    /// instance.
    pub fn new(class: &str, values: Vec<FieldValue>) -> Self {
        Self {
            key: DetachedKey::new(),
            class: class.to_string(),
            values,
            state: None,
            embedded: false,
        }
    }

    pub fn object_id(&self) -> Option<&ObjectId> {
        self.state.as_ref().map(|s| &s.object_id)
    }

    pub fn version(&self) -> Option<Version> {
        self.state.as_ref().and_then(|s| s.version)
    }

    pub fn get(&self, field: usize) -> Option<&FieldValue> {
        self.values.get(field)
    }

    /// Change a field the way a client would while disconnected.
    pub fn set(&mut self, field: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(field) {
            *slot = value;
        }
        if let Some(state) = self.state.as_mut() {
            state.loaded.insert(field);
            state.dirty.insert(field);
        }
    }
}

/// Arena of detached instances produced by one detach call.
#[derive(Debug, Clone, Default)]
pub struct DetachedGraph {
    pub objects: BTreeMap<DetachedKey, DetachedObject>,
    /// Keys of the instances detach was asked for, in request order.
    pub roots: Vec<DetachedKey>,
}

impl DetachedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: DetachedKey) -> Option<&DetachedObject> {
        self.objects.get(&key)
    }

    pub fn get_mut(&mut self, key: DetachedKey) -> Option<&mut DetachedObject> {
        self.objects.get_mut(&key)
    }

    /// Add an object as a new root and return its key.
    pub fn insert_root(&mut self, object: DetachedObject) -> DetachedKey {
        let key = object.key;
        self.objects.insert(key, object);
        self.roots.push(key);
        key
    }

    pub fn insert(&mut self, object: DetachedObject) -> DetachedKey {
        let key = object.key;
        self.objects.insert(key, object);
        key
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Root keys whose objects are of `class`.
    pub fn roots_of(&self, class: &str) -> Vec<DetachedKey> {
        self.roots
            .iter()
            .copied()
            .filter(|k| self.objects.get(k).map(|o| o.class == class).unwrap_or(false))
            .collect()
    }
}
