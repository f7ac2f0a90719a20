use super::{LifecycleEvent, PersistenceContext};
use crate::attach::{AttachManager, DetachedGraph, DetachedObject, DetachedState};
use crate::core::{DetachedKey, FieldValue, InstanceId, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{Level, event, info_span};

impl PersistenceContext {
    pub fn detach(&mut self, id: InstanceId) -> Result<DetachedGraph> {
        self.detach_all(&[id])
    }

    /// Copy `ids` and everything they reference out of the context. The
    /// managed originals are left as they are. An instance reached twice is
    /// detached once.
    pub fn detach_all(&mut self, ids: &[InstanceId]) -> Result<DetachedGraph> {
        let span = info_span!("context.detach", context = %self.uuid, roots = ids.len());
        let _enter = span.enter();

        let mut graph = DetachedGraph::new();
        let mut seen = HashMap::new();
        for id in ids {
            let key = self.detach_into(*id, &mut graph, &mut seen)?;
            graph.roots.push(key);
        }
        event!(Level::DEBUG, roots = ids.len(), objects = graph.len(), "detached");
        Ok(graph)
    }

    fn detach_into(
        &mut self,
        id: InstanceId,
        graph: &mut DetachedGraph,
        seen: &mut HashMap<InstanceId, DetachedKey>,
    ) -> Result<DetachedKey> {
        if let Some(key) = seen.get(&id) {
            return Ok(*key);
        }
        let key = DetachedKey::new();
        seen.insert(id, key);

        self.fire_for(LifecycleEvent::BeforeDetach, id)?;
        self.load_missing(id)?;

        let sm = self.sm(id)?;
        let class = sm.class_name().to_string();
        let values = sm.object.values.clone();
        let mut loaded = sm.loaded.clone();
        let embedded = sm.state.is_embedded();
        let identity = if sm.state.is_new() || embedded || sm.object_id.is_temporary() {
            None
        } else {
            Some((sm.object_id.clone(), sm.version, sm.dirty.clone()))
        };

        let mut detached = Vec::with_capacity(values.len());
        for (field, value) in values.iter().enumerate() {
            if !loaded.contains(field) {
                detached.push(FieldValue::Null);
                continue;
            }
            match self.detach_value(value, graph, seen)? {
                Some(copy) => detached.push(copy),
                None => {
                    loaded.remove(field);
                    detached.push(FieldValue::Null);
                }
            }
        }

        let state = identity.map(|(object_id, version, dirty)| DetachedState {
            object_id,
            version,
            loaded,
            dirty,
        });
        graph.insert(DetachedObject {
            key,
            class,
            values: detached,
            state,
            embedded,
        });
        self.fire_for(LifecycleEvent::AfterDetach, id)?;
        Ok(key)
    }

    /// Detached counterpart of one value. `None` means the value cannot be
    /// copied and the field is left unloaded.
    fn detach_value(
        &mut self,
        value: &FieldValue,
        graph: &mut DetachedGraph,
        seen: &mut HashMap<InstanceId, DetachedKey>,
    ) -> Result<Option<FieldValue>> {
        let copy = match value {
            FieldValue::Managed(target) => {
                return Ok(Some(FieldValue::Detached(
                    self.detach_into(*target, graph, seen)?,
                )));
            }
            FieldValue::Array(items) | FieldValue::List(items) | FieldValue::Set(items) => {
                let source = items.read().clone();
                let mut out = Vec::with_capacity(source.len());
                for item in &source {
                    match self.detach_value(item, graph, seen)? {
                        Some(copy) => out.push(copy),
                        None => return Ok(None),
                    }
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
                    match self.detach_value(entry, graph, seen)? {
                        Some(copy) => {
                            out.insert(key.clone(), copy);
                        }
                        None => return Ok(None),
                    }
                }
                FieldValue::map(out)
            }
            other => match self.registry.copy(other) {
                Some(copy) => copy,
                None => return Ok(None),
            },
        };
        copy.set_tracking(self.config.detach_proxy_fields);
        Ok(Some(copy))
    }

    /// Attach one detached instance and whatever it cascades to. Returns
    /// `None` when the attach callbacks skip it.
    pub fn attach(&mut self, graph: &DetachedGraph, key: DetachedKey) -> Result<Option<InstanceId>> {
        AttachManager::for_context(self).attach(self, graph, key)
    }

    /// Attach several roots sharing one identity map, collecting failures.
    pub fn attach_all(
        &mut self,
        graph: &DetachedGraph,
        keys: &[DetachedKey],
    ) -> Result<Vec<Option<InstanceId>>> {
        AttachManager::for_context(self).attach_all(self, graph, keys)
    }
}
