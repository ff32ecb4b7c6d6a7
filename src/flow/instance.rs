//! Flow instances, their store and the per-request transaction overlay.
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    context::{Attrs, ContextCodec, ContextValue},
    entity::EntityRef,
    error::{FlowError, FlowResult},
    flow::spec::{Flow, FlowId, InstanceId, NodeId, UiHints},
};

/// Time spent on a node that has logging enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub node: NodeId,
    pub entered: DateTime<Utc>,
    pub left: Option<DateTime<Utc>>,
}

/// The live execution record of one session's position within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: InstanceId,
    pub owner: String,
    /// The flow version this instance was created against.
    pub flow: FlowId,
    pub current_node: NodeId,
    pub parent: Option<InstanceId>,
    pub linked: Option<InstanceId>,
    pub current_entity: Option<EntityRef>,
    context_blob: String,
    #[serde(skip)]
    context: Attrs,
    pub ui: UiHints,
    pub display_path: Option<String>,
    pub activity: Vec<AuditEntry>,
    /// Bumped on every committed write.
    pub version: u64,
    pub created: DateTime<Utc>,
}

impl FlowInstance {
    pub fn new(owner: impl Into<String>, flow: &Flow, parent: Option<InstanceId>) -> Self {
        Self {
            id: InstanceId::new(),
            owner: owner.into(),
            flow: flow.id,
            current_node: flow.start_node,
            parent,
            linked: None,
            current_entity: None,
            context_blob: String::new(),
            context: Attrs::new(),
            ui: flow.ui,
            display_path: None,
            activity: Vec::new(),
            version: 0,
            created: Utc::now(),
        }
    }

    pub fn get_attr(&self, name: &str) -> Option<&ContextValue> {
        self.context.get(name)
    }

    pub fn attr_ref(&self, name: &str) -> Option<&EntityRef> {
        self.get_attr(name).and_then(ContextValue::as_reference)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.get_attr(name).and_then(ContextValue::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.context.insert(name.into(), value.into());
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<ContextValue> {
        self.context.remove(name)
    }

    pub fn attrs(&self) -> &Attrs {
        &self.context
    }

    pub fn context_blob(&self) -> &str {
        &self.context_blob
    }

    fn hydrate(&mut self, codec: &ContextCodec) -> FlowResult<()> {
        self.context = codec.decode(&self.context_blob)?;
        Ok(())
    }

    fn seal(&mut self, codec: &ContextCodec) -> FlowResult<()> {
        self.context_blob = codec.encode(&self.context)?;
        Ok(())
    }

    pub(crate) fn enter_node(&mut self, node: NodeId, logging: bool) {
        let now = Utc::now();
        if let Some(open) = self.activity.iter_mut().rev().find(|a| a.left.is_none()) {
            open.left = Some(now);
        }
        self.current_node = node;
        if logging {
            self.activity.push(AuditEntry {
                node,
                entered: now,
                left: None,
            });
        }
    }
}

/// A batch of writes applied atomically by an [`InstanceStore`].
#[derive(Debug, Default)]
pub struct Changeset {
    /// Instance plus the version it was read at (`None` for new instances).
    pub writes: Vec<(FlowInstance, Option<u64>)>,
    pub deletes: Vec<(InstanceId, Option<u64>)>,
    pub active: Vec<(String, Option<InstanceId>)>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty() && self.active.is_empty()
    }
}

pub trait InstanceStore: Send + Sync + Debug {
    fn get(&self, id: InstanceId) -> Option<FlowInstance>;

    /// The owner's stack top.
    fn active(&self, owner: &str) -> Option<InstanceId>;

    /// Applies everything or nothing. Fails with `Conflict` when any instance
    /// changed since it was read.
    fn apply(&self, changes: Changeset) -> FlowResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<InstanceId, FlowInstance>,
    active: HashMap<String, InstanceId>,
}

#[derive(Debug, Default)]
pub struct InMemoryInstanceStore {
    tables: RwLock<Tables>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> FlowResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| FlowError::Internal("instance store lock poisoned".into()))
    }
}

impl InstanceStore for InMemoryInstanceStore {
    fn get(&self, id: InstanceId) -> Option<FlowInstance> {
        self.read().ok()?.instances.get(&id).cloned()
    }

    fn active(&self, owner: &str) -> Option<InstanceId> {
        self.read().ok()?.active.get(owner).copied()
    }

    fn apply(&self, changes: Changeset) -> FlowResult<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| FlowError::Internal("instance store lock poisoned".into()))?;

        let check = |id: InstanceId, expected: Option<u64>| -> FlowResult<()> {
            let found = tables.instances.get(&id).map(|i| i.version);
            match (expected, found) {
                (None, None) => Ok(()),
                (Some(e), Some(f)) if e == f => Ok(()),
                (expected, found) => Err(FlowError::Conflict {
                    id: id.0,
                    expected: expected.unwrap_or(0),
                    found: found.unwrap_or(0),
                }),
            }
        };
        for (instance, expected) in &changes.writes {
            check(instance.id, *expected)?;
        }
        for (id, expected) in &changes.deletes {
            check(*id, *expected)?;
        }

        for (mut instance, _) in changes.writes {
            instance.version += 1;
            tables.instances.insert(instance.id, instance);
        }
        for (id, _) in changes.deletes {
            tables.instances.remove(&id);
        }
        for (owner, top) in changes.active {
            match top {
                Some(id) => tables.active.insert(owner, id),
                None => tables.active.remove(&owner),
            };
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.read().map(|t| t.instances.len()).unwrap_or(0)
    }
}

#[derive(Debug)]
enum Staged {
    Write(FlowInstance),
    Deleted,
}

/// Buffers every instance change of one request. Dropping it without
/// [`InstanceTxn::commit`] leaves the store untouched.
#[derive(Debug)]
pub struct InstanceTxn<'s> {
    store: &'s dyn InstanceStore,
    codec: &'s ContextCodec,
    staged: HashMap<InstanceId, Staged>,
    read_versions: HashMap<InstanceId, u64>,
    created: HashSet<InstanceId>,
    active: HashMap<String, Option<InstanceId>>,
}

impl<'s> InstanceTxn<'s> {
    pub fn new(store: &'s dyn InstanceStore, codec: &'s ContextCodec) -> Self {
        Self {
            store,
            codec,
            staged: HashMap::new(),
            read_versions: HashMap::new(),
            created: HashSet::new(),
            active: HashMap::new(),
        }
    }

    pub fn codec(&self) -> &ContextCodec {
        self.codec
    }

    /// Reads an instance with its context decoded.
    pub fn load(&mut self, id: InstanceId) -> FlowResult<FlowInstance> {
        match self.staged.get(&id) {
            Some(Staged::Write(instance)) => return Ok(instance.clone()),
            Some(Staged::Deleted) => return Err(FlowError::not_found(format!("instance {id}"))),
            None => {}
        }
        let mut instance = self
            .store
            .get(id)
            .ok_or_else(|| FlowError::not_found(format!("instance {id}")))?;
        self.read_versions.entry(id).or_insert(instance.version);
        instance.hydrate(self.codec)?;
        Ok(instance)
    }

    /// Stages an instance, re-encoding its context from the cached copy.
    pub fn save(&mut self, mut instance: FlowInstance) -> FlowResult<()> {
        instance.seal(self.codec)?;
        let id = instance.id;
        if !self.read_versions.contains_key(&id) && !self.created.contains(&id) {
            match self.store.get(id) {
                Some(existing) => {
                    self.read_versions.insert(id, existing.version);
                }
                None => {
                    self.created.insert(id);
                }
            }
        }
        trace!(instance = %instance.id, node = %instance.current_node, "staged instance");
        self.staged.insert(instance.id, Staged::Write(instance));
        Ok(())
    }

    pub fn delete(&mut self, id: InstanceId) {
        if !self.created.contains(&id) && !self.read_versions.contains_key(&id) {
            if let Some(existing) = self.store.get(id) {
                self.read_versions.insert(id, existing.version);
            }
        }
        self.staged.insert(id, Staged::Deleted);
    }

    pub fn active(&self, owner: &str) -> Option<InstanceId> {
        match self.active.get(owner) {
            Some(top) => *top,
            None => self.store.active(owner),
        }
    }

    pub fn set_active(&mut self, owner: &str, top: Option<InstanceId>) {
        self.active.insert(owner.to_string(), top);
    }

    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty() || !self.active.is_empty()
    }

    pub fn commit(self) -> FlowResult<()> {
        let mut changes = Changeset::default();
        for (id, staged) in self.staged {
            let expected = if self.created.contains(&id) {
                None
            } else {
                self.read_versions.get(&id).copied()
            };
            match staged {
                Staged::Write(instance) => changes.writes.push((instance, expected)),
                // created and deleted within the same request
                Staged::Deleted if self.created.contains(&id) => {}
                Staged::Deleted => changes.deletes.push((id, expected)),
            }
        }
        changes.active = self.active.into_iter().collect();
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            writes = changes.writes.len(),
            deletes = changes.deletes.len(),
            "committing instance changes"
        );
        self.store.apply(changes)
    }
}
