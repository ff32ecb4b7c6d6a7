//! Behavior registry: pluggable per-node behavior for flows.
//!
//! A [`Behavior`] implements only the hooks it cares about; every hook has a
//! default that means "not provided", and the registry's dispatch methods
//! substitute the engine default in that case.
pub mod builtin;

use std::{fmt::Debug, sync::Arc};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    entity::EntityResolver,
    error::{FlowError, FlowResult},
    flow::{Edge, FlowInstance, FlowStore, Node, NodeId, TutorSession},
    message::{Draft, Step},
};

/// Read-only view handed to most hooks.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub node: &'a Node,
    pub instance: &'a FlowInstance,
    pub entities: &'a dyn EntityResolver,
    pub flows: &'a FlowStore,
}

/// Everything a behavior may look at while building a message.
#[derive(Clone, Copy)]
pub struct BuildCtx<'a> {
    pub node: &'a Node,
    pub instance: &'a FlowInstance,
    pub session: &'a TutorSession,
    /// The step the student just answered, if any.
    pub current: Option<&'a Step>,
    pub entities: &'a dyn EntityResolver,
    pub flows: &'a FlowStore,
}

impl BuildCtx<'_> {
    pub fn scope(&self) -> Scope<'_> {
        Scope {
            node: self.node,
            instance: self.instance,
            entities: self.entities,
            flows: self.flows,
        }
    }
}

/// Post-processing of a freshly submitted answer.
pub struct InputCtx<'a> {
    pub node: &'a Node,
    pub step: &'a Step,
    pub session: &'a mut TutorSession,
    pub instance: &'a mut FlowInstance,
    pub entities: &'a dyn EntityResolver,
}

/// Result of entering a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnterAction {
    /// Stay on the node and display it under this path.
    Stay(String),
    /// Leave immediately along the named edge.
    Follow(String),
}

pub trait Behavior: Send + Sync + Debug {
    /// Registry id flows refer to.
    fn id(&self) -> &'static str;

    fn clone_box(&self) -> Box<dyn Behavior>;

    fn on_enter(&self, _scope: &Scope<'_>) -> FlowResult<Option<EnterAction>> {
        Ok(None)
    }

    /// Destination override for an outgoing edge of the scoped node.
    fn on_edge(&self, _edge: &Edge, _scope: &Scope<'_>) -> FlowResult<Option<NodeId>> {
        Ok(None)
    }

    /// Admission check for a proposed answer along `edge`.
    fn filter(&self, _edge: &Edge, _scope: &Scope<'_>, _candidate: &str) -> Option<bool> {
        None
    }

    fn resolve_path(&self, _scope: &Scope<'_>) -> Option<String> {
        None
    }

    fn resolve_help(&self, _scope: &Scope<'_>) -> Option<String> {
        None
    }

    /// Nodes whose behavior returns `None` here are silent.
    fn build_message(&self, _ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        Ok(None)
    }

    /// Where the orchestrator goes when no edge name is given.
    fn default_next_edge(&self, _scope: &Scope<'_>) -> FlowResult<Option<NodeId>> {
        Ok(None)
    }

    fn handle_input(&self, _ctx: &mut InputCtx<'_>) -> FlowResult<()> {
        Ok(())
    }
}

impl Clone for Box<dyn Behavior> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Holds behavior prototypes by id and the instance bound to each published
/// node.
#[derive(Debug, Default)]
pub struct BehaviorRegistry {
    prototypes: DashMap<String, Box<dyn Behavior>>,
    bound: DashMap<NodeId, Arc<dyn Behavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in behavior registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for behavior in builtin::all() {
            registry.register(behavior);
        }
        registry
    }

    /// Registers a prototype under its `id()`, replacing any previous one.
    pub fn register(&self, behavior: Box<dyn Behavior>) {
        let id = behavior.id().to_string();
        debug!("🧩 registered behavior `{id}`");
        self.prototypes.insert(id, behavior);
    }

    /// Nodes already bound keep their instance.
    pub fn unregister(&self, id: &str) {
        self.prototypes.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.prototypes.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.prototypes.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Creates a fresh behavior for `node`. `Ok(None)` when the node names no
    /// behavior.
    pub fn load(&self, node: &Node) -> FlowResult<Option<Arc<dyn Behavior>>> {
        let Some(id) = node.behavior_id.as_deref() else {
            return Ok(None);
        };
        self.prototypes
            .get(id)
            .map(|proto| Some(Arc::from(proto.value().clone_box())))
            .ok_or_else(|| FlowError::PluginLoadError {
                node: node.name.clone(),
                behavior: id.to_string(),
            })
    }

    pub fn bind(&self, node: NodeId, behavior: Arc<dyn Behavior>) {
        self.bound.insert(node, behavior);
    }

    pub fn unbind(&self, node: &NodeId) {
        self.bound.remove(node);
    }

    pub fn bound_count(&self) -> usize {
        self.bound.len()
    }

    pub fn for_node(&self, node: &Node) -> Option<Arc<dyn Behavior>> {
        if let Some(bound) = self.bound.get(&node.id) {
            return Some(bound.value().clone());
        }
        match self.load(node) {
            Ok(Some(behavior)) => {
                self.bind(node.id, behavior.clone());
                Some(behavior)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("🛑 {e}, node `{}` runs with defaults", node.name);
                None
            }
        }
    }

    pub fn enter(&self, scope: &Scope<'_>, default_path: &str) -> FlowResult<EnterAction> {
        if let Some(b) = self.for_node(scope.node) {
            if let Some(action) = b.on_enter(scope)? {
                return Ok(action);
            }
        }
        Ok(EnterAction::Stay(self.path(scope, Some(default_path))?))
    }

    pub fn edge_target(&self, edge: &Edge, scope: &Scope<'_>) -> FlowResult<NodeId> {
        if let Some(b) = self.for_node(scope.node) {
            if let Some(to) = b.on_edge(edge, scope)? {
                return Ok(to);
            }
        }
        Ok(edge.to)
    }

    pub fn admits(&self, edge: &Edge, scope: &Scope<'_>, candidate: &str) -> bool {
        self.for_node(scope.node)
            .and_then(|b| b.filter(edge, scope, candidate))
            .unwrap_or(true)
    }

    /// Behavior path, then the node's override, then `default`.
    pub fn path(&self, scope: &Scope<'_>, default: Option<&str>) -> FlowResult<String> {
        if let Some(path) = self.for_node(scope.node).and_then(|b| b.resolve_path(scope)) {
            return Ok(path);
        }
        scope
            .node
            .path_override
            .clone()
            .or_else(|| default.map(str::to_string))
            .ok_or_else(|| FlowError::not_found(format!("path for node `{}`", scope.node.name)))
    }

    pub fn help(&self, scope: &Scope<'_>) -> Option<String> {
        if let Some(help) = self.for_node(scope.node).and_then(|b| b.resolve_help(scope)) {
            return Some(help);
        }
        if scope.instance.current_node == scope.node.id {
            scope.node.help_text.clone()
        } else {
            None
        }
    }

    pub fn build(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        match self.for_node(ctx.node) {
            Some(b) => b.build_message(ctx),
            None => Ok(None),
        }
    }

    pub fn next_decision(&self, scope: &Scope<'_>) -> FlowResult<Option<NodeId>> {
        match self.for_node(scope.node) {
            Some(b) => b.default_next_edge(scope),
            None => Ok(None),
        }
    }

    pub fn handle_input(&self, ctx: &mut InputCtx<'_>) -> FlowResult<()> {
        match self.for_node(ctx.node) {
            Some(b) => b.handle_input(ctx),
            None => Ok(()),
        }
    }
}
