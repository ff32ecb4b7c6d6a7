//! Published flows, nodes and edges.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard},
};

use petgraph::{algo::is_cyclic_directed, graph::DiGraph};
use tracing::{debug, info};

use crate::{
    behavior::{Behavior, BehaviorRegistry},
    error::{FlowError, FlowResult},
    flow::spec::{Edge, Flow, FlowDef, FlowId, Node, NodeId, OLD_SUFFIX},
};

#[derive(Debug, Default)]
struct Tables {
    flows: HashMap<FlowId, Arc<Flow>>,
    by_name: HashMap<String, FlowId>,
    nodes: HashMap<NodeId, Arc<Node>>,
    node_names: HashMap<(FlowId, String), NodeId>,
    edges: HashMap<(NodeId, String), Arc<Edge>>,
    graphs: HashMap<FlowId, DiGraph<NodeId, String>>,
}

impl Tables {
    fn remove_flow(&mut self, id: FlowId) -> Vec<NodeId> {
        let Some(flow) = self.flows.remove(&id) else {
            return Vec::new();
        };
        if self.by_name.get(&flow.name) == Some(&id) {
            self.by_name.remove(&flow.name);
        }
        let nodes: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.flow == id)
            .map(|n| n.id)
            .collect();
        self.nodes.retain(|_, n| n.flow != id);
        self.node_names.retain(|(flow, _), _| *flow != id);
        self.edges.retain(|_, e| e.flow != id);
        self.graphs.remove(&id);
        nodes
    }
}

/// Read-mostly store of published flows. Readers never observe a half-applied
/// publish.
#[derive(Debug)]
pub struct FlowStore {
    tables: RwLock<Tables>,
    behaviors: Arc<BehaviorRegistry>,
}

impl FlowStore {
    pub fn new(behaviors: Arc<BehaviorRegistry>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            behaviors,
        }
    }

    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.behaviors
    }

    fn read(&self) -> FlowResult<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| FlowError::Internal("flow store lock poisoned".into()))
    }

    /// Publishes `def`, superseding any flow with the same name.
    ///
    /// Every behavior is loaded before the tables are touched, so a flow
    /// naming an unknown behavior leaves the store exactly as it was.
    #[tracing::instrument(skip(self, def), fields(flow = %def.name))]
    pub fn publish(&self, def: &FlowDef) -> FlowResult<Arc<Flow>> {
        let compiled = def.compile()?;

        let mut loaded: Vec<(NodeId, Arc<dyn Behavior>)> = Vec::new();
        for node in &compiled.nodes {
            if let Some(behavior) = self.behaviors.load(node)? {
                loaded.push((node.id, behavior));
            }
        }

        let mut graph = DiGraph::new();
        let index: HashMap<NodeId, _> = compiled
            .nodes
            .iter()
            .map(|n| (n.id, graph.add_node(n.id)))
            .collect();
        for edge in &compiled.edges {
            graph.add_edge(index[&edge.from], index[&edge.to], edge.name.clone());
        }
        if is_cyclic_directed(&graph) {
            debug!("flow `{}` contains cycles", def.name);
        }

        let flow = Arc::new(compiled.flow);
        let dropped = {
            let mut tables = self
                .tables
                .write()
                .map_err(|_| FlowError::Internal("flow store lock poisoned".into()))?;

            let old_name = format!("{}{OLD_SUFFIX}", def.name);
            let mut dropped = Vec::new();
            if let Some(previous_old) = tables.by_name.get(&old_name).copied() {
                dropped = tables.remove_flow(previous_old);
            }
            if let Some(current) = tables.by_name.remove(&def.name) {
                if let Some(existing) = tables.flows.get(&current).cloned() {
                    let mut renamed = existing.as_ref().clone();
                    renamed.name = old_name.clone();
                    tables.flows.insert(current, Arc::new(renamed));
                    tables.by_name.insert(old_name, current);
                }
            }

            for node in compiled.nodes {
                tables
                    .node_names
                    .insert((flow.id, node.name.clone()), node.id);
                tables.nodes.insert(node.id, Arc::new(node));
            }
            for edge in compiled.edges {
                tables
                    .edges
                    .insert((edge.from, edge.name.clone()), Arc::new(edge));
            }
            tables.graphs.insert(flow.id, graph);
            tables.flows.insert(flow.id, flow.clone());
            tables.by_name.insert(flow.name.clone(), flow.id);
            dropped
        };

        for node in &dropped {
            self.behaviors.unbind(node);
        }
        for (node, behavior) in loaded {
            self.behaviors.bind(node, behavior);
        }
        info!("📦 published flow `{}` ({})", flow.name, flow.id);
        Ok(flow)
    }

    pub fn flow(&self, id: FlowId) -> FlowResult<Arc<Flow>> {
        self.read()?
            .flows
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("flow {id}")))
    }

    /// The active version published under `name`.
    pub fn flow_by_name(&self, name: &str) -> FlowResult<Arc<Flow>> {
        let tables = self.read()?;
        tables
            .by_name
            .get(name)
            .and_then(|id| tables.flows.get(id))
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("flow `{name}`")))
    }

    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|t| t.by_name.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn node(&self, id: NodeId) -> FlowResult<Arc<Node>> {
        self.read()?
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("node {id}")))
    }

    pub fn get_node(&self, flow: FlowId, name: &str) -> FlowResult<Arc<Node>> {
        let tables = self.read()?;
        tables
            .node_names
            .get(&(flow, name.to_string()))
            .and_then(|id| tables.nodes.get(id))
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("node {name}")))
    }

    /// Outgoing edge of `node` called `name`.
    pub fn outgoing(&self, node: NodeId, name: &str) -> FlowResult<Option<Arc<Edge>>> {
        Ok(self.read()?.edges.get(&(node, name.to_string())).cloned())
    }

    pub fn is_terminal(&self, node: NodeId) -> FlowResult<bool> {
        Ok(self.outgoing(node, crate::flow::spec::NEXT)?.is_none())
    }

    pub fn node_count(&self, flow: FlowId) -> FlowResult<usize> {
        self.read()?
            .graphs
            .get(&flow)
            .map(|g| g.node_count())
            .ok_or_else(|| FlowError::not_found(format!("flow {flow}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, behavior: &str) -> FlowDef {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "start": "START",
            "nodes": [
                {"name": "START", "behavior": behavior},
                {"name": "END"}
            ],
            "edges": [{"from": "START", "to": "END"}]
        }))
        .unwrap()
    }

    fn store() -> FlowStore {
        FlowStore::new(Arc::new(BehaviorRegistry::with_builtins()))
    }

    #[test]
    fn publish_and_lookup() {
        let store = store();
        let flow = store.publish(&def("lesson", "lesson")).unwrap();
        let start = store.get_node(flow.id, "START").unwrap();
        assert_eq!(start.id, flow.start_node);
        assert!(!store.is_terminal(start.id).unwrap());

        let end = store.get_node(flow.id, "END").unwrap();
        assert!(store.is_terminal(end.id).unwrap());
        assert_eq!(store.node_count(flow.id).unwrap(), 2);
        assert_eq!(
            store.get_node(flow.id, "MISSING"),
            Err(FlowError::not_found("node MISSING"))
        );
    }

    #[test]
    fn republish_keeps_the_old_version_renamed() {
        let store = store();
        let v1 = store.publish(&def("lesson", "lesson")).unwrap();
        let v1_start = v1.start_node;
        let v2 = store.publish(&def("lesson", "question")).unwrap();

        assert_eq!(store.flow_by_name("lesson").unwrap().id, v2.id);
        assert_eq!(store.flow(v1.id).unwrap().name, "lesson__old");
        // nodes of the superseded version stay reachable
        assert_eq!(store.node(v1_start).unwrap().flow, v1.id);

        let v3 = store.publish(&def("lesson", "lesson")).unwrap();
        assert!(store.flow(v1.id).is_err());
        assert!(store.node(v1_start).is_err());
        assert_eq!(store.flow(v2.id).unwrap().name, "lesson__old");
        assert_eq!(store.flow_by_name("lesson").unwrap().id, v3.id);
        assert_eq!(store.flow_names(), vec!["lesson", "lesson__old"]);
    }

    #[test]
    fn unknown_behavior_aborts_without_writes() {
        let store = store();
        let v1 = store.publish(&def("lesson", "lesson")).unwrap();

        let err = store.publish(&def("lesson", "no_such_behavior")).unwrap_err();
        assert!(matches!(err, FlowError::PluginLoadError { .. }));

        let active = store.flow_by_name("lesson").unwrap();
        assert_eq!(active.id, v1.id);
        assert_eq!(active.name, "lesson");
        assert!(store.flow_by_name("lesson__old").is_err());
        assert_eq!(store.flow_names(), vec!["lesson"]);
    }
}
