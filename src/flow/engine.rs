//! Transition, push and pop over flow instances.
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::{
    behavior::{BehaviorRegistry, EnterAction, Scope},
    context::Attrs,
    entity::EntityResolver,
    error::{FlowError, FlowResult},
    flow::{
        instance::{FlowInstance, InstanceTxn},
        spec::{Flow, InstanceId, Node, NodeId, NEXT},
        store::FlowStore,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// No outgoing edge by that name; the event may be ignored.
    NotHandled,
    Moved { from: NodeId, to: NodeId, path: String },
}

#[derive(Debug)]
pub struct FlowEngine {
    flows: Arc<FlowStore>,
    entities: Arc<dyn EntityResolver>,
}

impl FlowEngine {
    pub fn new(flows: Arc<FlowStore>, entities: Arc<dyn EntityResolver>) -> Self {
        Self { flows, entities }
    }

    pub fn flows(&self) -> &Arc<FlowStore> {
        &self.flows
    }

    pub fn entities(&self) -> &Arc<dyn EntityResolver> {
        &self.entities
    }

    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        self.flows.behaviors()
    }

    pub fn scope<'a>(&'a self, node: &'a Node, instance: &'a FlowInstance) -> Scope<'a> {
        Scope {
            node,
            instance,
            entities: self.entities.as_ref(),
            flows: self.flows.as_ref(),
        }
    }

    /// `/<flow>/<node>`, used when neither behavior nor node give a path.
    fn default_path(&self, node: &Node) -> FlowResult<String> {
        let flow = self.flows.flow(node.flow)?;
        Ok(format!("/{}/{}", flow.base_name(), node.name))
    }

    fn move_to(
        &self,
        instance: &mut FlowInstance,
        from: &Node,
        to: NodeId,
        via: &str,
    ) -> FlowResult<Transition> {
        let target = self.flows.node(to)?;
        if target.flow != instance.flow {
            let flow = self.flows.flow(instance.flow)?;
            return Err(FlowError::ForeignNode {
                edge: via.to_string(),
                flow: flow.name.clone(),
            });
        }
        instance.enter_node(target.id, target.logging_enabled);
        let default = self.default_path(&target)?;
        let path = self
            .behaviors()
            .path(&self.scope(&target, instance), Some(&default))?;
        instance.display_path = Some(path.clone());
        trace!("👣 {} -[{}]-> {}", from.name, via, target.name);
        Ok(Transition::Moved {
            from: from.id,
            to: target.id,
            path,
        })
    }

    /// Follows the outgoing edge `edge_name` of the instance's current node.
    #[tracing::instrument(skip(self, txn), fields(instance = %id))]
    pub fn transition(
        &self,
        txn: &mut InstanceTxn<'_>,
        id: InstanceId,
        edge_name: &str,
    ) -> FlowResult<Transition> {
        let mut instance = txn.load(id)?;
        let from = self.flows.node(instance.current_node)?;
        let Some(edge) = self.flows.outgoing(from.id, edge_name)? else {
            trace!("no edge `{edge_name}` out of `{}`", from.name);
            return Ok(Transition::NotHandled);
        };
        let to = self
            .behaviors()
            .edge_target(&edge, &self.scope(&from, &instance))?;
        let moved = self.move_to(&mut instance, &from, to, edge_name)?;
        txn.save(instance)?;
        Ok(moved)
    }

    /// The orchestrator's default advance: the behavior's own decision, else
    /// the `next` edge.
    pub fn advance(&self, txn: &mut InstanceTxn<'_>, id: InstanceId) -> FlowResult<Transition> {
        let mut instance = txn.load(id)?;
        let node = self.flows.node(instance.current_node)?;
        let decision = self
            .behaviors()
            .next_decision(&self.scope(&node, &instance))?;
        match decision {
            Some(to) => {
                let moved = self.move_to(&mut instance, &node, to, NEXT)?;
                txn.save(instance)?;
                Ok(moved)
            }
            None => self.transition(txn, id, NEXT),
        }
    }

    pub fn is_terminal(&self, node: NodeId) -> FlowResult<bool> {
        self.flows.is_terminal(node)
    }

    /// Starts the active version of `flow_name` on top of `parent`.
    pub fn push(
        &self,
        txn: &mut InstanceTxn<'_>,
        owner: &str,
        flow_name: &str,
        seed: Attrs,
        parent: Option<InstanceId>,
    ) -> FlowResult<InstanceId> {
        let flow = self.flows.flow_by_name(flow_name)?;
        self.push_flow(txn, owner, &flow, seed, parent)
    }

    #[tracing::instrument(skip(self, txn, flow, seed), fields(flow = %flow.name))]
    pub fn push_flow(
        &self,
        txn: &mut InstanceTxn<'_>,
        owner: &str,
        flow: &Flow,
        seed: Attrs,
        parent: Option<InstanceId>,
    ) -> FlowResult<InstanceId> {
        let mut instance = FlowInstance::new(owner, flow, parent);
        for (name, value) in seed {
            instance.set_attr(name, value);
        }
        instance.current_entity = instance
            .attr_ref("thread")
            .or_else(|| instance.attr_ref("seed"))
            .cloned();
        let start = self.flows.node(flow.start_node)?;
        instance.enter_node(start.id, start.logging_enabled);

        let limit = self.flows.node_count(flow.id)? + 1;
        for _ in 0..limit {
            let node = self.flows.node(instance.current_node)?;
            let default = self.default_path(&node)?;
            let action = self
                .behaviors()
                .enter(&self.scope(&node, &instance), &default)?;
            let path = match action {
                EnterAction::Stay(path) => path,
                EnterAction::Follow(edge_name) => match self.flows.outgoing(node.id, &edge_name)? {
                    Some(edge) => {
                        let to = self
                            .behaviors()
                            .edge_target(&edge, &self.scope(&node, &instance))?;
                        self.move_to(&mut instance, &node, to, &edge_name)?;
                        continue;
                    }
                    None => self
                        .behaviors()
                        .path(&self.scope(&node, &instance), Some(&default))?,
                },
            };
            instance.display_path = Some(path);
            let id = instance.id;
            txn.save(instance)?;
            txn.set_active(owner, Some(id));
            info!("➡️ pushed `{}` for `{owner}` as {id}", flow.name);
            return Ok(id);
        }
        Err(FlowError::FlowCycleSuspected(limit))
    }

    /// Makes the parent the owner's active instance and deletes `id`.
    #[tracing::instrument(skip(self, txn), fields(instance = %id))]
    pub fn pop(&self, txn: &mut InstanceTxn<'_>, id: InstanceId) -> FlowResult<FlowInstance> {
        let instance = txn.load(id)?;
        let parent = instance.parent.ok_or(FlowError::InvalidPop(id.0))?;
        txn.load(parent)?;
        txn.set_active(&instance.owner, Some(parent));
        txn.delete(id);
        info!("⬅️ popped {id} back to {parent}");
        Ok(instance)
    }

    /// Deletes an instance without a parent to return to.
    pub fn finish(&self, txn: &mut InstanceTxn<'_>, id: InstanceId) -> FlowResult<FlowInstance> {
        let instance = txn.load(id)?;
        txn.delete(id);
        if txn.active(&instance.owner) == Some(id) {
            txn.set_active(&instance.owner, instance.parent);
        }
        debug!("🏁 finished {id}");
        Ok(instance)
    }

    /// Tears down every instance on the owner's stack.
    pub fn end_stack(&self, txn: &mut InstanceTxn<'_>, owner: &str) -> FlowResult<usize> {
        let mut ended = 0;
        while let Some(top) = txn.active(owner) {
            self.finish(txn, top)?;
            ended += 1;
        }
        Ok(ended)
    }

    /// Records `other` as running alongside `id`.
    pub fn link(
        &self,
        txn: &mut InstanceTxn<'_>,
        id: InstanceId,
        other: Option<InstanceId>,
    ) -> FlowResult<()> {
        let mut instance = txn.load(id)?;
        instance.linked = other;
        txn.save(instance)
    }

    /// Help text for the node the instance sits on.
    pub fn help(&self, txn: &mut InstanceTxn<'_>, id: InstanceId) -> FlowResult<Option<String>> {
        let instance = txn.load(id)?;
        let node = self.flows.node(instance.current_node)?;
        Ok(self.behaviors().help(&self.scope(&node, &instance)))
    }
}
