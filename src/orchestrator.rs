//! Decides, after each answer, which nodes to walk through and which step the
//! student sees next.
//!
//! The walk is a loop over a [`Cursor`]: `Render` builds the message of the
//! node the active instance sits on, `Advance` leaves it. Before advancing,
//! pending side tasks (help, remediation, resources, FAQ and update gates)
//! may push a sub-flow on top of the active instance. A resource request
//! waits on the session until the student is back on the instance it was
//! made from. Every render spends from a [`StepBudget`] sized after the flows
//! involved, so a cyclic graph fails with [`FlowError::FlowCycleSuspected`]
//! instead of spinning.
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{
    behavior::{BuildCtx, builtin::open_faqs},
    context::{Attrs, ContextValue},
    entity::EntityRef,
    error::{FlowError, FlowResult},
    flow::{
        FlowEngine, FlowInstance, InstanceId, InstanceTxn, Node, NodeRole, ResourceRequest,
        Transition, TutorSession,
    },
    message::{Draft, Step},
};

/// Names of the sub-flows the orchestrator pushes.
pub const FAQ_FLOW: &str = "faq";
pub const UPDATES_FLOW: &str = "updates";
pub const HELP_FLOW: &str = "help";
pub const ADDITIONAL_FLOW: &str = "additional";
pub const RESOURCE_FLOW: &str = "resource";

/// Context keys shared between the orchestrator and sub-flows.
pub const THREAD: &str = "thread";
pub const SAVED_THREAD: &str = "saved_thread";
pub const ANSWER_THREAD: &str = "answer_thread";
pub const ITEM: &str = "item";
pub const ERROR: &str = "error";
pub const RESUME: &str = "resume";
const RESUME_RENDER: &str = "render";

pub const DEFAULT_MAX_STEPS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Build the message of the current node.
    Render,
    /// Leave the current node.
    Advance,
}

/// One orchestration request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub cursor: Cursor,
    /// The step the student just answered.
    pub answered: Option<Uuid>,
    /// Thread to branch into the `resource` sub-flow for.
    pub resource: Option<EntityRef>,
}

impl Request {
    /// Shows whatever the active instance currently sits on.
    pub fn render() -> Self {
        Self {
            cursor: Cursor::Render,
            answered: None,
            resource: None,
        }
    }

    /// Moves on after `step` was answered.
    pub fn answered(step: Uuid) -> Self {
        Self {
            cursor: Cursor::Advance,
            answered: Some(step),
            resource: None,
        }
    }

    /// Branches into the `resource` sub-flow once nothing else is pending.
    pub fn resource(thread: EntityRef) -> Self {
        Self {
            cursor: Cursor::Advance,
            answered: None,
            resource: Some(thread),
        }
    }
}

/// What the student gets back from one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reply {
    pub session: Uuid,
    /// Steps shown together ahead of `next`, already delivered.
    pub batch: Vec<Step>,
    /// The step waiting for the student. `None` once the session is over.
    pub next: Option<Step>,
}

/// Node renders a request may take before it is considered cyclic.
#[derive(Debug)]
struct StepBudget {
    used: usize,
    allowed: usize,
    cap: usize,
}

impl StepBudget {
    fn new(cap: usize) -> Self {
        Self {
            used: 0,
            allowed: 0,
            cap,
        }
    }

    fn grant(&mut self, steps: usize) {
        self.allowed = self.allowed.saturating_add(steps);
    }

    fn limit(&self) -> usize {
        self.allowed.min(self.cap)
    }

    fn spend(&mut self) -> FlowResult<()> {
        self.used += 1;
        if self.used > self.limit() {
            return Err(FlowError::FlowCycleSuspected(self.limit()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    engine: Arc<FlowEngine>,
    max_steps: usize,
}

impl Orchestrator {
    pub fn new(engine: Arc<FlowEngine>, max_steps: usize) -> Self {
        Self { engine, max_steps }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    /// Runs one request against the session's active flow stack.
    ///
    /// Every instance change goes through `txn`; on error the caller drops it
    /// and the stack stays as last committed. Unresolvable references surface
    /// as [`FlowError::SessionInconsistent`].
    #[tracing::instrument(skip_all, fields(session = %session.id, owner = %session.owner))]
    pub fn run(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &mut TutorSession,
        request: Request,
    ) -> FlowResult<Reply> {
        self.drive(txn, session, request)
            .map_err(|e| e.in_session(session.id))
    }

    fn drive(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &mut TutorSession,
        request: Request,
    ) -> FlowResult<Reply> {
        let owner = session.owner.clone();
        let mut cursor = request.cursor;
        let mut batch: Vec<Step> = Vec::new();
        let mut next: Option<Step> = None;

        let mut prev = match request.answered {
            Some(id) => {
                let step = session
                    .step_mut(id)
                    .ok_or_else(|| FlowError::not_found(format!("step {id}")))?;
                step.deliver();
                Some(step.clone())
            }
            None => None,
        };

        let mut budget = StepBudget::new(self.max_steps);
        if let Some(top) = txn.active(&owner) {
            let instance = txn.load(top)?;
            budget.grant(self.flow_size(&instance)?);
            if let Some(thread) = request.resource {
                // waits behind queued help and remediation
                session.resource = Some(ResourceRequest {
                    thread,
                    from: top,
                    step: session.awaiting,
                });
            }
        }

        loop {
            let Some(top) = txn.active(&owner) else {
                trace!("no active flow for `{owner}`");
                break;
            };
            // every other move either ends in a render or shrinks the stack
            if cursor == Cursor::Render {
                budget.spend()?;
            }
            let instance = txn.load(top)?;
            let node = self.engine.flows().node(instance.current_node)?;

            if cursor == Cursor::Advance && self.engine.is_terminal(node.id)? {
                cursor = self.leave(txn, session, &instance, &mut budget)?;
                continue;
            }

            if self.enter_faq(txn, session, &instance, &node, &mut budget)? {
                cursor = Cursor::Render;
                continue;
            }

            if cursor == Cursor::Advance {
                if self.enter_pending(txn, session, &instance, &mut budget)? {
                    cursor = Cursor::Render;
                    continue;
                }
                if let Some(request) = session.resource.take_if(|r| r.from == instance.id) {
                    let seed = Attrs::from([
                        (THREAD.to_string(), ContextValue::from(request.thread)),
                        (RESUME.to_string(), ContextValue::from(RESUME_RENDER)),
                    ]);
                    let pushed = self.push(txn, &instance, RESOURCE_FLOW, seed, &mut budget)?;
                    let awaiting = session.awaiting;
                    if let Some(step) = request.step.and_then(|id| session.step_mut(id)) {
                        if !pushed && !step.is_delivered() && awaiting == Some(step.id) {
                            debug!("nothing to branch into, `{}` keeps waiting", node.name);
                            next = Some(step.clone());
                            break;
                        }
                        // the node is rendered afresh, after the resource if there is one
                        step.deliver();
                    }
                    cursor = Cursor::Render;
                    continue;
                }
            }

            if self.enter_updates(txn, session, &instance, &node, &mut budget)? {
                cursor = Cursor::Render;
                continue;
            }

            if cursor == Cursor::Render && !node.role.is_gate() {
                cursor = Cursor::Advance;
                let Some(candidate) = self.build(session, &instance, &node, prev.as_ref())? else {
                    trace!("node `{}` is silent", node.name);
                    continue;
                };
                let groups = prev
                    .as_ref()
                    .is_some_and(|p| candidate.groups_after(p) && candidate.lets_grouping_continue());
                if groups {
                    let step = session
                        .step_mut(candidate.id)
                        .ok_or_else(|| FlowError::not_found(format!("step {}", candidate.id)))?;
                    step.deliver();
                    let step = step.clone();
                    trace!("🧩 grouped {:?} step {}", step.kind, step.id);
                    prev = Some(step.clone());
                    batch.push(step);
                    continue;
                }
                next = Some(candidate);
                break;
            }

            if self.engine.is_terminal(node.id)? {
                // untriggered gate without a way out
                cursor = Cursor::Advance;
                continue;
            }
            match self.engine.advance(txn, top)? {
                Transition::Moved { .. } => cursor = Cursor::Render,
                Transition::NotHandled => {
                    return Err(FlowError::Internal(format!(
                        "node `{}` has a `next` edge but could not advance",
                        node.name
                    )));
                }
            }
        }

        if let Some(request) = &session.resource {
            if !self.stack(txn, &owner)?.contains(&request.from) {
                debug!("resource request for {} dropped, its flow is gone", request.thread);
                session.resource = None;
            }
        }

        let next = next.or_else(|| batch.pop());
        session.awaiting = next
            .as_ref()
            .filter(|step| !step.is_delivered())
            .map(|step| step.id);
        Ok(Reply {
            session: session.id,
            batch,
            next,
        })
    }

    fn flow_size(&self, instance: &FlowInstance) -> FlowResult<usize> {
        Ok(self.engine.flows().node_count(instance.flow)? + 1)
    }

    fn flow_name(&self, instance: &FlowInstance) -> FlowResult<String> {
        Ok(self.engine.flows().flow(instance.flow)?.base_name().to_string())
    }

    /// Pushes `flow_name` on top of `parent`. `false` when no such flow is
    /// published.
    fn push(
        &self,
        txn: &mut InstanceTxn<'_>,
        parent: &FlowInstance,
        flow_name: &str,
        seed: Attrs,
        budget: &mut StepBudget,
    ) -> FlowResult<bool> {
        let Ok(flow) = self.engine.flows().flow_by_name(flow_name) else {
            debug!("sub-flow `{flow_name}` is not published, skipping");
            return Ok(false);
        };
        let id = self
            .engine
            .push_flow(txn, &parent.owner, &flow, seed, Some(parent.id))?;
        budget.grant(self.engine.flows().node_count(flow.id)? + 1);
        info!("➡️ entered `{flow_name}` ({id}) from {}", parent.id);
        Ok(true)
    }

    /// Leaves a finished instance and says how to carry on in its parent.
    fn leave(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &mut TutorSession,
        instance: &FlowInstance,
        budget: &mut StepBudget,
    ) -> FlowResult<Cursor> {
        let Some(parent) = instance.parent else {
            self.engine.finish(txn, instance.id)?;
            return Ok(Cursor::Advance);
        };
        let name = self.flow_name(instance)?;
        let popped = self.engine.pop(txn, instance.id)?;
        budget.grant(1);

        match name.as_str() {
            FAQ_FLOW | UPDATES_FLOW => {
                restore_thread(session, &popped);
                match self.engine.advance(txn, parent)? {
                    Transition::Moved { .. } => Ok(Cursor::Render),
                    Transition::NotHandled => Ok(Cursor::Advance),
                }
            }
            _ if popped.attr_str(RESUME) == Some(RESUME_RENDER) => Ok(Cursor::Render),
            _ => Ok(Cursor::Advance),
        }
    }

    fn has_open_faqs(&self, thread: &EntityRef) -> FlowResult<bool> {
        let entities = self.engine.entities().as_ref();
        if !entities.exists(thread) {
            return Err(FlowError::UnresolvedReference(thread.clone()));
        }
        Ok(!open_faqs(entities, thread).is_empty())
    }

    /// FAQ gates push the `faq` sub-flow when the thread has open questions.
    fn enter_faq(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &mut TutorSession,
        instance: &FlowInstance,
        node: &Node,
        budget: &mut StepBudget,
    ) -> FlowResult<bool> {
        match node.role {
            NodeRole::Faq => {
                let Some(thread) = instance
                    .attr_ref(THREAD)
                    .cloned()
                    .or_else(|| session.active_thread.clone())
                else {
                    return Ok(false);
                };
                if !self.has_open_faqs(&thread)? {
                    return Ok(false);
                }
                let seed = Attrs::from([(THREAD.to_string(), ContextValue::from(thread))]);
                self.push(txn, instance, FAQ_FLOW, seed, budget)
            }
            NodeRole::FaqUpdates => {
                let Some(thread) = instance
                    .attr_ref(ANSWER_THREAD)
                    .cloned()
                    .or_else(|| session.active_thread.clone())
                else {
                    return Ok(false);
                };
                if !self.has_open_faqs(&thread)? {
                    return Ok(false);
                }
                let seed = Attrs::from([
                    (THREAD.to_string(), ContextValue::from(thread.clone())),
                    (SAVED_THREAD.to_string(), saved_thread(session)),
                ]);
                let pushed = self.push(txn, instance, FAQ_FLOW, seed, budget)?;
                if pushed {
                    session.active_thread = Some(thread);
                }
                Ok(pushed)
            }
            _ => Ok(false),
        }
    }

    /// Queued help items come before queued remediation.
    fn enter_pending(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &TutorSession,
        instance: &FlowInstance,
        budget: &mut StepBudget,
    ) -> FlowResult<bool> {
        let current = self.flow_name(instance)?;

        if current != HELP_FLOW {
            if let Some(item) = session.pending_help() {
                let seed = Attrs::from([(
                    ITEM.to_string(),
                    ContextValue::literal(item.id.to_string()),
                )]);
                if self.push(txn, instance, HELP_FLOW, seed, budget)? {
                    return Ok(true);
                }
            }
        }

        if current != ADDITIONAL_FLOW {
            if let Some(item) = session.pending_additional() {
                let mut seed = Attrs::from([(
                    ITEM.to_string(),
                    ContextValue::literal(item.id.to_string()),
                )]);
                if let Some(error) = &item.error {
                    seed.insert(ERROR.to_string(), ContextValue::from(error.clone()));
                }
                if self.push(txn, instance, ADDITIONAL_FLOW, seed, budget)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The `view_updates` gate shows a flagged update once.
    fn enter_updates(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &mut TutorSession,
        instance: &FlowInstance,
        node: &Node,
        budget: &mut StepBudget,
    ) -> FlowResult<bool> {
        if node.role != NodeRole::ViewUpdates {
            return Ok(false);
        }
        let Some(thread) = session.update_flag.clone() else {
            return Ok(false);
        };
        let seed = Attrs::from([
            (THREAD.to_string(), ContextValue::from(thread.clone())),
            (SAVED_THREAD.to_string(), saved_thread(session)),
        ]);
        let pushed = self.push(txn, instance, UPDATES_FLOW, seed, budget)?;
        if pushed {
            session.update_flag = None;
            session.active_thread = Some(thread);
        }
        Ok(pushed)
    }

    /// Builds the node's message and records it on the session.
    fn build(
        &self,
        session: &mut TutorSession,
        instance: &FlowInstance,
        node: &Node,
        current: Option<&Step>,
    ) -> FlowResult<Option<Step>> {
        let draft = {
            let ctx = BuildCtx {
                node,
                instance,
                session,
                current,
                entities: self.engine.entities().as_ref(),
                flows: self.engine.flows().as_ref(),
            };
            self.engine.behaviors().build(&ctx)?
        };
        let flow = self.flow_name(instance)?;

        let step = match draft {
            None => return Ok(None),
            Some(Draft::New(mut step)) => {
                step.node = Some(node.id);
                step.flow = Some(flow.clone());
                step.is_additional |= flow == ADDITIONAL_FLOW;
                session.push_step(step.clone());
                step
            }
            Some(Draft::Queued(id)) => {
                let step = session
                    .step_mut(id)
                    .ok_or_else(|| FlowError::not_found(format!("step {id}")))?;
                step.node = Some(node.id);
                step.flow = Some(flow);
                step.clone()
            }
        };
        trace!("built {:?} step {} on `{}`", step.kind, step.id, node.name);
        Ok(Some(step))
    }

    /// Base name of the owner's active flow.
    pub fn active_flow(&self, txn: &mut InstanceTxn<'_>, owner: &str) -> FlowResult<Option<String>> {
        match txn.active(owner) {
            Some(top) => {
                let instance = txn.load(top)?;
                Ok(Some(self.flow_name(&instance)?))
            }
            None => Ok(None),
        }
    }

    /// Instance ids on the owner's stack, top first.
    pub fn stack(&self, txn: &mut InstanceTxn<'_>, owner: &str) -> FlowResult<Vec<InstanceId>> {
        let mut stack = Vec::new();
        let mut cursor = txn.active(owner);
        while let Some(id) = cursor {
            stack.push(id);
            cursor = txn.load(id)?.parent;
        }
        Ok(stack)
    }
}

/// The thread in focus, stashed so it can be restored when a sub-flow ends.
fn saved_thread(session: &TutorSession) -> ContextValue {
    match &session.active_thread {
        Some(thread) => ContextValue::from(thread.clone()),
        None => ContextValue::literal(Value::Null),
    }
}

fn restore_thread(session: &mut TutorSession, popped: &FlowInstance) {
    match popped.get_attr(SAVED_THREAD) {
        Some(ContextValue::Reference(thread)) => session.active_thread = Some(thread.clone()),
        Some(ContextValue::Literal(Value::Null)) => session.active_thread = None,
        _ => {}
    }
}
