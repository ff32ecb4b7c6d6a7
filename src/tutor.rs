//! Session-level entry points.
//!
//! Every call takes the owner's lock, works on a copy of the session and an
//! [`InstanceTxn`], and only commits both once the whole request succeeded.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{
    behavior::InputCtx,
    config::EngineConfig,
    context::{Attrs, ContextCodec, ContextValue},
    entity::{EntityRef, EntityResolver},
    error::{FlowError, FlowResult},
    flow::{
        FlowEngine, FlowStore, InMemoryInstanceStore, InMemorySessionStore, InstanceId,
        InstanceStore, InstanceTxn, NEXT, SessionStore, TutorSession,
    },
    logger::instrument_request,
    orchestrator::{Orchestrator, Reply, Request, THREAD},
};

pub const SEED: &str = "seed";

#[derive(Debug)]
pub struct Tutor {
    orchestrator: Orchestrator,
    codec: ContextCodec,
    instances: Arc<dyn InstanceStore>,
    sessions: SessionStore,
    config: EngineConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Tutor {
    /// A tutor over in-memory instance and session stores.
    pub fn new(
        flows: Arc<FlowStore>,
        entities: Arc<dyn EntityResolver>,
        config: EngineConfig,
    ) -> Self {
        let sessions = InMemorySessionStore::new(config.session_ttl);
        Self::with_stores(
            flows,
            entities,
            Arc::new(InMemoryInstanceStore::new()),
            sessions,
            config,
        )
    }

    pub fn with_stores(
        flows: Arc<FlowStore>,
        entities: Arc<dyn EntityResolver>,
        instances: Arc<dyn InstanceStore>,
        sessions: SessionStore,
        config: EngineConfig,
    ) -> Self {
        let engine = Arc::new(FlowEngine::new(flows, entities.clone()));
        Self {
            orchestrator: Orchestrator::new(engine, config.max_steps),
            codec: ContextCodec::new(entities),
            instances,
            sessions,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        self.orchestrator.engine()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn session(&self, id: Uuid) -> Option<TutorSession> {
        self.sessions.get(id).await
    }

    fn txn(&self) -> InstanceTxn<'_> {
        InstanceTxn::new(self.instances.as_ref(), &self.codec)
    }

    async fn lock(&self, owner: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(owner.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops the owner's lock entry unless another request still holds or
    /// waits on it.
    fn release(&self, owner: &str) {
        if self
            .locks
            .remove_if(owner, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
        {
            trace!("released lock of `{owner}`");
        }
    }

    /// Whether the owner's flow stack is still the one `session` started.
    /// A later `start_session` for the same owner replaces it.
    fn owns_stack(&self, txn: &mut InstanceTxn<'_>, session: &TutorSession) -> FlowResult<bool> {
        let stack = self.orchestrator.stack(txn, &session.owner)?;
        Ok(stack.is_empty() || stack.last().copied() == session.root)
    }

    fn ensure_owns_stack(
        &self,
        txn: &mut InstanceTxn<'_>,
        session: &TutorSession,
    ) -> FlowResult<()> {
        if self.owns_stack(txn, session)? {
            return Ok(());
        }
        debug!("🛑 session {} was superseded", session.id);
        Err(FlowError::SessionInconsistent {
            session: session.id,
            reason: format!("flow stack of `{}` belongs to a newer session", session.owner),
        })
    }

    /// Loads a session and locks its owner. The session is read again under
    /// the lock so a concurrent request's changes are not lost.
    async fn checkout(&self, id: Uuid) -> FlowResult<(TutorSession, OwnedMutexGuard<()>)> {
        let session = self
            .sessions
            .get(id)
            .await
            .ok_or_else(|| FlowError::not_found(format!("session {id}")))?;
        let guard = self.lock(&session.owner).await;
        let session = self
            .sessions
            .get(id)
            .await
            .ok_or_else(|| FlowError::not_found(format!("session {id}")))?;
        Ok((session, guard))
    }

    /// Starts a new session for `owner` on the track flow for `seed`,
    /// discarding whatever flow stack the owner still had.
    pub async fn start_session(&self, owner: &str, seed: EntityRef) -> FlowResult<Reply> {
        instrument_request("start_session", move || async move {
            let _guard = self.lock(owner).await;
            if !self.engine().entities().exists(&seed) {
                return Err(FlowError::not_found(format!("entity {seed}")));
            }
            let mut session = TutorSession::new(owner, seed);
            let reply = self
                .begin(&mut session)
                .map_err(|e| e.in_session(session.id))?;
            self.sessions.save(session).await;
            Ok::<Reply, FlowError>(reply)
        })
        .await
    }

    fn begin(&self, session: &mut TutorSession) -> FlowResult<Reply> {
        let engine = self.engine();
        let mut txn = self.txn();
        let ended = engine.end_stack(&mut txn, &session.owner)?;
        if ended > 0 {
            debug!("ended {ended} instances left over by `{}`", session.owner);
        }

        let track = self.config.track_for(session.seed.kind).to_string();
        let seed = Attrs::from([
            (SEED.to_string(), ContextValue::from(session.seed.clone())),
            (THREAD.to_string(), ContextValue::from(session.seed.clone())),
        ]);
        session.root = Some(engine.push(&mut txn, &session.owner, &track, seed, None)?);
        let reply = self.orchestrator.run(&mut txn, session, Request::render())?;
        txn.commit()?;
        info!(
            "👣 session {} started for `{}` on `{track}`",
            session.id, session.owner
        );
        Ok(reply)
    }

    /// Answers the step the session is waiting on and moves on.
    pub async fn submit_input(&self, session: Uuid, answer: &str) -> FlowResult<Reply> {
        instrument_request("submit_input", move || async move {
            let (mut session, _guard) = self.checkout(session).await?;
            let reply = self
                .answer(&mut session, answer)
                .map_err(|e| e.in_session(session.id))?;
            self.sessions.save(session).await;
            Ok::<Reply, FlowError>(reply)
        })
        .await
    }

    fn answer(&self, session: &mut TutorSession, answer: &str) -> FlowResult<Reply> {
        let step_id = session
            .awaiting_step()
            .filter(|step| !step.is_delivered())
            .map(|step| step.id)
            .ok_or_else(|| FlowError::not_found(format!("pending step of session {}", session.id)))?;

        let engine = self.engine();
        let mut txn = self.txn();
        self.ensure_owns_stack(&mut txn, session)?;
        let top = txn
            .active(&session.owner)
            .ok_or_else(|| FlowError::not_found(format!("active flow of `{}`", session.owner)))?;
        let mut instance = txn.load(top)?;
        let node = engine.flows().node(instance.current_node)?;

        if let Some(edge) = engine.flows().outgoing(node.id, NEXT)? {
            if !engine
                .behaviors()
                .admits(&edge, &engine.scope(&node, &instance), answer)
            {
                debug!("🛑 `{}` refused {answer:?}", node.name);
                return Err(FlowError::InputRejected(edge.name.clone()));
            }
        }

        let step = {
            let step = session
                .step_mut(step_id)
                .ok_or_else(|| FlowError::not_found(format!("step {step_id}")))?;
            step.answer = Some(answer.to_string());
            step.clone()
        };
        engine.behaviors().handle_input(&mut InputCtx {
            node: &node,
            step: &step,
            session: &mut *session,
            instance: &mut instance,
            entities: engine.entities().as_ref(),
        })?;
        txn.save(instance)?;

        let reply = self
            .orchestrator
            .run(&mut txn, session, Request::answered(step_id))?;
        txn.commit()?;
        Ok(reply)
    }

    /// Queues a help item. It is shown the next time the session moves on.
    pub async fn request_help(&self, session: Uuid, text: &str) -> FlowResult<Uuid> {
        instrument_request("request_help", move || async move {
            let (mut session, _guard) = self.checkout(session).await?;
            let item = session.queue_help(text);
            debug!("queued help item {item} on session {}", session.id);
            self.sessions.save(session).await;
            Ok::<Uuid, FlowError>(item)
        })
        .await
    }

    /// Branches into the `resource` sub-flow for `thread`. The step the
    /// session was waiting on is shown again once the resource is done; if
    /// no `resource` flow is published it simply stays pending.
    pub async fn open_resource(&self, session: Uuid, thread: EntityRef) -> FlowResult<Reply> {
        instrument_request("open_resource", move || async move {
            let (mut session, _guard) = self.checkout(session).await?;
            if !self.engine().entities().exists(&thread) {
                return Err(FlowError::not_found(format!("entity {thread}")));
            }
            let reply = self
                .branch(&mut session, thread)
                .map_err(|e| e.in_session(session.id))?;
            self.sessions.save(session).await;
            Ok::<Reply, FlowError>(reply)
        })
        .await
    }

    fn branch(&self, session: &mut TutorSession, thread: EntityRef) -> FlowResult<Reply> {
        let mut txn = self.txn();
        self.ensure_owns_stack(&mut txn, session)?;
        let reply = self
            .orchestrator
            .run(&mut txn, session, Request::resource(thread))?;
        txn.commit()?;
        Ok(reply)
    }

    /// Flags `thread` as updated; the next `view_updates` gate shows it.
    pub async fn flag_update(&self, session: Uuid, thread: EntityRef) -> FlowResult<()> {
        instrument_request("flag_update", move || async move {
            let (mut session, _guard) = self.checkout(session).await?;
            session.update_flag = Some(thread);
            self.sessions.save(session).await;
            Ok::<(), FlowError>(())
        })
        .await
    }

    /// Base name of the flow `owner` is currently in.
    pub async fn active_flow(&self, owner: &str) -> FlowResult<Option<String>> {
        let _guard = self.lock(owner).await;
        let mut txn = self.txn();
        self.orchestrator.active_flow(&mut txn, owner)
    }

    /// Depth of the owner's flow stack.
    pub async fn stack_depth(&self, owner: &str) -> FlowResult<usize> {
        let _guard = self.lock(owner).await;
        let mut txn = self.txn();
        Ok(self.orchestrator.stack(&mut txn, owner)?.len())
    }

    /// Records `other`'s flow as running alongside `session`'s, e.g. a live
    /// co-session. The relation is one-way and owns nothing.
    pub async fn link_sessions(&self, session: Uuid, other: Uuid) -> FlowResult<()> {
        instrument_request("link_sessions", move || async move {
            let target = self
                .sessions
                .get(other)
                .await
                .ok_or_else(|| FlowError::not_found(format!("session {other}")))?;
            let (session, _guard) = self.checkout(session).await?;
            let mut txn = self.txn();
            self.ensure_owns_stack(&mut txn, &session)?;
            let root = session
                .root
                .ok_or_else(|| FlowError::not_found(format!("flow of session {}", session.id)))?;
            self.engine().link(&mut txn, root, target.root)?;
            txn.commit()?;
            debug!("linked session {} to {}", session.id, target.id);
            Ok::<(), FlowError>(())
        })
        .await
    }

    /// Instance the session's root flow is linked to.
    pub async fn linked_instance(&self, session: Uuid) -> FlowResult<Option<InstanceId>> {
        let (session, _guard) = self.checkout(session).await?;
        let Some(root) = session.root else {
            return Ok(None);
        };
        let mut txn = self.txn();
        match txn.load(root) {
            Ok(instance) => Ok(instance.linked),
            Err(FlowError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Tears down the owner's flow stack and forgets the session. A session
    /// superseded by a newer one leaves the newer stack alone.
    pub async fn end_session(&self, session: Uuid) -> FlowResult<usize> {
        instrument_request("end_session", move || async move {
            let (session, guard) = self.checkout(session).await?;
            let mut txn = self.txn();
            let ended = if self.owns_stack(&mut txn, &session)? {
                self.engine().end_stack(&mut txn, &session.owner)?
            } else {
                0
            };
            txn.commit()?;
            self.sessions.remove(session.id).await;
            drop(guard);
            self.release(&session.owner);
            info!("🏁 session {} ended", session.id);
            Ok::<usize, FlowError>(ended)
        })
        .await
    }
}
