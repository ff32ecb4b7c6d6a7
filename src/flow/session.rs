use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    entity::EntityRef,
    flow::InstanceId,
    message::{Step, StepKind, SubKind},
};

/// The conversation record of one student working through one seed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorSession {
    pub id: Uuid,
    pub owner: String,
    pub seed: EntityRef,
    /// Thread currently in focus.
    pub active_thread: Option<EntityRef>,
    /// Thread whose update should be shown at the next `view_updates` gate.
    pub update_flag: Option<EntityRef>,
    pub steps: Vec<Step>,
    /// The step last handed to the student as "next".
    pub awaiting: Option<Uuid>,
    /// Bottom instance of the flow stack this session started.
    #[serde(default)]
    pub root: Option<InstanceId>,
    /// Resource branch waiting for queued help and remediation.
    #[serde(default)]
    pub resource: Option<ResourceRequest>,
    pub created: DateTime<Utc>,
}

/// A branch into the `resource` sub-flow, taken once the student is back on
/// the instance it was asked from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub thread: EntityRef,
    pub from: InstanceId,
    /// Step the student left unanswered to look at the resource.
    pub step: Option<Uuid>,
}

impl TutorSession {
    pub fn new(owner: impl Into<String>, seed: EntityRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            active_thread: Some(seed.clone()),
            seed,
            update_flag: None,
            steps: Vec::new(),
            awaiting: None,
            root: None,
            resource: None,
            created: Utc::now(),
        }
    }

    pub fn step(&self, id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn awaiting_step(&self) -> Option<&Step> {
        self.awaiting.and_then(|id| self.step(id))
    }

    pub fn push_step(&mut self, step: Step) -> Uuid {
        let id = step.id;
        self.steps.push(step);
        id
    }

    /// Queued items are steps that were never placed on a node nor shown.
    fn queued(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.node.is_none() && !s.is_delivered())
    }

    /// Oldest outstanding help item.
    pub fn pending_help(&self) -> Option<&Step> {
        self.queued()
            .filter(|s| s.sub_kind == Some(SubKind::Help))
            .min_by_key(|s| s.created)
    }

    /// Outstanding remediation item, ordered by the error it remediates.
    pub fn pending_additional(&self) -> Option<&Step> {
        self.queued()
            .filter(|s| s.is_additional && s.error.is_some())
            .min_by(|a, b| a.error.cmp(&b.error).then(a.created.cmp(&b.created)))
    }

    pub fn queue_help(&mut self, text: impl Into<String>) -> Uuid {
        self.push_step(Step::new(StepKind::Message).sub(SubKind::Help).text(text))
    }
}

pub type SessionStore = Arc<dyn SessionStoreType>;

/// Keeps tutoring sessions between requests.
#[async_trait]
pub trait SessionStoreType: Send + Sync + Debug {
    async fn get(&self, id: Uuid) -> Option<TutorSession>;

    async fn save(&self, session: TutorSession);

    async fn remove(&self, id: Uuid);
}

#[derive(Clone, Debug)]
pub struct InMemorySessionStore {
    cache: Cache<Uuid, Arc<TutorSession>>,
}

impl InMemorySessionStore {
    /// Creates a store whose sessions expire after `ttl_secs` without access.
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<Uuid>, _value: Arc<TutorSession>, cause| {
                info!("Session expired: key={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl SessionStoreType for InMemorySessionStore {
    async fn get(&self, id: Uuid) -> Option<TutorSession> {
        self.cache.get(&id).await.map(|s| s.as_ref().clone())
    }

    async fn save(&self, session: TutorSession) {
        self.cache.insert(session.id, Arc::new(session)).await;
    }

    async fn remove(&self, id: Uuid) {
        self.cache.invalidate(&id).await;
    }
}
