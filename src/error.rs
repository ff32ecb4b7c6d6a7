use thiserror::Error;
use uuid::Uuid;

use crate::entity::EntityRef;

/// Errors raised by the flow runtime and the step orchestrator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FlowError {
    /// A flow, node, edge, instance or step does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A context reference points at an entity that no longer exists.
    #[error("unresolved reference {0}")]
    UnresolvedReference(EntityRef),

    /// Surfaced by the orchestrator when persisted session state cannot be
    /// resolved any more. Retryable only after operator intervention.
    #[error("session {session} is inconsistent: {reason}")]
    SessionInconsistent { session: Uuid, reason: String },

    /// A flow references a behavior id that is not registered.
    #[error("could not load behavior `{behavior}` for node `{node}`")]
    PluginLoadError { node: String, behavior: String },

    /// Popping an instance that has no parent.
    #[error("instance {0} has no parent to pop back to")]
    InvalidPop(Uuid),

    /// The orchestrator exceeded its step budget.
    #[error("flow cycle suspected after {0} steps")]
    FlowCycleSuspected(usize),

    /// A flow definition failed structural validation.
    #[error("invalid flow `{flow}`: {reason}")]
    InvalidFlow { flow: String, reason: String },

    /// A behavior routed an edge to a node of another flow.
    #[error("edge `{edge}` leads outside of flow `{flow}`")]
    ForeignNode { edge: String, flow: String },

    /// An edge filter refused the submitted answer.
    #[error("input rejected by edge `{0}`")]
    InputRejected(String),

    /// Optimistic version check failed on commit.
    #[error("instance {id} was modified concurrently (expected v{expected}, found v{found})")]
    Conflict { id: Uuid, expected: u64, found: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FlowError::NotFound(what.into())
    }

    /// Maps reference failures onto the retryable session error, leaves
    /// everything else untouched.
    pub fn in_session(self, session: Uuid) -> Self {
        match self {
            FlowError::UnresolvedReference(r) => FlowError::SessionInconsistent {
                session,
                reason: format!("unresolved reference {r}"),
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
