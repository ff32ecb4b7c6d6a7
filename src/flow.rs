//! Flow definitions, published flows, instances and the tutoring session.
pub mod engine;
pub mod instance;
pub mod loader;
pub mod session;
pub mod spec;
pub mod store;

pub use engine::{FlowEngine, Transition};
pub use instance::{
    AuditEntry, Changeset, FlowInstance, InMemoryInstanceStore, InstanceStore, InstanceTxn,
};
pub use session::{
    InMemorySessionStore, ResourceRequest, SessionStore, SessionStoreType, TutorSession,
};
pub use spec::{
    Compiled, Edge, EdgeDef, EdgeId, Flow, FlowDef, FlowId, InstanceId, NEXT, Node, NodeDef,
    NodeId, NodeRole, OLD_SUFFIX, UiHints, base_name,
};
pub use store::FlowStore;
