#![allow(dead_code)]
use std::sync::Arc;

use courseflow::{
    behavior::BehaviorRegistry,
    config::EngineConfig,
    entity::{EntityRef, EntityType, InMemoryEntityStore},
    flow::{FlowDef, FlowStore},
    tutor::Tutor,
};
use serde_json::json;

pub const LINEAR: &str = r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: lesson }
  - { name: QUESTION, behavior: question }
  - { name: END, behavior: end }
edges:
  - { from: START, to: QUESTION }
  - { from: QUESTION, to: END }
"#;

pub const FAQ: &str = r#"
name: faq
start: LIST
nodes:
  - { name: LIST, title: Open questions, behavior: faq }
  - { name: END, title: Back to work, behavior: end }
edges:
  - { from: LIST, to: END }
"#;

pub const HELP: &str = r#"
name: help
start: ITEM
nodes:
  - { name: ITEM, behavior: pending_item }
  - { name: DONE, title: Got it, behavior: button }
  - { name: END }
edges:
  - { from: ITEM, to: DONE }
  - { from: DONE, to: END }
"#;

pub const ADDITIONAL: &str = r#"
name: additional
start: ITEM
nodes:
  - { name: ITEM, behavior: pending_item }
  - { name: DONE, title: Understood, behavior: button }
  - { name: END }
edges:
  - { from: ITEM, to: DONE }
  - { from: DONE, to: END }
"#;

pub const RESOURCE: &str = r#"
name: resource
start: SHOW
nodes:
  - { name: SHOW, behavior: resource }
  - { name: END }
edges:
  - { from: SHOW, to: END }
"#;

pub fn flow(yaml: &str) -> FlowDef {
    serde_yaml_bw::from_str(yaml).expect("fixture flow parses")
}

pub fn thread(id: &str) -> EntityRef {
    EntityRef::new(EntityType::Thread, id)
}

pub struct World {
    pub flows: Arc<FlowStore>,
    pub entities: Arc<InMemoryEntityStore>,
    pub tutor: Tutor,
}

impl World {
    pub fn new(flows: &[&str]) -> Self {
        Self::with_config(flows, EngineConfig::default())
    }

    pub fn with_config(flows: &[&str], config: EngineConfig) -> Self {
        let store = Arc::new(FlowStore::new(Arc::new(BehaviorRegistry::with_builtins())));
        for yaml in flows {
            store.publish(&flow(yaml)).expect("fixture flow publishes");
        }

        let entities = Arc::new(InMemoryEntityStore::new());
        entities.insert(
            thread("t1"),
            json!({"title": "Fractions", "text": "Halves and quarters", "question": "What is 1/2 + 1/4?"}),
        );
        entities.insert(thread("t2"), json!({"title": "Decimals"}));

        let tutor = Tutor::new(store.clone(), entities.clone(), config);
        Self {
            flows: store,
            entities,
            tutor,
        }
    }

    pub fn add(&self, kind: EntityType, id: &str, data: serde_json::Value) {
        self.entities.insert(EntityRef::new(kind, id), data);
    }

    /// Id of node `name` in the active version of `flow`.
    pub fn node(&self, flow: &str, name: &str) -> courseflow::flow::NodeId {
        let flow = self.flows.flow_by_name(flow).unwrap();
        self.flows.get_node(flow.id, name).unwrap().id
    }
}
