//! Flow definitions as authored in files, and the immutable runtime records
//! they are published into.
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{FlowError, FlowResult};

/// Suffix given to the superseded version of a flow on republish.
pub const OLD_SUFFIX: &str = "__old";

/// Name of the edge the orchestrator follows by default.
pub const NEXT: &str = "next";

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(FlowId);
id_type!(NodeId);
id_type!(EdgeId);
id_type!(InstanceId);

/// What the orchestrator does when an instance sits on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Normal,
    /// Enters the `faq` sub-flow when the current thread has open FAQs.
    Faq,
    /// Like `faq`, but for the thread the student answered on.
    FaqUpdates,
    /// Enters the `updates` sub-flow when an update was flagged.
    ViewUpdates,
}

impl NodeRole {
    pub fn is_gate(&self) -> bool {
        !matches!(self, NodeRole::Normal)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UiHints {
    #[serde(default)]
    pub hide_tabs: bool,
    #[serde(default)]
    pub hide_links: bool,
    #[serde(default)]
    pub hide_nav: bool,
}

/// A flow document as authored in YAML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowDef {
    /// Unique name the flow is published under.
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// Name of the node new instances start on.
    pub start: String,
    #[serde(flatten)]
    pub ui: UiHints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDef {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Behavior registry id governing this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub role: NodeRole,
    /// Free-form parameters handed to the behavior.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeDef {
    pub from: String,
    pub to: String,
    #[serde(default = "EdgeDef::default_name")]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl EdgeDef {
    fn default_name() -> String {
        NEXT.to_string()
    }
}

impl FlowDef {
    /// Structural checks that a JSON schema cannot express.
    pub fn validate(&self) -> FlowResult<()> {
        let invalid = |reason: String| FlowError::InvalidFlow {
            flow: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("flow name is empty".into()));
        }
        if self.name.ends_with(OLD_SUFFIX) {
            return Err(invalid(format!("names ending in `{OLD_SUFFIX}` are reserved")));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(invalid("node with empty name".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(invalid(format!("duplicate node `{}`", node.name)));
            }
        }
        if !names.contains(self.start.as_str()) {
            return Err(invalid(format!("start node `{}` is not defined", self.start)));
        }

        let mut outgoing: HashMap<&str, HashSet<&str>> = HashMap::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !names.contains(end.as_str()) {
                    return Err(invalid(format!(
                        "edge `{}` references unknown node `{end}`",
                        edge.name
                    )));
                }
            }
            if !outgoing.entry(edge.from.as_str()).or_default().insert(edge.name.as_str()) {
                return Err(invalid(format!(
                    "node `{}` has two outgoing edges named `{}`",
                    edge.from, edge.name
                )));
            }
        }
        Ok(())
    }
}

/// A published flow. Never mutated except for the rename on republish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub title: String,
    pub start_node: NodeId,
    pub ui: UiHints,
    pub owner: Option<String>,
    pub created: DateTime<Utc>,
}

impl Flow {
    /// The name without the superseded-version suffix.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }

    pub fn is_superseded(&self) -> bool {
        self.name.ends_with(OLD_SUFFIX)
    }
}

pub fn base_name(name: &str) -> &str {
    let mut name = name;
    while let Some(stripped) = name.strip_suffix(OLD_SUFFIX) {
        name = stripped;
    }
    name
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub flow: FlowId,
    pub name: String,
    pub title: String,
    pub help_text: Option<String>,
    pub path_override: Option<String>,
    pub behavior_id: Option<String>,
    pub logging_enabled: bool,
    pub role: NodeRole,
    pub config: Option<Value>,
}

impl Node {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.as_ref()?.get(key)?.as_str()
    }

    pub fn config_list(&self, key: &str) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub flow: FlowId,
    pub name: String,
    pub from: NodeId,
    pub to: NodeId,
    pub title: String,
    pub help_text: Option<String>,
}

/// Runtime records for one publish call, built before anything is written.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub flow: Flow,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl FlowDef {
    pub fn compile(&self) -> FlowResult<Compiled> {
        self.validate()?;
        let flow_id = FlowId::new();

        let nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|n| Node {
                id: NodeId::new(),
                flow: flow_id,
                name: n.name.clone(),
                title: n.title.clone(),
                help_text: n.help.clone(),
                path_override: n.path.clone(),
                behavior_id: n.behavior.clone(),
                logging_enabled: n.logging,
                role: n.role,
                config: n.config.clone(),
            })
            .collect();
        let by_name: HashMap<&str, NodeId> =
            nodes.iter().map(|n| (n.name.as_str(), n.id)).collect();

        let edges = self
            .edges
            .iter()
            .map(|e| Edge {
                id: EdgeId::new(),
                flow: flow_id,
                name: e.name.clone(),
                from: by_name[e.from.as_str()],
                to: by_name[e.to.as_str()],
                title: e.title.clone(),
                help_text: e.help.clone(),
            })
            .collect();

        let flow = Flow {
            id: flow_id,
            name: self.name.clone(),
            title: self.title.clone(),
            start_node: by_name[self.start.as_str()],
            ui: self.ui,
            owner: self.owner.clone(),
            created: Utc::now(),
        };
        Ok(Compiled { flow, nodes, edges })
    }
}
