use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{entity::EntityRef, flow::NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Explanation,
    Question,
    Message,
    Button,
    ErrorClassification,
    Divider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubKind {
    Faq,
    SelfAssess,
    Remediation,
    Help,
    Resource,
    Update,
    End,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    None,
    Text,
    Options,
    Custom,
}

/// Which kinds may be shown right after a given kind without waiting for the
/// student.
static GROUPS_WITH: Lazy<HashMap<StepKind, HashSet<StepKind>>> = Lazy::new(|| {
    use StepKind::*;
    HashMap::from([
        (Explanation, HashSet::from([Explanation, Question, Divider])),
        (Question, HashSet::from([Explanation, Message, Divider])),
        (Message, HashSet::from([Message, Button, ErrorClassification])),
        (Divider, HashSet::from([Explanation, Question, Message])),
        (Button, HashSet::new()),
        (ErrorClassification, HashSet::new()),
    ])
});

/// One unit of conversation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: Uuid,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_kind: Option<SubKind>,
    #[serde(default)]
    pub input_type: InputType,
    /// Domain content this step renders, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub content: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Remediation-track step, as opposed to the main track.
    #[serde(default)]
    pub is_additional: bool,
    /// Classified error this step remediates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub error: Option<EntityRef>,
    /// When the step was delivered. `None` while still pending.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub created: DateTime<Utc>,
}

impl Step {
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sub_kind: None,
            input_type: InputType::None,
            content: None,
            text: None,
            options: Vec::new(),
            is_additional: false,
            error: None,
            timestamp: None,
            node: None,
            flow: None,
            answer: None,
            created: Utc::now(),
        }
    }

    pub fn sub(mut self, sub_kind: SubKind) -> Self {
        self.sub_kind = Some(sub_kind);
        self
    }

    pub fn input(mut self, input_type: InputType) -> Self {
        self.input_type = input_type;
        self
    }

    pub fn content(mut self, content: EntityRef) -> Self {
        self.content = Some(content);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn is_delivered(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn deliver(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    pub fn is_faq(&self) -> bool {
        self.sub_kind == Some(SubKind::Faq)
    }

    pub fn requires_input(&self) -> bool {
        matches!(self.input_type, InputType::Text | InputType::Options)
    }

    /// Whether `self` may be shown in the same reply as `prev`.
    pub fn groups_after(&self, prev: &Step) -> bool {
        let allowed = GROUPS_WITH
            .get(&prev.kind)
            .is_some_and(|next| next.contains(&self.kind));
        allowed || (prev.kind == StepKind::Message && self.is_faq())
    }

    /// Whether grouping may carry on past this step.
    pub fn lets_grouping_continue(&self) -> bool {
        !self.requires_input() || self.is_faq()
    }
}

/// What a behavior hands back when asked to build a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Draft {
    /// A fresh step.
    New(Step),
    /// An already queued step (help or remediation item) to present here.
    Queued(Uuid),
}
