//! Behaviors shipped with the runtime.
use tracing::warn;
use uuid::Uuid;

use super::{Behavior, BuildCtx, EnterAction, InputCtx, Scope};
use crate::{
    entity::{Entity, EntityRef, EntityResolver, EntityType},
    error::{FlowError, FlowResult},
    flow::{Edge, FlowInstance, NEXT, NodeId, TutorSession},
    message::{Draft, InputType, Step, StepKind, SubKind},
    util::{attrs_to_json, render_handlebars},
};

pub const SELF_ASSESS_OPTIONS: [&str; 3] = ["correct", "close", "different"];
pub const CONTINUE: &str = "continue";

/// Edge a self-assessed "correct" answer is routed along.
pub const SKIP: &str = "skip";

pub fn all() -> Vec<Box<dyn Behavior>> {
    vec![
        Box::new(Lesson),
        Box::new(Question),
        Box::new(Choice),
        Box::new(SelfAssess),
        Box::new(Classify),
        Box::new(MessageText),
        Box::new(Button),
        Box::new(Divider),
        Box::new(Faq),
        Box::new(PendingItem),
        Box::new(Resource),
        Box::new(Update),
        Box::new(Auto),
        Box::new(End),
    ]
}

/// FAQs on `thread` nobody marked resolved.
pub fn open_faqs(entities: &dyn EntityResolver, thread: &EntityRef) -> Vec<Entity> {
    entities
        .children(EntityType::Faq, thread)
        .into_iter()
        .filter(|f| !f.bool_field("resolved"))
        .collect()
}

/// Thread seeded into the instance, or the one the session focuses on.
fn focus(instance: &FlowInstance, session: &TutorSession) -> Option<EntityRef> {
    instance
        .attr_ref("thread")
        .cloned()
        .or_else(|| session.active_thread.clone())
}

fn thread(ctx: &BuildCtx<'_>) -> Option<EntityRef> {
    focus(ctx.instance, ctx.session)
}

fn fetch(entities: &dyn EntityResolver, r: &EntityRef) -> FlowResult<Entity> {
    entities
        .fetch(r)
        .ok_or_else(|| FlowError::UnresolvedReference(r.clone()))
}

/// Step over the thread in focus, titled from the entity or the node.
fn over_thread(ctx: &BuildCtx<'_>, kind: StepKind, field: &str) -> FlowResult<Step> {
    let mut step = Step::new(kind);
    let mut text = (!ctx.node.title.is_empty()).then(|| ctx.node.title.clone());
    if let Some(r) = thread(ctx) {
        let entity = fetch(ctx.entities, &r)?;
        if let Some(t) = entity.str_field(field).or_else(|| entity.str_field("title")) {
            text = Some(t.to_string());
        }
        step = step.content(r);
    }
    if let Some(text) = text {
        step = step.text(text);
    }
    Ok(step)
}

macro_rules! boxed {
    ($id:literal) => {
        fn id(&self) -> &'static str {
            $id
        }

        fn clone_box(&self) -> Box<dyn Behavior> {
            Box::new(self.clone())
        }
    };
}

#[derive(Debug, Clone)]
pub struct Lesson;

impl Behavior for Lesson {
    boxed!("lesson");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        Ok(Some(Draft::New(over_thread(ctx, StepKind::Explanation, "text")?)))
    }
}

/// Free-text question; empty answers are refused.
#[derive(Debug, Clone)]
pub struct Question;

impl Behavior for Question {
    boxed!("question");

    fn filter(&self, edge: &Edge, _scope: &Scope<'_>, candidate: &str) -> Option<bool> {
        (edge.name == NEXT).then(|| !candidate.trim().is_empty())
    }

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = over_thread(ctx, StepKind::Question, "question")?.input(InputType::Text);
        Ok(Some(Draft::New(step)))
    }
}

/// Multiple choice over `config.options`.
#[derive(Debug, Clone)]
pub struct Choice;

impl Behavior for Choice {
    boxed!("choice");

    fn filter(&self, edge: &Edge, scope: &Scope<'_>, candidate: &str) -> Option<bool> {
        if edge.name != NEXT {
            return None;
        }
        let options = scope.node.config_list("options");
        Some(options.is_empty() || options.iter().any(|o| o == candidate.trim()))
    }

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = over_thread(ctx, StepKind::Question, "question")?
            .input(InputType::Options)
            .options(ctx.node.config_list("options"));
        Ok(Some(Draft::New(step)))
    }
}

/// Asks the student to grade their own answer. A `correct` grade follows
/// the node's `skip` edge when it has one.
#[derive(Debug, Clone)]
pub struct SelfAssess;

impl Behavior for SelfAssess {
    boxed!("self_assess");

    fn filter(&self, edge: &Edge, _scope: &Scope<'_>, candidate: &str) -> Option<bool> {
        (edge.name == NEXT).then(|| SELF_ASSESS_OPTIONS.contains(&candidate.trim()))
    }

    fn on_edge(&self, edge: &Edge, scope: &Scope<'_>) -> FlowResult<Option<NodeId>> {
        if edge.name != NEXT || scope.instance.attr_str("self_assessment") != Some("correct") {
            return Ok(None);
        }
        Ok(scope.flows.outgoing(scope.node.id, SKIP)?.map(|skip| skip.to))
    }

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = over_thread(ctx, StepKind::Question, "assess")?
            .sub(SubKind::SelfAssess)
            .input(InputType::Options)
            .options(SELF_ASSESS_OPTIONS.iter().map(|s| s.to_string()).collect());
        Ok(Some(Draft::New(step)))
    }

    fn handle_input(&self, ctx: &mut InputCtx<'_>) -> FlowResult<()> {
        if let Some(answer) = ctx.step.answer.as_deref() {
            ctx.instance.set_attr("self_assessment", answer.trim());
        }
        Ok(())
    }
}

/// Lets the student pick the errors they made. Each pick queues a
/// remediation step.
#[derive(Debug, Clone)]
pub struct Classify;

impl Classify {
    fn errors(entities: &dyn EntityResolver, thread: &EntityRef) -> Vec<Entity> {
        entities.children(EntityType::ErrorModel, thread)
    }
}

impl Behavior for Classify {
    boxed!("classify");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let mut step = over_thread(ctx, StepKind::ErrorClassification, "classify")?
            .input(InputType::Options);
        if let Some(r) = thread(ctx) {
            step = step.options(
                Self::errors(ctx.entities, &r)
                    .into_iter()
                    .map(|e| e.reference.id)
                    .collect(),
            );
        }
        Ok(Some(Draft::New(step)))
    }

    fn handle_input(&self, ctx: &mut InputCtx<'_>) -> FlowResult<()> {
        let Some(thread) = focus(ctx.instance, ctx.session) else {
            return Ok(());
        };
        let errors = Self::errors(ctx.entities, &thread);
        let picked = ctx.step.answer.as_deref().unwrap_or_default();
        for id in picked.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some(error) = errors.iter().find(|e| e.reference.id == id) else {
                warn!("ignoring unknown error model `{id}`");
                continue;
            };
            let mut step = Step::new(StepKind::Message)
                .sub(SubKind::Remediation)
                .content(error.reference.clone());
            if let Some(text) = error.str_field("remediation").or_else(|| error.str_field("title")) {
                step = step.text(text);
            }
            step.is_additional = true;
            step.error = Some(error.reference.clone());
            ctx.session.push_step(step);
        }
        Ok(())
    }
}

/// Templated text from the node's help text (or title) over the context.
#[derive(Debug, Clone)]
pub struct MessageText;

impl Behavior for MessageText {
    boxed!("message");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let template = ctx
            .node
            .help_text
            .as_deref()
            .unwrap_or(ctx.node.title.as_str());
        let text = render_handlebars(template, &attrs_to_json(ctx.instance.attrs()));
        Ok(Some(Draft::New(Step::new(StepKind::Message).text(text))))
    }
}

#[derive(Debug, Clone)]
pub struct Button;

impl Behavior for Button {
    boxed!("button");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = Step::new(StepKind::Button)
            .text(ctx.node.title.clone())
            .input(InputType::Options)
            .options(vec![CONTINUE.to_string()]);
        Ok(Some(Draft::New(step)))
    }
}

#[derive(Debug, Clone)]
pub struct Divider;

impl Behavior for Divider {
    boxed!("divider");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        Ok(Some(Draft::New(
            Step::new(StepKind::Divider).text(ctx.node.title.clone()),
        )))
    }
}

/// Lists the open FAQs of the seeded thread.
#[derive(Debug, Clone)]
pub struct Faq;

impl Behavior for Faq {
    boxed!("faq");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let Some(r) = thread(ctx) else {
            return Ok(None);
        };
        fetch(ctx.entities, &r)?;
        let options = open_faqs(ctx.entities, &r)
            .into_iter()
            .map(|f| f.reference.id)
            .collect();
        let step = Step::new(StepKind::Message)
            .sub(SubKind::Faq)
            .content(r)
            .text(ctx.node.title.clone())
            .input(InputType::Options)
            .options(options);
        Ok(Some(Draft::New(step)))
    }
}

/// Presents the queued help or remediation item the sub-flow was seeded with.
#[derive(Debug, Clone)]
pub struct PendingItem;

impl Behavior for PendingItem {
    boxed!("pending_item");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let Some(raw) = ctx.instance.attr_str("item") else {
            return Ok(None);
        };
        let id = Uuid::parse_str(raw)
            .map_err(|e| FlowError::Serialization(format!("bad item id `{raw}`: {e}")))?;
        Ok(Some(Draft::Queued(id)))
    }
}

#[derive(Debug, Clone)]
pub struct Resource;

impl Behavior for Resource {
    boxed!("resource");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = over_thread(ctx, StepKind::Explanation, "resource")?.sub(SubKind::Resource);
        Ok(Some(Draft::New(step)))
    }
}

#[derive(Debug, Clone)]
pub struct Update;

impl Behavior for Update {
    boxed!("update");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let step = over_thread(ctx, StepKind::Message, "update")?.sub(SubKind::Update);
        Ok(Some(Draft::New(step)))
    }
}

/// Passes straight through along `next` on entry.
#[derive(Debug, Clone)]
pub struct Auto;

impl Behavior for Auto {
    boxed!("auto");

    fn on_enter(&self, _scope: &Scope<'_>) -> FlowResult<Option<EnterAction>> {
        Ok(Some(EnterAction::Follow(NEXT.to_string())))
    }
}

#[derive(Debug, Clone)]
pub struct End;

impl Behavior for End {
    boxed!("end");

    fn build_message(&self, ctx: &BuildCtx<'_>) -> FlowResult<Option<Draft>> {
        let text = if ctx.node.title.is_empty() {
            "Done".to_string()
        } else {
            ctx.node.title.clone()
        };
        Ok(Some(Draft::New(
            Step::new(StepKind::Message).sub(SubKind::End).text(text),
        )))
    }
}
