mod common;

use common::*;
use courseflow::{
    config::EngineConfig,
    entity::EntityType,
    error::FlowError,
    message::{InputType, StepKind, SubKind},
};
use serde_json::json;

#[tokio::test]
async fn linear_flow_start_to_end() {
    let world = World::new(&[LINEAR]);
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let first = reply.next.clone().unwrap();
    assert!(reply.batch.is_empty());
    assert_eq!(first.kind, StepKind::Explanation);
    assert_eq!(first.text.as_deref(), Some("Halves and quarters"));
    assert_eq!(first.node, Some(world.node("lesson", "START")));
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));

    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    let question = reply.next.clone().unwrap();
    assert_eq!(question.node, Some(world.node("lesson", "QUESTION")));
    assert_eq!(question.input_type, InputType::Text);
    assert_eq!(question.text.as_deref(), Some("What is 1/2 + 1/4?"));

    let reply = tutor.submit_input(reply.session, "3/4").await.unwrap();
    let end = reply.next.clone().unwrap();
    assert_eq!(end.node, Some(world.node("lesson", "END")));
    assert_eq!(end.sub_kind, Some(SubKind::End));
    assert_eq!(tutor.active_flow("ada").await.unwrap(), None);

    let session = tutor.session(reply.session).await.unwrap();
    assert_eq!(session.awaiting, None);
    assert!(session.steps.iter().all(|s| s.is_delivered()));
    let answered = session.step(question.id).unwrap();
    assert_eq!(answered.answer.as_deref(), Some("3/4"));
}

#[tokio::test]
async fn empty_answer_is_rejected_without_side_effects() {
    let world = World::new(&[LINEAR]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    let question = reply.next.unwrap();

    let err = tutor.submit_input(reply.session, "   ").await.unwrap_err();
    assert_eq!(err, FlowError::InputRejected("next".into()));

    let session = tutor.session(reply.session).await.unwrap();
    assert_eq!(session.awaiting, Some(question.id));
    assert!(!session.step(question.id).unwrap().is_delivered());
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
}

#[tokio::test]
async fn faq_gate_enters_and_leaves_the_faq_flow() {
    let world = World::new(&[
        r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: lesson }
  - { name: GATE, role: faq }
  - { name: QUESTION, behavior: question }
  - { name: END, behavior: end }
edges:
  - { from: START, to: GATE }
  - { from: GATE, to: QUESTION }
  - { from: QUESTION, to: END }
"#,
        FAQ,
    ]);
    world.add(EntityType::Faq, "f1", json!({"parent": "t1", "title": "Why?"}));
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    let faq = reply.next.clone().unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("faq"));
    assert_eq!(faq.sub_kind, Some(SubKind::Faq));
    assert_eq!(faq.options, vec!["f1".to_string()]);
    assert_eq!(faq.content, Some(thread("t1")));
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 2);

    let reply = tutor.submit_input(reply.session, "f1").await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 1);
    // the faq flow's closing message is grouped ahead of the question
    assert_eq!(reply.batch.len(), 1);
    assert_eq!(reply.batch[0].flow.as_deref(), Some("faq"));
    let question = reply.next.unwrap();
    assert_eq!(question.node, Some(world.node("lesson", "QUESTION")));
}

#[tokio::test]
async fn faq_gate_without_open_faqs_is_passed() {
    let world = World::new(&[
        r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: lesson }
  - { name: GATE, role: faq }
  - { name: QUESTION, behavior: question }
edges:
  - { from: START, to: GATE }
  - { from: GATE, to: QUESTION }
"#,
        FAQ,
    ]);
    world.add(
        EntityType::Faq,
        "f1",
        json!({"parent": "t1", "title": "Why?", "resolved": true}),
    );
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    assert_eq!(reply.next.unwrap().node, Some(world.node("lesson", "QUESTION")));
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
}

const CLASSIFY: &str = r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: classify }
  - { name: END, behavior: end }
edges:
  - { from: START, to: END }
"#;

#[tokio::test]
async fn help_comes_before_remediation() {
    let world = World::new(&[CLASSIFY, HELP, ADDITIONAL]);
    world.add(
        EntityType::ErrorModel,
        "e1",
        json!({"parent": "t1", "title": "Added denominators", "remediation": "Keep the denominator"}),
    );
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let classify = reply.next.clone().unwrap();
    assert_eq!(classify.kind, StepKind::ErrorClassification);
    assert_eq!(classify.options, vec!["e1".to_string()]);

    let help_id = tutor.request_help(reply.session, "I'm stuck").await.unwrap();
    let reply = tutor.submit_input(reply.session, "e1").await.unwrap();

    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("help"));
    let help = reply.next.clone().unwrap();
    assert_eq!(help.id, help_id);
    assert_eq!(help.sub_kind, Some(SubKind::Help));
    assert_eq!(help.flow.as_deref(), Some("help"));

    let session = tutor.session(reply.session).await.unwrap();
    let remediation = session.pending_additional().unwrap().clone();
    assert_eq!(remediation.text.as_deref(), Some("Keep the denominator"));

    // leaving the help item picks up the remediation on top of the help flow
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("additional"));
    assert_eq!(reply.batch.len(), 1);
    let shown = &reply.batch[0];
    assert_eq!(shown.id, remediation.id);
    assert!(shown.is_additional);
    assert_eq!(shown.flow.as_deref(), Some("additional"));
    let button = reply.next.unwrap();
    assert_eq!(button.kind, StepKind::Button);
    assert_eq!(button.text.as_deref(), Some("Understood"));

    let reply = tutor.submit_input(reply.session, "continue").await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("help"));
    assert_eq!(reply.next.unwrap().text.as_deref(), Some("Got it"));

    let reply = tutor.submit_input(reply.session, "continue").await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
    assert_eq!(reply.next.unwrap().sub_kind, Some(SubKind::End));
    let session = tutor.session(reply.session).await.unwrap();
    assert!(session.pending_help().is_none());
    assert!(session.pending_additional().is_none());
}

#[tokio::test]
async fn resource_branch_returns_to_the_question() {
    let world = World::new(&[LINEAR, RESOURCE]);
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    let question = reply.next.unwrap();

    let reply = tutor.open_resource(reply.session, thread("t2")).await.unwrap();
    let resource = reply.next.clone().unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("resource"));
    assert_eq!(resource.sub_kind, Some(SubKind::Resource));
    assert_eq!(resource.content, Some(thread("t2")));

    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
    let again = reply.next.unwrap();
    assert_eq!(again.node, question.node);
    assert_ne!(again.id, question.id);
    assert_eq!(again.input_type, InputType::Text);
}

#[tokio::test]
async fn cyclic_flow_fails_without_committing() {
    let world = World::new(&[r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: lesson }
  - { name: A }
  - { name: B }
edges:
  - { from: START, to: A }
  - { from: A, to: B }
  - { from: B, to: A }
"#]);
    let tutor = &world.tutor;

    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let start = reply.next.unwrap();
    let err = tutor.submit_input(reply.session, "ok").await.unwrap_err();
    assert_eq!(err, FlowError::FlowCycleSuspected(4));

    let session = tutor.session(reply.session).await.unwrap();
    assert_eq!(session.awaiting, Some(start.id));
    assert!(!session.step(start.id).unwrap().is_delivered());
    // retrying hits the same wall from the same place
    let err = tutor.submit_input(reply.session, "ok").await.unwrap_err();
    assert_eq!(err, FlowError::FlowCycleSuspected(4));
}

#[tokio::test]
async fn max_steps_caps_the_budget() {
    let config = EngineConfig {
        max_steps: 1,
        ..EngineConfig::default()
    };
    let world = World::with_config(
        &[r#"
name: lesson
start: START
nodes:
  - { name: START, behavior: lesson }
  - { name: RULE, behavior: divider }
  - { name: QUESTION, behavior: question }
edges:
  - { from: START, to: RULE }
  - { from: RULE, to: QUESTION }
"#],
        config,
    );
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let err = tutor.submit_input(reply.session, "ok").await.unwrap_err();
    assert_eq!(err, FlowError::FlowCycleSuspected(1));
}

#[tokio::test]
async fn deleted_thread_makes_the_session_inconsistent() {
    let world = World::new(&[LINEAR]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();

    world.entities.remove(&thread("t1"));
    let err = tutor.submit_input(reply.session, "ok").await.unwrap_err();
    assert!(
        matches!(err, FlowError::SessionInconsistent { session, .. } if session == reply.session),
        "{err:?}"
    );
}

#[tokio::test]
async fn unknown_seed_is_not_found() {
    let world = World::new(&[LINEAR]);
    let err = world
        .tutor
        .start_session("ada", thread("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
    assert_eq!(world.tutor.active_flow("ada").await.unwrap(), None);
}

#[tokio::test]
async fn track_is_chosen_by_seed_type() {
    let mut config = EngineConfig::default();
    config
        .tracks
        .insert(EntityType::Unit, "lesson".to_string());
    config.default_track = "missing".to_string();
    let world = World::with_config(&[LINEAR], config);
    world.add(EntityType::Unit, "u1", json!({"title": "Unit one"}));

    let reply = world
        .tutor
        .start_session("ada", courseflow::entity::EntityRef::new(EntityType::Unit, "u1"))
        .await
        .unwrap();
    assert_eq!(reply.next.unwrap().text.as_deref(), Some("Unit one"));

    let err = world
        .tutor
        .start_session("bob", thread("t1"))
        .await
        .unwrap_err();
    assert_eq!(err, FlowError::not_found("flow `missing`"));
}

#[tokio::test]
async fn restarting_replaces_the_previous_stack() {
    let world = World::new(&[LINEAR, RESOURCE]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    tutor.open_resource(reply.session, thread("t2")).await.unwrap();
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 2);

    tutor.start_session("ada", thread("t2")).await.unwrap();
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 1);
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));
}

#[tokio::test]
async fn concurrent_submissions_are_serialized() {
    let world = World::new(&[LINEAR]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let id = reply.session;

    let (a, b) = tokio::join!(tutor.submit_input(id, "a"), tutor.submit_input(id, "b"));
    let nexts = [a.unwrap().next.unwrap(), b.unwrap().next.unwrap()];
    // whichever ran first answered START, the other answered QUESTION
    assert!(nexts.iter().any(|s| s.kind == StepKind::Question));
    assert!(nexts.iter().any(|s| s.sub_kind == Some(SubKind::End)));

    let session = tutor.session(id).await.unwrap();
    assert_eq!(session.awaiting, None);
    assert_eq!(tutor.active_flow("ada").await.unwrap(), None);
}

#[tokio::test]
async fn ending_a_session_clears_the_stack() {
    let world = World::new(&[LINEAR, RESOURCE]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    tutor.open_resource(reply.session, thread("t2")).await.unwrap();

    assert_eq!(tutor.end_session(reply.session).await.unwrap(), 2);
    assert!(tutor.session(reply.session).await.is_none());
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 0);
}

#[tokio::test]
async fn restarting_supersedes_the_earlier_session() {
    let world = World::new(&[LINEAR, RESOURCE]);
    let tutor = &world.tutor;
    let old = tutor.start_session("ada", thread("t1")).await.unwrap().session;
    let new = tutor.start_session("ada", thread("t2")).await.unwrap().session;

    let err = tutor.submit_input(old, "ok").await.unwrap_err();
    assert!(
        matches!(err, FlowError::SessionInconsistent { session, .. } if session == old),
        "{err:?}"
    );
    assert!(tutor.open_resource(old, thread("t1")).await.is_err());
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 1);

    // the newer session still gets its own question
    let reply = tutor.submit_input(new, "ok").await.unwrap();
    let question = reply.next.unwrap();
    assert_eq!(question.kind, StepKind::Question);
    assert_eq!(question.content, Some(thread("t2")));

    // ending the stale session leaves the newer stack running
    assert_eq!(tutor.end_session(old).await.unwrap(), 0);
    assert_eq!(tutor.stack_depth("ada").await.unwrap(), 1);
    let reply = tutor.submit_input(new, "0.5").await.unwrap();
    assert_eq!(reply.next.unwrap().sub_kind, Some(SubKind::End));
}

#[tokio::test]
async fn resource_waits_for_queued_help() {
    let world = World::new(&[LINEAR, RESOURCE, HELP]);
    let tutor = &world.tutor;
    let reply = tutor.start_session("ada", thread("t1")).await.unwrap();
    let reply = tutor.submit_input(reply.session, "ok").await.unwrap();
    let question = reply.next.unwrap();
    let session = reply.session;

    let help_id = tutor.request_help(session, "I'm stuck").await.unwrap();
    let reply = tutor.open_resource(session, thread("t2")).await.unwrap();
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("help"));
    let mut next = reply.next.unwrap();
    let mut shown = vec![(next.id, next.sub_kind)];
    assert_eq!(next.id, help_id);
    // the question is still owed, not answered
    let pending = tutor.session(session).await.unwrap();
    assert!(!pending.step(question.id).unwrap().is_delivered());
    assert!(pending.resource.is_some());

    // work through whatever comes until the question is back
    for _ in 0..6 {
        let answer = if next.kind == StepKind::Button { "continue" } else { "ok" };
        let reply = tutor.submit_input(session, answer).await.unwrap();
        shown.extend(reply.batch.iter().map(|s| (s.id, s.sub_kind)));
        next = reply.next.expect("the lesson is not over yet");
        shown.push((next.id, next.sub_kind));
        if next.node == question.node {
            break;
        }
    }
    assert_eq!(next.node, question.node, "question never came back");
    assert_ne!(next.id, question.id);
    assert_eq!(next.input_type, InputType::Text);
    assert_eq!(tutor.active_flow("ada").await.unwrap().as_deref(), Some("lesson"));

    let position = |kind: SubKind| shown.iter().position(|(_, sub)| *sub == Some(kind));
    let help = position(SubKind::Help).unwrap();
    let resource = position(SubKind::Resource).expect("resource was never shown");
    assert!(help < resource, "{shown:?}");

    let state = tutor.session(session).await.unwrap();
    assert!(state.pending_help().is_none());
    assert!(state.resource.is_none());
    assert!(state.step(question.id).unwrap().is_delivered());

    let reply = tutor.submit_input(session, "3/4").await.unwrap();
    assert_eq!(reply.next.unwrap().sub_kind, Some(SubKind::End));
}

#[tokio::test]
async fn linked_sessions_are_recorded_one_way() {
    let world = World::new(&[LINEAR]);
    let tutor = &world.tutor;
    let ada = tutor.start_session("ada", thread("t1")).await.unwrap().session;
    let bob = tutor.start_session("bob", thread("t1")).await.unwrap().session;

    tutor.link_sessions(ada, bob).await.unwrap();
    let bob_root = tutor.session(bob).await.unwrap().root;
    assert!(bob_root.is_some());
    assert_eq!(tutor.linked_instance(ada).await.unwrap(), bob_root);
    assert_eq!(tutor.linked_instance(bob).await.unwrap(), None);

    // the link rides along as ada moves on
    tutor.submit_input(ada, "ok").await.unwrap();
    assert_eq!(tutor.linked_instance(ada).await.unwrap(), bob_root);

    let err = tutor
        .link_sessions(ada, uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::NotFound(_)));
}
