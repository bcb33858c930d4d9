//! Pause/resume control and checkpoint-based resumption.

mod common;

use common::*;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use loomflow::checkpoint::{CheckpointStore, InMemoryCheckpointStore, WorkflowCheckpoint};
use loomflow::engine::WorkflowEngine;
use loomflow::events::Event;
use loomflow::message::{ExecutionScope, NodeMessage, ValueMap};
use loomflow::queue::{EnvelopeStatus, QueuedEnvelope};
use loomflow::types::WorkflowStatus;

#[tokio::test(flavor = "multi_thread")]
async fn pause_suspends_leasing_and_resume_restores_it() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = loomflow::config::EngineConfig::default()
        .with_grace_period(std::time::Duration::from_millis(500));
    let rig = TestRig::with_config(config);
    let log = rig.log.clone();
    let executions_of = move |node: &str| log.lock().iter().filter(|r| r.node_id == node).count();
    let engine = Arc::new(rig.engine.with_checkpoint_store(store.clone()));

    let mut events = engine.subscribe_events();
    let definition = graph("pausable")
        .with_node(config_value(native("A", "test.sleep"), "Millis", json!(150)))
        .with_node(native("B", "test.echo"))
        .with_edge(on_complete("A", "B"));

    let runner = engine.clone();
    let run = tokio::spawn(async move {
        runner
            .start(definition, ValueMap::default(), None, CancellationToken::new())
            .await
    });

    let instance_id = loop {
        match events.recv().await.unwrap() {
            Event::Workflow(wf) => break wf.instance_id,
            _ => continue,
        }
    };

    // Pause while A is still sleeping: B's lease must not be taken.
    engine.pause(instance_id).await.unwrap();
    let snapshot = engine.get_workflow_status(instance_id).unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Paused);

    // A finishes and routes to B, but B stays queued while paused.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    assert_eq!(executions_of("B"), 0);
    let queued: usize = engine
        .get_workflow_status(instance_id)
        .unwrap()
        .queue_counts
        .values()
        .map(|c| c.ready)
        .sum();
    assert!(queued >= 1, "B's message should be waiting");

    // The pause wrote a checkpoint.
    let checkpoint = store.load(instance_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.workflow_id, "pausable");

    engine.resume(instance_id).unwrap();
    let ctx = run.await.unwrap().unwrap();
    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(executions_of("B"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_from_checkpoint_redelivers_queued_messages() {
    let rig = TestRig::new();

    let definition = graph("resumable")
        .with_node(noop("A"))
        .with_node(native("B", "test.echo"))
        .with_edge(on_complete("A", "B"));

    // Hand-build the state after A completed: B's queue holds the routed
    // message, captured while in flight.
    let mut scope = ExecutionScope::default();
    scope.input.insert("value".into(), json!(10));
    let message = NodeMessage::complete("A", Uuid::new_v4(), scope, None);
    let envelope = QueuedEnvelope {
        envelope_id: Uuid::new_v4(),
        sequence: 0,
        message,
        enqueued_at: Utc::now(),
        retry_count: 0,
        max_retries: 3,
        visibility_timeout: std::time::Duration::from_millis(200),
        visible_after: Utc::now(),
        status: EnvelopeStatus::InFlight,
        lease_id: Some(Uuid::new_v4()),
        last_error: None,
    };

    let mut queues = rustc_hash::FxHashMap::default();
    queues.insert("B".to_string(), vec![envelope]);
    let original_instance = Uuid::new_v4();
    let checkpoint = WorkflowCheckpoint {
        instance_id: original_instance,
        workflow_id: "resumable".into(),
        status: WorkflowStatus::Paused,
        variables: ValueMap::default(),
        node_instances: Vec::new(),
        queues,
        created_at: Utc::now(),
    };

    let ctx = rig
        .engine
        .resume_from_checkpoint(definition, checkpoint, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    // The run keeps its identity across the resume.
    assert_eq!(ctx.instance_id, original_instance);
    // B was redelivered from the checkpoint; A never re-ran because its
    // queue held nothing.
    assert_eq!(rig.executions_of("B"), 1);
    let input = rig.log.lock()[0].input.clone();
    assert_eq!(input["value"], json!(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_runs_are_checkpointed_and_listed_complete() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let config = loomflow::config::EngineConfig::default();
    let engine = WorkflowEngine::new(config).with_checkpoint_store(store.clone());

    let definition = graph("archived").with_node(noop("only"));
    let ctx = engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    let checkpoint = store.load(ctx.instance_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.status, WorkflowStatus::Completed);
    assert!(store.list_incomplete().await.unwrap().is_empty());
}
