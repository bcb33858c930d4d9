//! End-to-end workflow runs against the engine.

mod common;

use common::*;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use loomflow::definition::EdgeDefinition;
use loomflow::message::ValueMap;
use loomflow::types::{EdgeKind, NodeStatus, RuntimeKind, WorkflowStatus};

#[tokio::test(flavor = "multi_thread")]
async fn linear_three_node_pipeline() {
    let rig = TestRig::new();
    let definition = graph("linear")
        .with_node(script("A", "value = 10"))
        .with_node(script("B", "value = 20"))
        .with_node(script("C", "value = 30"))
        .with_edge(on_complete("A", "B"))
        .with_edge(on_complete("B", "C"));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);

    let mut instances = ctx.instances_snapshot();
    instances.sort_by_key(|i| i.started_at);
    let order: Vec<&str> = instances.iter().map(|i| i.node_id.as_str()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
    assert!(instances.iter().all(|i| i.status == NodeStatus::Completed));

    let c = instances.iter().find(|i| i.node_id == "C").unwrap();
    assert_eq!(c.scope.output["value"], json!(30));
    // B saw A's output as input.
    let b = instances.iter().find(|i| i.node_id == "B").unwrap();
    assert_eq!(b.scope.input["value"], json!(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn branch_on_variable_takes_true_path() {
    let rig = TestRig::new();
    let definition = graph("branching")
        .with_node(script("A", "x = 7"))
        .with_node(
            config_value(
                loomflow::definition::NodeDefinition::new("Branch", RuntimeKind::Branch),
                "Condition",
                json!("output.x > 5"),
            ),
        )
        .with_node(native("T", "test.echo"))
        .with_node(native("F", "test.echo"))
        .with_edge(on_complete("A", "Branch"))
        .with_edge(EdgeDefinition::new("Branch", "T", EdgeKind::TrueBranch))
        .with_edge(EdgeDefinition::new("Branch", "F", EdgeKind::FalseBranch));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(rig.executions_of("T"), 1);
    assert_eq!(rig.executions_of("F"), 0);

    let instances = ctx.instances_snapshot();
    let ran: Vec<&str> = instances.iter().map(|i| i.node_id.as_str()).collect();
    assert!(ran.contains(&"A") && ran.contains(&"Branch") && ran.contains(&"T"));
    assert!(!ran.contains(&"F"));

    let branch = instances.iter().find(|i| i.node_id == "Branch").unwrap();
    assert_eq!(branch.source_port.as_deref(), Some("true-branch"));
}

#[tokio::test(flavor = "multi_thread")]
async fn foreach_fans_out_one_next_per_item() {
    let rig = TestRig::new();
    let definition = graph("foreach")
        .with_node(script("Source", "items = [1, 2, 3]"))
        .with_node(config_value(
            loomflow::definition::NodeDefinition::new("ForEach", RuntimeKind::LoopForeach),
            "CollectionExpression",
            json!("input.items"),
        ))
        .with_node(native("Worker", "test.echo"))
        .with_edge(on_complete("Source", "ForEach"))
        .with_edge(EdgeDefinition::new("ForEach", "Worker", EdgeKind::LoopBody));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(rig.executions_of("Worker"), 3);

    let items: Vec<_> = rig
        .log
        .lock()
        .iter()
        .filter(|r| r.node_id == "Worker")
        .map(|r| r.input["item"].clone())
        .collect();
    let mut items: Vec<i64> = items.iter().filter_map(|v| v.as_i64()).collect();
    items.sort_unstable();
    assert_eq!(items, vec![1, 2, 3]);

    let instances = ctx.instances_snapshot();
    let foreach = instances.iter().find(|i| i.node_id == "ForEach").unwrap();
    assert_eq!(foreach.source_port.as_deref(), Some("loop-body"));
}

#[tokio::test(flavor = "multi_thread")]
async fn while_loop_feeds_back_until_condition_fails() {
    let rig = TestRig::new();
    let definition = graph("while")
        .with_default_variable("w", json!(0))
        .with_node(config_value(
            loomflow::definition::NodeDefinition::new("w", RuntimeKind::LoopWhile),
            "Condition",
            json!("variables.w < 2"),
        ))
        .with_node(native("Body", "test.echo"))
        .with_node(native("After", "test.echo"))
        .with_edge(EdgeDefinition::new("w", "Body", EdgeKind::LoopBody))
        .with_edge(EdgeDefinition::new("Body", "w", EdgeKind::IterationCheck))
        .with_edge(EdgeDefinition::new("w", "After", EdgeKind::LoopExit));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(rig.executions_of("Body"), 2);
    assert_eq!(rig.executions_of("After"), 1);
    // Counter keyed by the node id.
    assert_eq!(ctx.variable("w"), Some(json!(2)));
}

#[tokio::test(flavor = "multi_thread")]
async fn switch_routes_to_matched_case_port() {
    let rig = TestRig::new();
    let definition = graph("switching")
        .with_node(script("Source", "color = \"red\""))
        .with_node(
            config_value(
                config_value(
                    loomflow::definition::NodeDefinition::new("Switch", RuntimeKind::Switch),
                    "Expression",
                    json!("input.color"),
                ),
                "Cases",
                json!({"red": "stop", "green": "go"}),
            ),
        )
        .with_node(native("Stop", "test.echo"))
        .with_node(native("Go", "test.echo"))
        .with_edge(on_complete("Source", "Switch"))
        .with_edge(
            EdgeDefinition::new("Switch", "Stop", EdgeKind::SwitchCase).with_source_port("stop"),
        )
        .with_edge(EdgeDefinition::new("Switch", "Go", EdgeKind::SwitchCase).with_source_port("go"));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(rig.executions_of("Stop"), 1);
    assert_eq!(rig.executions_of("Go"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn handled_failure_takes_the_fail_edge() {
    let rig = TestRig::new();
    let definition = graph("recovery")
        .with_node(native("A", "test.fail"))
        .with_node(native("H", "test.echo"))
        .with_edge(EdgeDefinition::new("A", "H", EdgeKind::OnFail));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    // The on-fail edge recovered the failure; the workflow completes.
    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    assert_eq!(rig.executions_of("H"), 1);

    let handler_input = rig
        .log
        .lock()
        .iter()
        .find(|r| r.node_id == "H")
        .unwrap()
        .input
        .clone();
    assert_eq!(handler_input["error"], json!("exploded"));
    assert_eq!(handler_input["failedNodeId"], json!("A"));

    let instances = ctx.instances_snapshot();
    let a = instances.iter().find(|i| i.node_id == "A").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn unhandled_failure_fails_the_workflow() {
    let rig = TestRig::new();
    let definition = graph("unhandled")
        .with_node(native("A", "test.fail"))
        .with_node(native("B", "test.echo"))
        .with_edge(on_complete("A", "B"));

    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Failed);
    assert_eq!(rig.executions_of("B"), 0);
    let failures = ctx.unrecovered_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "A");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_during_long_run_cancels_both_branches() {
    let rig = TestRig::new();
    let definition = graph("cancelling")
        .with_node(config_value(
            native("A", "test.sleep"),
            "Millis",
            json!(1000),
        ))
        .with_node(config_value(
            native("B", "test.sleep"),
            "Millis",
            json!(1000),
        ));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let ctx = rig
        .engine
        .start(definition, ValueMap::default(), None, cancel)
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Cancelled);
    assert!(started.elapsed() < std::time::Duration::from_millis(900));
    let instances = ctx.instances_snapshot();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.status == NodeStatus::Cancelled));
}

#[tokio::test(flavor = "multi_thread")]
async fn workflow_timeout_behaves_like_cancellation() {
    let rig = TestRig::new();
    let definition = graph("timeout").with_node(config_value(
        native("Slow", "test.sleep"),
        "Millis",
        json!(5000),
    ));

    let ctx = rig
        .engine
        .start(
            definition,
            ValueMap::default(),
            Some(std::time::Duration::from_millis(100)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_errors_block_start() {
    let rig = TestRig::new();
    let definition = graph("broken")
        .with_node(noop("a"))
        .with_edge(on_complete("a", "ghost"));

    let err = rig
        .engine
        .start(definition, ValueMap::default(), None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed validation"));
}

#[tokio::test(flavor = "multi_thread")]
async fn initial_variables_seed_entry_input() {
    let rig = TestRig::new();
    let definition = graph("seeded").with_node(native("Entry", "test.echo"));

    let mut vars = ValueMap::default();
    vars.insert("greeting".into(), json!("hello"));
    let ctx = rig
        .engine
        .start(definition, vars, None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(ctx.status(), WorkflowStatus::Completed);
    let entry_input = rig.log.lock()[0].input.clone();
    assert_eq!(entry_input["greeting"], json!("hello"));
}
