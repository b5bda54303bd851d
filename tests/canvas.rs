//! Workflows dispatched through the memory broker and run by real workers

mod common;

use serde_json::{json, Value};
use task_canvas::message::{ExecutionMode, InvocationMessage};
use task_canvas::{
    args, AppConfig, ChordFailurePolicy, Group, ResultHandle, Signature, TaskError, TaskState,
};
use tokio_test::{assert_err, assert_ok};

use common::{registry, Counters, Harness, TIMEOUT};

#[tokio::test]
async fn group_results_follow_member_order_not_completion_order() {
    let harness = Harness::new(registry(&Counters::default()));
    let workers = harness.spawn_workers(2);

    // Later members finish first.
    let group: Group = (0..6)
        .map(|i| Signature::new("echo_after", args![(6 - i) * 15, i]))
        .collect();
    let values = harness.dispatcher.apply_and_wait(&group, TIMEOUT).await.unwrap();
    assert_eq!(values, (0..6).map(|i| json!(i)).collect::<Vec<_>>());

    workers.stop().await;
}

#[tokio::test]
async fn chain_threads_each_result_into_the_next_step() {
    let harness = Harness::new(registry(&Counters::default()));
    let worker = harness.worker();

    let chain = Signature::new("add", args![4, 4])
        .then(Signature::new("mul", args![8]))
        .then(Signature::new("mul", args![10]));
    let result = harness.dispatcher.apply(&chain).await.unwrap();
    assert_eq!(result.parents().len(), 2);

    assert_eq!(harness.drain(&worker).await, 3);
    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(640));
}

#[tokio::test]
async fn failed_chain_step_stops_the_chain() {
    let counters = Counters::default();
    let harness = Harness::new(registry(&counters));
    let worker = harness.worker();

    let chain = Signature::new("add", args![1, 1])
        .then(Signature::new("boom", vec![]))
        .then(Signature::new("record", vec![]));
    let result = harness.dispatcher.apply(&chain).await.unwrap();

    assert_eq!(harness.drain(&worker).await, 2);
    assert_eq!(counters.record(), 0);

    let err = result.get(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TaskError::Handler { ref message } if message == "boom"));

    let first = harness.dispatcher.result(result.parents()[0]);
    assert_eq!(first.get(TIMEOUT).await.unwrap(), json!(2));
    let second = harness.dispatcher.result(result.parents()[1]);
    assert_eq!(second.state().await.unwrap(), TaskState::Failure);
}

#[tokio::test]
async fn chord_body_runs_once_across_concurrent_workers() {
    let counters = Counters::default();
    let harness = Harness::new(registry(&counters));
    let workers = harness.spawn_workers(3);

    let header: Group = (0..20).map(|i| Signature::new("add", args![i, i])).collect();
    let chord = header.chord(Signature::new("collect", vec![]));
    let total = harness.dispatcher.apply_and_wait(&chord, TIMEOUT).await.unwrap();

    assert_eq!(total, json!((0..20).map(|i| i * 2).sum::<i64>()));
    workers.stop().await;
    assert_eq!(counters.collect(), 1);
}

#[tokio::test]
async fn chord_with_empty_header_fires_body_with_an_empty_list() {
    let harness = Harness::new(registry(&Counters::default()));
    let worker = harness.worker();

    let chord = Group::default().chord(Signature::new("xsum", vec![]));
    let result = harness.dispatcher.apply(&chord).await.unwrap();
    assert!(result.header().is_empty());

    assert_eq!(harness.drain(&worker).await, 1);
    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(0));
}

#[tokio::test]
async fn aborted_chord_fails_without_running_the_body() {
    let counters = Counters::default();
    let harness = Harness::new(registry(&counters));
    let worker = harness.worker();

    let header = Group::new([
        Signature::new("add", args![1, 1]),
        Signature::new("boom", args![0]),
        Signature::new("add", args![2, 2]),
    ]);
    let result = harness
        .dispatcher
        .apply(&header.chord(Signature::new("collect", vec![])))
        .await
        .unwrap();

    assert_eq!(harness.drain(&worker).await, 3);
    let err = result.get(TIMEOUT).await.unwrap_err();
    assert!(matches!(err, TaskError::ChordAborted { .. }), "unexpected error: {err}");
    assert_eq!(counters.collect(), 0);
    assert_eq!(result.header().completed_count().await.unwrap(), 3);
}

#[tokio::test]
async fn lenient_chord_fires_with_the_successful_results() {
    let config = AppConfig {
        chord_failure_policy: ChordFailurePolicy::FireWithSuccessful,
        ..Default::default()
    };
    let harness = Harness::with_config(registry(&Counters::default()), config);
    let worker = harness.worker();

    let header = Group::new([
        Signature::new("add", args![1, 1]),
        Signature::new("boom", args![0]),
        Signature::new("add", args![2, 2]),
    ]);
    let result = harness
        .dispatcher
        .apply(&header.chord(Signature::new("xsum", vec![])))
        .await
        .unwrap();

    harness.drain(&worker).await;
    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(6));
}

#[tokio::test]
async fn per_chord_policy_overrides_the_default() {
    let harness = Harness::new(registry(&Counters::default()));
    let worker = harness.worker();

    let chord = Group::new([Signature::new("boom", args![0]), Signature::new("add", args![5, 5])])
        .chord(Signature::new("xsum", vec![]))
        .with_failure_policy(ChordFailurePolicy::FireWithSuccessful);
    let result = harness.dispatcher.apply(&chord).await.unwrap();

    harness.drain(&worker).await;
    assert_eq!(result.get(TIMEOUT).await.unwrap(), json!(10));
}

#[tokio::test]
async fn chunks_split_into_messages_and_flatten_back() {
    let harness = Harness::new(registry(&Counters::default()));
    let worker = harness.worker();
    let add = harness.registry.task("add").unwrap();
    let items: Vec<Vec<Value>> = (0..10).map(|i| args![i, i]).collect();

    let result = harness
        .dispatcher
        .apply(&add.chunks(items.clone(), 3))
        .await
        .unwrap();

    let sizes: Vec<usize> = harness
        .broker
        .pending("default")
        .iter()
        .map(|payload| match InvocationMessage::decode(payload).unwrap().mode {
            ExecutionMode::Chunk { items } => items.len(),
            ExecutionMode::Call => panic!("expected a chunk message"),
        })
        .collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);

    assert_eq!(harness.drain(&worker).await, 4);
    let chunked = result.get(TIMEOUT).await.unwrap();
    let elementwise = add.starmap(items).call(&harness.registry).await.unwrap();
    assert_eq!(chunked, elementwise);
}

#[tokio::test]
async fn map_and_starmap_dispatch_one_message_per_item() {
    let harness = Harness::new(registry(&Counters::default()));
    let worker = harness.worker();
    let xsum = harness.registry.task("xsum").unwrap();
    let add = harness.registry.task("add").unwrap();

    let mapped = harness
        .dispatcher
        .apply(&xsum.map([json!([1, 2, 3]), json!([10, 20])]))
        .await
        .unwrap();
    let starmapped = harness
        .dispatcher
        .apply(&add.starmap([args![1, 1], args![2, 3]]))
        .await
        .unwrap();
    assert_eq!(harness.broker.published_count(), 4);

    harness.drain(&worker).await;
    assert_eq!(mapped.get(TIMEOUT).await.unwrap(), vec![json!(6), json!(30)]);
    assert_eq!(starmapped.get(TIMEOUT).await.unwrap(), vec![json!(2), json!(5)]);
}

#[tokio::test]
async fn local_calls_touch_neither_broker_nor_backend() {
    let harness = Harness::new(registry(&Counters::default()));

    let sum = Signature::new("add", args![2, 3]).invoke_locally(&harness.registry).await;
    assert_eq!(assert_ok!(sum), json!(5));

    let chain = Signature::new("add", args![1, 1]).then(Signature::new("mul", args![3]));
    assert_eq!(chain.call(&harness.registry).await.unwrap(), json!(6));

    let failed = Signature::new("boom", args![1]).invoke_locally(&harness.registry).await;
    assert!(matches!(assert_err!(failed), TaskError::Handler { .. }));

    assert_eq!(harness.broker.published_count(), 0);
    assert!(harness.backend.is_empty());
}

#[tokio::test]
async fn unknown_tasks_are_refused_before_publishing() {
    let harness = Harness::new(registry(&Counters::default()));

    let chain = Signature::new("add", args![1, 1]).then(Signature::new("missing", vec![]));
    let err = assert_err!(harness.dispatcher.apply(&chain).await);
    assert!(matches!(err, TaskError::UnknownTask { ref name } if name == "missing"));
    assert_eq!(harness.broker.published_count(), 0);
}
