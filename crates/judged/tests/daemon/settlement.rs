//! How deliveries are settled: ack, requeue or dead-letter

use std::collections::HashMap;
use std::time::Duration;

use judged::{Broker, ResultMessage, Verdict};
use serde_json::json;

use crate::{Harness, compile_task, grade_task};

#[tokio::test]
async fn malformed_task_is_dead_lettered_without_a_slot() {
    let harness = Harness::new(1).await;
    harness.broker.push("{not json");
    harness.push(json!({"type": "Explode", "submissionId": "x"}));
    harness.run_to_completion().await;

    assert_eq!(harness.broker.dead_letters().len(), 2);
    assert!(harness.results().is_empty());
    assert_eq!(harness.daemon.pool().peak_occupied(), 0);
}

#[tokio::test]
async fn unknown_language_is_retried_then_dead_lettered() {
    let harness = Harness::new(1).await;
    harness.push(compile_task("sub-1", "cobol", "DISPLAY 'HI'."));
    harness.run_to_completion().await;

    // every attempt hits the same configuration error
    assert!(harness.results().is_empty());
    assert!(harness.broker.acked().is_empty());
    assert_eq!(harness.broker.dead_letters().len(), 1);
    assert_eq!(harness.daemon.pool().free_count(), 1);
}

#[tokio::test]
async fn missing_binary_is_not_graded() {
    let harness = Harness::new(1).await;
    let testcase = harness.testcase("case-1", b"", b"").await;
    harness.push(grade_task("never-compiled", 0, "fake", testcase));
    harness.run_to_completion().await;

    assert!(harness.results().is_empty());
    assert_eq!(harness.broker.dead_letters().len(), 1);
}

#[tokio::test]
async fn sandbox_failure_is_redelivered_not_judged() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-2", b"vanish\n").await;
    let testcase = harness.testcase("case-2", b"", b"").await;
    harness.push(grade_task("sub-2", 0, "fake", testcase));
    harness.run_to_completion().await;

    assert!(harness.results().is_empty());
    assert_eq!(harness.broker.dead_letters().len(), 1);
    assert_eq!(harness.sandbox.runs().len(), 3);
}

#[tokio::test]
async fn panicking_stage_frees_its_slot_and_is_redelivered() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-p", b"panic\n").await;
    let testcase = harness.testcase("case-p", b"", b"").await;
    harness.push(grade_task("sub-p", 0, "fake", testcase));
    harness.push(compile_task("sub-after", "fake", "echo\nfine\n"));
    harness.run_to_completion().await;

    // three panicking attempts, each torn down on the single slot
    assert_eq!(harness.broker.dead_letters().len(), 1);
    assert_eq!(harness.broker.acked().len(), 1);
    assert_eq!(harness.results().len(), 1);
    assert_eq!(harness.results()[0].submission_id(), "sub-after");
    assert_eq!(harness.sandbox.in_use(), 0);
    assert_eq!(harness.sandbox.double_inits(), 0);
    assert_eq!(harness.daemon.pool().free_count(), 1);
    // reset, three panics, one compile, final teardown
    assert_eq!(harness.sandbox.teardowns().len(), 6);
}

#[tokio::test]
async fn init_failure_is_retried() {
    let harness = Harness::new(1).await;
    harness.sandbox.fail_next_inits(1);
    harness.push(compile_task("sub-3", "fake", "echo\nfine\n"));
    harness.run_to_completion().await;

    assert_eq!(harness.results().len(), 1);
    assert_eq!(harness.broker.acked().len(), 1);
    assert!(harness.broker.dead_letters().is_empty());
}

#[tokio::test]
async fn teardown_failure_discards_the_result() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-4", b"breakbox\nok\n").await;
    let testcase = harness.testcase("case-4", b"", b"ok\n").await;
    harness.push(grade_task("sub-4", 0, "fake", testcase));
    harness.run_to_completion().await;

    // each attempt breaks its own teardown, so nothing is ever published
    assert!(harness.results().is_empty());
    assert!(harness.broker.acked().is_empty());
    assert_eq!(harness.broker.dead_letters().len(), 1);
    assert_eq!(harness.daemon.pool().free_count(), 1);
}

#[tokio::test]
async fn occupancy_is_bounded_by_slot_count() {
    let harness =
        Harness::with_sandbox(2, |sandbox| sandbox.with_run_delay(Duration::from_millis(20))).await;
    for i in 0..8 {
        harness.put_binary(&format!("sub-{i}"), b"echo\nok\n").await;
        let testcase = harness.testcase(&format!("case-{i}"), b"", b"ok\n").await;
        harness.push(grade_task(&format!("sub-{i}"), i, "fake", testcase));
    }
    harness.run_to_completion().await;

    assert_eq!(harness.results().len(), 8);
    assert!(harness.sandbox.peak_in_use() <= 2);
    assert_eq!(harness.sandbox.double_inits(), 0);
    assert!(harness.daemon.pool().peak_occupied() <= 2);
    assert!(harness.broker.max_in_flight() <= 2);
    assert_eq!(harness.sandbox.in_use(), 0);
    assert_eq!(harness.daemon.pool().free_count(), 2);
}

#[tokio::test]
async fn each_task_is_published_and_acked_once_or_left_unacked() {
    let harness =
        Harness::with_sandbox(3, |sandbox| sandbox.with_run_delay(Duration::from_millis(5))).await;
    let programs = ["echo\nok\n", "echo\nno\n", "loop\n", "vanish\n", "breakbox\nok\n"];
    for (i, program) in programs.iter().enumerate() {
        let id = format!("sub-{i}");
        harness.put_binary(&id, program.as_bytes()).await;
        let testcase = harness.testcase(&format!("case-{i}"), b"", b"ok\n").await;
        harness.push(grade_task(&id, i as u32, "fake", testcase));
    }
    harness.push(compile_task("sub-c", "fake", "echo\nhi\n"));
    harness.run_to_completion().await;

    let mut published: HashMap<String, usize> = HashMap::new();
    for message in harness.results() {
        *published.entry(message.submission_id().to_string()).or_default() += 1;
    }
    let acked = harness.broker.acked().len();
    let dead = harness.broker.dead_letters().len();

    assert_eq!(acked + dead, programs.len() + 1);
    assert_eq!(published.values().sum::<usize>(), acked);
    assert!(published.values().all(|&count| count == 1));
    for failing in ["sub-3", "sub-4"] {
        assert!(!published.contains_key(failing), "{failing} was published");
    }
    assert_eq!(dead, 2);

    let verdicts: HashMap<String, Verdict> = harness
        .results()
        .into_iter()
        .filter_map(|message| match message {
            ResultMessage::Grading {
                submission_id,
                result,
                ..
            } => Some((submission_id, result.verdict)),
            ResultMessage::Compiling { .. } => None,
        })
        .collect();
    assert_eq!(verdicts["sub-0"], Verdict::Accepted);
    assert_eq!(verdicts["sub-1"], Verdict::WrongAnswer);
    assert_eq!(verdicts["sub-2"], Verdict::TimeLimitExceeded);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_tasks() {
    let harness =
        Harness::with_sandbox(2, |sandbox| sandbox.with_run_delay(Duration::from_millis(200))).await;
    for i in 0..4 {
        harness.push(compile_task(&format!("sub-{i}"), "fake", "echo\nok\n"));
    }

    let shutdown = tokio::time::sleep(Duration::from_millis(50));
    tokio::time::timeout(Duration::from_secs(10), harness.daemon.run(shutdown))
        .await
        .unwrap()
        .unwrap();

    // the two tasks that were running finish and settle; the rest stay queued
    assert_eq!(harness.results().len(), 2);
    assert_eq!(harness.broker.acked().len(), 2);
    assert_eq!(harness.broker.in_flight(), 0);
    assert_eq!(harness.broker.pending(), 2);
    assert_eq!(harness.sandbox.in_use(), 0);
}

#[tokio::test]
async fn prefetch_matches_slot_count() {
    let harness = Harness::new(4).await;
    harness.run_to_completion().await;

    // the daemon set prefetch to its capacity; a fifth delivery needs a settlement
    for i in 0..5 {
        harness.push(compile_task(&format!("sub-{i}"), "fake", "echo\n"));
    }
    let mut tags = Vec::new();
    for _ in 0..4 {
        tags.push(harness.broker.next_delivery().await.unwrap().unwrap().tag);
    }
    let fifth = tokio::time::timeout(Duration::from_millis(50), harness.broker.next_delivery()).await;
    assert!(fifth.is_err(), "delivered beyond prefetch");

    harness.broker.ack(tags[0]).await.unwrap();
    let fifth = harness.broker.next_delivery().await.unwrap();
    assert!(fifth.is_some());
}
