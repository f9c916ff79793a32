//! Verdicts produced end to end for compile and grade tasks

use judged::{CompileOutcome, ResultMessage, SlotId, Verdict};

use crate::{Harness, compile_task, grade_task};

fn grading(message: &ResultMessage) -> &judged::GradingResult {
    match message {
        ResultMessage::Grading { result, .. } => result,
        other => panic!("expected a grading result, got {other:?}"),
    }
}

#[tokio::test]
async fn compile_success_publishes_binary() {
    let harness = Harness::new(2).await;
    harness.push(compile_task("sub-1", "fake", "echo\nhello\n"));
    harness.run_to_completion().await;

    let results = harness.results();
    assert_eq!(results.len(), 1);
    match &results[0] {
        ResultMessage::Compiling {
            submission_id,
            result,
        } => {
            assert_eq!(submission_id, "sub-1");
            assert_eq!(result, &CompileOutcome::CompileSucceeded);
        }
        other => panic!("unexpected result {other:?}"),
    }

    assert_eq!(harness.binary("sub-1").await.unwrap(), b"echo\nhello\n");
    assert_eq!(harness.broker.acked().len(), 1);

    // compile limits override the language's run limits
    let runs = harness.sandbox.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].command, vec!["fakecc", "main.fake", "-o", "main"]);
    assert_eq!(runs[0].constraints.time_ms, 5000);
    assert_eq!(runs[0].constraints.max_processes, 8);
}

#[tokio::test]
async fn compile_failure_reports_log_without_binary() {
    let harness = Harness::new(1).await;
    harness.push(compile_task("sub-2", "fake", "int main() { syntax error }"));
    harness.run_to_completion().await;

    let results = harness.results();
    assert_eq!(results.len(), 1);
    match &results[0] {
        ResultMessage::Compiling {
            result: CompileOutcome::CompileFailed { log },
            ..
        } => assert!(log.contains("error: expected ';'"), "log: {log}"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(harness.binary("sub-2").await.is_none());
    assert_eq!(harness.broker.acked().len(), 1);
}

#[tokio::test]
async fn interpreted_language_publishes_source() {
    let harness = Harness::new(1).await;
    harness.push(compile_task("sub-3", "script", "cat\n"));
    harness.run_to_completion().await;

    let results = harness.results();
    assert!(matches!(
        &results[0],
        ResultMessage::Compiling {
            result: CompileOutcome::CompileSucceeded,
            ..
        }
    ));
    assert_eq!(harness.binary("sub-3").await.unwrap(), b"cat\n");
    assert!(harness.sandbox.runs().is_empty());
}

#[tokio::test]
async fn accepted_ignores_trailing_newline() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-4", b"echo\n42").await;
    let testcase = harness.testcase("sum-1", b"40 2\n", b"42\n").await;
    harness.push(grade_task("sub-4", 1, "fake", testcase));
    harness.run_to_completion().await;

    let results = harness.results();
    assert_eq!(results.len(), 1);
    let ResultMessage::Grading {
        submission_id,
        testcase_index,
        result,
    } = &results[0]
    else {
        panic!("unexpected result {:?}", results[0]);
    };
    assert_eq!(submission_id, "sub-4");
    assert_eq!(*testcase_index, 1);
    assert_eq!(result.verdict, Verdict::Accepted);
    assert_eq!(result.time_ms, 5);
    assert_eq!(result.memory_kb, 1024);

    // task constraints win over the language defaults
    let runs = harness.sandbox.runs();
    assert_eq!(runs[0].command, vec!["./main"]);
    assert_eq!(runs[0].constraints.time_ms, 2000);
    assert_eq!(runs[0].stdin.as_deref(), Some("input.txt"));
}

#[tokio::test]
async fn program_reads_testcase_input() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-5", b"cat\n").await;
    let testcase = harness.testcase("echo-1", b"1 2 3\n", b"1 2 3\n").await;
    harness.push(grade_task("sub-5", 0, "fake", testcase));
    harness.run_to_completion().await;

    assert_eq!(grading(&harness.results()[0]).verdict, Verdict::Accepted);
}

#[tokio::test]
async fn wrong_answer() {
    let harness = Harness::new(1).await;
    harness.put_binary("sub-6", b"echo\n41\n").await;
    let testcase = harness.testcase("sum-2", b"40 2\n", b"42\n").await;
    harness.push(grade_task("sub-6", 2, "fake", testcase));
    harness.run_to_completion().await;

    assert_eq!(grading(&harness.results()[0]).verdict, Verdict::WrongAnswer);
}

#[tokio::test]
async fn resource_verdicts_come_from_the_sandbox() {
    let harness = Harness::new(3).await;
    for (id, program) in [("tle", "loop\n"), ("mle", "oom\n"), ("re", "crash\n")] {
        harness.put_binary(id, program.as_bytes()).await;
        let testcase = harness.testcase(&format!("case-{id}"), b"", b"").await;
        harness.push(grade_task(id, 0, "fake", testcase));
    }
    harness.run_to_completion().await;

    let results = harness.results();
    assert_eq!(results.len(), 3);
    for message in &results {
        let result = grading(message);
        match message.submission_id() {
            "tle" => {
                assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
                assert_eq!(result.time_ms, 2000);
            }
            "mle" => assert_eq!(result.verdict, Verdict::MemoryLimitExceeded),
            "re" => {
                assert_eq!(result.verdict, Verdict::RuntimeError);
                assert_eq!(result.exit_code, Some(3));
            }
            other => panic!("unexpected submission {other}"),
        }
    }
}

#[tokio::test]
async fn compile_then_grade_share_the_published_binary() {
    let harness = Harness::new(1).await;
    harness.push(compile_task("sub-7", "fake", "echo\nok\n"));
    harness.run_to_completion().await;

    let testcase = harness.testcase("ok-1", b"", b"ok").await;
    // a second daemon run on the same store and cache
    harness.push(grade_task("sub-7", 0, "fake", testcase));
    harness.run_to_completion().await;

    let results = harness.results();
    assert_eq!(results.len(), 2);
    assert_eq!(grading(&results[1]).verdict, Verdict::Accepted);
}

#[tokio::test]
async fn every_slot_is_reset_before_and_after_running() {
    let harness = Harness::new(3).await;
    harness.run_to_completion().await;

    let teardowns = harness.sandbox.teardowns();
    let expected: Vec<SlotId> = [1, 2, 3, 1, 2, 3].into_iter().map(SlotId).collect();
    assert_eq!(teardowns, expected);
    assert!(harness.results().is_empty());
}
