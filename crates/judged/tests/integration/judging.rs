//! Compile and grade stages end to end in isolate, using the example C toolchain

use judged::{CompileOutcome, ResultMessage, Verdict};
use serde_json::json;

use super::Judge;

const SUM: &str = r#"
#include <stdio.h>
int main(void) {
    long a, b;
    if (scanf("%ld %ld", &a, &b) != 2) return 1;
    printf("%ld\n", a + b);
    return 0;
}
"#;

const SPIN: &str = "int main(void) { volatile unsigned long x = 0; for (;;) x++; }\n";

fn compile(submission_id: &str, source: &str) -> serde_json::Value {
    json!({
        "type": "Compile",
        "submissionId": submission_id,
        "language": "c",
        "sourceCode": source
    })
}

fn grade(submission_id: &str, testcase: &str, time_ms: u64) -> serde_json::Value {
    json!({
        "type": "Grade",
        "submissionId": submission_id,
        "testcaseIndex": 0,
        "language": "c",
        "constraints": {"timeMs": time_ms, "memoryKB": 262144, "totalStorageKB": 65536, "maxProcesses": 1},
        "binaryRef": {"objectId": submission_id},
        "testcaseRef": {
            "input": {"objectId": format!("{testcase}.in")},
            "output": {"objectId": format!("{testcase}.out")}
        }
    })
}

fn compile_outcome(message: ResultMessage) -> CompileOutcome {
    match message {
        ResultMessage::Compiling { result, .. } => result,
        other => panic!("expected a compile result, got {other:?}"),
    }
}

fn verdict(message: ResultMessage) -> Verdict {
    match message {
        ResultMessage::Grading { result, .. } => result.verdict,
        other => panic!("expected a grading result, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_success() {
    let judge = Judge::new().await;
    let outcome = compile_outcome(judge.run(50, compile("ok", SUM)).await);
    assert_eq!(outcome, CompileOutcome::CompileSucceeded);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_compile_failure_carries_log() {
    let judge = Judge::new().await;
    let outcome = compile_outcome(
        judge
            .run(51, compile("broken", "int main(void) { return 0 }\n"))
            .await,
    );
    match outcome {
        CompileOutcome::CompileFailed { log } => assert!(log.contains("error"), "log: {log}"),
        other => panic!("expected compile failure, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_accepted_and_wrong_answer() {
    let judge = Judge::new().await;
    judge.put_testcase("sum.in", b"40 2\n").await;
    judge.put_testcase("sum.out", b"42").await;
    judge.put_testcase("sum-wrong.in", b"40 2\n").await;
    judge.put_testcase("sum-wrong.out", b"43\n").await;

    let outcome = compile_outcome(judge.run(52, compile("sum", SUM)).await);
    assert_eq!(outcome, CompileOutcome::CompileSucceeded);

    assert_eq!(verdict(judge.run(52, grade("sum", "sum", 2000)).await), Verdict::Accepted);
    assert_eq!(
        verdict(judge.run(53, grade("sum", "sum-wrong", 2000)).await),
        Verdict::WrongAnswer
    );
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_time_limit_exceeded() {
    let judge = Judge::new().await;
    judge.put_testcase("spin.in", b"").await;
    judge.put_testcase("spin.out", b"").await;

    let outcome = compile_outcome(judge.run(54, compile("spin", SPIN)).await);
    assert_eq!(outcome, CompileOutcome::CompileSucceeded);

    let message = judge.run(54, grade("spin", "spin", 500)).await;
    let ResultMessage::Grading { result, .. } = message else {
        panic!("expected a grading result");
    };
    assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
    assert!(result.time_ms >= 500, "time {}", result.time_ms);
}
