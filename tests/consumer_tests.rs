#![allow(clippy::unwrap_used)]

//! Consumer-path scenarios over the full in-memory stack: decode failures,
//! routing to the outboxes, the self-stepping message loop.

mod common;

use common::TestStack;
use chrono::Utc;
use lemline::messaging::Disposition;
use lemline::repository::OutboxStatus;
use lemline::state::Envelope;

const HELLO: &str = r"
document: {dsl: '1.0.0', namespace: t, name: hello, version: '1'}
do:
  - greet:
      set:
        message: Hello World!
";

#[tokio::test]
async fn test_decode_failure_archives_and_dead_letters() {
    // S6: undecodable input becomes a FAILED retry row and goes to the DLQ.
    let stack = TestStack::new().await;
    let disposition = stack.consumer.handle("not-json").await;
    assert_eq!(disposition, Disposition::DeadLetter);

    let rows = stack.retries.rows().await;
    assert_eq!(rows.len(), 1);
    let row = rows.first().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.message, "not-json");
    assert!(row.last_error.as_ref().is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
async fn test_dead_letters_reach_the_dlq_channel() {
    let stack = TestStack::new().await;
    stack.broker.publish("not-json").await.unwrap();

    // Run one worker until the inbound channel drains.
    let message = stack.broker.try_recv().await.unwrap();
    if stack.consumer.handle(&message).await == Disposition::DeadLetter {
        stack.broker.dead_letter_sink().emit(&message).await.unwrap();
    }
    assert_eq!(
        stack.broker.try_recv_dead_letter().await.as_deref(),
        Some("not-json")
    );
}

#[tokio::test]
async fn test_unknown_definition_is_a_failed_row() {
    let stack = TestStack::new().await;
    let disposition = stack
        .consumer
        .handle(&Envelope::initial("ghost", "1").encode())
        .await;
    assert_eq!(disposition, Disposition::DeadLetter);
    assert_eq!(stack.retries.count_with_status(OutboxStatus::Failed).await, 1);
}

#[tokio::test]
async fn test_flow_only_workflow_completes_in_one_step() {
    let stack = TestStack::new().await;
    stack.register(HELLO).await;
    stack
        .broker
        .publish(&Envelope::initial("hello", "1").encode())
        .await
        .unwrap();

    let processed = stack.pump().await;
    assert_eq!(processed, 1);
    // Terminal: no next message, no delayed rows.
    assert!(stack.broker.try_recv().await.is_none());
    assert!(stack.retries.rows().await.is_empty());
    assert!(stack.waits.rows().await.is_empty());
}

#[tokio::test]
async fn test_wait_routes_to_wait_outbox() {
    // S3: no broker emit; one PENDING row in `waits` due ≈ now + 30 s.
    let stack = TestStack::new().await;
    stack
        .register(
            r"
document: {dsl: '1.0.0', namespace: t, name: sleeper, version: '1'}
do:
  - w:
      wait:
        seconds: 30
",
        )
        .await;
    stack
        .broker
        .publish(&Envelope::initial("sleeper", "1").encode())
        .await
        .unwrap();
    stack.pump().await;

    assert!(stack.broker.try_recv().await.is_none());
    let rows = stack.waits.rows().await;
    assert_eq!(rows.len(), 1);
    let row = rows.first().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    let lag = (row.delayed_until - Utc::now()).num_seconds();
    assert!((28..=30).contains(&lag), "due in {lag}s");

    // The parked envelope resumes past the wait once redelivered.
    stack.broker.publish(&row.message).await.unwrap();
    assert_eq!(stack.pump().await, 1);
    assert!(stack.waits.rows().await.len() == 1, "row stays until the processor sends it");
}

#[tokio::test]
async fn test_faulted_workflow_is_archived_not_emitted() {
    let stack = TestStack::new().await;
    stack
        .register(
            r"
document: {dsl: '1.0.0', namespace: t, name: doomed, version: '1'}
do:
  - boom:
      raise:
        error:
          type: https://serverlessworkflow.io/spec/1.0.0/errors/runtime
          status: 500
          title: Kaboom
",
        )
        .await;
    stack
        .broker
        .publish(&Envelope::initial("doomed", "1").encode())
        .await
        .unwrap();
    stack.pump().await;

    assert!(stack.broker.try_recv().await.is_none());
    let rows = stack.retries.rows().await;
    assert_eq!(rows.len(), 1);
    let row = rows.first().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert!(row.last_error.as_ref().unwrap().contains("Kaboom"));
    // The archived message is the faulted envelope, pinned to the raiser.
    let archived = Envelope::decode(&row.message).unwrap();
    assert_eq!(archived.position.as_str(), "/do/0/boom");
}

#[tokio::test]
async fn test_retry_parks_with_delay_and_resumes() {
    let stack = TestStack::new().await;
    stack
        .register(
            r"
document: {dsl: '1.0.0', namespace: t, name: retrier, version: '1'}
do:
  - guard:
      try:
        - boom:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
                status: 500
                title: Flaky
      catch:
        errors:
          with:
            status: 500
        retry:
          delay: {seconds: 2}
          limit:
            attempt:
              count: 2
        do:
          - recover:
              set: {recovered: true}
",
        )
        .await;
    stack
        .broker
        .publish(&Envelope::initial("retrier", "1").encode())
        .await
        .unwrap();
    stack.pump().await;

    // First failure: parked for retry.
    let rows = stack.retries.rows().await;
    assert_eq!(rows.len(), 1);
    let row = rows.first().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
    let lag = (row.delayed_until - Utc::now()).num_seconds();
    assert!((0..=2).contains(&lag), "due in {lag}s");

    // Redeliver: the second failure exhausts the retry and the catch body
    // completes the workflow.
    stack.broker.publish(&row.message).await.unwrap();
    let processed = stack.pump().await;
    assert_eq!(processed, 1);
    assert!(stack.broker.try_recv().await.is_none());
    assert_eq!(stack.retries.count_with_status(OutboxStatus::Failed).await, 0);
}
