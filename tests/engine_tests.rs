#![allow(clippy::unwrap_used)]

//! Drive-loop tests over flow nodes: sequencing, switch routing, flow
//! directives, loops, error catching, context export.

mod common;

use common::{compile, envelope_with_input, instance};
use lemline::instance::{StepOutcome, WorkflowStatus};
use lemline::position::JsonPointer;
use lemline::state::Envelope;
use serde_json::json;

#[tokio::test]
async fn test_set_chain_produces_last_output() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: chain, version: '1'}
do:
  - first:
      set:
        step: 1
  - second:
      set:
        step: 2
        previous: '${ .step }'
",
    );
    let mut instance = instance(&workflow, Envelope::initial("chain", "1"));
    let outcome = instance.drive().await;

    let StepOutcome::Completed(output) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(output.unwrap(), json!({"step": 2, "previous": 1}));
    assert_eq!(instance.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_switch_routes_to_named_task() {
    // S2: input "task" routes through the named target and produces the
    // set output.
    let workflow = compile(
        r#"
document: {dsl: '1.0.0', namespace: t, name: router, version: '1'}
do:
  - router:
      switch:
        - a:
            when: '${ . == "task" }'
            then: t
        - b:
            when: '${ . == "completed" }'
            then: exit
  - t:
      set:
        hit: true
"#,
    );
    let envelope = envelope_with_input("router", "1", json!("task"));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"hit": true}));
}

#[tokio::test]
async fn test_switch_exit_terminates_without_side_effects() {
    // S2: input "completed" exits before the named task runs.
    let workflow = compile(
        r#"
document: {dsl: '1.0.0', namespace: t, name: router, version: '1'}
do:
  - router:
      switch:
        - a:
            when: '${ . == "task" }'
            then: t
        - b:
            when: '${ . == "completed" }'
            then: exit
  - t:
      set:
        hit: true
"#,
    );
    let envelope = envelope_with_input("router", "1", json!("completed"));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    // The switch passes its input through; "t" never ran.
    assert_eq!(output.unwrap(), json!("completed"));
}

#[tokio::test]
async fn test_switch_without_match_faults_with_expression_error() {
    let workflow = compile(
        r#"
document: {dsl: '1.0.0', namespace: t, name: router, version: '1'}
do:
  - router:
      switch:
        - a:
            when: '${ . == "never" }'
            then: end
"#,
    );
    let envelope = envelope_with_input("router", "1", json!("something else"));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Faulted(envelope, error) = instance.drive().await else {
        panic!("expected a fault");
    };
    assert!(error.error_type.ends_with("/expression"), "{error}");
    assert_eq!(envelope.position.as_str(), "/do/0/router");
    assert_eq!(instance.status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn test_end_directive_terminates_workflow() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: ender, version: '1'}
do:
  - firstTask:
      set:
        step: 1
      then: end
  - shouldNotRun:
      set:
        step: 99
",
    );
    let mut instance = instance(&workflow, Envelope::initial("ender", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"step": 1}));
}

#[tokio::test]
async fn test_named_directive_skips_intermediate_task() {
    let workflow = compile(
        r#"
document: {dsl: '1.0.0', namespace: t, name: jumper, version: '1'}
do:
  - start:
      set:
        visited: [start]
      then: finish
  - middle:
      set:
        visited: '${ .visited + ["middle"] }'
  - finish:
      set:
        visited: '${ .visited + ["finish"] }'
"#,
    );
    let mut instance = instance(&workflow, Envelope::initial("jumper", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"visited": ["start", "finish"]}));
}

#[tokio::test]
async fn test_unknown_named_target_faults() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: jumper, version: '1'}
do:
  - start:
      set: {x: 1}
      then: ghost
",
    );
    let mut instance = instance(&workflow, Envelope::initial("jumper", "1"));
    let StepOutcome::Faulted(_, error) = instance.drive().await else {
        panic!("expected a fault");
    };
    assert!(error.error_type.ends_with("/configuration"), "{error}");
}

#[tokio::test]
async fn test_nested_do_sequencing() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: nested, version: '1'}
do:
  - outer:
      do:
        - innerOne:
            set: {a: 1}
        - innerTwo:
            set: {a: '${ .a + 1 }'}
  - after:
      set: {a: '${ .a + 10 }'}
",
    );
    let mut instance = instance(&workflow, Envelope::initial("nested", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"a": 12}));
}

#[tokio::test]
async fn test_for_loop_binds_item_and_index() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: looper, version: '1'}
do:
  - collect:
      for:
        each: color
        in: '${ .colors }'
      do:
        - paint:
            set:
              painted: '${ $color }'
              at: '${ $index }'
",
    );
    let envelope = envelope_with_input("looper", "1", json!({"colors": ["red", "green", "blue"]}));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    // The loop's output is the last iteration's output.
    assert_eq!(output.unwrap(), json!({"painted": "blue", "at": 2}));
}

#[tokio::test]
async fn test_for_loop_over_empty_collection_passes_input_through() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: looper, version: '1'}
do:
  - collect:
      for:
        in: '${ .colors }'
      do:
        - paint:
            set: {painted: true}
",
    );
    let envelope = envelope_with_input("looper", "1", json!({"colors": []}));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"colors": []}));
}

#[tokio::test]
async fn test_for_while_stops_early() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: looper, version: '1'}
do:
  - count:
      for:
        in: '${ .items }'
      while: '${ $index < 2 }'
      do:
        - tally:
            set:
              seen: '${ $index }'
",
    );
    let envelope = envelope_with_input("looper", "1", json!({"items": [10, 20, 30, 40]}));
    let mut instance = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    // Iterations 0 and 1 run; the while gate stops index 2.
    assert_eq!(output.unwrap(), json!({"seen": 1}));
}

#[tokio::test]
async fn test_if_false_passes_input_through() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: guarded, version: '1'}
do:
  - first:
      set: {flag: false, n: 1}
  - maybe:
      if: '${ .flag }'
      set: {n: 99}
  - last:
      set: {n: '${ .n + 1 }'}
",
    );
    let mut instance = instance(&workflow, Envelope::initial("guarded", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"n": 2}));
}

#[tokio::test]
async fn test_raise_caught_by_catch_body() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: guarded, version: '1'}
do:
  - guard:
      try:
        - boom:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
                status: 503
                title: Backend unavailable
      catch:
        errors:
          with:
            type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
        as: problem
        do:
          - recover:
              set:
                recovered: true
                status: '${ $problem.status }'
",
    );
    let mut instance = instance(&workflow, Envelope::initial("guarded", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"recovered": true, "status": 503}));
}

#[tokio::test]
async fn test_raise_with_unmatched_filter_faults() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: guarded, version: '1'}
do:
  - guard:
      try:
        - boom:
            raise:
              error:
                type: https://serverlessworkflow.io/spec/1.0.0/errors/validation
                status: 400
                title: Bad data
      catch:
        errors:
          with:
            type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
        do:
          - recover:
              set: {recovered: true}
",
    );
    let mut instance = instance(&workflow, Envelope::initial("guarded", "1"));
    let StepOutcome::Faulted(envelope, error) = instance.drive().await else {
        panic!("expected a fault");
    };
    assert!(error.error_type.ends_with("/validation"));
    // The fault pins the raising position.
    assert_eq!(envelope.position.as_str(), "/do/0/guard/try/0/boom");
}

#[tokio::test]
async fn test_raise_named_error_from_use_block() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: guarded, version: '1'}
use:
  errors:
    unavailable:
      type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
      status: 503
      title: Unavailable
do:
  - boom:
      raise:
        error: unavailable
",
    );
    let mut instance = instance(&workflow, Envelope::initial("guarded", "1"));
    let StepOutcome::Faulted(_, error) = instance.drive().await else {
        panic!("expected a fault");
    };
    assert_eq!(error.status, 503);
    assert_eq!(error.title, "Unavailable");
}

#[tokio::test]
async fn test_retry_schedules_and_exhausts() {
    // A raise inside a retrying try: each step parks in the retry outbox
    // with the constant delay until attempts run out, then the fault
    // propagates.
    let workflow = compile(
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
            type: https://serverlessworkflow.io/spec/1.0.0/errors/communication
        retry:
          delay: {seconds: 1}
          limit:
            attempt:
              count: 3
",
    );

    let mut envelope = Envelope::initial("retrier", "1");
    let guard = JsonPointer::from("/do/0/guard");

    for expected_attempt in 1..=2 {
        let mut step = instance(&workflow, envelope.clone());
        let outcome = step.drive().await;
        let StepOutcome::Retry(next, delay) = outcome else {
            panic!("attempt {expected_attempt}: expected retry, got {outcome:?}");
        };
        assert_eq!(delay.as_secs(), 1);
        assert_eq!(next.position, guard);
        assert_eq!(
            next.states.get(&guard).unwrap().attempt_index,
            expected_attempt
        );
        envelope = next;
    }

    let mut step = instance(&workflow, envelope);
    let StepOutcome::Faulted(_, error) = step.drive().await else {
        panic!("expected fault after retries exhausted");
    };
    assert_eq!(error.status, 500);
}

#[tokio::test]
async fn test_wait_parks_and_resumes() {
    // S3: the wait routes to the wait outbox; the redelivered envelope
    // resumes past it.
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: sleeper, version: '1'}
do:
  - w:
      wait:
        seconds: 30
  - after:
      set: {woke: true}
",
    );
    let mut first = instance(&workflow, Envelope::initial("sleeper", "1"));
    let StepOutcome::Wait(envelope, delay) = first.drive().await else {
        panic!("expected wait");
    };
    assert_eq!(delay.as_secs(), 30);
    assert_eq!(envelope.position.as_str(), "/do/0/w");
    assert_eq!(first.status, WorkflowStatus::Waiting);

    let mut resumed = instance(&workflow, envelope);
    let StepOutcome::Completed(output) = resumed.drive().await else {
        panic!("expected completion after the wait");
    };
    assert_eq!(output.unwrap(), json!({"woke": true}));
}

#[tokio::test]
async fn test_export_updates_context() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: ctx, version: '1'}
do:
  - remember:
      set: {token: abc}
      export:
        as: '${ {token: .token} }'
  - use:
      set:
        fromContext: '${ $context.token }'
",
    );
    let mut instance = instance(&workflow, Envelope::initial("ctx", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"fromContext": "abc"}));
}

#[tokio::test]
async fn test_workflow_output_transformation() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: shaped, version: '1'}
output:
  as: '${ {wrapped: .} }'
do:
  - produce:
      set: {inner: 1}
",
    );
    let mut instance = instance(&workflow, Envelope::initial("shaped", "1"));
    let StepOutcome::Completed(output) = instance.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"wrapped": {"inner": 1}}));
}

#[tokio::test]
async fn test_fork_is_declarative_only() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: forked, version: '1'}
do:
  - split:
      fork:
        branches:
          - left:
              set: {l: 1}
          - right:
              set: {r: 1}
",
    );
    let mut instance = instance(&workflow, Envelope::initial("forked", "1"));
    let StepOutcome::Faulted(_, error) = instance.drive().await else {
        panic!("expected a fault");
    };
    assert!(error.error_type.ends_with("/runtime"), "{error}");
}

#[tokio::test]
async fn test_redriving_completed_instance_is_idempotent() {
    let workflow = compile(
        r"
document: {dsl: '1.0.0', namespace: t, name: idem, version: '1'}
do:
  - only:
      set: {done: true}
",
    );
    let mut first = instance(&workflow, Envelope::initial("idem", "1"));
    let StepOutcome::Completed(output) = first.drive().await else {
        panic!("expected completion");
    };
    assert_eq!(output.unwrap(), json!({"done": true}));

    // Re-driving the terminal snapshot completes again without producing a
    // next message or a delayed row.
    let snapshot = first.to_envelope();
    let mut second = instance(&workflow, snapshot);
    let StepOutcome::Completed(output) = second.drive().await else {
        panic!("expected idempotent completion");
    };
    assert_eq!(output.unwrap(), json!({"done": true}));
}
