//! Integration tests for stopping and restarting runs: failure resume,
//! cooperative cancellation, `--from-step` seeding, and the ways a stale
//! record can disagree with its definition.

mod common;

use common::{fail, harness, no_overrides, ok, workflow};
use drover::error::{DefinitionError, EngineError};
use drover::progress::{RunStatus, StepStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn failed_run_resumes_at_the_failed_step_and_skips_completed_ones() {
    let h = harness();
    let wf = workflow(
        r#"
name: two-phase
steps:
  - name: prepare
    type: leaf-command
    command: do prepare
  - name: finish
    type: leaf-command
    command: "finish with ${prepare.summary}"
    retry:
      max_attempts: 1
"#,
    );
    h.invoker.script("do prepare", vec![ok("prep-artifact")]);
    h.invoker.script(
        "finish with prep-artifact",
        vec![fail("downstream offline"), ok("finished")],
    );

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepExecution { ref step, .. } if step == "finish"));

    let record = h.executor.store().list().await.unwrap().remove(0);
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.is_step_completed("prepare"));

    let progress = h
        .executor
        .resume(&wf, &record.workflow_id, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    // The completed step was skipped; the failed one re-ran with the same
    // rehydrated template context.
    assert_eq!(h.invoker.calls_containing("do prepare"), 1);
    assert_eq!(h.invoker.calls_containing("finish with prep-artifact"), 2);
    assert_eq!(progress.completed_names(), vec!["prepare", "finish"]);
}

#[tokio::test]
async fn cancellation_lets_the_inflight_attempt_finish() {
    let h = harness();
    let wf = workflow(
        r#"
name: cancellable
steps:
  - name: slow
    type: leaf-command
    command: long haul
  - name: after
    type: leaf-command
    command: wrap up
"#,
    );
    h.invoker
        .script_slow("long haul", Duration::from_millis(300), vec![ok("hauled")]);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        canceller.cancel();
    });

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), cancel)
        .await
        .unwrap();

    // The attempt that was in flight ran to completion and its result was
    // recorded; only then did the run stop.
    assert_eq!(progress.status, RunStatus::Cancelled);
    assert_eq!(h.invoker.calls_containing("long haul"), 1);
    assert_eq!(h.invoker.calls_containing("wrap up"), 0);
    let slow = progress
        .completed_steps
        .iter()
        .find(|step| step.name == "slow")
        .unwrap();
    assert_eq!(slow.status, StepStatus::Completed);
    assert_eq!(slow.output_summary, "hauled");
    assert!(progress.pending_steps.contains(&"after".to_string()));

    let resumed = h
        .executor
        .resume(&wf, &progress.workflow_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("long haul"), 1);
    assert_eq!(h.invoker.calls_containing("wrap up"), 1);
}

#[tokio::test]
async fn cancellation_is_observed_between_retry_attempts() {
    let h = harness();
    let wf = workflow(
        r#"
name: retry-cancel
steps:
  - name: flaky
    type: leaf-command
    command: flaky call
    retry:
      max_attempts: 3
      backoff: fixed
      initial_delay: 500ms
"#,
    );
    h.invoker
        .script("flaky call", vec![fail("no route"), ok("recovered")]);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        canceller.cancel();
    });

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), cancel)
        .await
        .unwrap();

    // Attempt one failed, the backoff wait was interrupted, attempt two
    // never started.
    assert_eq!(progress.status, RunStatus::Cancelled);
    assert_eq!(h.invoker.calls_containing("flaky call"), 1);
    let current = progress.current_step.as_ref().unwrap();
    assert_eq!(current.name, "flaky");
    assert_eq!(current.retry_count, 1);

    // Resume re-runs the interrupted step from its first attempt.
    let resumed = h
        .executor
        .resume(&wf, &progress.workflow_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[tokio::test]
async fn run_from_seeds_earlier_steps_as_completed() {
    let h = harness();
    let wf = workflow(
        r#"
name: staged
steps:
  - name: one
    type: leaf-command
    command: cmd one
  - name: two
    type: leaf-command
    command: cmd two
  - name: three
    type: leaf-command
    command: cmd three
"#,
    );

    let progress = h
        .executor
        .run_from(&wf, None, &no_overrides(), "two", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("cmd one"), 0);
    assert_eq!(h.invoker.calls_containing("cmd two"), 1);
    assert_eq!(h.invoker.calls_containing("cmd three"), 1);
    assert_eq!(progress.completed_names(), vec!["one", "two", "three"]);
    assert_eq!(
        progress.completed_steps[0].output_summary,
        "completed in a previous run"
    );
}

#[tokio::test]
async fn run_from_an_unknown_step_is_a_definition_error() {
    let h = harness();
    let wf = workflow(
        r#"
name: staged
steps:
  - name: one
    type: leaf-command
    command: cmd one
"#,
    );

    let err = h
        .executor
        .run_from(&wf, None, &no_overrides(), "zzz", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Definition(DefinitionError::UnknownStep(_))
    ));
    assert_eq!(h.invoker.calls().len(), 0);
}

#[tokio::test]
async fn a_completed_run_cannot_be_resumed() {
    let h = harness();
    let wf = workflow(
        r#"
name: oneshot
steps:
  - name: only
    type: leaf-command
    command: do it
"#,
    );

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(progress.status, RunStatus::Completed);

    let err = h
        .executor
        .resume(&wf, &progress.workflow_id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("COMPLETED"));
    assert_eq!(h.invoker.calls_containing("do it"), 1);
}

#[tokio::test]
async fn resuming_against_an_edited_definition_fails_cleanly() {
    let h = harness();
    let original = workflow(
        r#"
name: editable
steps:
  - name: keep
    type: leaf-command
    command: cmd keep
  - name: dropped
    type: leaf-command
    command: cmd dropped
    retry:
      max_attempts: 1
"#,
    );
    h.invoker.script("cmd dropped", vec![fail("boom")]);

    let err = h
        .executor
        .run(&original, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepExecution { .. }));
    let record = h.executor.store().list().await.unwrap().remove(0);

    // The workflow file lost the failed step between sessions.
    let edited = workflow(
        r#"
name: editable
steps:
  - name: keep
    type: leaf-command
    command: cmd keep
"#,
    );
    let err = h
        .executor
        .resume(&edited, &record.workflow_id, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Definition(DefinitionError::UnknownStep(ref name)) if name == "dropped"
    ));

    let record = h.executor.store().load(&record.workflow_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Failed);
}
