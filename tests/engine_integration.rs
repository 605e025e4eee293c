//! Integration tests for the step engine: serial, parallel, conditional,
//! and bounded-loop semantics driven through a full `WorkflowExecutor`
//! against scripted collaborators.

mod common;

use common::{fail, harness, no_overrides, ok, workflow};
use drover::error::EngineError;
use drover::progress::{RunStatus, StepStatus};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn serial_runs_children_in_order_and_stops_at_first_failure() {
    let h = harness();
    let wf = workflow(
        r#"
name: pipeline
steps:
  - name: stage
    type: serial
    steps:
      - name: build
        type: leaf-command
        command: run build
      - name: test
        type: leaf-command
        command: run tests
        retry:
          max_attempts: 1
      - name: deploy
        type: leaf-command
        command: run deploy
"#,
    );
    h.invoker.script("run tests", vec![fail("assertion failed")]);

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::StepExecution { step, message } => {
            assert_eq!(step, "stage");
            assert!(
                message.contains("stage/test"),
                "failure should name the offending child, got: {message}"
            );
        }
        other => panic!("expected step execution error, got {other}"),
    }

    // The later sibling never started.
    assert_eq!(h.invoker.calls_containing("run build"), 1);
    assert_eq!(h.invoker.calls_containing("run tests"), 1);
    assert_eq!(h.invoker.calls_containing("run deploy"), 0);

    let record = h.executor.store().list().await.unwrap().remove(0);
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(
        record.completed_names(),
        vec!["stage/build", "stage/test", "stage"]
    );
    assert_eq!(record.completed_steps[0].status, StepStatus::Completed);
    assert_eq!(record.completed_steps[1].status, StepStatus::Failed);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(record.errors[0].step, "stage");
    assert!(record.errors[0].error.contains("stage/test"));
}

#[tokio::test]
async fn parallel_runs_every_branch_in_its_own_worktree() {
    let h = harness();
    let wf = workflow(
        r#"
name: fanout-test
steps:
  - name: fanout
    type: parallel
    steps:
      - name: alpha
        type: leaf-command
        command: task alpha
      - name: beta
        type: leaf-command
        command: task beta
      - name: gamma
        type: leaf-command
        command: task gamma
"#,
    );

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("task alpha"), 1);
    assert_eq!(h.invoker.calls_containing("task beta"), 1);
    assert_eq!(h.invoker.calls_containing("task gamma"), 1);

    // One worktree per branch, all released.
    assert_eq!(h.isolation.created(), 3);
    assert_eq!(h.isolation.removed(), 3);

    // Each branch saw a distinct working directory.
    let dirs: Vec<_> = h
        .invoker
        .calls()
        .into_iter()
        .map(|call| call.working_dir)
        .collect();
    assert_eq!(dirs.len(), 3);
    assert!(dirs.iter().all(|dir| dirs.iter().filter(|d| *d == dir).count() == 1));

    assert_eq!(
        progress.completed_names(),
        vec!["fanout/alpha", "fanout/beta", "fanout/gamma", "fanout"]
    );
}

#[tokio::test]
async fn parallel_failure_does_not_stop_sibling_branches() {
    let h = harness();
    let wf = workflow(
        r#"
name: fanout-partial
steps:
  - name: fanout
    type: parallel
    steps:
      - name: alpha
        type: leaf-command
        command: task alpha
      - name: beta
        type: leaf-command
        command: task beta
        retry:
          max_attempts: 1
      - name: gamma
        type: leaf-command
        command: task gamma
"#,
    );
    h.invoker.script("task beta", vec![fail("beta broke")]);

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::StepExecution { ref step, .. } if step == "fanout"));
    assert!(err.to_string().contains("fanout/beta"));

    // All three branches ran to completion behind the join barrier.
    assert_eq!(h.invoker.calls_containing("task alpha"), 1);
    assert_eq!(h.invoker.calls_containing("task beta"), 1);
    assert_eq!(h.invoker.calls_containing("task gamma"), 1);
    assert_eq!(h.isolation.created(), 3);
    assert_eq!(h.isolation.removed(), 3);

    let record = h.executor.store().list().await.unwrap().remove(0);
    let beta = record
        .completed_steps
        .iter()
        .find(|step| step.name == "fanout/beta")
        .unwrap();
    assert_eq!(beta.status, StepStatus::Failed);
    let alpha = record
        .completed_steps
        .iter()
        .find(|step| step.name == "fanout/alpha")
        .unwrap();
    assert_eq!(alpha.status, StepStatus::Completed);
}

#[tokio::test]
async fn parallel_isolation_failure_fails_the_branch_not_the_process() {
    let h = harness();
    h.isolation.fail_creates();
    let wf = workflow(
        r#"
name: fanout-isolation
steps:
  - name: fanout
    type: parallel
    steps:
      - name: alpha
        type: leaf-command
        command: task alpha
      - name: beta
        type: leaf-command
        command: task beta
"#,
    );

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepExecution { .. }));

    // No worktree, no execution.
    assert_eq!(h.invoker.calls().len(), 0);
    assert_eq!(h.isolation.created(), 0);
    assert_eq!(h.isolation.removed(), 0);

    let record = h.executor.store().list().await.unwrap().remove(0);
    for branch in ["fanout/alpha", "fanout/beta"] {
        let step = record
            .completed_steps
            .iter()
            .find(|step| step.name == branch)
            .unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.output_summary, "worktree setup failed");
    }
}

#[tokio::test]
async fn conditional_runs_exactly_the_then_branch() {
    let h = harness();
    let wf = workflow(
        r#"
name: gated
steps:
  - name: check
    type: leaf-command
    command: inspect target
  - name: gate
    type: conditional
    condition: "${check.success}"
    then:
      - name: ship
        type: leaf-command
        command: do ship
    else:
      - name: rollback
        type: leaf-command
        command: do rollback
"#,
    );
    h.invoker.script("inspect target", vec![ok("all good")]);

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("do ship"), 1);
    assert_eq!(h.invoker.calls_containing("do rollback"), 0);

    // The unchosen branch leaves no trace in the records.
    assert!(progress.completed_names().contains(&"gate/ship"));
    assert!(progress
        .completed_names()
        .iter()
        .all(|name| !name.contains("rollback")));
}

#[tokio::test]
async fn conditional_takes_the_else_branch_when_false() {
    let h = harness();
    let wf = workflow(
        r#"
name: gated-else
variables:
  - name: mode
    default: slow
steps:
  - name: gate
    type: conditional
    condition: "${mode} == \"fast\""
    then:
      - name: ship
        type: leaf-command
        command: do ship
    else:
      - name: rollback
        type: leaf-command
        command: do rollback
"#,
    );

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("do ship"), 0);
    assert_eq!(h.invoker.calls_containing("do rollback"), 1);
    assert!(progress.completed_names().contains(&"gate/rollback"));
    assert!(!progress.completed_names().contains(&"gate/ship"));
}

#[tokio::test]
async fn conditional_without_else_is_a_completed_noop() {
    let h = harness();
    let wf = workflow(
        r#"
name: gated-noop
variables:
  - name: mode
    default: slow
steps:
  - name: gate
    type: conditional
    condition: "${mode} == \"fast\""
    then:
      - name: ship
        type: leaf-command
        command: do ship
"#,
    );

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls().len(), 0);
    let gate = progress
        .completed_steps
        .iter()
        .find(|step| step.name == "gate")
        .unwrap();
    assert_eq!(gate.status, StepStatus::Completed);
    assert_eq!(gate.output_summary, "condition false, nothing to run");
}

#[tokio::test]
async fn bounded_loop_stops_at_the_cap_and_reports_exhaustion() {
    let h = harness();
    let wf = workflow(
        r#"
name: polling
variables:
  - name: done
    default: "no"
steps:
  - name: poll
    type: bounded-loop
    max_iterations: 3
    until: "${done} == \"yes\""
    steps:
      - name: probe
        type: leaf-command
        command: probe status
"#,
    );

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        EngineError::LoopExhausted { step, cap } => {
            assert_eq!(step, "poll");
            assert_eq!(cap, 3);
        }
        other => panic!("expected loop exhaustion, got {other}"),
    }

    // Exactly the cap, not one more.
    assert_eq!(h.invoker.calls_containing("probe status"), 3);

    let record = h.executor.store().list().await.unwrap().remove(0);
    assert_eq!(record.status, RunStatus::Failed);
    for iteration in 1..=3 {
        assert!(record
            .completed_names()
            .contains(&format!("poll/iteration-{iteration}/probe").as_str()));
    }
    let poll = record
        .completed_steps
        .iter()
        .find(|step| step.name == "poll")
        .unwrap();
    assert_eq!(poll.status, StepStatus::Exhausted);
    assert!(record.errors[0]
        .error
        .contains("exit condition not met after 3 iteration(s)"));
}

#[tokio::test]
async fn bounded_loop_exits_as_soon_as_the_condition_holds() {
    let h = harness();
    let wf = workflow(
        r#"
name: polling-early
steps:
  - name: poll
    type: bounded-loop
    max_iterations: 5
    until: "${probe.output} == \"ready\""
    steps:
      - name: probe
        type: leaf-command
        command: probe status
"#,
    );
    h.invoker
        .script("probe status", vec![ok("pending"), ok("ready")]);

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("probe status"), 2);

    let poll = progress
        .completed_steps
        .iter()
        .find(|step| step.name == "poll")
        .unwrap();
    assert_eq!(poll.status, StepStatus::Completed);
    assert_eq!(poll.output_summary, "exit condition met after 2 iteration(s)");
    assert!(progress
        .completed_names()
        .contains(&"poll/iteration-2/probe"));
    assert!(!progress
        .completed_names()
        .contains(&"poll/iteration-3/probe"));
}

#[tokio::test]
async fn bounded_loop_with_allow_failures_keeps_iterating() {
    let h = harness();
    let wf = workflow(
        r#"
name: lenient-loop
steps:
  - name: fixup
    type: bounded-loop
    max_iterations: 2
    allow_failures: true
    steps:
      - name: fix
        type: leaf-command
        command: apply fix
        retry:
          max_attempts: 1
"#,
    );
    h.invoker.script("apply fix", vec![fail("still broken")]);

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    // A counted loop with failures allowed completes at the cap.
    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("apply fix"), 2);

    let fixup = progress
        .completed_steps
        .iter()
        .find(|step| step.name == "fixup")
        .unwrap();
    assert_eq!(fixup.status, StepStatus::Completed);
    for iteration in 1..=2 {
        let child = progress
            .completed_steps
            .iter()
            .find(|step| step.name == format!("fixup/iteration-{iteration}/fix"))
            .unwrap();
        assert_eq!(child.status, StepStatus::Failed);
    }
}

#[tokio::test]
async fn variables_and_step_outputs_flow_into_later_templates() {
    let h = harness();
    let wf = workflow(
        r#"
name: templated
variables:
  - name: target
    default: staging
steps:
  - name: plan
    type: leaf-prompt
    prompt: "Plan deploy to ${target}"
  - name: apply
    type: leaf-command
    command: "apply ${plan.output}"
"#,
    );
    h.invoker
        .script("Plan deploy to prod", vec![ok("use-blue-green")]);

    let mut overrides = std::collections::HashMap::new();
    overrides.insert("target".to_string(), "prod".to_string());

    let progress = h
        .executor
        .run(&wf, None, &overrides, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(h.invoker.calls_containing("Plan deploy to prod"), 1);
    assert_eq!(h.invoker.calls_containing("apply use-blue-green"), 1);
}

#[tokio::test]
async fn unresolved_template_fails_without_invoking_anything() {
    let h = harness();
    let wf = workflow(
        r#"
name: bad-template
steps:
  - name: greet
    type: leaf-command
    command: "echo ${missing}"
"#,
    );

    let err = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::StepExecution { .. }));
    assert!(err.to_string().contains("missing"));
    assert_eq!(h.invoker.calls().len(), 0);

    let record = h.executor.store().list().await.unwrap().remove(0);
    let greet = record
        .completed_steps
        .iter()
        .find(|step| step.name == "greet")
        .unwrap();
    assert_eq!(greet.output_summary, "template rendering failed");
}

#[tokio::test]
async fn nested_composites_record_full_paths() {
    let h = harness();
    let wf = workflow(
        r#"
name: release
steps:
  - name: outer
    type: serial
    steps:
      - name: checks
        type: parallel
        steps:
          - name: lint
            type: leaf-command
            command: run lint
          - name: unit
            type: leaf-command
            command: run unit
      - name: tag
        type: leaf-command
        command: run tag
"#,
    );

    let progress = h
        .executor
        .run(&wf, None, &no_overrides(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.status, RunStatus::Completed);
    let names = progress.completed_names();
    assert!(names.contains(&"outer/checks/lint"));
    assert!(names.contains(&"outer/checks/unit"));
    assert!(names.contains(&"outer/checks"));
    assert!(names.contains(&"outer/tag"));
    assert!(names.contains(&"outer"));
    assert_eq!(h.isolation.created(), 2);
    assert_eq!(h.isolation.removed(), 2);
}
