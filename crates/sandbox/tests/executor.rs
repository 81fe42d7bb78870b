use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use conflux_sandbox::{ContainerSpec, MockRun, MockRuntime, SandboxError, Stage, Task, TaskExecutor, ENV_DATA, ENV_NAME};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn task(name: &str) -> Task {
    Task {
        image: "X".into(),
        name: name.into(),
        timeout: Duration::from_secs(2),
        input: json!({"id": "7"}),
        cpu: None,
        memory: None,
    }
}

fn env(spec: &ContainerSpec, key: &str) -> String {
    spec.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()).unwrap_or_default()
}

/// Echoes its input back under the sentinel, like a well-behaved task image.
fn echo(spec: &ContainerSpec) -> MockRun {
    let name = env(spec, ENV_NAME);
    let raw = base64::engine::general_purpose::STANDARD.decode(env(spec, ENV_DATA)).unwrap();
    let input: Value = serde_json::from_slice(&raw).unwrap();
    MockRun {
        stdout: format!("starting\n{name}: {}\ndone\n", json!({"ok": true, "seen": input})),
        ..Default::default()
    }
}

#[tokio::test]
async fn sentinel_line_is_the_result() {
    let rt = Arc::new(MockRuntime::fixed(MockRun { stdout: "t1: {\"ok\":true}\n".into(), ..Default::default() }));
    let exec = TaskExecutor::new(rt.clone());
    let out = exec.run_task(&task("t1"), &CancellationToken::new()).await.expect("run");
    assert_eq!(out, json!({"ok": true}));
    assert_eq!(rt.calls(), vec!["image_present", "create", "start", "wait", "logs", "kill", "remove"]);
}

#[tokio::test]
async fn input_reaches_the_container_through_env() {
    let rt = Arc::new(MockRuntime::new(echo));
    let exec = TaskExecutor::new(rt.clone()).with_limits(Some("250m".into()), Some("64Mi".into()));
    let out = exec.run_task(&task("t2"), &CancellationToken::new()).await.expect("run");
    assert_eq!(out["seen"], json!({"id": "7"}));
    let spec = rt.spec("mock-t2").expect("spec");
    assert_eq!(spec.image, "X");
    assert_eq!(spec.cpu.as_deref(), Some("250m"));
    assert_eq!(spec.memory.as_deref(), Some("64Mi"));
}

#[tokio::test]
async fn missing_image_is_pulled() {
    let mut rt = MockRuntime::fixed(MockRun { stdout: "t3: 1\n".into(), ..Default::default() });
    rt.image_present = false;
    let rt = Arc::new(rt);
    TaskExecutor::new(rt.clone()).run_task(&task("t3"), &CancellationToken::new()).await.expect("run");
    assert_eq!(rt.count("pull"), 1);
}

#[tokio::test]
async fn non_zero_exit_is_task_failed_and_cleans_up_once() {
    let rt = Arc::new(MockRuntime::fixed(MockRun {
        exit_code: 3,
        stdout: "t4: {\"ok\":true}\n".into(),
        stderr: "boom\n".into(),
        ..Default::default()
    }));
    let err = TaskExecutor::new(rt.clone()).run_task(&task("t4"), &CancellationToken::new()).await.expect_err("fail");
    match err {
        SandboxError::TaskFailed { exit_code, stderr } => {
            assert_eq!(exit_code, 3);
            assert_eq!(stderr, "boom");
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(rt.count("kill"), 1);
    assert_eq!(rt.count("remove"), 1);
}

#[tokio::test]
async fn failed_exit_wins_over_unreadable_logs() {
    let mut rt = MockRuntime::fixed(MockRun { exit_code: 2, ..Default::default() });
    rt.fail_logs = true;
    let rt = Arc::new(rt);
    let err = TaskExecutor::new(rt.clone()).run_task(&task("t10"), &CancellationToken::new()).await.expect_err("fail");
    match err {
        SandboxError::TaskFailed { exit_code, stderr } => {
            assert_eq!(exit_code, 2);
            assert!(stderr.is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(rt.count("remove"), 1);

    let mut rt = MockRuntime::fixed(MockRun::default());
    rt.fail_logs = true;
    let err = TaskExecutor::new(Arc::new(rt)).run_task(&task("t11"), &CancellationToken::new()).await.expect_err("logs");
    assert!(matches!(err, SandboxError::Failure { stage: Stage::Logs, .. }));
}

#[tokio::test]
async fn missing_or_repeated_sentinel_fails_extraction() {
    let rt = Arc::new(MockRuntime::fixed(MockRun { stdout: "hello\n".into(), ..Default::default() }));
    let err = TaskExecutor::new(rt).run_task(&task("t5"), &CancellationToken::new()).await.expect_err("none");
    assert!(matches!(err, SandboxError::ResultExtractionFailed(_)));

    let rt = Arc::new(MockRuntime::fixed(MockRun { stdout: "t6: 1\n".into(), stderr: "t6: 2\n".into(), ..Default::default() }));
    let err = TaskExecutor::new(rt).run_task(&task("t6"), &CancellationToken::new()).await.expect_err("twice");
    assert!(matches!(err, SandboxError::ResultExtractionFailed(_)));
}

#[tokio::test]
async fn deadline_maps_to_timeout_and_still_cleans_up() {
    let rt = Arc::new(MockRuntime::fixed(MockRun { runtime: Duration::from_secs(5), ..Default::default() }));
    let mut t = task("t7");
    t.timeout = Duration::from_millis(50);
    let err = TaskExecutor::new(rt.clone()).run_task(&t, &CancellationToken::new()).await.expect_err("timeout");
    assert!(matches!(err, SandboxError::Timeout { stage: Stage::Wait }));
    assert_eq!(rt.count("kill"), 1);
    assert_eq!(rt.count("remove"), 1);
    assert_eq!(rt.count("logs"), 0);
}

#[tokio::test]
async fn cleanup_errors_do_not_mask_the_result() {
    let mut rt = MockRuntime::fixed(MockRun { stdout: "t8: true\n".into(), ..Default::default() });
    rt.fail_kill = true;
    let rt = Arc::new(rt);
    let out = TaskExecutor::new(rt.clone()).run_task(&task("t8"), &CancellationToken::new()).await.expect("run");
    assert_eq!(out, json!(true));
    assert_eq!(rt.count("remove"), 1);
}

#[tokio::test]
async fn parent_cancel_aborts_the_task() {
    let rt = Arc::new(MockRuntime::fixed(MockRun { runtime: Duration::from_secs(5), ..Default::default() }));
    let parent = CancellationToken::new();
    let exec = TaskExecutor::new(rt.clone());
    let t = task("t9");
    let canceller = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });
    let err = exec.run_task(&t, &parent).await.expect_err("cancelled");
    assert!(matches!(err, SandboxError::Timeout { .. }));
    assert_eq!(rt.count("kill"), 1);
}

#[tokio::test]
async fn aborted_task_still_kills_and_removes_its_container() {
    let rt = Arc::new(MockRuntime::fixed(MockRun { runtime: Duration::from_secs(30), ..Default::default() }));
    let exec = TaskExecutor::new(rt.clone());
    let mut t = task("t12");
    t.timeout = Duration::from_secs(60);
    let handle = tokio::spawn(async move { exec.run_task(&t, &CancellationToken::new()).await });

    tokio::time::timeout(Duration::from_secs(2), async {
        while rt.count("wait") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task reached wait");
    handle.abort();
    assert!(handle.await.expect_err("aborted").is_cancelled());

    tokio::time::timeout(Duration::from_secs(2), async {
        while rt.count("remove") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deferred cleanup ran");
    assert_eq!(rt.count("kill"), 1);
    assert_eq!(rt.count("remove"), 1);
    assert_eq!(rt.calls(), vec!["image_present", "create", "start", "wait", "kill", "remove"]);
}
