use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::oneshot;

use super::support::{Behavior, MockTool};
use crate::executor::{ExecutorConfig, ToolExecution, ToolExecutor};
use crate::{PermissionManager, PermissionMode, ToolError, ToolRegistry, ToolResult};

fn executor(mode: PermissionMode) -> ToolExecutor {
    ToolExecutor::new(Arc::new(PermissionManager::new(mode)))
}

const LONG: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_execute_success() {
    let exec = executor(PermissionMode::BypassPermissions);
    let tool = MockTool::returning("echo", json!({"ok": true})).shared();

    let result = exec.execute(tool, json!({}), LONG).await;
    assert_eq!(result, ToolResult::success(json!({"ok": true})));
}

#[tokio::test]
async fn test_tool_error_becomes_failed() {
    let exec = executor(PermissionMode::BypassPermissions);
    let tool = MockTool::new("flaky", Behavior::Fail("file not found: a.txt")).shared();

    let result = exec.execute(tool, json!({}), LONG).await;
    assert_eq!(
        result,
        ToolResult::Error(ToolError::Failed {
            tool: "flaky".into(),
            message: "file not found: a.txt".into(),
        })
    );
}

#[tokio::test]
async fn test_panicking_tool_is_contained() {
    let exec = executor(PermissionMode::BypassPermissions);
    let tool = MockTool::new("bomb", Behavior::Panic("kaboom")).shared();

    match exec.execute(tool, json!({}), LONG).await {
        ToolResult::Error(ToolError::Failed { tool, message }) => {
            assert_eq!(tool, "bomb");
            assert!(message.contains("kaboom"), "message: {}", message);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_hanging_tool_times_out() {
    let exec = executor(PermissionMode::BypassPermissions);
    let tool = MockTool::new("stuck", Behavior::Hang).shared();

    let started = Instant::now();
    let result = exec.execute(tool, json!({}), Duration::from_millis(50)).await;

    assert_eq!(
        result,
        ToolResult::Error(ToolError::Timeout { tool: "stuck".into(), timeout_ms: 50 })
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    // A timeout is not a cancellation of the executor.
    assert!(!exec.is_cancelled());
}

#[tokio::test]
async fn test_cancel_returns_promptly() {
    let exec = Arc::new(executor(PermissionMode::BypassPermissions));
    let tool = MockTool::new("stuck", Behavior::Hang).shared();

    let runner = Arc::clone(&exec);
    let started = Instant::now();
    let handle = tokio::spawn(async move { runner.execute(tool, json!({}), LONG).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    exec.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("execute did not return after cancel")
        .unwrap();
    assert_eq!(result, ToolResult::Error(ToolError::Cancelled { tool: "stuck".into() }));
    assert!(started.elapsed() < LONG);
    assert!(exec.is_cancelled());
}

#[tokio::test]
async fn test_cooperative_tool_sees_cancellation() {
    let exec = Arc::new(executor(PermissionMode::BypassPermissions));
    let observed = Arc::new(AtomicBool::new(false));
    let tool = MockTool::new("watcher", Behavior::WaitForCancel(Arc::clone(&observed))).shared();

    let runner = Arc::clone(&exec);
    let handle = tokio::spawn(async move { runner.execute(tool, json!({}), LONG).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    exec.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, ToolResult::Error(ToolError::Cancelled { .. })));
}

#[tokio::test]
async fn test_new_call_resets_cancellation() {
    let exec = executor(PermissionMode::BypassPermissions);
    exec.cancel();
    assert!(exec.is_cancelled());

    let result = exec
        .execute(MockTool::returning("echo", json!(1)).shared(), json!({}), LONG)
        .await;
    assert!(result.is_success());
    assert!(!exec.is_cancelled());
}

#[tokio::test]
async fn test_denied_tool_is_never_invoked() {
    let exec = executor(PermissionMode::Plan);
    let tool = MockTool::returning("write_file", json!(null));
    let calls = tool.call_counter();

    let result = exec.execute(tool.shared(), json!({}), LONG).await;
    assert!(matches!(
        result,
        ToolResult::Error(ToolError::PermissionDenied { ref tool, .. }) if tool == "write_file"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_approval_then_trust() {
    let exec = executor(PermissionMode::Default);
    let tool = MockTool::returning("bash", json!("ran"));
    let calls = tool.call_counter();
    let tool = tool.shared();

    let result = exec.execute(Arc::clone(&tool), json!({}), LONG).await;
    assert!(matches!(result, ToolResult::Error(ToolError::ApprovalRequired { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    exec.permissions().add_trusted_tool("bash");
    let result = exec.execute(tool, json!({}), LONG).await;
    assert_eq!(result, ToolResult::success("ran"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_execute_by_name() {
    let exec = executor(PermissionMode::BypassPermissions);
    let registry = ToolRegistry::new();
    registry.register(MockTool::returning("echo", json!("hi"))).unwrap();

    assert_eq!(
        exec.execute_by_name(&registry, "echo", json!({})).await,
        ToolResult::success("hi")
    );
    assert_eq!(
        exec.execute_by_name(&registry, "missing", json!({})).await,
        ToolResult::Error(ToolError::NotFound("missing".into()))
    );
}

#[tokio::test]
async fn test_batch_stops_on_error() {
    let exec = executor(PermissionMode::BypassPermissions);
    let first = MockTool::returning("first", json!(1));
    let second = MockTool::new("second", Behavior::Fail("broken"));
    let third = MockTool::returning("third", json!(3));
    let counters = [first.call_counter(), second.call_counter(), third.call_counter()];

    let results = exec
        .execute_batch(vec![
            ToolExecution::new(first.shared(), json!({})),
            ToolExecution::new(second.shared(), json!({})).stop_on_error(true),
            ToolExecution::new(third.shared(), json!({})),
        ])
        .await;

    assert_eq!(results.len(), 2);
    assert!(results[0].is_success());
    assert!(matches!(results[1], ToolResult::Error(ToolError::Failed { .. })));
    let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(calls, vec![1, 1, 0]);
}

#[tokio::test]
async fn test_batch_continues_without_stop_on_error() {
    let exec = executor(PermissionMode::BypassPermissions);
    let results = exec
        .execute_batch(vec![
            ToolExecution::new(MockTool::returning("a", json!(1)).shared(), json!({})),
            ToolExecution::new(MockTool::new("b", Behavior::Fail("x")).shared(), json!({})),
            ToolExecution::new(MockTool::returning("c", json!(3)).shared(), json!({})),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[1].is_error());
    assert_eq!(results[2], ToolResult::success(json!(3)));
}

#[tokio::test]
async fn test_batch_entry_timeout() {
    let exec = executor(PermissionMode::BypassPermissions);
    let results = exec
        .execute_batch(vec![
            ToolExecution::new(MockTool::new("slow", Behavior::Hang).shared(), json!({}))
                .with_timeout(Duration::from_millis(30)),
            ToolExecution::new(MockTool::returning("next", json!(2)).shared(), json!({})),
        ])
        .await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], ToolResult::Error(ToolError::Timeout { .. })));
    assert!(results[1].is_success());
}

#[tokio::test]
async fn test_cancel_stops_batch() {
    let exec = Arc::new(executor(PermissionMode::BypassPermissions));
    let last = MockTool::returning("last", json!(null));
    let last_calls = last.call_counter();
    let batch = vec![
        ToolExecution::new(MockTool::new("stuck", Behavior::Hang).shared(), json!({})),
        ToolExecution::new(last.shared(), json!({})),
    ];

    let runner = Arc::clone(&exec);
    let handle = tokio::spawn(async move { runner.execute_batch(batch).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    exec.cancel();

    let results = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], ToolResult::Error(ToolError::Cancelled { .. })));
    assert_eq!(last_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_reaches_batch_outlived_by_another() {
    let exec = Arc::new(executor(PermissionMode::BypassPermissions));
    let after = MockTool::returning("after", json!(null));
    let after_calls = after.call_counter();
    let long_batch = vec![
        ToolExecution::new(MockTool::new("slow", Behavior::Sleep(Duration::from_millis(300))).shared(), json!({})),
        ToolExecution::new(after.shared(), json!({})),
    ];

    let runner = Arc::clone(&exec);
    let handle = tokio::spawn(async move { runner.execute_batch(long_batch).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A short batch starts and finishes while the long one is still running.
    let quick = exec
        .execute_batch(vec![ToolExecution::new(MockTool::returning("quick", json!(1)).shared(), json!({}))])
        .await;
    assert_eq!(quick, vec![ToolResult::success(json!(1))]);

    exec.cancel();
    let results = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], ToolResult::Error(ToolError::Cancelled { tool: "slow".into() }));
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_execute_async_delivers_to_callback() {
    let exec = executor(PermissionMode::BypassPermissions);
    let (tx, rx) = oneshot::channel();

    let handle = exec.execute_async(
        MockTool::returning("echo", json!("async")).shared(),
        json!({}),
        LONG,
        move |result| {
            let _ = tx.send(result);
        },
    );

    handle.await.unwrap();
    assert_eq!(rx.await.unwrap(), ToolResult::success("async"));
}

#[tokio::test]
async fn test_execute_async_denied_before_spawn() {
    let exec = executor(PermissionMode::Plan);
    let tool = MockTool::returning("write_file", json!(null));
    let calls = tool.call_counter();
    let (tx, rx) = oneshot::channel();

    exec.execute_async(tool.shared(), json!({}), LONG, move |result| {
        let _ = tx.send(result);
    });

    let result = rx.await.unwrap();
    assert!(matches!(result, ToolResult::Error(ToolError::PermissionDenied { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let exec = Arc::new(ToolExecutor::with_config(
        Arc::new(PermissionManager::new(PermissionMode::BypassPermissions)),
        ExecutorConfig::default().with_max_concurrency(1),
    ));
    let delay = Duration::from_millis(60);

    let started = Instant::now();
    let a = {
        let exec = Arc::clone(&exec);
        let tool = MockTool::new("a", Behavior::Sleep(delay)).shared();
        tokio::spawn(async move { exec.execute(tool, json!({}), LONG).await })
    };
    let b = {
        let exec = Arc::clone(&exec);
        let tool = MockTool::new("b", Behavior::Sleep(delay)).shared();
        tokio::spawn(async move { exec.execute(tool, json!({}), LONG).await })
    };

    assert!(a.await.unwrap().is_success());
    assert!(b.await.unwrap().is_success());
    assert!(started.elapsed() >= delay * 2);
}
