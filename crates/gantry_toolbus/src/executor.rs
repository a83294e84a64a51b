use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gantry_observability::{record_duration, record_error, tool_span};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::permission::{PermissionDecision, PermissionManager};
use crate::tools::{Tool, ToolContext, ToolError, ToolResult};
use crate::ToolRegistry;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_TOOL_CONCURRENCY: usize = 10;

const TIMEOUT_ENV: &str = "GANTRY_TOOL_TIMEOUT_SECS";
const CONCURRENCY_ENV: &str = "GANTRY_MAX_TOOL_CONCURRENCY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    /// Upper bound on tool calls running at once across all callers.
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TOOL_TIMEOUT,
            max_concurrency: DEFAULT_MAX_TOOL_CONCURRENCY,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `GANTRY_TOOL_TIMEOUT_SECS` and
    /// `GANTRY_MAX_TOOL_CONCURRENCY`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_number(TIMEOUT_ENV) {
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_number(CONCURRENCY_ENV) {
            config.max_concurrency = max as usize;
        }
        config
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

/// One entry of a batch run by [`ToolExecutor::execute_batch`].
#[derive(Clone)]
pub struct ToolExecution {
    pub tool: Arc<dyn Tool>,
    pub args: JsonValue,
    pub stop_on_error: bool,
    /// Falls back to the executor's default timeout.
    pub timeout: Option<Duration>,
}

impl ToolExecution {
    pub fn new(tool: Arc<dyn Tool>, args: JsonValue) -> Self {
        Self {
            tool,
            args,
            stop_on_error: false,
            timeout: None,
        }
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ToolExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecution")
            .field("tool", &self.tool.name())
            .field("args", &self.args)
            .field("stop_on_error", &self.stop_on_error)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Runs tools behind the permission gate with a timeout and a shared
/// cancellation signal.
///
/// Every call gets a fresh signal, so [`cancel`](Self::cancel) only affects
/// the call in flight at that moment and every batch still running. A tool
/// that ignores its [`ToolContext`] is aborted at its next await point; the
/// executor itself always returns once the timeout or the cancellation fires.
pub struct ToolExecutor {
    permissions: Arc<PermissionManager>,
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    signal: Mutex<CancellationToken>,
    batches: DashMap<u64, CancellationToken>,
    next_batch: AtomicU64,
}

impl ToolExecutor {
    pub fn new(permissions: Arc<PermissionManager>) -> Self {
        Self::with_config(permissions, ExecutorConfig::default())
    }

    pub fn with_config(permissions: Arc<PermissionManager>, config: ExecutorConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            permissions,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            signal: Mutex::new(CancellationToken::new()),
            batches: DashMap::new(),
            next_batch: AtomicU64::new(0),
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one tool call to completion, timeout or cancellation.
    ///
    /// Never panics and never returns early with anything but a
    /// [`ToolResult`]; failures of the tool itself come back as
    /// [`ToolError::Failed`].
    pub async fn execute(&self, tool: Arc<dyn Tool>, args: JsonValue, timeout: Duration) -> ToolResult {
        self.execute_under(tool, args, timeout, None).await
    }

    async fn execute_under(
        &self,
        tool: Arc<dyn Tool>,
        args: JsonValue,
        timeout: Duration,
        batch: Option<&CancellationToken>,
    ) -> ToolResult {
        if let Err(err) = self.authorize(tool.as_ref()) {
            return ToolResult::Error(err);
        }
        let signal = self.reset_signal(batch);
        run_tool(Arc::clone(&self.semaphore), tool, args, timeout, signal).await
    }

    pub async fn execute_default(&self, tool: Arc<dyn Tool>, args: JsonValue) -> ToolResult {
        self.execute(tool, args, self.config.default_timeout).await
    }

    /// Resolve `name` in `registry` and run it with the default timeout.
    pub async fn execute_by_name(&self, registry: &ToolRegistry, name: &str, args: JsonValue) -> ToolResult {
        match registry.get_tool(name) {
            Some(tool) => self.execute_default(tool, args).await,
            None => ToolResult::Error(ToolError::NotFound(name.to_string())),
        }
    }

    /// Run `executions` strictly in order.
    ///
    /// Stops after a cancelled entry, after [`cancel`](Self::cancel) is
    /// called, or after a failed entry that has `stop_on_error` set. Returns
    /// the results of the entries that ran.
    pub async fn execute_batch(&self, executions: Vec<ToolExecution>) -> Vec<ToolResult> {
        let active = ActiveBatch::register(self);
        let batch = &active.token;

        let total = executions.len();
        let mut results = Vec::with_capacity(total);
        for execution in executions {
            if batch.is_cancelled() {
                info!("Batch cancelled after {}/{} tools", results.len(), total);
                break;
            }

            let timeout = execution.timeout.unwrap_or(self.config.default_timeout);
            let result = self
                .execute_under(execution.tool, execution.args, timeout, Some(batch))
                .await;

            let cancelled = matches!(result, ToolResult::Error(ToolError::Cancelled { .. }));
            let stop = cancelled || (execution.stop_on_error && result.is_error());
            results.push(result);
            if stop {
                debug!("Batch stopped after {}/{} tools", results.len(), total);
                break;
            }
        }

        results
    }

    /// Like [`execute`](Self::execute) but hands the result to `callback` from
    /// a spawned task. The permission check and signal reset happen before
    /// this returns.
    pub fn execute_async<F>(
        &self,
        tool: Arc<dyn Tool>,
        args: JsonValue,
        timeout: Duration,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(ToolResult) + Send + 'static,
    {
        if let Err(err) = self.authorize(tool.as_ref()) {
            return tokio::spawn(async move { callback(ToolResult::Error(err)) });
        }
        let signal = self.reset_signal(None);
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let result = run_tool(semaphore, tool, args, timeout, signal).await;
            callback(result);
        })
    }

    /// Cancel the call currently in flight and every running batch.
    pub fn cancel(&self) {
        lock(&self.signal).cancel();
        for batch in self.batches.iter() {
            batch.value().cancel();
        }
        debug!("Tool execution cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.signal).is_cancelled()
    }

    fn authorize(&self, tool: &dyn Tool) -> Result<(), ToolError> {
        match self.permissions.check(tool) {
            PermissionDecision::Allowed => Ok(()),
            PermissionDecision::Denied(reason) => Err(ToolError::PermissionDenied {
                tool: tool.name().to_string(),
                reason,
            }),
            PermissionDecision::NeedsApproval(reason) => Err(ToolError::ApprovalRequired {
                tool: tool.name().to_string(),
                reason,
            }),
        }
    }

    fn reset_signal(&self, batch: Option<&CancellationToken>) -> CancellationToken {
        let fresh = match batch {
            Some(batch) => batch.child_token(),
            None => CancellationToken::new(),
        };
        *lock(&self.signal) = fresh.clone();
        fresh
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("config", &self.config)
            .field("available_permits", &self.semaphore.available_permits())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A batch's token, listed in the executor for as long as the batch runs.
struct ActiveBatch<'a> {
    batches: &'a DashMap<u64, CancellationToken>,
    id: u64,
    token: CancellationToken,
}

impl<'a> ActiveBatch<'a> {
    fn register(executor: &'a ToolExecutor) -> Self {
        let id = executor.next_batch.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        executor.batches.insert(id, token.clone());
        Self {
            batches: &executor.batches,
            id,
            token,
        }
    }
}

impl Drop for ActiveBatch<'_> {
    fn drop(&mut self) {
        self.batches.remove(&self.id);
    }
}

async fn run_tool(
    semaphore: Arc<Semaphore>,
    tool: Arc<dyn Tool>,
    args: JsonValue,
    timeout: Duration,
    signal: CancellationToken,
) -> ToolResult {
    let name = tool.name().to_string();
    let span = tool_span!(name.as_str());

    async move {
        let started = Instant::now();
        // Timeouts trip only this call's token; cancel() trips the parent.
        let call_token = signal.child_token();
        let ctx = ToolContext::new(call_token.clone());

        let mut worker = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            tool.call(args, &ctx).await
        });

        let result = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                worker.abort();
                ToolResult::Error(ToolError::Cancelled { tool: name.clone() })
            }
            _ = tokio::time::sleep(timeout) => {
                call_token.cancel();
                worker.abort();
                ToolResult::Error(ToolError::Timeout {
                    tool: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            joined = &mut worker => match joined {
                Ok(Ok(output)) => ToolResult::Success(output),
                Ok(Err(e)) => ToolResult::Error(ToolError::Failed {
                    tool: name.clone(),
                    message: e.to_string(),
                }),
                Err(join_err) if join_err.is_panic() => ToolResult::Error(ToolError::Failed {
                    tool: name.clone(),
                    message: panic_message(join_err.into_panic()),
                }),
                Err(_) => ToolResult::Error(ToolError::Cancelled { tool: name.clone() }),
            },
        };

        record_duration("duration_ms", started.elapsed());
        match &result {
            ToolResult::Success(_) => debug!("Tool '{}' completed", name),
            ToolResult::Error(err) => record_error(err),
        }
        result
    }
    .instrument(span)
    .await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

// Guarded values are plain tokens; a poisoned lock still holds a usable one.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
