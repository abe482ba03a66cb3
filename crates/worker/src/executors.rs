use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

use jobflow_core::models::{DispatchTaskRequest, TaskKind};
use jobflow_core::{SchedulerError, SchedulerResult};

/// 执行器看到的任务上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub execution_id: String,
    pub job_id: String,
    pub kind: TaskKind,
    pub params: Value,
    pub input: Option<Value>,
    cancelled: watch::Receiver<bool>,
}

impl TaskContext {
    pub fn new(request: &DispatchTaskRequest, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            task_id: request.task_id.clone(),
            execution_id: request.execution_id.clone(),
            job_id: request.job_id.clone(),
            kind: request.kind,
            params: request.params.clone(),
            input: request.input.clone(),
            cancelled,
        }
    }

    /// 长任务可以轮询该标志提前退出
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

/// 任务执行器
///
/// 普通任务与MAP分片调用 `execute`; 分片节点先在SPLIT任务中调用 `sharding`,
/// 所有分片完成后在REDUCE任务中调用 `reduce`。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value>;

    /// 默认整个参数作为唯一分片
    async fn sharding(&self, context: &TaskContext) -> SchedulerResult<Vec<Value>> {
        Ok(vec![context.params.clone()])
    }

    /// 默认原样返回所有分片结果
    async fn reduce(&self, _context: &TaskContext, results: Vec<Value>) -> SchedulerResult<Value> {
        Ok(Value::Array(results))
    }
}

/// 按任务角色调用执行器
pub async fn run_task(
    executor: &dyn TaskExecutor,
    context: &TaskContext,
) -> SchedulerResult<Value> {
    match context.kind {
        TaskKind::Normal | TaskKind::Map => executor.execute(context).await,
        TaskKind::Split => {
            let shards = executor.sharding(context).await?;
            debug!("任务 {} 拆分出 {} 个分片", context.task_id, shards.len());
            Ok(Value::Array(shards))
        }
        TaskKind::Reduce => {
            let results = match &context.input {
                Some(Value::Array(results)) => results.clone(),
                Some(other) => {
                    return Err(SchedulerError::TaskExecution(format!(
                        "REDUCE输入必须是数组: {other}"
                    )))
                }
                None => Vec::new(),
            };
            executor.reduce(context, results).await
        }
    }
}

/// 按名称查找执行器, 启动时显式构建
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 包含内置的shell与http执行器
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor::new()));
        registry.register(Arc::new(HttpExecutor::new()));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Shell任务执行器; 任务被中止时子进程随之结束
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
        let start_time = Instant::now();
        let params: ShellTaskParams = serde_json::from_value(context.params.clone())
            .map_err(|e| SchedulerError::TaskExecution(format!("解析Shell任务参数失败: {e}")))?;

        info!(
            "执行Shell任务: task_id={}, command={}, args={:?}",
            context.task_id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("JOBFLOW_TASK_ID", &context.task_id)
            .env("JOBFLOW_EXECUTION_ID", &context.execution_id);
        if let Some(input) = &context.input {
            cmd.env("JOBFLOW_TASK_INPUT", input.to_string());
        }
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env_vars {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;

        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_lines.push(line);
            }
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_lines.push(line);
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let exit_status = child
            .wait()
            .await
            .map_err(|e| SchedulerError::TaskExecution(format!("等待进程结束失败: {e}")))?;
        let duration_ms = start_time.elapsed().as_millis() as u64;

        info!(
            "Shell任务执行完成: task_id={}, success={}, exit_code={:?}, duration={}ms",
            context.task_id,
            exit_status.success(),
            exit_status.code(),
            duration_ms
        );

        if !exit_status.success() {
            let detail = if stderr_lines.is_empty() {
                format!("命令执行失败, 退出码: {:?}", exit_status.code())
            } else {
                stderr_lines.join("\n")
            };
            return Err(SchedulerError::TaskExecution(detail));
        }
        Ok(json!({
            "exitCode": exit_status.code(),
            "stdout": stdout_lines.join("\n"),
            "durationMs": duration_ms,
        }))
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// HTTP任务执行器, 非2xx响应视为失败
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
        let params: HttpTaskParams = serde_json::from_value(context.params.clone())
            .map_err(|e| SchedulerError::TaskExecution(format!("解析HTTP任务参数失败: {e}")))?;
        let method = params.method.as_deref().unwrap_or("GET").to_uppercase();

        info!(
            "执行HTTP任务: task_id={}, method={}, url={}",
            context.task_id, method, params.url
        );

        let mut request = match method.as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(SchedulerError::TaskExecution(format!(
                    "不支持的HTTP方法: {method}"
                )))
            }
        };
        if let Some(timeout_seconds) = params.timeout_seconds {
            request = request.timeout(Duration::from_secs(timeout_seconds));
        }
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        if let Some(body) = params.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::TaskExecution(format!("HTTP请求失败: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SchedulerError::TaskExecution(format!("读取响应体失败: {e}")))?;

        if !status.is_success() {
            return Err(SchedulerError::TaskExecution(format!(
                "HTTP状态码 {}: {}",
                status.as_u16(),
                body
            )));
        }
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}
