#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use jobflow_core::models::{
    DispatchTaskRequest, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    TaskFeedback, TaskKind,
};
use jobflow_core::{BrokerClient, SchedulerError, SchedulerResult, WorkerConfig};
use jobflow_worker::{ExecutorRegistry, FeedbackReporter, TaskContext, TaskExecutor, TaskOutcome};

pub fn request(
    task_id: &str,
    executor: &str,
    params: Value,
    timeout_ms: u64,
) -> DispatchTaskRequest {
    DispatchTaskRequest {
        task_id: task_id.to_string(),
        execution_id: "exec-1".to_string(),
        job_id: "job-1".to_string(),
        executor: executor.to_string(),
        kind: TaskKind::Normal,
        params,
        input: None,
        broker_url: "http://broker-a".to_string(),
        timeout_ms,
    }
}

/// 按时间顺序记录上报的任务状态
#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, TaskOutcome)>>,
}

impl RecordingReporter {
    pub fn outcomes_of(&self, task_id: &str) -> Vec<TaskOutcome> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == task_id)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }

    /// 任务已上报终态时返回该状态
    pub fn final_outcome(&self, task_id: &str) -> Option<TaskOutcome> {
        self.outcomes_of(task_id)
            .into_iter()
            .find(|outcome| *outcome != TaskOutcome::Executing)
    }

    pub fn is_executing(&self, task_id: &str) -> bool {
        self.outcomes_of(task_id).contains(&TaskOutcome::Executing)
    }
}

#[async_trait]
impl FeedbackReporter for RecordingReporter {
    async fn report(&self, request: &DispatchTaskRequest, outcome: TaskOutcome) {
        self.reports
            .lock()
            .unwrap()
            .push((request.task_id.clone(), outcome));
    }
}

/// 原样返回参数
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
        Ok(context.params.clone())
    }
}

/// 睡眠 params.ms 毫秒, 同时统计最大并发数
#[derive(Default)]
pub struct SleepExecutor {
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for SleepExecutor {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let ms = context.params["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(ms))
    }
}

pub struct PanicExecutor;

#[async_trait]
impl TaskExecutor for PanicExecutor {
    fn name(&self) -> &str {
        "panic"
    }

    async fn execute(&self, _context: &TaskContext) -> SchedulerResult<Value> {
        panic!("executor blew up");
    }
}

pub fn executors(sleep: Arc<SleepExecutor>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(EchoExecutor));
    registry.register(sleep);
    registry.register(Arc::new(PanicExecutor));
    registry
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn worker_config(broker_urls: &[&str]) -> WorkerConfig {
    WorkerConfig {
        server_id: Some("worker-test".to_string()),
        advertised_url: "http://worker-test:7171".to_string(),
        broker_urls: broker_urls.iter().map(|url| url.to_string()).collect(),
        queue_capacity: 5,
        concurrency: 2,
        register_attempts: 1,
        register_backoff_ms: 10,
        feedback_attempts: 2,
        ..WorkerConfig::default()
    }
}

/// 可编排故障的broker客户端
#[derive(Default)]
pub struct MockBrokerClient {
    pub registrations: Mutex<Vec<(String, RegisterRequest)>>,
    pub heartbeats: Mutex<Vec<String>>,
    pub feedbacks: Mutex<Vec<(String, TaskFeedback)>>,
    pub unreachable: Mutex<HashSet<String>>,
    pub forgetful: Mutex<HashSet<String>>,
    pub topology: Mutex<Vec<String>>,
}

impl MockBrokerClient {
    pub fn unreachable(&self, url: &str) {
        self.unreachable.lock().unwrap().insert(url.to_string());
    }

    pub fn reachable(&self, url: &str) {
        self.unreachable.lock().unwrap().remove(url);
    }

    /// 该broker对心跳返回NOT_FOUND
    pub fn forget_workers(&self, url: &str) {
        self.forgetful.lock().unwrap().insert(url.to_string());
    }

    pub fn set_topology(&self, brokers: &[&str]) {
        *self.topology.lock().unwrap() = brokers.iter().map(|url| url.to_string()).collect();
    }

    pub fn registrations(&self) -> Vec<(String, RegisterRequest)> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn feedbacks(&self) -> Vec<(String, TaskFeedback)> {
        self.feedbacks.lock().unwrap().clone()
    }

    fn check_reachable(&self, url: &str) -> SchedulerResult<()> {
        if self.unreachable.lock().unwrap().contains(url) {
            return Err(SchedulerError::Network(format!("{url} 不可达")));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for MockBrokerClient {
    async fn register(
        &self,
        broker_url: &str,
        request: &RegisterRequest,
    ) -> SchedulerResult<RegisterResponse> {
        self.registrations
            .lock()
            .unwrap()
            .push((broker_url.to_string(), request.clone()));
        self.check_reachable(broker_url)?;
        self.forgetful.lock().unwrap().remove(broker_url);
        Ok(RegisterResponse {
            worker_id: request
                .server_id
                .clone()
                .unwrap_or_else(|| "worker-assigned".to_string()),
            broker_url: broker_url.to_string(),
            brokers: self.topology.lock().unwrap().clone(),
        })
    }

    async fn heartbeat(
        &self,
        broker_url: &str,
        request: &HeartbeatRequest,
    ) -> SchedulerResult<HeartbeatResponse> {
        self.heartbeats.lock().unwrap().push(broker_url.to_string());
        self.check_reachable(broker_url)?;
        if self.forgetful.lock().unwrap().contains(broker_url) {
            return Err(SchedulerError::not_found("Worker", &request.worker_id));
        }
        Ok(HeartbeatResponse {
            brokers: self.topology.lock().unwrap().clone(),
        })
    }

    async fn feedback(&self, broker_url: &str, feedback: &TaskFeedback) -> SchedulerResult<()> {
        self.check_reachable(broker_url)?;
        self.feedbacks
            .lock()
            .unwrap()
            .push((broker_url.to_string(), feedback.clone()));
        Ok(())
    }
}
