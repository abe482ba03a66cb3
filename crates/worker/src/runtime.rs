//! worker执行运行时
//!
//! 有界FIFO队列是唯一的准入点, 并发上限由信号量控制; 两者在外部构建后注入。
//! 每个任务在独立的监督任务中运行, 执行器的错误和panic都转成失败反馈。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use jobflow_core::models::{DispatchTaskRequest, DispatchTaskResponse, RejectReason};
use jobflow_infrastructure::MetricsCollector;

use crate::executors::{run_task, ExecutorRegistry, TaskContext};

/// 执行结果, 由反馈通道转成发给broker的消息
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Executing,
    Succeeded(Value),
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// 任务状态上报
#[async_trait]
pub trait FeedbackReporter: Send + Sync {
    async fn report(&self, request: &DispatchTaskRequest, outcome: TaskOutcome);
}

/// 有界FIFO任务队列
pub struct TaskQueue {
    sender: mpsc::Sender<DispatchTaskRequest>,
    receiver: Mutex<mpsc::Receiver<DispatchTaskRequest>>,
    capacity: usize,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// 满或已关闭时立即拒绝
    pub fn try_push(&self, request: DispatchTaskRequest) -> Result<(), RejectReason> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RejectReason::Draining);
        }
        self.sender.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RejectReason::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RejectReason::Draining,
        })
    }

    pub async fn pop(&self) -> Option<DispatchTaskRequest> {
        self.receiver.lock().await.recv().await
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// capacity - size, 每次心跳上报
    pub fn available(&self) -> usize {
        self.sender.capacity()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 并发上限
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }
}

pub struct WorkerRuntime {
    queue: Arc<TaskQueue>,
    limiter: ConcurrencyLimiter,
    executors: Arc<ExecutorRegistry>,
    reporter: Arc<dyn FeedbackReporter>,
    /// 从接收到上报终态之间的任务, 用于识别重复派发
    accepted: Mutex<HashSet<String>>,
    queued: Mutex<HashSet<String>>,
    cancelled_queued: Mutex<HashSet<String>>,
    running: Mutex<HashMap<String, watch::Sender<bool>>>,
    in_flight: AtomicUsize,
    enabled: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<TaskQueue>,
        limiter: ConcurrencyLimiter,
        executors: Arc<ExecutorRegistry>,
        reporter: Arc<dyn FeedbackReporter>,
    ) -> Self {
        Self {
            queue,
            limiter,
            executors,
            reporter,
            accepted: Mutex::new(HashSet::new()),
            queued: Mutex::new(HashSet::new()),
            cancelled_queued: Mutex::new(HashSet::new()),
            running: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    pub fn available_queue_size(&self) -> usize {
        if self.enabled.load(Ordering::Acquire) && !self.queue.is_closed() {
            self.queue.available()
        } else {
            0
        }
    }

    /// 已出队但尚未上报终态的任务数
    pub fn active_tasks(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// 接收派发; 拒绝原因原样返回给broker
    pub async fn submit(&self, request: DispatchTaskRequest) -> DispatchTaskResponse {
        if !self.enabled.load(Ordering::Acquire) {
            return DispatchTaskResponse::rejected(RejectReason::Disabled);
        }
        if !self.executors.contains(&request.executor) {
            warn!("不支持的执行器 {}, 拒绝任务 {}", request.executor, request.task_id);
            return DispatchTaskResponse::rejected(RejectReason::UnsupportedExecutor);
        }

        let task_id = request.task_id.clone();
        if !self.accepted.lock().await.insert(task_id.clone()) {
            debug!("任务 {} 已在本worker上, 忽略重复派发", task_id);
            return DispatchTaskResponse::accepted();
        }
        // 先登记再入队, 出队时一定能找到记录
        self.queued.lock().await.insert(task_id.clone());
        match self.queue.try_push(request) {
            Ok(()) => {
                self.metrics.set_queue_depth(self.queue.len());
                debug!("任务 {} 已入队, 剩余容量 {}", task_id, self.queue.available());
                DispatchTaskResponse::accepted()
            }
            Err(reason) => {
                self.queued.lock().await.remove(&task_id);
                self.accepted.lock().await.remove(&task_id);
                info!("拒绝任务 {}: {:?}", task_id, reason);
                DispatchTaskResponse::rejected(reason)
            }
        }
    }

    /// 取消任务: 运行中的任务发出取消信号, 排队中的任务出队时直接丢弃
    pub async fn cancel(&self, task_id: &str) -> bool {
        if let Some(signal) = self.running.lock().await.get(task_id) {
            let _ = signal.send(true);
            info!("已向任务 {} 发送取消信号", task_id);
            return true;
        }
        if self.queued.lock().await.contains(task_id) {
            self.cancelled_queued.lock().await.insert(task_id.to_string());
            info!("排队中的任务 {} 标记为取消", task_id);
            return true;
        }
        debug!("任务 {} 不在本worker上", task_id);
        false
    }

    /// 出队并在并发上限内执行, 直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "worker运行时启动: 队列容量 {}, 并发 {}",
            self.queue.capacity(),
            self.limiter.limit()
        );
        loop {
            let permit = tokio::select! {
                permit = self.limiter.acquire() => match permit {
                    Some(permit) => permit,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };
            let request = tokio::select! {
                request = self.queue.pop() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown_rx.recv() => break,
            };
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            self.metrics.set_queue_depth(self.queue.len());

            self.queued.lock().await.remove(&request.task_id);
            if self.cancelled_queued.lock().await.remove(&request.task_id) {
                self.reporter.report(&request, TaskOutcome::Cancelled).await;
                self.accepted.lock().await.remove(&request.task_id);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let runtime = self.clone();
            tokio::spawn(async move {
                let task_id = request.task_id.clone();
                runtime.supervise(request, permit).await;
                runtime.accepted.lock().await.remove(&task_id);
                runtime.in_flight.fetch_sub(1, Ordering::AcqRel);
            });
        }
        info!("worker运行时已停止");
    }

    async fn supervise(&self, request: DispatchTaskRequest, _permit: OwnedSemaphorePermit) {
        let Some(executor) = self.executors.get(&request.executor) else {
            self.reporter
                .report(
                    &request,
                    TaskOutcome::Failed(format!("执行器不存在: {}", request.executor)),
                )
                .await;
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.running
            .lock()
            .await
            .insert(request.task_id.clone(), cancel_tx);
        self.reporter.report(&request, TaskOutcome::Executing).await;

        let started = Instant::now();
        let context = TaskContext::new(&request, cancel_rx.clone());
        let handle = tokio::spawn(async move { run_task(executor.as_ref(), &context).await });
        let abort = handle.abort_handle();
        let timeout_ms = request.timeout_ms;

        let outcome = tokio::select! {
            joined = handle => match joined {
                Ok(Ok(result)) => TaskOutcome::Succeeded(result),
                Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                Err(e) if e.is_panic() => {
                    error!("任务 {} 执行时发生panic", request.task_id);
                    TaskOutcome::Failed("执行器发生panic".to_string())
                }
                Err(e) => TaskOutcome::Failed(e.to_string()),
            },
            _ = wait_cancelled(cancel_rx) => {
                abort.abort();
                TaskOutcome::Cancelled
            }
            _ = deadline(timeout_ms) => {
                abort.abort();
                warn!("任务 {} 执行超过 {}ms, 已中止", request.task_id, timeout_ms);
                TaskOutcome::Failed(format!("执行超时: {timeout_ms}ms"))
            }
        };

        self.running.lock().await.remove(&request.task_id);
        self.metrics.record_task_execution(
            &request.executor,
            outcome.label(),
            started.elapsed().as_secs_f64(),
        );
        self.reporter.report(&request, outcome).await;
    }

    /// 停止接收新任务, 等待队列与运行中的任务完成; 超时后取消剩余任务
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.queue.close();
        info!("worker开始排空, 最长等待 {:?}", timeout);
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.queue.is_empty() && self.active_tasks() == 0 {
                info!("worker已排空");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let running: Vec<String> = self.running.lock().await.keys().cloned().collect();
        warn!("排空超时, 取消 {} 个运行中的任务", running.len());
        for task_id in running {
            self.cancel(&task_id).await;
        }
        false
    }
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
    while !*cancelled.borrow() {
        if cancelled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// 0表示不限时
async fn deadline(timeout_ms: u64) {
    if timeout_ms == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
    }
}
