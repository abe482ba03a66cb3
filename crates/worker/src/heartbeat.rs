//! worker与broker集群的连接: 注册、心跳、故障转移与任务反馈

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use jobflow_core::models::{
    DispatchTaskRequest, HeartbeatRequest, RegisterRequest, TaskFeedback, WorkerMetric,
};
use jobflow_core::{now_millis, BrokerClient, SchedulerError, SchedulerResult, WorkerConfig};
use jobflow_infrastructure::ResourceMonitor;

use crate::runtime::{FeedbackReporter, TaskOutcome, TaskQueue};

const MAX_REGISTER_BACKOFF: Duration = Duration::from_secs(30);
const FEEDBACK_RETRY_DELAY: Duration = Duration::from_millis(200);

/// broker分配给本worker的身份
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub broker_url: String,
}

pub struct BrokerConnector {
    config: WorkerConfig,
    executors: Vec<String>,
    client: Arc<dyn BrokerClient>,
    queue: Arc<TaskQueue>,
    monitor: ResourceMonitor,
    identity: RwLock<Option<WorkerIdentity>>,
    brokers: RwLock<Vec<String>>,
}

impl BrokerConnector {
    pub fn new(
        config: WorkerConfig,
        executors: Vec<String>,
        client: Arc<dyn BrokerClient>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        let brokers = config.broker_urls.clone();
        Self {
            config,
            executors,
            client,
            queue,
            monitor: ResourceMonitor::new(),
            identity: RwLock::new(None),
            brokers: RwLock::new(brokers),
        }
    }

    pub async fn identity(&self) -> Option<WorkerIdentity> {
        self.identity.read().await.clone()
    }

    /// 心跳响应中学到的broker拓扑
    pub async fn brokers(&self) -> Vec<String> {
        self.brokers.read().await.clone()
    }

    /// 依次尝试已知broker, 全部失败后指数退避重试
    pub async fn register(&self) -> SchedulerResult<WorkerIdentity> {
        let attempts = self.config.register_attempts.max(1);
        let mut backoff = self.config.register_backoff();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.register_once(None).await {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    warn!("第 {}/{} 次注册失败: {}", attempt, attempts, e);
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_REGISTER_BACKOFF);
            }
        }

        error!("worker注册失败, 已尝试 {} 次", attempts);
        Err(SchedulerError::RegisterFailure(format!(
            "尝试 {attempts} 次后仍无法注册: {last_error}"
        )))
    }

    async fn register_once(&self, exclude: Option<&str>) -> SchedulerResult<WorkerIdentity> {
        let server_id = match self.identity().await {
            Some(identity) => Some(identity.worker_id),
            None => self.config.server_id.clone(),
        };
        let request = RegisterRequest {
            server_id,
            url: self.config.advertised_url.clone(),
            executors: self.executors.clone(),
            tags: self.config.tags.clone(),
            metric: self.metric(),
        };

        let candidates: Vec<String> = self
            .brokers()
            .await
            .into_iter()
            .filter(|url| Some(url.as_str()) != exclude)
            .collect();
        let mut last_error = SchedulerError::RegisterFailure("没有可用的broker地址".to_string());
        for broker_url in candidates {
            match self.client.register(&broker_url, &request).await {
                Ok(response) => {
                    let identity = WorkerIdentity {
                        worker_id: response.worker_id,
                        broker_url: response.broker_url,
                    };
                    info!(
                        "worker {} 通过 {} 注册成功, 归属broker {}",
                        identity.worker_id, broker_url, identity.broker_url
                    );
                    *self.identity.write().await = Some(identity.clone());
                    self.update_brokers(response.brokers).await;
                    return Ok(identity);
                }
                Err(e) => {
                    debug!("向 {} 注册失败: {}", broker_url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// 发送一次心跳; broker不认识本worker时重新注册, broker不可达时切换到其他broker
    pub async fn heartbeat_once(&self) -> SchedulerResult<()> {
        let Some(identity) = self.identity().await else {
            return self.register_once(None).await.map(|_| ());
        };
        let request = HeartbeatRequest {
            worker_id: identity.worker_id.clone(),
            url: self.config.advertised_url.clone(),
            metric: self.metric(),
        };

        match self.client.heartbeat(&identity.broker_url, &request).await {
            Ok(response) => {
                debug!("心跳成功: {}", identity.broker_url);
                self.update_brokers(response.brokers).await;
                Ok(())
            }
            Err(SchedulerError::NotFound { .. }) => {
                warn!(
                    "broker {} 不认识worker {}, 重新注册",
                    identity.broker_url, identity.worker_id
                );
                self.register_once(None).await.map(|_| ())
            }
            Err(e) => {
                warn!("向 {} 发送心跳失败: {}, 尝试其他broker", identity.broker_url, e);
                self.register_once(Some(&identity.broker_url))
                    .await
                    .map(|_| ())
            }
        }
    }

    /// 按配置的间隔发送心跳, 直到收到关闭信号
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.config.heartbeat_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        error!("心跳失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("心跳任务停止");
                    break;
                }
            }
        }
    }

    async fn update_brokers(&self, brokers: Vec<String>) {
        if brokers.is_empty() {
            return;
        }
        let mut known = self.brokers.write().await;
        if *known != brokers {
            debug!("broker拓扑更新: {:?}", brokers);
            *known = brokers;
        }
    }

    fn metric(&self) -> WorkerMetric {
        let snapshot = self.monitor.snapshot();
        let available = if self.queue.is_closed() {
            0
        } else {
            self.queue.available()
        };
        WorkerMetric {
            cpu_processors: snapshot.cpu_processors,
            cpu_load: snapshot.cpu_load,
            free_memory: snapshot.free_memory,
            available_queue_num: available as u32,
            last_heartbeat_at: now_millis(),
        }
    }
}

#[async_trait]
impl FeedbackReporter for BrokerConnector {
    async fn report(&self, request: &DispatchTaskRequest, outcome: TaskOutcome) {
        let worker_id = match self.identity().await {
            Some(identity) => identity.worker_id,
            None => self.config.server_id.clone().unwrap_or_default(),
        };
        let feedback = match outcome {
            TaskOutcome::Executing => TaskFeedback::executing(request, &worker_id),
            TaskOutcome::Succeeded(result) => TaskFeedback::succeeded(request, &worker_id, result),
            TaskOutcome::Failed(error) => TaskFeedback::failed(request, &worker_id, error),
            TaskOutcome::Cancelled => TaskFeedback::cancelled(request, &worker_id),
        };

        // 优先发给派发该任务的broker
        let mut targets = vec![request.broker_url.clone()];
        for url in self.brokers().await {
            if !targets.contains(&url) {
                targets.push(url);
            }
        }

        let attempts = self.config.feedback_attempts.max(1);
        for attempt in 1..=attempts {
            for url in &targets {
                match self.client.feedback(url, &feedback).await {
                    Ok(()) => return,
                    Err(e) => debug!("向 {} 反馈任务 {} 失败: {}", url, request.task_id, e),
                }
            }
            if attempt < attempts {
                tokio::time::sleep(FEEDBACK_RETRY_DELAY).await;
            }
        }
        warn!(
            "任务 {} 的 {:?} 反馈发送失败, 等待broker超时回收",
            request.task_id, feedback.status
        );
    }
}
