//! 任务派发: 负载均衡选点 + RPC投递, 被拒绝或失败时换下一个候选

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use jobflow_core::models::{DispatchOption, DispatchTaskRequest, InvocationParams, Worker};
use jobflow_core::{now_millis, NodeClient, SchedulerError, StructuredLogger};
use jobflow_infrastructure::MetricsCollector;

use crate::registry::NodeRegistry;
use crate::strategies::LoadBalancer;

/// 单次派发的退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Accepted(Worker),
    /// 没有可用或愿意接收的worker, 稍后重试
    Undispatchable,
}

pub struct TaskDispatcher {
    registry: Arc<NodeRegistry>,
    balancer: LoadBalancer,
    client: Arc<dyn NodeClient>,
    attempts: u32,
    backoff: Duration,
    metrics: MetricsCollector,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        balancer: LoadBalancer,
        client: Arc<dyn NodeClient>,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            registry,
            balancer,
            client,
            attempts: attempts.max(1),
            backoff,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    pub async fn dispatch(
        &self,
        request: &DispatchTaskRequest,
        option: &DispatchOption,
        params: &InvocationParams,
    ) -> DispatchOutcome {
        let mut tried: HashSet<String> = HashSet::new();

        for attempt in 1..=self.attempts {
            let candidates: Vec<Worker> = self
                .registry
                .workers(now_millis())
                .await
                .into_iter()
                .filter(|w| !tried.contains(w.id()))
                .collect();

            let Some(worker) = self
                .balancer
                .select(&candidates, &request.executor, option, params)
            else {
                debug!("任务 {} 暂时无法派发: 没有合适的Worker", request.task_id);
                self.metrics.record_undispatchable();
                return DispatchOutcome::Undispatchable;
            };

            match self.client.dispatch_task(&worker.node.url, request).await {
                Ok(response) if response.accepted => {
                    self.metrics.record_dispatch("accepted");
                    StructuredLogger::task_dispatched(&request.task_id, worker.id(), attempt);
                    return DispatchOutcome::Accepted(worker);
                }
                Ok(response) => {
                    let rejected = SchedulerError::DispatchRejected {
                        worker_id: worker.id().to_string(),
                        reason: format!("{:?}", response.reason),
                    };
                    debug!("任务 {}: {}", request.task_id, rejected);
                    self.metrics.record_dispatch("rejected");
                    tried.insert(worker.id().to_string());
                }
                Err(e) => {
                    warn!(
                        "向Worker {} 派发任务 {} 失败 (第{}次): {}",
                        worker.id(),
                        request.task_id,
                        attempt,
                        e
                    );
                    self.metrics.record_dispatch("failed");
                    tried.insert(worker.id().to_string());
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff_for(attempt)).await;
                    }
                }
            }
        }

        DispatchOutcome::Undispatchable
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt - 1))
            .min(MAX_BACKOFF)
    }
}
