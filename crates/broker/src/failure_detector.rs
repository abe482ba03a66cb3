use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info};

use jobflow_core::models::{Node, NodeRole, WorkerMetric};
use jobflow_core::{now_millis, NodeClient, SchedulerResult, StructuredLogger};
use jobflow_domain::{DomainEvent, EventPublisher};
use jobflow_infrastructure::MetricsCollector;

use crate::registry::NodeRegistry;

/// 节点失效检测
///
/// 刷新本broker的存活记录, 探测配置中的对等broker, 并把心跳超时的节点标记为离线。
/// 离线worker上的任务不在这里处理, 由任务超时扫描负责。
pub struct FailureDetector {
    node: Node,
    peers: Vec<String>,
    registry: Arc<NodeRegistry>,
    client: Arc<dyn NodeClient>,
    events: Arc<dyn EventPublisher>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
    metrics: MetricsCollector,
}

impl FailureDetector {
    pub fn new(
        node: Node,
        peers: Vec<String>,
        registry: Arc<NodeRegistry>,
        client: Arc<dyn NodeClient>,
        events: Arc<dyn EventPublisher>,
        interval: Duration,
    ) -> Self {
        Self {
            node,
            peers,
            registry,
            client,
            events,
            interval,
            running: Arc::new(RwLock::new(true)),
            metrics: MetricsCollector::new(),
        }
    }

    /// 执行一轮检测, 返回本轮被判定离线的节点
    pub async fn check_once(&self, now: i64) -> SchedulerResult<Vec<Node>> {
        self.heartbeat_self(now).await;
        self.probe_peers(now).await;

        let mut offline = Vec::new();
        for (node, last_heartbeat_at) in self.registry.sweep_dead(now).await {
            StructuredLogger::node_offline(&node.server_id, last_heartbeat_at);
            if node.role == NodeRole::Worker {
                if let Err(e) = self
                    .events
                    .publish(DomainEvent::WorkerOffline {
                        server_id: node.server_id.clone(),
                    })
                    .await
                {
                    debug!("发布离线事件失败: {}", e);
                }
            }
            offline.push(node);
        }

        let alive = self.registry.all_alive(NodeRole::Worker, now).await.len();
        self.metrics.set_alive_workers(alive);
        Ok(offline)
    }

    async fn heartbeat_self(&self, now: i64) {
        if self
            .registry
            .touch(&self.node.server_id, WorkerMetric::default(), now)
            .await
            .is_err()
        {
            self.registry
                .online(self.node.clone(), Vec::new(), WorkerMetric::default(), now)
                .await;
        }
    }

    async fn probe_peers(&self, now: i64) {
        for peer in &self.peers {
            if peer == &self.node.url {
                continue;
            }
            match self.client.ping(peer).await {
                Ok(response) if response.role == NodeRole::Broker => {
                    let is_new = self
                        .registry
                        .online(response.node(), Vec::new(), WorkerMetric::default(), now)
                        .await;
                    if is_new {
                        info!("发现对等broker {} ({})", response.server_id, peer);
                    }
                }
                Ok(response) => {
                    debug!("节点 {} 不是broker, 角色为 {:?}", peer, response.role);
                }
                Err(e) => debug!("探测对等broker {} 失败: {}", peer, e),
            }
        }
    }

    pub async fn start(&self) {
        info!("启动节点失效检测, 间隔 {:?}", self.interval);
        loop {
            if !*self.running.read().await {
                info!("节点失效检测已停止");
                break;
            }
            if let Err(e) = self.check_once(now_millis()).await {
                error!("节点失效检测出错: {}", e);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}
