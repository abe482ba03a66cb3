//! 节点注册中心与选主
//!
//! 每个节点一把独立的锁, 心跳只锁自己的条目; 存活状态在读取时由
//! 心跳新鲜度推导, 不会持久化。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use jobflow_core::models::{Node, NodeRole, Worker, WorkerMetric};
use jobflow_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    executors: Vec<String>,
    metric: WorkerMetric,
    enabled: bool,
    online: bool,
    last_heartbeat_at: i64,
}

pub struct NodeRegistry {
    entries: RwLock<HashMap<String, Arc<Mutex<NodeEntry>>>>,
    heartbeat_timeout_ms: i64,
}

impl NodeRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            heartbeat_timeout_ms: heartbeat_timeout.as_millis() as i64,
        }
    }

    fn is_fresh(&self, entry: &NodeEntry, now: i64) -> bool {
        entry.online && now - entry.last_heartbeat_at <= self.heartbeat_timeout_ms
    }

    /// 节点上线; 已存在的节点刷新身份并重新标记为在线, 返回是否为新节点
    pub async fn online(
        &self,
        node: Node,
        executors: Vec<String>,
        metric: WorkerMetric,
        now: i64,
    ) -> bool {
        let existing = self.entries.read().await.get(&node.server_id).cloned();
        if let Some(entry) = existing {
            let mut entry = entry.lock().await;
            entry.node = node;
            entry.executors = executors;
            entry.metric = metric;
            entry.online = true;
            entry.last_heartbeat_at = now;
            return false;
        }

        let mut entries = self.entries.write().await;
        let server_id = node.server_id.clone();
        let created = !entries.contains_key(&server_id);
        let entry = entries.entry(server_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(NodeEntry {
                node: node.clone(),
                executors: Vec::new(),
                metric: WorkerMetric::default(),
                enabled: true,
                online: true,
                last_heartbeat_at: now,
            }))
        });
        let mut guard = entry.lock().await;
        guard.node = node;
        guard.executors = executors;
        guard.metric = metric;
        guard.online = true;
        guard.last_heartbeat_at = now;
        if created {
            info!("节点上线: {} ({:?})", server_id, guard.node.role);
        }
        created
    }

    /// 幂等, 节点保留在注册中心中以便查看
    pub async fn offline(&self, server_id: &str) -> bool {
        let entry = self.entries.read().await.get(server_id).cloned();
        match entry {
            Some(entry) => {
                let mut entry = entry.lock().await;
                let was_online = entry.online;
                entry.online = false;
                if was_online {
                    info!("节点下线: {}", server_id);
                }
                was_online
            }
            None => false,
        }
    }

    /// 心跳: 指标整体替换; 未注册的节点需要重新注册
    pub async fn touch(
        &self,
        server_id: &str,
        metric: WorkerMetric,
        now: i64,
    ) -> SchedulerResult<()> {
        let entry = self
            .entries
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("Node", server_id))?;
        let mut entry = entry.lock().await;
        if !entry.online {
            debug!("节点 {} 恢复心跳", server_id);
        }
        entry.metric = metric;
        entry.online = true;
        entry.last_heartbeat_at = now;
        Ok(())
    }

    pub async fn set_enabled(&self, server_id: &str, enabled: bool) -> SchedulerResult<()> {
        let entry = self
            .entries
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| SchedulerError::not_found("Node", server_id))?;
        entry.lock().await.enabled = enabled;
        Ok(())
    }

    /// 按server id或url判断节点是否存活
    pub async fn alive(&self, address: &str, now: i64) -> bool {
        for entry in self.snapshot().await {
            if entry.node.server_id == address || entry.node.url == address {
                return self.is_fresh(&entry, now);
            }
        }
        false
    }

    pub async fn all_alive(&self, role: NodeRole, now: i64) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| entry.node.role == role && self.is_fresh(entry, now))
            .map(|entry| entry.node)
            .collect();
        nodes.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        nodes
    }

    /// 所有worker的快照, 包括已禁用和已失活的
    pub async fn workers(&self, now: i64) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|entry| entry.node.role == NodeRole::Worker)
            .map(|entry| Worker {
                alive: self.is_fresh(&entry, now),
                node: entry.node,
                executors: entry.executors,
                metric: entry.metric,
                enabled: entry.enabled,
            })
            .collect();
        workers.sort_by(|a, b| a.node.server_id.cmp(&b.node.server_id));
        workers
    }

    pub async fn worker(&self, server_id: &str, now: i64) -> Option<Worker> {
        self.workers(now)
            .await
            .into_iter()
            .find(|w| w.node.server_id == server_id)
    }

    /// 标记心跳超时的节点为离线, 返回 (server_id, 最后心跳时间)
    pub async fn sweep_dead(&self, now: i64) -> Vec<(Node, i64)> {
        let entries: Vec<Arc<Mutex<NodeEntry>>> =
            self.entries.read().await.values().cloned().collect();
        let mut dead = Vec::new();
        for entry in entries {
            let mut entry = entry.lock().await;
            if entry.online && !self.is_fresh(&entry, now) {
                entry.online = false;
                dead.push((entry.node.clone(), entry.last_heartbeat_at));
            }
        }
        dead
    }

    /// 在存活的broker中为资源选出唯一所有者
    ///
    /// 使用rendezvous哈希: 成员不变时结果稳定, 成员变化只迁移受影响的资源。
    /// 没有存活broker时返回None, 由调用方在下一轮重试。
    pub async fn elect(&self, resource_id: &str, now: i64) -> Option<Node> {
        self.all_alive(NodeRole::Broker, now)
            .await
            .into_iter()
            .max_by_key(|node| {
                (
                    rendezvous_weight(&node.server_id, resource_id),
                    node.server_id.clone(),
                )
            })
    }

    async fn snapshot(&self) -> Vec<NodeEntry> {
        let entries: Vec<Arc<Mutex<NodeEntry>>> =
            self.entries.read().await.values().cloned().collect();
        let mut snapshot = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshot.push(entry.lock().await.clone());
        }
        snapshot
    }
}

/// FNV-1a再经splitmix64终混, 各broker进程之间结果一致;
/// 短的顺序id只在低位不同, 不终混时权重分布严重偏斜
fn rendezvous_weight(server_id: &str, resource_id: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in server_id
        .as_bytes()
        .iter()
        .chain(b"/")
        .chain(resource_id.as_bytes())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    splitmix64(hash)
}

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
