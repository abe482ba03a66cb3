use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 集群节点角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeRole {
    #[serde(rename = "BROKER")]
    Broker,
    #[serde(rename = "WORKER")]
    Worker,
}

/// 集群节点身份
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub server_id: String,
    pub url: String,
    pub role: NodeRole,
    #[serde(default)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Node {
    pub fn new(server_id: impl Into<String>, url: impl Into<String>, role: NodeRole) -> Self {
        Self {
            server_id: server_id.into(),
            url: url.into(),
            role,
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(name.into(), values);
        self
    }

    pub fn tag_values(&self, name: &str) -> &[String] {
        self.tags.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Worker资源指标, 每次心跳整体替换
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetric {
    pub cpu_processors: u32,
    pub cpu_load: f64,
    pub free_memory: u64,
    pub available_queue_num: u32,
    pub last_heartbeat_at: i64,
}

impl WorkerMetric {
    /// 剩余可用的CPU核数
    pub fn cpu_headroom(&self) -> f64 {
        let load = self.cpu_load.clamp(0.0, 1.0);
        self.cpu_processors as f64 * (1.0 - load)
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.free_memory / (1024 * 1024)
    }
}

/// Worker在注册中心中的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub node: Node,
    pub executors: Vec<String>,
    pub metric: WorkerMetric,
    pub enabled: bool,
    /// 由心跳新鲜度推导, 仅在生成快照时计算
    pub alive: bool,
}

impl Worker {
    pub fn id(&self) -> &str {
        &self.node.server_id
    }

    pub fn supports(&self, executor: &str) -> bool {
        self.executors.iter().any(|e| e == executor)
    }

    pub fn is_dispatchable(&self) -> bool {
        self.enabled && self.alive
    }
}
