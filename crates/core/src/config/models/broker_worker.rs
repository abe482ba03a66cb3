use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub server_id: String,
    pub bind_address: String,
    pub advertised_url: String,
    /// 其他broker的地址, 用于选主和拓扑下发
    pub peers: Vec<String>,
    pub sweep_interval_ms: u64,
    pub expected_heartbeat_interval_seconds: u64,
    /// 连续丢失多少次心跳后判定节点失活
    pub missed_heartbeat_threshold: u32,
    pub liveness_check_interval_seconds: u64,
    pub dispatch_timeout_ms: u64,
    pub dispatch_attempts: u32,
    pub retry_backoff_ms: u64,
    pub task_timeout_seconds: u64,
    pub max_task_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server_id: "broker-001".to_string(),
            bind_address: "0.0.0.0:7070".to_string(),
            advertised_url: "http://127.0.0.1:7070".to_string(),
            peers: Vec::new(),
            sweep_interval_ms: 1000,
            expected_heartbeat_interval_seconds: 10,
            missed_heartbeat_threshold: 3,
            liveness_check_interval_seconds: 10,
            dispatch_timeout_ms: 3000,
            dispatch_attempts: 3,
            retry_backoff_ms: 500,
            task_timeout_seconds: 300,
            max_task_attempts: 3,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_id.is_empty() {
            return Err(anyhow::anyhow!("Broker ID不能为空"));
        }

        if !self.advertised_url.starts_with("http://")
            && !self.advertised_url.starts_with("https://")
        {
            return Err(anyhow::anyhow!("Broker地址格式无效: {}", self.advertised_url));
        }

        if self.sweep_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度扫描间隔必须大于0"));
        }

        if self.expected_heartbeat_interval_seconds == 0 || self.missed_heartbeat_threshold == 0 {
            return Err(anyhow::anyhow!("心跳间隔和丢失阈值必须大于0"));
        }

        if self.dispatch_timeout_ms == 0 {
            return Err(anyhow::anyhow!("派发超时时间必须大于0"));
        }

        if self.dispatch_attempts == 0 || self.max_task_attempts == 0 {
            return Err(anyhow::anyhow!("重试次数必须大于0"));
        }

        Ok(())
    }

    /// 心跳超时 = 期望心跳间隔 * 丢失阈值
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(
            self.expected_heartbeat_interval_seconds * self.missed_heartbeat_threshold as u64,
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_check_interval_seconds.max(1))
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 为空时使用主机名
    pub server_id: Option<String>,
    pub bind_address: String,
    pub advertised_url: String,
    pub broker_urls: Vec<String>,
    pub tags: HashMap<String, Vec<String>>,
    pub queue_capacity: usize,
    pub concurrency: usize,
    pub heartbeat_interval_seconds: u64,
    pub request_timeout_ms: u64,
    pub register_attempts: u32,
    pub register_backoff_ms: u64,
    pub feedback_attempts: u32,
    /// 关闭时等待运行中任务完成的最长时间
    pub drain_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            bind_address: "0.0.0.0:7171".to_string(),
            advertised_url: "http://127.0.0.1:7171".to_string(),
            broker_urls: vec!["http://127.0.0.1:7070".to_string()],
            tags: HashMap::new(),
            queue_capacity: 100,
            concurrency: 4,
            heartbeat_interval_seconds: 10,
            request_timeout_ms: 3000,
            register_attempts: 10,
            register_backoff_ms: 1000,
            feedback_attempts: 3,
            drain_timeout_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker_urls.is_empty() {
            return Err(anyhow::anyhow!("Broker地址列表不能为空"));
        }

        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("任务队列容量必须大于0"));
        }

        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.register_attempts == 0 || self.feedback_attempts == 0 {
            return Err(anyhow::anyhow!("重试次数必须大于0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn register_backoff(&self) -> Duration {
        Duration::from_millis(self.register_backoff_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}
