use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Worker注册失败: {0}")]
    RegisterFailure(String),

    #[error("Worker {worker_id} 拒绝任务: {reason}")]
    DispatchRejected { worker_id: String, reason: String },

    #[error("资源 {resource_id} 无法选出存活的所有者")]
    ElectionUnresolved { resource_id: String },

    #[error("计算下次触发时间失败: {0}")]
    ScheduleCalculation(String),

    #[error("任务 {task_id} 超时")]
    TaskTimeout { task_id: String },

    #[error("服务未就绪, 当前状态: {state}")]
    ServerNotReady { state: String },

    #[error("没有可用的Worker: {0}")]
    NoAvailableWorker(String),

    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("无效的工作流定义: {0}")]
    InvalidFlow(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("版本冲突: {kind} {id}")]
    VersionConflict { kind: &'static str, id: String },

    #[error("网络错误: {0}")]
    Network(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// 稳定的机器可读错误码, 用于RPC响应
    pub fn code(&self) -> &'static str {
        match self {
            Self::RegisterFailure(_) => "REGISTER_FAILURE",
            Self::DispatchRejected { .. } => "DISPATCH_REJECTED",
            Self::ElectionUnresolved { .. } => "ELECTION_UNRESOLVED",
            Self::ScheduleCalculation(_) => "SCHEDULE_CALCULATION",
            Self::TaskTimeout { .. } => "TASK_TIMEOUT",
            Self::ServerNotReady { .. } => "SERVER_NOT_READY",
            Self::NoAvailableWorker(_) => "NO_AVAILABLE_WORKER",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidFlow(_) => "INVALID_FLOW",
            Self::InvalidCron { .. } => "INVALID_CRON",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::Network(_) => "NETWORK",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Configuration(_) => "CONFIGURATION",
            Self::TaskExecution(_) => "TASK_EXECUTION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// 瞬时错误可以按退避策略重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::TaskTimeout { .. }
                | Self::ServerNotReady { .. }
                | Self::VersionConflict { .. }
                | Self::ElectionUnresolved { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
