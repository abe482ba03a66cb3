//! 领域事件
//!
//! 由broker发布, 订阅方(指标、审计)与调度核心解耦

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobflow_core::SchedulerResult;
use serde::{Deserialize, Serialize};

use crate::state::ExecutionState;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    ExecutionCreated {
        execution_id: String,
        ref_id: String,
        trigger_at: i64,
    },
    ExecutionFinished {
        execution_id: String,
        state: ExecutionState,
        cause: Option<String>,
    },
    TaskDispatched {
        task_id: String,
        worker_id: String,
    },
    TaskFinished {
        task_id: String,
        execution_id: String,
        state: ExecutionState,
    },
    WorkerOnline {
        server_id: String,
    },
    WorkerOffline {
        server_id: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionCreated { .. } => "execution_created",
            Self::ExecutionFinished { .. } => "execution_finished",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskFinished { .. } => "task_finished",
            Self::WorkerOnline { .. } => "worker_online",
            Self::WorkerOffline { .. } => "worker_offline",
        }
    }
}

/// 事件记录, 附带发生时间
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: DomainEvent,
    pub occurred_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn now(event: DomainEvent) -> Self {
        Self {
            event,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> SchedulerResult<()>;
}
