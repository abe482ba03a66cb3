//! 领域仓储抽象
//!
//! 存储由外部协作方提供, 这里只定义按ID读写与乐观版本写入

use async_trait::async_trait;
use jobflow_core::SchedulerResult;

use crate::execution::{Execution, Task};
use crate::flow::Flow;
use crate::schedule::{Schedule, ScheduleDelay};

/// 调度仓储抽象
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Schedule>>;
    async fn find_enabled(&self) -> SchedulerResult<Vec<Schedule>>;
    async fn insert(&self, schedule: &Schedule) -> SchedulerResult<()>;
    /// 仅当存储中的版本等于 `expected_version` 时写入
    async fn update(&self, schedule: &Schedule, expected_version: u64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ScheduleDelayRepository: Send + Sync {
    async fn insert(&self, delay: &ScheduleDelay) -> SchedulerResult<()>;
    async fn find_all(&self) -> SchedulerResult<Vec<ScheduleDelay>>;
    /// 删除成功者获得触发权
    async fn delete(&self, id: &str) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Execution>>;
    async fn find_active(&self) -> SchedulerResult<Vec<Execution>>;
    async fn insert(&self, execution: &Execution) -> SchedulerResult<()>;
    async fn update(&self, execution: &Execution, expected_version: u64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;
    async fn find_by_execution(&self, execution_id: &str) -> SchedulerResult<Vec<Task>>;
    async fn find_active(&self) -> SchedulerResult<Vec<Task>>;
    async fn insert(&self, task: &Task) -> SchedulerResult<()>;
    async fn update(&self, task: &Task, expected_version: u64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Flow>>;
    async fn save(&self, flow: &Flow) -> SchedulerResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Execution,
    Task,
    Schedule,
    Worker,
}

impl IdKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Execution => "exe",
            Self::Task => "task",
            Self::Schedule => "sch",
            Self::Worker => "wkr",
        }
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self, kind: IdKind) -> String;
}
