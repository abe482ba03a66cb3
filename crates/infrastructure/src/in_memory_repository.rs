//! 内存仓储实现
//!
//! 每个实体按ID存放, 带版本的写入在同一把锁内比较并替换,
//! 嵌入式部署和测试都使用这一实现。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::{
    Execution, ExecutionRepository, Flow, FlowRepository, Schedule, ScheduleDelay,
    ScheduleDelayRepository, ScheduleRepository, Task, TaskRepository,
};
use tokio::sync::RwLock;
use tracing::debug;

trait Versioned: Clone + Send + Sync {
    const KIND: &'static str;
    fn key(&self) -> &str;
    fn version(&self) -> u64;
}

impl Versioned for Schedule {
    const KIND: &'static str = "Schedule";
    fn key(&self) -> &str {
        &self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Execution {
    const KIND: &'static str = "Execution";
    fn key(&self) -> &str {
        &self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Task {
    const KIND: &'static str = "Task";
    fn key(&self) -> &str {
        &self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
}

struct VersionedStore<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T: Versioned> VersionedStore<T> {
    fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    async fn get(&self, id: &str) -> Option<T> {
        self.items.read().await.get(id).cloned()
    }

    async fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.items
            .read()
            .await
            .values()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    async fn insert(&self, item: &T) -> SchedulerResult<()> {
        let mut items = self.items.write().await;
        if items.contains_key(item.key()) {
            return Err(SchedulerError::VersionConflict {
                kind: T::KIND,
                id: item.key().to_string(),
            });
        }
        items.insert(item.key().to_string(), item.clone());
        Ok(())
    }

    async fn compare_and_swap(&self, item: &T, expected_version: u64) -> SchedulerResult<bool> {
        let mut items = self.items.write().await;
        let current = items
            .get(item.key())
            .ok_or_else(|| SchedulerError::not_found(T::KIND, item.key()))?;
        if current.version() != expected_version {
            debug!(
                "{} {} 版本冲突: 期望 {}, 实际 {}",
                T::KIND,
                item.key(),
                expected_version,
                current.version()
            );
            return Ok(false);
        }
        items.insert(item.key().to_string(), item.clone());
        Ok(true)
    }
}

pub struct InMemoryScheduleRepository {
    store: VersionedStore<Schedule>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self {
            store: VersionedStore::new(),
        }
    }
}

impl Default for InMemoryScheduleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleRepository for InMemoryScheduleRepository {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Schedule>> {
        Ok(self.store.get(id).await)
    }

    async fn find_enabled(&self) -> SchedulerResult<Vec<Schedule>> {
        Ok(self.store.filter(|s| s.enabled).await)
    }

    async fn insert(&self, schedule: &Schedule) -> SchedulerResult<()> {
        self.store.insert(schedule).await
    }

    async fn update(&self, schedule: &Schedule, expected_version: u64) -> SchedulerResult<bool> {
        self.store.compare_and_swap(schedule, expected_version).await
    }
}

#[derive(Default)]
pub struct InMemoryScheduleDelayRepository {
    delays: RwLock<HashMap<String, ScheduleDelay>>,
}

impl InMemoryScheduleDelayRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleDelayRepository for InMemoryScheduleDelayRepository {
    async fn insert(&self, delay: &ScheduleDelay) -> SchedulerResult<()> {
        self.delays
            .write()
            .await
            .insert(delay.id.clone(), delay.clone());
        Ok(())
    }

    async fn find_all(&self) -> SchedulerResult<Vec<ScheduleDelay>> {
        Ok(self.delays.read().await.values().cloned().collect())
    }

    async fn delete(&self, id: &str) -> SchedulerResult<bool> {
        Ok(self.delays.write().await.remove(id).is_some())
    }
}

pub struct InMemoryExecutionRepository {
    store: VersionedStore<Execution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self {
            store: VersionedStore::new(),
        }
    }
}

impl Default for InMemoryExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Execution>> {
        Ok(self.store.get(id).await)
    }

    async fn find_active(&self) -> SchedulerResult<Vec<Execution>> {
        Ok(self.store.filter(|e| !e.state.is_terminal()).await)
    }

    async fn insert(&self, execution: &Execution) -> SchedulerResult<()> {
        self.store.insert(execution).await
    }

    async fn update(&self, execution: &Execution, expected_version: u64) -> SchedulerResult<bool> {
        self.store.compare_and_swap(execution, expected_version).await
    }
}

pub struct InMemoryTaskRepository {
    store: VersionedStore<Task>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            store: VersionedStore::new(),
        }
    }
}

impl Default for InMemoryTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.store.get(id).await)
    }

    async fn find_by_execution(&self, execution_id: &str) -> SchedulerResult<Vec<Task>> {
        let mut tasks = self
            .store
            .filter(|t| t.execution_id == execution_id)
            .await;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn find_active(&self) -> SchedulerResult<Vec<Task>> {
        Ok(self.store.filter(|t| !t.state.is_terminal()).await)
    }

    async fn insert(&self, task: &Task) -> SchedulerResult<()> {
        self.store.insert(task).await
    }

    async fn update(&self, task: &Task, expected_version: u64) -> SchedulerResult<bool> {
        self.store.compare_and_swap(task, expected_version).await
    }
}

#[derive(Default)]
pub struct InMemoryFlowRepository {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find_by_id(&self, id: &str) -> SchedulerResult<Option<Flow>> {
        Ok(self
            .flows
            .read()
            .await
            .get(id)
            .map(|flow| flow.as_ref().clone()))
    }

    async fn save(&self, flow: &Flow) -> SchedulerResult<()> {
        self.flows
            .write()
            .await
            .insert(flow.id.clone(), Arc::new(flow.clone()));
        Ok(())
    }
}
