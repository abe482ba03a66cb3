//! 执行与任务的生命周期
//!
//! 所有状态变更都经过转换表, 并以版本号做比较交换写入; 冲突时重新读取再应用。
//! 终态上的重复反馈是空操作, 所以反馈可以按至少一次语义重投。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use jobflow_core::models::{
    CancelTaskRequest, DispatchTaskRequest, FeedbackStatus, InvocationParams, TaskFeedback,
    TaskKind,
};
use jobflow_core::{now_millis, BrokerConfig, SchedulerError, SchedulerResult, StructuredLogger};
use jobflow_domain::{
    evaluate, DomainEvent, EventPublisher, Execution, ExecutionRepository, ExecutionState,
    ExecutorNode, Flow, FlowRepository, IdGenerator, IdKind, RefType, ScheduleRepository,
    StateEvent, Task, TaskRepository, Transition,
};
use jobflow_infrastructure::MetricsCollector;

use crate::dispatcher::{DispatchOutcome, TaskDispatcher};

const MAX_CAS_RETRIES: usize = 8;

#[derive(Debug, Clone)]
pub struct ExecutionManagerConfig {
    pub broker_url: String,
    pub task_timeout: Duration,
    pub max_task_attempts: u32,
}

impl From<&BrokerConfig> for ExecutionManagerConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            broker_url: config.advertised_url.clone(),
            task_timeout: config.task_timeout(),
            max_task_attempts: config.max_task_attempts,
        }
    }
}

/// 触发一次执行所需的参数
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub ref_id: String,
    pub ref_type: RefType,
    pub schedule_id: Option<String>,
    pub trigger_at: i64,
    pub invocation: InvocationParams,
}

impl TriggerRequest {
    pub fn manual(ref_id: impl Into<String>, ref_type: RefType) -> Self {
        Self {
            ref_id: ref_id.into(),
            ref_type,
            schedule_id: None,
            trigger_at: now_millis(),
            invocation: InvocationParams::default(),
        }
    }
}

pub struct ExecutionManager {
    config: ExecutionManagerConfig,
    flows: Arc<dyn FlowRepository>,
    executions: Arc<dyn ExecutionRepository>,
    tasks: Arc<dyn TaskRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventPublisher>,
    dispatcher: Arc<TaskDispatcher>,
    metrics: MetricsCollector,
}

impl ExecutionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionManagerConfig,
        flows: Arc<dyn FlowRepository>,
        executions: Arc<dyn ExecutionRepository>,
        tasks: Arc<dyn TaskRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventPublisher>,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            config,
            flows,
            executions,
            tasks,
            schedules,
            ids,
            events,
            dispatcher,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn execution(&self, id: &str) -> SchedulerResult<Execution> {
        self.executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("Execution", id))
    }

    pub async fn tasks_of(&self, execution_id: &str) -> SchedulerResult<Vec<Task>> {
        self.tasks.find_by_execution(execution_id).await
    }

    /// 创建执行并立即推进DAG
    pub async fn trigger(&self, request: TriggerRequest) -> SchedulerResult<Execution> {
        let flow = self.load_flow(&request.ref_id).await?;
        flow.ensure_valid()?;
        for issue in flow.validate() {
            warn!("工作流 {} 校验警告: {:?} {}", flow.id, issue.node_id, issue.message);
        }

        let mut execution = Execution::new(
            self.ids.next_id(IdKind::Execution),
            &flow,
            request.ref_type,
            request.trigger_at,
            self.config.broker_url.clone(),
        );
        execution.schedule_id = request.schedule_id;
        execution.invocation = request.invocation;
        self.executions.insert(&execution).await?;

        StructuredLogger::execution_triggered(
            &execution.id,
            &execution.ref_id,
            execution.trigger_at,
        );
        self.publish(DomainEvent::ExecutionCreated {
            execution_id: execution.id.clone(),
            ref_id: execution.ref_id.clone(),
            trigger_at: execution.trigger_at,
        })
        .await;

        self.progress(&execution.id).await?;
        self.execution(&execution.id).await
    }

    /// 遍历DAG: 阻塞被失败上游卡住的节点, 派发就绪节点, 无法推进时结束执行
    pub async fn progress(&self, execution_id: &str) -> SchedulerResult<()> {
        let execution = self.execution(execution_id).await?;
        if execution.state.is_terminal() {
            return Ok(());
        }
        if execution.state == ExecutionState::Killing {
            return self.settle_killing(execution_id).await;
        }
        let flow = execution.flow;

        let updated = self
            .update_execution(execution_id, |e| {
                if e.state.is_terminal()
                    || matches!(e.state, ExecutionState::Paused | ExecutionState::Killing)
                {
                    return None;
                }
                let before = (e.state, e.node_states.clone());
                let progress = evaluate(&flow, &e.node_states);

                for node_id in &progress.blocked {
                    e.apply_node(node_id, StateEvent::Kill);
                }
                let enqueued: Vec<String> = progress
                    .eligible
                    .iter()
                    .filter(|node_id| e.apply_node(node_id, StateEvent::Enqueue).is_applied())
                    .cloned()
                    .collect();

                if matches!(e.state, ExecutionState::Created | ExecutionState::Restarted) {
                    e.apply(StateEvent::Enqueue);
                }
                match progress.outcome {
                    Some(ExecutionState::Success) => {
                        e.apply(StateEvent::Succeed);
                    }
                    Some(_) => {
                        if e.failure_cause.is_none() {
                            e.failure_cause = Some(failure_cause(&e.node_states));
                        }
                        e.apply(StateEvent::Fail);
                    }
                    None => {}
                }

                if before == (e.state, e.node_states.clone()) {
                    None
                } else {
                    Some(enqueued)
                }
            })
            .await?;

        let Some((execution, enqueued)) = updated else {
            return Ok(());
        };

        for node_id in enqueued {
            if let Some(node) = flow.node(&node_id).and_then(|n| n.as_executor()) {
                self.start_node(&execution, node).await?;
            }
        }
        if execution.state.is_terminal() {
            self.on_execution_finished(&execution).await;
        }
        Ok(())
    }

    async fn start_node(&self, execution: &Execution, node: &ExecutorNode) -> SchedulerResult<()> {
        let kind = if node.sharded {
            TaskKind::Split
        } else {
            TaskKind::Normal
        };
        let task = Task::new(
            self.ids.next_id(IdKind::Task),
            &execution.id,
            &node.id,
            &node.executor,
            kind,
            node.params.clone(),
        )
        .with_timeout(node.timeout_ms.filter(|t| *t > 0));
        self.tasks.insert(&task).await?;
        debug!("执行 {} 节点 {} 创建任务 {} ({:?})", execution.id, node.id, task.id, kind);
        self.dispatch_task(&task, execution, node).await
    }

    fn timeout_of(&self, task: &Task) -> Duration {
        if task.timeout_ms > 0 {
            Duration::from_millis(task.timeout_ms)
        } else {
            self.config.task_timeout
        }
    }

    fn build_request(&self, task: &Task, execution: &Execution) -> DispatchTaskRequest {
        DispatchTaskRequest {
            task_id: task.id.clone(),
            execution_id: task.execution_id.clone(),
            job_id: execution.ref_id.clone(),
            executor: task.executor.clone(),
            kind: task.kind,
            params: task.params.clone(),
            input: task.input.clone(),
            broker_url: self.config.broker_url.clone(),
            timeout_ms: self.timeout_of(task).as_millis() as u64,
        }
    }

    async fn dispatch_task(
        &self,
        task: &Task,
        execution: &Execution,
        node: &ExecutorNode,
    ) -> SchedulerResult<()> {
        if execution.state == ExecutionState::Paused {
            debug!("执行 {} 已暂停, 任务 {} 在恢复后派发", execution.id, task.id);
            return Ok(());
        }
        let request = self.build_request(task, execution);
        match self
            .dispatcher
            .dispatch(&request, &node.dispatch, &execution.invocation)
            .await
        {
            DispatchOutcome::Accepted(worker) => {
                let now = now_millis();
                let updated = self
                    .update_task(&task.id, |t| {
                        // 反馈可能先于这里到达
                        if !t.awaiting_dispatch() {
                            return None;
                        }
                        t.apply(StateEvent::Enqueue);
                        t.worker_id = Some(worker.id().to_string());
                        t.worker_url = Some(worker.node.url.clone());
                        t.attempts += 1;
                        t.dispatched_at = Some(now);
                        Some(())
                    })
                    .await?;
                if updated.is_some() {
                    self.publish(DomainEvent::TaskDispatched {
                        task_id: task.id.clone(),
                        worker_id: worker.id().to_string(),
                    })
                    .await;
                }
            }
            DispatchOutcome::Undispatchable => {
                warn!("任务 {} 暂无可用Worker, 等待下一轮重试", task.id);
            }
        }
        Ok(())
    }

    /// 处理worker反馈; 终态之后的重复反馈被忽略
    pub async fn feedback(&self, feedback: TaskFeedback) -> SchedulerResult<()> {
        let status = format!("{:?}", feedback.status);
        self.metrics.record_feedback(&status);
        let now = now_millis();

        let updated = self
            .update_task(&feedback.task_id, |task| {
                if let Some(assigned) = &task.worker_id {
                    if assigned != &feedback.worker_id && !task.awaiting_dispatch() {
                        debug!(
                            "忽略来自旧Worker {} 的任务 {} 反馈",
                            feedback.worker_id, task.id
                        );
                        return None;
                    }
                }
                if task.awaiting_dispatch() {
                    task.apply(StateEvent::Enqueue);
                    task.worker_id = Some(feedback.worker_id.clone());
                    task.dispatched_at.get_or_insert(now);
                }

                let events: &[StateEvent] = match feedback.status {
                    FeedbackStatus::Executing => &[StateEvent::Start],
                    FeedbackStatus::Succeeded => &[StateEvent::Succeed],
                    FeedbackStatus::Failed => &[StateEvent::Fail],
                    FeedbackStatus::Cancelled if task.state == ExecutionState::Killing => {
                        &[StateEvent::Cancel]
                    }
                    FeedbackStatus::Cancelled => &[StateEvent::Kill, StateEvent::Cancel],
                };
                let mut outcome = Transition::Rejected;
                for event in events {
                    outcome = task.apply(*event);
                }
                match outcome {
                    Transition::Applied { .. } => {}
                    Transition::Ignored => {
                        StructuredLogger::transition_ignored(
                            "Task",
                            &task.id,
                            task.state.as_str(),
                            &status,
                        );
                        return None;
                    }
                    Transition::Rejected => {
                        debug!("任务 {} 在状态 {} 下不接受 {} 反馈", task.id, task.state, status);
                        return None;
                    }
                }
                if let Some(result) = &feedback.result {
                    task.result = Some(result.clone());
                }
                if let Some(error) = &feedback.error {
                    task.error = Some(error.clone());
                }
                Some(task.state)
            })
            .await?;

        let Some((task, state)) = updated else {
            return Ok(());
        };
        StructuredLogger::feedback_applied(&task.id, &feedback.worker_id, state.as_str());

        if state == ExecutionState::Running {
            self.mark_started(&task).await?;
        } else if state.is_terminal() {
            self.on_task_finished(&task).await?;
        }
        Ok(())
    }

    async fn mark_started(&self, task: &Task) -> SchedulerResult<()> {
        self.update_execution(&task.execution_id, |e| {
            let node_started = e.apply_node(&task.node_id, StateEvent::Start).is_applied();
            let execution_started =
                e.state == ExecutionState::Queued && e.apply(StateEvent::Start).is_applied();
            (node_started || execution_started).then_some(())
        })
        .await?;
        Ok(())
    }

    async fn on_task_finished(&self, task: &Task) -> SchedulerResult<()> {
        self.publish(DomainEvent::TaskFinished {
            task_id: task.id.clone(),
            execution_id: task.execution_id.clone(),
            state: task.state,
        })
        .await;

        match (task.kind, task.state) {
            (TaskKind::Split, ExecutionState::Success) => self.fan_out(task).await?,
            (TaskKind::Map, ExecutionState::Success) => self.maybe_reduce(task).await?,
            (_, ExecutionState::Success) => {
                self.settle_node(task, &[StateEvent::Succeed], None).await?
            }
            (kind, ExecutionState::Failed) => {
                let cause = format!(
                    "节点 {} 的任务 {} 失败: {}",
                    task.node_id,
                    task.id,
                    task.error.as_deref().unwrap_or("未知错误")
                );
                self.settle_node(task, &[StateEvent::Fail], Some(cause)).await?;
                if matches!(kind, TaskKind::Map | TaskKind::Split) {
                    self.cancel_node_tasks(task).await?;
                }
            }
            (_, _) => {
                self.settle_node(task, &[StateEvent::Kill, StateEvent::Cancel], None)
                    .await?
            }
        }
        self.progress(&task.execution_id).await
    }

    async fn settle_node(
        &self,
        task: &Task,
        events: &[StateEvent],
        cause: Option<String>,
    ) -> SchedulerResult<()> {
        self.update_execution(&task.execution_id, |e| {
            let mut applied = false;
            for event in events {
                applied |= e.apply_node(&task.node_id, *event).is_applied();
            }
            if applied && e.failure_cause.is_none() {
                e.failure_cause = cause.clone();
            }
            applied.then_some(())
        })
        .await?;
        Ok(())
    }

    /// SPLIT成功后为每个分片创建MAP任务; 暂停期间只创建不派发
    async fn fan_out(&self, split: &Task) -> SchedulerResult<()> {
        let execution = self.execution(&split.execution_id).await?;
        if stops_new_tasks(&execution) {
            debug!("执行 {} 正在取消, 节点 {} 不再拆分", execution.id, split.node_id);
            return self
                .settle_node(split, &[StateEvent::Kill, StateEvent::Cancel], None)
                .await;
        }
        let Some(node) = execution
            .flow
            .node(&split.node_id)
            .and_then(|n| n.as_executor())
        else {
            return Err(SchedulerError::InvalidFlow(format!("节点不存在: {}", split.node_id)));
        };

        let shards = match split.result.as_ref().and_then(Value::as_array) {
            Some(shards) => shards.clone(),
            None => {
                let cause = format!("节点 {} 的分片结果不是数组", node.id);
                return self.settle_node(split, &[StateEvent::Fail], Some(cause)).await;
            }
        };
        info!("执行 {} 节点 {} 拆分为 {} 个分片", execution.id, node.id, shards.len());

        if shards.is_empty() {
            return self.start_reduce(&execution, node, Vec::new()).await;
        }
        for (index, shard) in shards.into_iter().enumerate() {
            let task = Task::new(
                self.ids.next_id(IdKind::Task),
                &execution.id,
                &node.id,
                &node.executor,
                TaskKind::Map,
                node.params.clone(),
            )
            .with_shard(index as u32, shard)
            .with_timeout(node.timeout_ms.filter(|t| *t > 0));
            self.tasks.insert(&task).await?;
            self.dispatch_task(&task, &execution, node).await?;
        }
        Ok(())
    }

    /// 所有MAP成功后创建唯一的REDUCE任务
    async fn maybe_reduce(&self, map: &Task) -> SchedulerResult<()> {
        let siblings: Vec<Task> = self
            .tasks
            .find_by_execution(&map.execution_id)
            .await?
            .into_iter()
            .filter(|t| t.node_id == map.node_id && t.kind == TaskKind::Map)
            .collect();
        if !siblings.iter().all(|t| t.state == ExecutionState::Success) {
            return Ok(());
        }

        let mut ordered = siblings;
        ordered.sort_by_key(|t| t.shard_index);
        let results: Vec<Value> = ordered
            .into_iter()
            .map(|t| t.result.unwrap_or(Value::Null))
            .collect();

        let execution = self.execution(&map.execution_id).await?;
        if stops_new_tasks(&execution) {
            debug!("执行 {} 正在取消, 节点 {} 不再归并", execution.id, map.node_id);
            return self
                .settle_node(map, &[StateEvent::Kill, StateEvent::Cancel], None)
                .await;
        }
        let Some(node) = execution
            .flow
            .node(&map.node_id)
            .and_then(|n| n.as_executor())
        else {
            return Err(SchedulerError::InvalidFlow(format!("节点不存在: {}", map.node_id)));
        };
        self.start_reduce(&execution, node, results).await
    }

    async fn start_reduce(
        &self,
        execution: &Execution,
        node: &ExecutorNode,
        results: Vec<Value>,
    ) -> SchedulerResult<()> {
        let claimed = self
            .update_execution(&execution.id, |e| {
                if stops_new_tasks(e) || !e.reduced_nodes.insert(node.id.clone()) {
                    return None;
                }
                Some(())
            })
            .await?;
        let Some((execution, ())) = claimed else {
            debug!("节点 {} 的REDUCE任务已创建", node.id);
            return Ok(());
        };

        let task = Task::new(
            self.ids.next_id(IdKind::Task),
            &execution.id,
            &node.id,
            &node.executor,
            TaskKind::Reduce,
            node.params.clone(),
        )
        .with_input(Value::Array(results))
        .with_timeout(node.timeout_ms.filter(|t| *t > 0));
        self.tasks.insert(&task).await?;
        self.dispatch_task(&task, &execution, node).await
    }

    /// 取消执行: 进入KILLING, 通知所有在途任务, 全部确认或超时后到达CANCELLED
    pub async fn cancel(&self, execution_id: &str) -> SchedulerResult<ExecutionState> {
        let updated = self
            .update_execution(execution_id, |e| {
                e.apply(StateEvent::Kill).is_applied().then_some(())
            })
            .await?;
        match updated {
            Some((execution, ())) if execution.state == ExecutionState::Cancelled => {
                self.on_execution_finished(&execution).await;
            }
            Some(_) => self.settle_killing(execution_id).await?,
            None => debug!("执行 {} 当前状态不可取消", execution_id),
        }
        Ok(self.execution(execution_id).await?.state)
    }

    async fn settle_killing(&self, execution_id: &str) -> SchedulerResult<()> {
        for task in self.tasks.find_by_execution(execution_id).await? {
            if task.state.is_terminal() || task.state == ExecutionState::Killing {
                continue;
            }
            self.kill_task(&task).await?;
        }

        let pending = self
            .tasks
            .find_by_execution(execution_id)
            .await?
            .iter()
            .any(|t| !t.state.is_terminal());
        if pending {
            return Ok(());
        }

        let finished = self
            .update_execution(execution_id, |e| {
                if e.state != ExecutionState::Killing {
                    return None;
                }
                let open: Vec<String> = e
                    .node_states
                    .iter()
                    .filter(|(_, state)| !state.is_terminal())
                    .map(|(id, _)| id.clone())
                    .collect();
                for node_id in open {
                    e.apply_node(&node_id, StateEvent::Kill);
                    e.apply_node(&node_id, StateEvent::Cancel);
                }
                e.apply(StateEvent::Cancel).is_applied().then_some(())
            })
            .await?;
        if let Some((execution, ())) = finished {
            self.on_execution_finished(&execution).await;
        }
        Ok(())
    }

    async fn kill_task(&self, task: &Task) -> SchedulerResult<()> {
        let killed = self
            .update_task(&task.id, |t| {
                let in_flight = t.in_flight();
                if !t.apply(StateEvent::Kill).is_applied() {
                    return None;
                }
                // 没有交给worker的任务无需等待确认
                if !in_flight && t.state == ExecutionState::Killing {
                    t.apply(StateEvent::Cancel);
                }
                Some(in_flight)
            })
            .await?;
        match killed {
            Some((task, true)) => self.signal_cancel(&task),
            Some((task, false)) if task.state.is_terminal() => {
                self.publish(DomainEvent::TaskFinished {
                    task_id: task.id.clone(),
                    execution_id: task.execution_id.clone(),
                    state: task.state,
                })
                .await;
            }
            _ => {}
        }
        Ok(())
    }

    async fn cancel_node_tasks(&self, failed: &Task) -> SchedulerResult<()> {
        for task in self.tasks.find_by_execution(&failed.execution_id).await? {
            if task.node_id == failed.node_id
                && task.id != failed.id
                && !task.state.is_terminal()
                && task.state != ExecutionState::Killing
            {
                self.kill_task(&task).await?;
            }
        }
        Ok(())
    }

    /// 异步通知worker取消, 不等待结果
    fn signal_cancel(&self, task: &Task) {
        let Some(worker_url) = task.worker_url.clone() else {
            return;
        };
        let client = self.dispatcher.client().clone();
        let request = CancelTaskRequest {
            task_id: task.id.clone(),
            execution_id: task.execution_id.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = client.cancel_task(&worker_url, &request).await {
                warn!("通知 {} 取消任务 {} 失败: {}", worker_url, request.task_id, e);
            }
        });
    }

    pub async fn pause(&self, execution_id: &str) -> SchedulerResult<ExecutionState> {
        let updated = self
            .update_execution(execution_id, |e| {
                e.apply(StateEvent::Pause).is_applied().then_some(())
            })
            .await?;
        if updated.is_some() {
            info!("执行 {} 已暂停", execution_id);
        }
        Ok(self.execution(execution_id).await?.state)
    }

    pub async fn resume(&self, execution_id: &str) -> SchedulerResult<ExecutionState> {
        let updated = self
            .update_execution(execution_id, |e| {
                e.apply(StateEvent::Restart).is_applied().then_some(())
            })
            .await?;
        if updated.is_some() {
            info!("执行 {} 已恢复", execution_id);
            self.progress(execution_id).await?;
            self.redispatch_pending(execution_id).await?;
        }
        Ok(self.execution(execution_id).await?.state)
    }

    /// 周期任务: 超时的在途任务判定为失联并重新派发, 未派发的任务重试派发
    pub async fn sweep_tasks(&self, now: i64) -> SchedulerResult<()> {
        for execution in self.executions.find_active().await? {
            if execution.broker_url != self.config.broker_url {
                continue;
            }
            for task in self.tasks.find_by_execution(&execution.id).await? {
                let timeout = self.timeout_of(&task).as_millis() as i64;
                match task.state {
                    ExecutionState::Queued | ExecutionState::Running => {
                        let since = task
                            .dispatched_at
                            .unwrap_or_else(|| task.updated_at.timestamp_millis());
                        if now - since > timeout {
                            self.lose_task(&task).await?;
                        }
                    }
                    ExecutionState::Killing => {
                        if now - task.updated_at.timestamp_millis() > timeout {
                            self.expire_killing(&task).await?;
                        }
                    }
                    _ => {}
                }
            }
            self.redispatch_pending(&execution.id).await?;
        }
        Ok(())
    }

    async fn redispatch_pending(&self, execution_id: &str) -> SchedulerResult<()> {
        let execution = self.execution(execution_id).await?;
        if execution.state.is_terminal()
            || matches!(execution.state, ExecutionState::Paused | ExecutionState::Killing)
        {
            return Ok(());
        }
        for task in self.tasks.find_by_execution(execution_id).await? {
            if !task.awaiting_dispatch() {
                continue;
            }
            let node = execution
                .flow
                .node(&task.node_id)
                .and_then(|n| n.as_executor());
            if let Some(node) = node {
                self.dispatch_task(&task, &execution, node).await?;
            }
        }
        Ok(())
    }

    async fn lose_task(&self, task: &Task) -> SchedulerResult<()> {
        let max_attempts = self.config.max_task_attempts;
        let lost = self
            .update_task(&task.id, |t| {
                if !matches!(t.state, ExecutionState::Queued | ExecutionState::Running) {
                    return None;
                }
                t.apply(StateEvent::Lose);
                if t.attempts >= max_attempts {
                    t.apply(StateEvent::Fail);
                    t.error = Some(format!("超时且已达到最大派发次数 {max_attempts}"));
                }
                Some(())
            })
            .await?;
        let Some((task, ())) = lost else {
            return Ok(());
        };

        warn!(
            "{}, 失联于Worker {:?}",
            SchedulerError::TaskTimeout {
                task_id: task.id.clone()
            },
            task.worker_id
        );
        self.metrics.record_task_lost();
        self.signal_cancel(&task);
        if task.state.is_terminal() {
            self.on_task_finished(&task).await?;
        }
        Ok(())
    }

    async fn expire_killing(&self, task: &Task) -> SchedulerResult<()> {
        let expired = self
            .update_task(&task.id, |t| {
                t.apply(StateEvent::Cancel).is_applied().then_some(())
            })
            .await?;
        if let Some((task, ())) = expired {
            debug!("任务 {} 取消确认超时", task.id);
            self.on_task_finished(&task).await?;
        }
        Ok(())
    }

    async fn on_execution_finished(&self, execution: &Execution) {
        let state = execution.state;
        StructuredLogger::execution_finished(
            &execution.id,
            state.as_str(),
            execution.failure_cause.as_deref(),
        );
        let duration = (execution.updated_at - execution.created_at)
            .to_std()
            .unwrap_or_default();
        self.metrics
            .record_execution_finished(state.as_str(), duration.as_secs_f64());
        self.publish(DomainEvent::ExecutionFinished {
            execution_id: execution.id.clone(),
            state,
            cause: execution.failure_cause.clone(),
        })
        .await;

        if let Some(schedule_id) = &execution.schedule_id {
            if let Err(e) = self.record_schedule_feedback(schedule_id).await {
                warn!("更新调度 {} 的反馈时间失败: {}", schedule_id, e);
            }
        }
    }

    async fn record_schedule_feedback(&self, schedule_id: &str) -> SchedulerResult<()> {
        for _ in 0..MAX_CAS_RETRIES {
            let Some(current) = self.schedules.find_by_id(schedule_id).await? else {
                return Ok(());
            };
            let mut next = current.clone();
            next.last_feedback_at = Some(now_millis());
            next.version = current.version + 1;
            if self.schedules.update(&next, current.version).await? {
                return Ok(());
            }
        }
        Err(SchedulerError::VersionConflict {
            kind: "Schedule",
            id: schedule_id.to_string(),
        })
    }

    async fn load_flow(&self, id: &str) -> SchedulerResult<Flow> {
        self.flows
            .find_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("Flow", id))
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("发布事件失败: {}", e);
        }
    }

    async fn update_execution<R, F>(
        &self,
        id: &str,
        mut change: F,
    ) -> SchedulerResult<Option<(Execution, R)>>
    where
        R: Send,
        F: FnMut(&mut Execution) -> Option<R> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.execution(id).await?;
            let mut next = current.clone();
            let Some(outcome) = change(&mut next) else {
                return Ok(None);
            };
            next.version = current.version + 1;
            if self.executions.update(&next, current.version).await? {
                return Ok(Some((next, outcome)));
            }
            debug!("执行 {} 版本冲突, 重新读取", id);
        }
        Err(SchedulerError::VersionConflict {
            kind: "Execution",
            id: id.to_string(),
        })
    }

    async fn update_task<R, F>(&self, id: &str, mut change: F) -> SchedulerResult<Option<(Task, R)>>
    where
        R: Send,
        F: FnMut(&mut Task) -> Option<R> + Send,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .tasks
                .find_by_id(id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("Task", id))?;
            let mut next = current.clone();
            let Some(outcome) = change(&mut next) else {
                return Ok(None);
            };
            next.version = current.version + 1;
            if self.tasks.update(&next, current.version).await? {
                return Ok(Some((next, outcome)));
            }
            debug!("任务 {} 版本冲突, 重新读取", id);
        }
        Err(SchedulerError::VersionConflict {
            kind: "Task",
            id: id.to_string(),
        })
    }
}

/// 取消中或已结束的执行不再产生新任务
fn stops_new_tasks(execution: &Execution) -> bool {
    execution.state.is_terminal() || execution.state == ExecutionState::Killing
}

fn failure_cause(node_states: &BTreeMap<String, ExecutionState>) -> String {
    let failed: Vec<&str> = node_states
        .iter()
        .filter(|(_, state)| **state == ExecutionState::Failed)
        .map(|(id, _)| id.as_str())
        .collect();
    if failed.is_empty() {
        "没有可以继续推进的节点".to_string()
    } else {
        format!("节点执行失败: {}", failed.join(", "))
    }
}
